//! Stateless wrapper over a compiled classic-BPF filter program.

use pcap::{BpfProgram, Capture, Linktype};

use super::CaptureError;

/// A compiled packet filter. Compilation happens once at worker init;
/// evaluation is pure and allocation-free.
pub struct BpfFilter {
    prog: BpfProgram,
}

// SAFETY: a compiled program is immutable instruction data; evaluation
// neither mutates it nor touches thread-local state.
unsafe impl Send for BpfFilter {}
unsafe impl Sync for BpfFilter {}

impl BpfFilter {
    /// Compile `expr` for the Ethernet link type.
    pub fn compile(expr: &str) -> Result<Self, CaptureError> {
        let cap = Capture::dead(Linktype::ETHERNET)?;
        let prog = cap.compile(expr, true)?;
        Ok(Self { prog })
    }

    /// Evaluate the program over one frame.
    pub fn matches(&self, frame: &[u8]) -> bool {
        self.prog.filter(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal Ethernet frame with the given ethertype, padded to 60 bytes.
    fn eth_frame(ethertype: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
        frame
    }

    #[test]
    fn filters_by_ethertype() {
        let filter = BpfFilter::compile("ether proto 0x0806").unwrap();
        assert!(filter.matches(&eth_frame(0x0806)));
        assert!(!filter.matches(&eth_frame(0x0800)));
    }

    #[test]
    fn match_nothing_expression() {
        let filter = BpfFilter::compile("ether proto 0xFFFF").unwrap();
        assert!(!filter.matches(&eth_frame(0x0800)));
        assert!(!filter.matches(&eth_frame(0x0806)));
    }

    #[test]
    fn bad_expression_is_a_config_error() {
        assert!(matches!(
            BpfFilter::compile("not a filter at all ]["),
            Err(CaptureError::BadFilter(_))
        ));
    }
}
