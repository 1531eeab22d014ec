//! Process-wide shutdown sentinel.
//!
//! Constructed once before any worker starts and handed to every thread
//! that needs to observe shutdown; workers check it at the top of each poll
//! cycle and exit after finishing the current drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_visible_to_clones() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_set());
        flag.trigger();
        assert!(observer.is_set());
    }
}
