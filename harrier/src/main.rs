// The capture engine requires ring-fabric support; without the feature the
// binary only knows how to say so and exit.
#[cfg(feature = "netmap")]
mod capture;
#[cfg(feature = "netmap")]
mod checksum;
#[cfg(feature = "netmap")]
mod cli;
#[cfg(feature = "netmap")]
mod error;
#[cfg(feature = "netmap")]
mod livedev;
#[cfg(feature = "netmap")]
mod metrics;
#[cfg(feature = "netmap")]
mod pipeline;
#[cfg(feature = "netmap")]
mod shutdown;

#[cfg(not(feature = "netmap"))]
fn main() {
    eprintln!(
        "harrier: this build has no ring-fabric support, \
         please recompile with the 'netmap' feature"
    );
    std::process::exit(1);
}

#[cfg(feature = "netmap")]
fn main() -> error::Result<()> {
    use std::sync::Arc;

    use clap::Parser as _;
    use tracing::{error, info};

    use crate::error::HarrierError;

    use crate::capture::opts::DEFAULT_PACKET_SIZE;
    use crate::capture::threads::{WorkerEvent, spawn_capture_worker};
    use crate::capture::{CaptureWorker, DeviceRegistry};
    use crate::livedev::LiveDeviceRegistry;
    use crate::pipeline::{Downstream, SinkSlot};
    use crate::shutdown::ShutdownFlag;
    use harrier_common::PacketPool;

    let cli = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let opts = cli.capture_opts();
    opts.validate()?;

    // Block shutdown signals before any thread exists so every worker
    // inherits the mask and only main consumes them.
    let sigset = signals::block_shutdown_signals()?;

    let registry = Arc::new(DeviceRegistry::new());
    let livedevs = LiveDeviceRegistry::new();
    let pool = PacketPool::new(cli.pool_size, DEFAULT_PACKET_SIZE);
    let shutdown = ShutdownFlag::new();
    let downstream: Arc<dyn Downstream> = Arc::new(SinkSlot::new(pool.clone()));

    let (event_tx, event_rx) = crossbeam::channel::unbounded();
    let mut handles = Vec::with_capacity(opts.threads);

    for i in 0..opts.threads {
        let name = format!("{}#{i:02}", opts.iface);
        match CaptureWorker::new(
            &name,
            registry.clone(),
            pool.clone(),
            &livedevs,
            &opts,
            downstream.clone(),
            shutdown.clone(),
        ) {
            Ok(worker) => handles.push(spawn_capture_worker(worker, event_tx.clone())?),
            Err(e) => {
                error!(
                    event.name = "harrier.worker_init_failed",
                    worker = %name,
                    error = %e,
                    "receive worker initialization failed"
                );
            }
        }
    }
    drop(event_tx);

    if handles.is_empty() {
        return Err(HarrierError::internal(format!(
            "no receive worker could be started on '{}'",
            opts.iface
        )));
    }

    info!(
        event.name = "harrier.started",
        iface = %opts.iface,
        workers = handles.len(),
        "capture running, waiting for shutdown signal"
    );

    let sig = signals::wait_for_shutdown(&sigset)?;
    info!(
        event.name = "harrier.shutdown",
        signal = sig,
        "shutdown signal received, stopping workers"
    );
    shutdown.trigger();

    for handle in handles {
        let _ = handle.join();
    }

    let mut total_pkts = 0u64;
    let mut total_drops = 0u64;
    for event in event_rx.iter() {
        if let WorkerEvent::Stopped(summary) = event {
            total_pkts += summary.pkts;
            total_drops += summary.drops;
        }
    }
    info!(
        event.name = "harrier.stopped",
        pkts = total_pkts,
        drops = total_drops,
        "all workers stopped"
    );

    Ok(())
}

#[cfg(feature = "netmap")]
mod signals {
    use std::io;
    use std::mem;
    use std::ptr;

    /// Block SIGINT/SIGTERM for the calling thread (and every thread it
    /// spawns afterwards) and return the set for `wait_for_shutdown`.
    pub fn block_shutdown_signals() -> io::Result<libc::sigset_t> {
        // SAFETY: the set is zero-initialized and populated by the libc
        // sigset API before use; return codes are checked.
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            if libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(set)
        }
    }

    /// Block until one of the signals in `set` is delivered.
    pub fn wait_for_shutdown(set: &libc::sigset_t) -> io::Result<libc::c_int> {
        let mut sig: libc::c_int = 0;
        // SAFETY: set was initialized by block_shutdown_signals and sig is
        // a valid out-pointer.
        let rc = unsafe { libc::sigwait(set, &mut sig) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(sig)
    }
}
