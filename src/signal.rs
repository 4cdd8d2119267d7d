//! SIGHUP/SIGTERM/SIGINT adapter.
//!
//! The loop itself is synchronous, so signals are received on a small
//! current-thread tokio runtime running in its own thread. A signal only
//! calls [`StopHandle::stop`]; the guard returned by [`install`] shuts the
//! thread down when dropped.

use std::io;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::info;

use crate::node::StopHandle;

/// Keeps the signal thread alive. Dropping it stops the thread.
pub struct SignalGuard {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Stop the loop behind `stop` on SIGHUP, SIGTERM or SIGINT.
#[cfg(unix)]
pub fn install(stop: StopHandle) -> io::Result<SignalGuard> {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    // Register up front so failures reach the caller.
    let (mut sighup, mut sigterm, mut sigint) = {
        let _enter = runtime.enter();
        (
            signal(SignalKind::hangup())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
        )
    };
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("emews-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    tokio::select! {
                        _ = sighup.recv() => info!("Received SIGHUP"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = &mut shutdown_rx => break,
                    }
                    stop.stop();
                }
            });
        })?;

    Ok(SignalGuard {
        shutdown: Some(shutdown),
        thread: Some(thread),
    })
}

/// Stop the loop behind `stop` on Ctrl-C.
#[cfg(not(unix))]
pub fn install(stop: StopHandle) -> io::Result<SignalGuard> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("emews-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    tokio::select! {
                        result = tokio::signal::ctrl_c() => match result {
                            Ok(()) => info!("Received Ctrl-C"),
                            Err(e) => {
                                tracing::warn!("Ctrl-C handler failed: {}", e);
                                break;
                            }
                        },
                        _ = &mut shutdown_rx => break,
                    }
                    stop.stop();
                }
            });
        })?;

    Ok(SignalGuard {
        shutdown: Some(shutdown),
        thread: Some(thread),
    })
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Signal thread panicked");
            }
        }
    }
}
