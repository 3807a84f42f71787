//! Process-wide stop signal and fault diagnostics.
//!
//! OS signals are consumed by tokio's signal driver, which only records the
//! delivery; the [`ShutdownFlag`] is set later from ordinary async context.

use std::backtrace::Backtrace;
use std::io;
use std::panic;
use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Set at most once per process and never reset.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    token: CancellationToken,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Sets `flag` once SIGINT or SIGTERM arrives.
pub async fn watch_signals(flag: ShutdownFlag) {
    tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "shutdown signal received"),
                Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
            }
            flag.set();
        }
        _ = flag.wait() => {}
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str, io::Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str, io::Error> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

/// Reports panics with their location, thread and a captured backtrace,
/// then hands over to the previously installed hook.
pub fn install_fault_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = thread::current();
        let location = panic_info
            .location()
            .map(|location| location.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let backtrace = Backtrace::force_capture();

        error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            location = %location,
            "fault: {panic_info}\n{backtrace}"
        );
        previous(panic_info);
    }));
}
