//! Process-level supervision for a queue node.
//!
//! There is exactly one thing to supervise: the [`QueueRuntime`]. The
//! supervisor starts it, sleeps until the process is told to stop (or a
//! runtime task dies), and then runs the staged shutdown under the
//! configured timeout.

use crate::runtime::QueueRuntime;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Why the node is coming down.
enum Shutdown {
    Interrupt,
    Terminate,
    TaskExited,
}

pub struct Supervisor {
    runtime: QueueRuntime,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(runtime: QueueRuntime, shutdown_timeout: Duration) -> Self {
        Self {
            runtime,
            shutdown_timeout,
        }
    }

    /// Run the node until it is told to stop, then shut it down.
    ///
    /// The exit code reflects whether the runtime both ran and stopped
    /// cleanly: a dead runtime task or a shutdown that errors or overruns
    /// the timeout all fail the process.
    pub async fn run(mut self) -> ExitCode {
        if let Err(error) = self.runtime.start().await {
            error!(error = ?error, "queue runtime failed to start");
            return ExitCode::FAILURE;
        }

        let reason = self.wait_for_shutdown().await;

        let mut exit_code = match reason {
            Shutdown::Interrupt | Shutdown::Terminate => ExitCode::SUCCESS,
            Shutdown::TaskExited => ExitCode::FAILURE,
        };

        match tokio::time::timeout(self.shutdown_timeout, self.runtime.shutdown()).await {
            Ok(Ok(())) => info!("graceful shutdown complete"),
            Ok(Err(error)) => {
                error!(error = ?error, "shutdown failed");
                exit_code = ExitCode::FAILURE;
            }
            Err(_) => {
                warn!(
                    timeout = format!("{:.2?}", self.shutdown_timeout),
                    "shutdown timed out with work still in flight"
                );
                exit_code = ExitCode::FAILURE;
            }
        }

        info!(exit_code = ?exit_code, "node stopped");
        exit_code
    }

    async fn wait_for_shutdown(&self) -> Shutdown {
        let interrupt = async {
            signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C signal handler");
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            let mut stream =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");
            stream.recv().await;
        };

        // select! needs every branch on non-Unix targets too
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => {
                info!("received ctrl+c, gracefully shutting down...");
                Shutdown::Interrupt
            }
            _ = terminate => {
                info!("received SIGTERM, gracefully shutting down...");
                Shutdown::Terminate
            }
            _ = self.runtime.tend() => {
                error!("a runtime task exited unexpectedly, shutting down");
                Shutdown::TaskExited
            }
        }
    }
}
