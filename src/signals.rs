//! Host shutdown signals.
//!
//! SIGINT (Ctrl-C) and SIGTERM both resolve `shutdown_signal()`. While the
//! terminal is in raw mode Ctrl-C is delivered to the agent as a keystroke
//! instead, so in interactive sessions this mostly catches SIGTERM.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    /// Conventional `128 + signo` exit status.
    pub fn exit_code(self) -> i32 {
        match self {
            Shutdown::Interrupt => 130,
            Shutdown::Terminate => 143,
        }
    }
}

/// Resolve when the host is asked to stop. If a handler can't be installed,
/// that source is ignored rather than treated as a signal.
pub async fn shutdown_signal() -> Shutdown {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => Shutdown::Interrupt,
        _ = terminate => Shutdown::Terminate,
    }
}
