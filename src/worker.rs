use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Runtime dedicated to network I/O.
///
/// Sessions receive its [`Handle`] at construction and spawn their stream
/// readers onto it, so a slow or reconnecting connection never competes with
/// the task driving the game. The owner decides when it stops.
pub struct NetworkWorker {
    runtime: Runtime,
}

impl NetworkWorker {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("chess-network")
            .enable_all()
            .build()?;
        tracing::debug!("network worker started");
        Ok(Self { runtime })
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Stop the worker. Tasks still running are cancelled at their next
    /// await point; blocking work gets a short grace period.
    pub fn shutdown(self) {
        self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        tracing::debug!("network worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_tasks_until_shutdown() {
        let worker = NetworkWorker::new().expect("build runtime");
        let handle = worker.handle();

        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            tx.send(std::thread::current().name().map(str::to_string))
                .unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("chess-network"));

        let (held_tx, held_rx) = std::sync::mpsc::channel::<()>();
        handle.spawn(async move {
            let _held = held_tx;
            futures::future::pending::<()>().await;
        });
        worker.shutdown();
        assert_eq!(
            held_rx.recv_timeout(Duration::from_secs(5)),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected)
        );
    }
}
