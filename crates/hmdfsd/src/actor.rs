//! Single-consumer command queues for stateful components
//!
//! Every stateful component (the device manager, each network agent) is an
//! actor: commands are posted to an unbounded channel and drained FIFO by
//! one dedicated task, so all state transitions for one component are
//! serialized without a lock held across them. A command carries an
//! optional retry budget; a failing handler is retried with a short delay
//! and the error never escapes into the dispatcher loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hmdfsd_core::AgentError;

use crate::CMD_RETRY_DELAY_MS;

/// A posted command plus its retry budget
#[derive(Debug)]
pub struct Command<C> {
    pub cmd: C,
    pub try_times: u32,
}

impl<C> Command<C> {
    /// One attempt, no retry
    pub fn once(cmd: C) -> Self {
        Self { cmd, try_times: 1 }
    }

    pub fn with_retry(cmd: C, try_times: u32) -> Self {
        Self {
            cmd,
            try_times: try_times.max(1),
        }
    }
}

/// Implemented by actor targets; one call per command attempt
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Cmd: Send + std::fmt::Debug + 'static;

    async fn handle(&self, cmd: &Self::Cmd) -> Result<(), AgentError>;
}

/// Sending half of an actor queue
pub struct ActorHandle<C> {
    tx: mpsc::UnboundedSender<Command<C>>,
}

impl<C> Clone for ActorHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C: Send + 'static> ActorHandle<C> {
    /// Post a command; drops it with a log if the consumer is gone
    pub fn recv(&self, cmd: Command<C>) {
        if self.tx.send(cmd).is_err() {
            warn!("actor queue closed, command dropped");
        }
    }
}

/// Spawn the consumer task for `target`; dropping every handle (and the
/// returned one) ends the loop once the queue drains.
pub fn start<H: Handler>(target: Arc<H>) -> (ActorHandle<H::Cmd>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command<H::Cmd>>();

    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let attempts = command.try_times.max(1);
            for attempt in 1..=attempts {
                match target.handle(&command.cmd).await {
                    Ok(()) => break,
                    Err(e) if attempt < attempts => {
                        debug!(
                            "command {:?} failed (attempt {attempt}/{attempts}): {e}",
                            command.cmd
                        );
                        tokio::time::sleep(Duration::from_millis(CMD_RETRY_DELAY_MS)).await;
                    }
                    Err(e) => {
                        warn!("command {:?} abandoned after {attempts} attempts: {e}", command.cmd);
                    }
                }
            }
        }
        debug!("actor queue drained, consumer exiting");
    });

    (ActorHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Handler for Flaky {
        type Cmd = &'static str;

        async fn handle(&self, _cmd: &Self::Cmd) -> Result<(), AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(AgentError::Domain("induced".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        struct Recorder {
            seen: parking_lot::Mutex<Vec<u32>>,
        }

        #[async_trait]
        impl Handler for Recorder {
            type Cmd = u32;

            async fn handle(&self, cmd: &u32) -> Result<(), AgentError> {
                self.seen.lock().push(*cmd);
                Ok(())
            }
        }

        let target = Arc::new(Recorder {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let (handle, task) = start(Arc::clone(&target));
        for i in 0..8 {
            handle.recv(Command::once(i));
        }
        drop(handle);
        task.await.unwrap();

        assert_eq!(*target.seen.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let target = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let (handle, task) = start(Arc::clone(&target));
        handle.recv(Command::with_retry("connect", 5));
        drop(handle);
        task.await.unwrap();

        // two failures then one success
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_do_not_kill_the_loop() {
        let target = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let (handle, task) = start(Arc::clone(&target));
        handle.recv(Command::with_retry("connect", 2));
        handle.recv(Command::once("disconnect"));
        drop(handle);
        task.await.unwrap();

        // both commands were attempted; the failing one did not poison the queue
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }
}
