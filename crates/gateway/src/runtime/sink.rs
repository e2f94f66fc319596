//! Event sink between the orchestrator and a transport.
//!
//! A bounded channel (default 64 events) absorbs bursts. When the transport
//! cannot keep up the producer pauses; the first stall that resolves within
//! the grace period emits a `warning{slow-consumer}`, and a stall that
//! exhausts the grace fails the turn with `backpressure`. A dropped receiver
//! reads as client disconnect. Terminal events are delivered best-effort even
//! through a full buffer.

use std::time::Duration;

use tokio::sync::mpsc;

use vx_domain::error::{Error, Result};
use vx_domain::event::AgentEvent;

pub const DEFAULT_BUFFER: usize = 64;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

pub struct EventSink {
    tx: mpsc::Sender<AgentEvent>,
    grace: Duration,
    warned_slow: bool,
    terminal_sent: bool,
}

impl EventSink {
    /// Create a sink and its transport-side receiver.
    pub fn channel(buffer: usize, grace: Duration) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                grace,
                warned_slow: false,
                terminal_sent: false,
            },
            rx,
        )
    }

    /// Emit one event, pausing under backpressure.
    ///
    /// Errors: `Cancelled` when the receiver is gone (client disconnect),
    /// `Backpressure` when the buffer stays full past the grace period.
    pub async fn send(&mut self, event: AgentEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Cancelled),
            Err(mpsc::error::TrySendError::Full(event)) => {
                let event_name = event.name();
                match tokio::time::timeout(self.grace, self.tx.send(event)).await {
                    Ok(Ok(())) => {
                        if !self.warned_slow {
                            self.warned_slow = true;
                            tracing::warn!(event = event_name, "stream buffer overflowed; consumer is slow");
                            // Best-effort; if the buffer is full again the
                            // backpressure path will fire shortly anyway.
                            let _ = tokio::time::timeout(
                                self.grace,
                                self.tx.send(AgentEvent::warning(
                                    "slow-consumer",
                                    "the stream buffer overflowed; delivery is delayed",
                                )),
                            )
                            .await;
                        }
                        Ok(())
                    }
                    Ok(Err(_)) => Err(Error::Cancelled),
                    Err(_) => Err(Error::Backpressure(format!(
                        "stream buffer full for over {:?}",
                        self.grace
                    ))),
                }
            }
        }
    }

    /// Emit a terminal event (`end` or `error`), at most once.
    ///
    /// Goes through a detached task when the buffer is full so a slow-but-
    /// alive consumer still observes the terminal; a gone consumer drops it.
    pub fn send_terminal(&mut self, event: AgentEvent) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        debug_assert!(event.is_terminal());

        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }
}
