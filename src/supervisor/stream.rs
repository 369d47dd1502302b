//! Streaming variants of create and start, and live log feeds.
//!
//! The lifecycle operation runs in its own task. Only the forwarding of
//! events is tied to the receiver, so a caller that goes away mid-start
//! leaves the world starting normally.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::Supervisor;
use crate::broadcast::{Delivery, LogEvent, LogSubscription};
use crate::error::{Error, Result};
use crate::world::WorldSpec;

const STREAM_BUFFER: usize = 256;

/// Progress markers emitted before a streamed start switches to log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Creating,
    Created,
    Starting,
    Started,
}

/// One item of a streamed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Connected { world: String },
    Status { world: String, phase: StreamPhase },
    Log(LogEvent),
    Error {
        message: String,
        code: Option<&'static str>,
    },
}

impl StreamEvent {
    fn error(error: &Error) -> Self {
        Self::Error {
            message: error.to_string(),
            code: error.code(),
        }
    }
}

impl Supervisor {
    /// Create and start a world, reporting progress and then its output.
    pub fn create_with_stream(self: &Arc<Self>, spec: WorldSpec) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let id = spec.id.clone();
            supervisor.run_stream(id, Some(spec), tx).await;
        });
        rx
    }

    /// Start a world, reporting progress and then its output.
    pub fn start_with_stream(self: &Arc<Self>, id: impl Into<String>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let supervisor = Arc::clone(self);
        let id = id.into();
        tokio::spawn(async move {
            supervisor.run_stream(id, None, tx).await;
        });
        rx
    }

    /// Live log feed of a world: a `connected` event, the last `tail` lines,
    /// then live output until the world stops or the receiver is dropped.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidRequest` for an oversized tail.
    pub fn follow_stream(&self, id: &str, tail: usize) -> Result<mpsc::Receiver<StreamEvent>> {
        let subscription = self.follow(id, tail)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let world = id.to_string();
        tokio::spawn(async move {
            if tx.send(StreamEvent::Connected { world }).await.is_ok() {
                forward(subscription, &tx).await;
            }
        });
        Ok(rx)
    }

    async fn run_stream(
        &self,
        id: String,
        create: Option<WorldSpec>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        // Send failures mean the client left; the operation still completes.
        let _ = tx.send(StreamEvent::Connected { world: id.clone() }).await;
        let phase = |phase| StreamEvent::Status {
            world: id.clone(),
            phase,
        };

        if let Some(spec) = create {
            let _ = tx.send(phase(StreamPhase::Creating)).await;
            if let Err(e) = self.create(spec).await {
                let _ = tx.send(StreamEvent::error(&e)).await;
                return;
            }
            let _ = tx.send(phase(StreamPhase::Created)).await;
        }

        let Some(subscription) = self.registry.with(&id, |r| r.hub.subscribe_upcoming()) else {
            let _ = tx.send(StreamEvent::error(&Error::not_found(&id))).await;
            return;
        };

        let _ = tx.send(phase(StreamPhase::Starting)).await;
        if let Err(e) = self.start(&id).await {
            tracing::debug!(world = %id, error = %e, "Streamed start failed");
            let _ = tx.send(StreamEvent::error(&e)).await;
            return;
        }
        if tx.send(phase(StreamPhase::Started)).await.is_err() {
            return;
        }

        forward(subscription, &tx).await;
    }
}

/// Relay deliveries until the world closes or the receiver goes away.
async fn forward(mut subscription: LogSubscription, tx: &mpsc::Sender<StreamEvent>) {
    loop {
        let delivery = tokio::select! {
            delivery = subscription.next() => delivery,
            () = tx.closed() => break,
        };

        let event = match delivery {
            Some(Delivery::Event(event)) => StreamEvent::Log(event),
            Some(Delivery::Lagged(missed)) => StreamEvent::Error {
                message: format!("stream lagged, {missed} log lines dropped"),
                code: None,
            },
            Some(Delivery::Closed(event)) => {
                let _ = tx.send(StreamEvent::Log(event)).await;
                break;
            },
            None => break,
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }
}
