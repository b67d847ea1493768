//! Event Bridge: turns a run's broadcast channel into a client stream.
//!
//! A stream always starts with a snapshot of the persisted record, relays
//! published events, heartbeats while idle and ends after a terminal status.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::response::sse::{Event, Sse};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use super::models::{EventStatus, Execution, ExecutionEvent};
use super::orchestrator::WorkflowContext;
use crate::errors::WorkflowResult;

/// Idle heartbeat period, short enough for common proxy timeouts.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

const FRAME_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeFrame {
    Connected,
    Event(ExecutionEvent),
    Heartbeat,
    Closed,
}

impl BridgeFrame {
    /// JSON payload of the frame; heartbeats carry none.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Connected => Some(json!({ "connected": true })),
            Self::Event(event) => serde_json::to_value(event).ok(),
            Self::Closed => Some(json!({ "stream_closed": true })),
            Self::Heartbeat => None,
        }
    }

    fn to_sse(&self) -> Event {
        match self.to_json() {
            Some(payload) => Event::default().data(payload.to_string()),
            None => Event::default().comment("ping"),
        }
    }
}

pub struct EventBridge {
    ctx: WorkflowContext,
    heartbeat: Duration,
}

impl EventBridge {
    pub fn new(ctx: WorkflowContext, heartbeat: Duration) -> Self {
        Self { ctx, heartbeat }
    }

    /// Open a stream for `run_id`. Unauthenticated viewers of anonymous runs
    /// see `login_required` in place of the statuses that need an account.
    pub async fn open(
        &self,
        run_id: &str,
        viewer_authenticated: bool,
    ) -> WorkflowResult<mpsc::Receiver<BridgeFrame>> {
        // Subscribe before reading the snapshot so no transition falls in between.
        let events = self.ctx.publisher.subscribe(run_id);
        let execution = self.ctx.load(run_id).await?;

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let relay = Relay {
            ctx: self.ctx.clone(),
            run_id: run_id.to_string(),
            viewer_authenticated,
            heartbeat: self.heartbeat,
        };
        tokio::spawn(relay.run(execution, events, tx));
        Ok(rx)
    }
}

struct Relay {
    ctx: WorkflowContext,
    run_id: String,
    viewer_authenticated: bool,
    heartbeat: Duration,
}

impl Relay {
    async fn run(
        self,
        execution: Execution,
        events: broadcast::Receiver<ExecutionEvent>,
        tx: mpsc::Sender<BridgeFrame>,
    ) {
        self.pump(execution, events, tx).await;
        self.ctx.publisher.release(&self.run_id);
        tracing::debug!(run_id = %self.run_id, "event stream finished");
    }

    /// Consumes the subscription so it is gone before the channel is released.
    async fn pump(
        &self,
        execution: Execution,
        mut events: broadcast::Receiver<ExecutionEvent>,
        tx: mpsc::Sender<BridgeFrame>,
    ) {
        if tx.send(BridgeFrame::Connected).await.is_err() {
            return;
        }
        if !self.forward(ExecutionEvent::snapshot(&execution), &tx).await {
            return;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if tx.send(BridgeFrame::Heartbeat).await.is_err() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        if !self.forward(event, &tx).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(run_id = %self.run_id, skipped, "subscriber lagged, resending snapshot");
                        match self.ctx.load(&self.run_id).await {
                            Ok(current) => {
                                if !self.forward(ExecutionEvent::snapshot(&current), &tx).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(run_id = %self.run_id, error = %e, "snapshot reload failed");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tx.closed() => break,
            }
        }
    }

    /// Send one event. Returns false once the stream is over.
    async fn forward(&self, event: ExecutionEvent, tx: &mpsc::Sender<BridgeFrame>) -> bool {
        let closes = event.status.closes_stream();
        let event = self.gate(event).await;
        if tx.send(BridgeFrame::Event(event)).await.is_err() {
            return false;
        }
        if closes {
            let _ = tx.send(BridgeFrame::Closed).await;
            return false;
        }
        true
    }

    async fn gate(&self, event: ExecutionEvent) -> ExecutionEvent {
        if self.viewer_authenticated || !event.status.requires_login() {
            return event;
        }
        // The run may have been claimed since the stream opened.
        let anonymous = match self.ctx.load(&self.run_id).await {
            Ok(current) => current.is_anonymous(),
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "owner lookup failed, gating event");
                true
            }
        };
        if !anonymous {
            return event;
        }
        ExecutionEvent {
            status: EventStatus::LoginRequired,
            metadata: json!({ "login_required": true }),
            ..event
        }
    }
}

// ── Transports ───────────────────────────────────────────────────────

/// Server-sent events: JSON data frames and `: ping` comments.
pub fn into_sse(
    frames: mpsc::Receiver<BridgeFrame>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(ReceiverStream::new(frames).map(|frame| Ok(frame.to_sse())))
}

/// WebSocket: JSON text frames, heartbeats as Ping, Close after the last frame.
pub async fn pump_websocket(socket: WebSocket, mut frames: mpsc::Receiver<BridgeFrame>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let last = frame == BridgeFrame::Closed;
                let message = match frame.to_json() {
                    Some(payload) => Message::Text(payload.to_string().into()),
                    None => Message::Ping(Vec::new().into()),
                };
                if sender.send(message).await.is_err() || last {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Pongs and client chatter are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
