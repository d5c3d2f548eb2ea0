// In-process connector.
//
// Each accepted `connect` produces a `MemorySession`: the peer end of the
// transport. Whoever holds the session can push frames at the client,
// read what the client sent, inject transport errors, or hang up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{future, sink, stream};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::envelope::Payload;
use super::socket::{ConnectFuture, Connector, Frame, Transport};
use crate::error::Error;

/// What the next `connect` call does.
#[derive(Debug, Clone)]
pub enum ConnectPlan {
    /// Open a session.
    Accept,
    /// Fail immediately with the given reason.
    Refuse(String),
    /// Never resolve (exercises connect timeouts).
    Hang,
}

struct Shared {
    plans: VecDeque<ConnectPlan>,
    attempts: usize,
}

/// Connector that opens in-process transports.
///
/// Plans are consumed one per `connect`; with none queued the connector
/// accepts.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
    sessions_tx: mpsc::UnboundedSender<MemorySession>,
    sessions_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemorySession>>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                plans: VecDeque::new(),
                attempts: 0,
            })),
            sessions_tx,
            sessions_rx: Arc::new(tokio::sync::Mutex::new(sessions_rx)),
        }
    }

    /// Queue the behavior of an upcoming `connect`.
    pub fn push_plan(&self, plan: ConnectPlan) {
        self.lock().plans.push_back(plan);
    }

    /// Total `connect` calls so far, accepted or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Wait for the next accepted session.
    pub async fn next_session(&self) -> Option<MemorySession> {
        self.sessions_rx.lock().await.recv().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &Url) -> ConnectFuture {
        let plan = {
            let mut shared = self.lock();
            shared.attempts += 1;
            shared.plans.pop_front().unwrap_or(ConnectPlan::Accept)
        };
        tracing::debug!(url = %endpoint, ?plan, "memory connect");

        match plan {
            ConnectPlan::Refuse(reason) => Box::pin(future::ready(Err(Error::StreamConnect(reason)))),
            ConnectPlan::Hang => Box::pin(future::pending()),
            ConnectPlan::Accept => {
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                let (payloads_tx, payloads_rx) = mpsc::unbounded_channel();

                let reader = stream::unfold(frames_rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                let writer = sink::unfold(payloads_tx, |tx: mpsc::UnboundedSender<Payload>, payload| async move {
                    tx.send(payload)
                        .map_err(|_| Error::StreamTransport("peer hung up".into()))?;
                    Ok::<_, Error>(tx)
                });

                // The test side may not be listening; the transport still opens.
                let _ = self.sessions_tx.send(MemorySession {
                    frames: frames_tx,
                    payloads: payloads_rx,
                });

                Box::pin(future::ready(Ok(Transport {
                    reader: Box::pin(reader),
                    writer: Box::pin(writer),
                })))
            }
        }
    }
}

/// Peer end of one in-process transport. Dropping it hangs up.
pub struct MemorySession {
    frames: mpsc::UnboundedSender<Result<Frame, Error>>,
    payloads: mpsc::UnboundedReceiver<Payload>,
}

impl MemorySession {
    /// Push a text frame to the client. Returns `false` once the client
    /// has dropped the transport.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(Frame::Text(text.into()))
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        self.frames.send(Ok(frame)).is_ok()
    }

    /// Surface a transport error on the client's reader.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.frames
            .send(Err(Error::StreamTransport(reason.into())))
            .is_ok()
    }

    /// Next payload the client wrote.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.payloads.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.payloads.try_recv().ok()
    }

    /// `true` while the client still holds the transport.
    pub fn is_open(&self) -> bool {
        !self.frames.is_closed()
    }
}
