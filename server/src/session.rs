//! # Tunnel Session
//!
//! One [`Session`] exists per registered agent connection. It owns the
//! connection and multiplexes any number of concurrent public requests
//! over it:
//!
//! - **Writer**: a single task drains the bounded outbound queue and is the
//!   only code that writes to the connection, so frames never interleave.
//! - **Reader**: reads frames, hands each `Response` to the waiter
//!   registered under its correlation id, and closes the session on
//!   anything else.
//! - **Correlation table**: correlation id → one-shot waiter. An entry is
//!   removed exactly once, by whichever comes first of its response, its
//!   deadline, or the session closing.
//!
//! ## Lifecycle
//! `Registering → Active → Closed`. The session is `Registering` until its
//! `RegisterAck` has been written, `Active` while both loops run, and
//! `Closed` for good after the first read/write failure, protocol violation
//! or explicit [`Session::close`].

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use tunnel_protocol::{CorrelationId, Envelope, HttpRequest, HttpResponse};
use uuid::Uuid;

use crate::error::SessionError;

/// Upper bound on closing the connection once the writer is done.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session tuning, taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Frames buffered in the outbound queue before senders wait.
    pub send_queue_capacity: usize,
    /// How long [`Session::send_request`] waits for the agent.
    pub request_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 32,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Registering,
    Active,
    Closed,
}

/// Why the reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    Disconnected,
    ReadError,
    ProtocolViolation,
    Closed,
}

struct Inner {
    state: SessionState,
    pending: HashMap<CorrelationId, oneshot::Sender<HttpResponse>>,
}

pub struct Session {
    tunnel_id: String,
    public_url: String,
    /// Connection id, only used to tell reconnects of the same tunnel apart in logs.
    conn_id: String,
    request_timeout: Duration,
    outbound: mpsc::Sender<Envelope>,
    /// Receiving end of the outbound queue until the writer takes it.
    outbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    next_correlation: AtomicU64,
    inner: Mutex<Inner>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        tunnel_id: impl Into<String>,
        public_url: impl Into<String>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(settings.send_queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            tunnel_id: tunnel_id.into(),
            public_url: public_url.into(),
            conn_id: Uuid::new_v4().to_string()[..8].to_string(),
            request_timeout: settings.request_timeout,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            next_correlation: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                state: SessionState::Registering,
                pending: HashMap::new(),
            }),
            closed,
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Number of requests currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().pending.len()
    }

    // ─── Connection Driver ──────────────────────────────────────────

    /// Drive the session over a connection until it closes.
    ///
    /// `sink` and `stream` carry one encoded envelope per item. The
    /// `RegisterAck` is always the first frame written. Returns once the
    /// session is `Closed` and the writer has finished; a second call on
    /// the same session returns immediately.
    pub async fn run<Si, St, E>(self: Arc<Self>, sink: Si, stream: St)
    where
        Si: Sink<String> + Unpin + Send + 'static,
        Si::Error: Display + Send,
        St: Stream<Item = Result<String, E>> + Unpin + Send,
        E: Display,
    {
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return;
        };

        let writer = tokio::spawn(Arc::clone(&self).write_loop(sink, outbound_rx));
        let outcome = self.read_loop(stream).await;
        if self.close() {
            info!(
                tunnel_id = %self.tunnel_id,
                conn_id = %self.conn_id,
                reason = ?outcome,
                "session ended"
            );
        }

        if let Err(e) = writer.await {
            warn!(tunnel_id = %self.tunnel_id, error = %e, "session writer panicked");
        }
    }

    async fn write_loop<Si>(self: Arc<Self>, mut sink: Si, mut outbound_rx: mpsc::Receiver<Envelope>)
    where
        Si: Sink<String> + Unpin + Send,
        Si::Error: Display + Send,
    {
        let ack = Envelope::RegisterAck {
            tunnel_id: self.tunnel_id.clone(),
            public_url: self.public_url.clone(),
        };
        if self.write_frame(&mut sink, &ack).await {
            self.mark_active();

            let closed = self.wait_closed();
            tokio::pin!(closed);
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = &mut closed => break,
                    envelope = outbound_rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                if !self.write_frame(&mut sink, &envelope).await {
                    break;
                }
            }
        }

        self.close();
        let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
        debug!(tunnel_id = %self.tunnel_id, conn_id = %self.conn_id, "writer exiting");
    }

    /// Write one envelope; on failure the session is closed and `false` returned.
    ///
    /// A write stalled on a dead connection is abandoned once the session
    /// closes.
    async fn write_frame<Si>(&self, sink: &mut Si, envelope: &Envelope) -> bool
    where
        Si: Sink<String> + Unpin + Send,
        Si::Error: Display + Send,
    {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                // Only a single envelope is lost; the connection is intact.
                warn!(tunnel_id = %self.tunnel_id, error = %e, "dropping unencodable envelope");
                return true;
            }
        };
        let closed = self.wait_closed();
        tokio::select! {
            sent = sink.send(text) => match sent {
                Ok(()) => true,
                Err(e) => {
                    warn!(tunnel_id = %self.tunnel_id, error = %e, "session write failed");
                    self.close();
                    false
                }
            },
            _ = closed => false,
        }
    }

    async fn read_loop<St, E>(&self, mut stream: St) -> ReadOutcome
    where
        St: Stream<Item = Result<String, E>> + Unpin,
        E: Display,
    {
        let closed = self.wait_closed();
        tokio::pin!(closed);
        loop {
            let frame = tokio::select! {
                _ = &mut closed => return ReadOutcome::Closed,
                frame = stream.next() => frame,
            };

            let text = match frame {
                None => return ReadOutcome::Disconnected,
                Some(Err(e)) => {
                    warn!(tunnel_id = %self.tunnel_id, error = %e, "session read failed");
                    return ReadOutcome::ReadError;
                }
                Some(Ok(text)) => text,
            };

            match Envelope::decode(&text) {
                Ok(Envelope::Response {
                    correlation_id,
                    status,
                    headers,
                    body,
                }) => self.deliver(
                    correlation_id,
                    HttpResponse {
                        status,
                        headers,
                        body,
                    },
                ),
                Ok(other) => {
                    warn!(
                        tunnel_id = %self.tunnel_id,
                        kind = other.kind(),
                        "unexpected envelope from agent"
                    );
                    return ReadOutcome::ProtocolViolation;
                }
                Err(e) => {
                    warn!(tunnel_id = %self.tunnel_id, error = %e, "undecodable frame from agent");
                    return ReadOutcome::ProtocolViolation;
                }
            }
        }
    }

    /// Resolves once the session has been closed.
    fn wait_closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut closed = self.closed.subscribe();
        async move {
            let _ = closed.wait_for(|closed| *closed).await;
        }
    }

    fn mark_active(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Registering {
            inner.state = SessionState::Active;
        }
    }

    // ─── Request Multiplexing ───────────────────────────────────────

    /// Relay one request to the agent and wait for its response.
    ///
    /// Fails with [`SessionError::Timeout`] when the agent does not answer
    /// within the request timeout (the time spent waiting for queue space
    /// counts), and with [`SessionError::Closed`] when the session closes
    /// first. Dropping the returned future withdraws the request's waiter.
    pub async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, SessionError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return Err(SessionError::Closed);
            }
            inner.pending.insert(correlation_id, tx);
        }
        let _waiter = WaiterGuard {
            session: self,
            correlation_id,
        };

        debug!(
            tunnel_id = %self.tunnel_id,
            correlation_id,
            method = %request.method,
            path = %request.path,
            "relaying request"
        );

        let exchange = async {
            // Waiting for queue space must not outlive the session.
            tokio::select! {
                sent = self.outbound.send(Envelope::request(correlation_id, request)) => {
                    sent.map_err(|_| SessionError::Closed)?
                }
                _ = self.wait_closed() => return Err(SessionError::Closed),
            }
            rx.await.map_err(|_| SessionError::Closed)
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tunnel_id = %self.tunnel_id, correlation_id, "request timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    /// Hand a response to its waiter; responses nobody waits for are dropped.
    fn deliver(&self, correlation_id: CorrelationId, response: HttpResponse) {
        let waiter = self.inner.lock().pending.remove(&correlation_id);
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!(tunnel_id = %self.tunnel_id, correlation_id, "requester went away");
                }
            }
            None => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    correlation_id,
                    "discarding response with no waiting request"
                );
            }
        }
    }

    /// Close the session: stop both loops, drop the connection and fail
    /// every waiting request with [`SessionError::Closed`].
    ///
    /// Returns `true` for the call that performed the transition.
    pub fn close(&self) -> bool {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            std::mem::take(&mut inner.pending)
        };

        // Dropping the senders wakes every waiter with an error.
        let failed = pending.len();
        drop(pending);
        self.outbound_rx.lock().take();
        self.closed.send_replace(true);

        info!(tunnel_id = %self.tunnel_id, conn_id = %self.conn_id, failed, "session closed");
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tunnel_id", &self.tunnel_id)
            .field("conn_id", &self.conn_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Removes a request's correlation entry however its wait ends.
struct WaiterGuard<'a> {
    session: &'a Session,
    correlation_id: CorrelationId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.session.inner.lock().pending.remove(&self.correlation_id);
    }
}
