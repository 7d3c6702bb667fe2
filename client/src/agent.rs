//! # Agent Connection Loop
//!
//! Keeps one WebSocket session to the tunnel server alive:
//! 1. Connect and send `Register`
//! 2. Wait for the matching `RegisterAck` and log the public URL
//! 3. Serve relayed requests until the connection drops
//! 4. Wait the reconnect delay and go to step 1, unless shutting down

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tunnel_protocol::Envelope;

use crate::config::{Config, REGISTER_ACK_TIMEOUT};
use crate::error::AgentError;
use crate::forwarder::{forward, HttpForwarder, LocalTarget};
use crate::writer::{spawn_writer, EnvelopeSender};

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Shutdown was requested locally.
    Shutdown,
    /// The server went away; reconnect.
    Disconnected,
}

/// Run the agent until `shutdown` flips to `true`.
pub async fn run(config: Config, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let tunnel_id = config
        .tunnel_id
        .clone()
        .unwrap_or_else(crate::generate_tunnel_id);
    let target: Arc<dyn LocalTarget> =
        Arc::new(HttpForwarder::new(config.local_base_url(), config.local_timeout())?);
    info!(%tunnel_id, local = %config.local_base_url(), "starting agent");

    loop {
        let session = connect_and_run(&config, &tunnel_id, Arc::clone(&target), shutdown.clone());
        let outcome = tokio::select! {
            outcome = session => outcome,
            _ = stopped(&mut shutdown) => return Ok(()),
        };
        match outcome {
            Ok(SessionOutcome::Shutdown) => return Ok(()),
            Ok(SessionOutcome::Disconnected) => warn!("disconnected from server"),
            Err(e) => error!(error = %e, "tunnel session failed"),
        }

        info!("reconnecting in {}s...", config.reconnect_delay().as_secs());
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
            _ = stopped(&mut shutdown) => return Ok(()),
        }
    }
}

/// One connection: register, then serve until disconnect or shutdown.
pub async fn connect_and_run(
    config: &Config,
    tunnel_id: &str,
    target: Arc<dyn LocalTarget>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionOutcome, AgentError> {
    info!(server = %config.server, "connecting");
    let (ws, _response) = tokio_tungstenite::connect_async(config.server.as_str()).await?;
    let (sink, mut stream) = ws.split();
    let (outbound, writer) = spawn_writer(sink, config.heartbeat_interval());

    let result = async {
        let public_url = register(&outbound, &mut stream, tunnel_id, REGISTER_ACK_TIMEOUT).await?;
        info!(%tunnel_id, %public_url, "🚇 tunnel online");

        tokio::select! {
            result = serve(stream, outbound, target) => result.map(|()| SessionOutcome::Disconnected),
            _ = stopped(&mut shutdown) => Ok(SessionOutcome::Shutdown),
        }
    }
    .await;

    writer.abort();
    result
}

/// Send `Register` and wait for the server's acknowledgement.
///
/// Returns the public URL. Any other first message, a mismatched id or a
/// close before the ack fails the attempt.
pub async fn register<St, E>(
    outbound: &EnvelopeSender,
    stream: &mut St,
    tunnel_id: &str,
    wait: Duration,
) -> Result<String, AgentError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    AgentError: From<E>,
{
    outbound
        .send(Envelope::Register {
            tunnel_id: tunnel_id.to_string(),
        })
        .await
        .map_err(|_| AgentError::Closed)?;

    let ack = async {
        match next_envelope(stream).await? {
            Some(Envelope::RegisterAck {
                tunnel_id: acked,
                public_url,
            }) if acked == tunnel_id => Ok(public_url),
            Some(Envelope::RegisterAck { tunnel_id: got, .. }) => Err(AgentError::TunnelIdMismatch {
                expected: tunnel_id.to_string(),
                got,
            }),
            Some(other) => Err(AgentError::UnexpectedMessage(other.kind())),
            None => Err(AgentError::Closed),
        }
    };

    tokio::time::timeout(wait, ack)
        .await
        .map_err(|_| AgentError::RegisterTimeout(wait))?
}

/// Serve relayed requests until the stream ends.
///
/// Every request runs on its own task so slow local calls never hold up
/// the others. Anything other than `Request` ends the session.
pub async fn serve<St, E>(
    mut stream: St,
    outbound: EnvelopeSender,
    target: Arc<dyn LocalTarget>,
) -> Result<(), AgentError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    AgentError: From<E>,
{
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            envelope = next_envelope(&mut stream) => {
                match envelope? {
                    None => return Ok(()),
                    Some(Envelope::Request { correlation_id, method, path, headers, body }) => {
                        debug!(correlation_id, %method, %path, "relayed request");
                        let request = tunnel_protocol::HttpRequest { method, path, headers, body };
                        let target = Arc::clone(&target);
                        let outbound = outbound.clone();
                        tasks.spawn(async move {
                            let response = forward(target.as_ref(), request).await;
                            let status = response.status;
                            if outbound
                                .send(Envelope::response(correlation_id, response))
                                .await
                                .is_err()
                            {
                                debug!(correlation_id, "connection gone, dropping response");
                            } else {
                                debug!(correlation_id, status, "response queued");
                            }
                        });
                    }
                    Some(other) => {
                        warn!(kind = other.kind(), "protocol violation from server");
                        return Err(AgentError::UnexpectedMessage(other.kind()));
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "request task failed");
                }
            }
        }
    }
}

/// Next decoded envelope, skipping control frames. `None` once closed.
async fn next_envelope<St, E>(stream: &mut St) -> Result<Option<Envelope>, AgentError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    AgentError: From<E>,
{
    while let Some(message) = stream.next().await {
        let envelope = match message? {
            Message::Text(text) => Envelope::decode(&text)?,
            Message::Binary(data) => Envelope::decode(&String::from_utf8_lossy(&data))?,
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    info!(code = %frame.code, reason = %frame.reason, "server closed connection");
                    if frame.reason.is_empty() {
                        return Ok(None);
                    }
                    return Err(AgentError::ClosedByServer(frame.reason.to_string()));
                }
                return Ok(None);
            }
            _ => continue,
        };
        return Ok(Some(envelope));
    }
    Ok(None)
}

/// Resolves once shutdown is requested. Pends forever if the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
