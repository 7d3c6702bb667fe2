//! Dedicated WebSocket writer task.
//!
//! Every outbound frame (registration, responses, heartbeat pings) goes
//! through one bounded channel to a single task that owns the sink, so
//! concurrent responses never interleave on the wire.

use std::fmt::Display;
use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};
use tunnel_protocol::Envelope;

/// Sender half, cloned by every request task.
pub type EnvelopeSender = mpsc::Sender<Envelope>;

const QUEUE_CAPACITY: usize = 256;

/// Spawn the writer task. Returns the sender and a JoinHandle for cleanup.
///
/// A WebSocket ping is written every `heartbeat` so idle tunnels stay open
/// through proxies. The task ends when every sender is dropped or a write
/// fails.
pub fn spawn_writer<S>(mut sink: S, heartbeat: Duration) -> (EnvelopeSender, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = tokio::select! {
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    match envelope.encode() {
                        Ok(text) => Message::text(text),
                        Err(e) => {
                            warn!(error = %e, kind = envelope.kind(), "dropping unencodable envelope");
                            continue;
                        }
                    }
                }
                _ = ticker.tick() => Message::Ping(Default::default()),
            };
            if let Err(e) = sink.send(message).await {
                error!(error = %e, "failed to write to WebSocket");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use tunnel_protocol::HttpResponse;

    #[tokio::test]
    async fn test_envelopes_written_in_enqueue_order() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (tx, handle) = spawn_writer(sink, Duration::from_secs(3600));

        for id in 1..=3u64 {
            tx.send(Envelope::response(id, HttpResponse::text(200, "ok")))
                .await
                .unwrap();
        }
        drop(tx);

        let mut ids = Vec::new();
        while let Some(message) = written.next().await {
            let Message::Text(text) = message else {
                panic!("expected text frame");
            };
            match Envelope::decode(&text).unwrap() {
                Envelope::Response { correlation_id, .. } => ids.push(correlation_id),
                other => panic!("unexpected {}", other.kind()),
            }
        }
        assert_eq!(ids, vec![1, 2, 3]);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ping() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (_tx, _handle) = spawn_writer(sink, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(written.next().await, Some(Message::Ping(_))));
    }

    #[tokio::test]
    async fn test_stops_when_sink_fails() {
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written);
        let (tx, handle) = spawn_writer(sink, Duration::from_secs(3600));

        tx.send(Envelope::Register { tunnel_id: "abc".into() })
            .await
            .unwrap();
        handle.await.unwrap();
        assert!(tx.is_closed());
    }
}
