//! In-process connection over tokio mpsc channels
//!
//! Used for loopback links and to wire two engines together in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::{Connection, TransportError};
use crate::engine::Engine;

const CHANNEL_CAPACITY: usize = 64;

/// Sending half of an mpsc link to a peer
pub struct ChannelConnection {
    id: String,
    peer: String,
    tx: mpsc::Sender<String>,
}

/// One side of a linked pair: its connection to the peer and its inbox
pub type ChannelEnd = (Arc<ChannelConnection>, mpsc::Receiver<String>);

impl ChannelConnection {
    /// Connection to `peer`; frames sent on it come out of the returned receiver
    pub fn new(peer: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let conn = Arc::new(Self {
            id: format!("chan-{}", Uuid::new_v4()),
            peer: peer.into(),
            tx,
        });
        (conn, rx)
    }

    /// Two linked ends: what `a` sends arrives in `b`'s inbox and vice versa
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (ChannelEnd, ChannelEnd) {
        let (to_b, inbox_b) = Self::new(b);
        let (to_a, inbox_a) = Self::new(a);
        ((to_b, inbox_a), (to_a, inbox_b))
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Feed `inbox` into the engine, answering over `connection`.
///
/// The connection is routable as soon as this returns; the handle completes
/// when the peer drops its end or the engine shuts down.
pub fn serve(
    engine: &Arc<Engine>,
    connection: Arc<ChannelConnection>,
    mut inbox: mpsc::Receiver<String>,
    uplink: bool,
) -> JoinHandle<()> {
    let connection: Arc<dyn Connection> = connection;
    if uplink {
        engine.connections().set_uplink(connection.clone());
    } else {
        engine.connections().register(connection.clone());
    }

    let engine = engine.clone();
    tokio::spawn(async move {
        let shutdown = engine.shutdown_token().clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = inbox.recv() => match frame {
                    Some(text) => engine.dispatch_frame(connection.clone(), text),
                    None => break,
                }
            }
        }
        debug!("Channel {} to {} stopped", connection.id(), connection.peer());
        engine.connection_closed(connection.id());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let ((a_to_b, mut inbox_a), (b_to_a, mut inbox_b)) = ChannelConnection::pair("A", "B");
        assert_eq!(a_to_b.peer(), "B");
        assert_eq!(b_to_a.peer(), "A");

        a_to_b.send_text("ping".to_string()).await.unwrap();
        b_to_a.send_text("pong".to_string()).await.unwrap();

        assert_eq!(inbox_b.recv().await.as_deref(), Some("ping"));
        assert_eq!(inbox_a.recv().await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, rx) = ChannelConnection::new("B");
        drop(rx);

        assert!(conn.is_closed());
        let err = conn.send_text("x".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }
}
