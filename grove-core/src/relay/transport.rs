//! Network seam between a relay connection and the wire.
//!
//! A [`Transport`] opens a [`TransportLink`]: a pair of channels carrying
//! text frames out and [`TransportSignal`]s in. A successful open means the
//! link is established. [`WebSocketTransport`] is the production
//! implementation; [`MemoryTransport`] lets tests play the relay side.

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::error::{RelayError, RelayResult};

/// Something arriving from the relay side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// A text frame.
    Frame(String),

    /// A non-fatal transport error.
    Error(String),

    /// The link is gone. Nothing follows.
    Closed,
}

/// An established link to a relay.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to write to the relay. Dropping every sender closes the link.
    pub outbound: mpsc::UnboundedSender<String>,

    /// Frames and errors read from the relay.
    pub inbound: mpsc::UnboundedReceiver<TransportSignal>,
}

/// Opens links to relays.
pub trait Transport: Send + Sync {
    /// Opens a link to `url`.
    ///
    /// The returned future resolves once the link is usable.
    fn open(&self, url: &str) -> BoxFuture<'static, RelayResult<TransportLink>>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates the transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, RelayResult<TransportLink>> {
        let url = url.to_string();
        async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| RelayError::Connection {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            tracing::info!(relay = %url, "websocket connected");

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportSignal>();
            let (mut write, mut read) = ws.split();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        out = out_rx.recv() => {
                            let Some(out) = out else {
                                // Every sender dropped: the connection was closed locally.
                                let _ = write.close().await;
                                break;
                            };
                            if let Err(err) = write.send(Message::Text(out)).await {
                                tracing::warn!(relay = %url, error = %err, "relay send failed");
                                let _ = in_tx.send(TransportSignal::Error(err.to_string()));
                                break;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    tracing::trace!(relay = %url, "relay rx");
                                    if in_tx.send(TransportSignal::Frame(text)).is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    tracing::warn!(relay = %url, error = %err, "relay read failed");
                                    let _ = in_tx.send(TransportSignal::Error(err.to_string()));
                                    break;
                                }
                            }
                        }
                    }
                }
                let _ = in_tx.send(TransportSignal::Closed);
                tracing::debug!(relay = %url, "websocket task finished");
            });

            Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryRelay, MemoryTransport};

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Mutex, PoisonError};

    use futures::future::{self, BoxFuture};
    use futures::FutureExt;
    use tokio::sync::mpsc;

    use super::{Transport, TransportLink, TransportSignal};
    use crate::nostr::Result as NostrResult;
    use crate::relay::error::{RelayError, RelayResult};
    use crate::relay::message::{ClientMessage, RelayMessage};

    /// In-process transport for tests.
    ///
    /// Every successful [`Transport::open`] queues a [`MemoryRelay`] that the
    /// test retrieves with [`MemoryTransport::take_relay`] to script the
    /// relay side of the link.
    ///
    /// This implementation should only be used in tests.
    #[derive(Debug, Default)]
    pub struct MemoryTransport {
        state: Mutex<MemoryState>,
    }

    #[derive(Debug, Default)]
    struct MemoryState {
        refused: HashSet<String>,
        stalled: HashSet<String>,
        opened: HashMap<String, Vec<MemoryRelay>>,
        open_count: HashMap<String, usize>,
    }

    impl MemoryTransport {
        /// Creates a transport that accepts every URL.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes opens to `url` fail with a connection error.
        pub fn refuse(&self, url: &str) {
            self.lock().refused.insert(url.to_string());
        }

        /// Makes opens to `url` never complete.
        pub fn stall(&self, url: &str) {
            self.lock().stalled.insert(url.to_string());
        }

        /// Removes and returns the oldest unclaimed relay end for `url`.
        #[must_use]
        pub fn take_relay(&self, url: &str) -> Option<MemoryRelay> {
            let mut state = self.lock();
            let queue = state.opened.get_mut(url)?;
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        }

        /// Number of successful opens to `url`.
        #[must_use]
        pub fn open_count(&self, url: &str) -> usize {
            self.lock().open_count.get(url).copied().unwrap_or(0)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Transport for MemoryTransport {
        fn open(&self, url: &str) -> BoxFuture<'static, RelayResult<TransportLink>> {
            let mut state = self.lock();

            if state.stalled.contains(url) {
                return future::pending::<RelayResult<TransportLink>>().boxed();
            }
            if state.refused.contains(url) {
                return future::ready(Err(RelayError::Connection {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }))
                .boxed();
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            state
                .opened
                .entry(url.to_string())
                .or_default()
                .push(MemoryRelay {
                    url: url.to_string(),
                    to_client: in_tx,
                    from_client: out_rx,
                });
            *state.open_count.entry(url.to_string()).or_default() += 1;

            future::ready(Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            }))
            .boxed()
        }
    }

    /// The relay end of an in-memory link.
    #[derive(Debug)]
    pub struct MemoryRelay {
        url: String,
        to_client: mpsc::UnboundedSender<TransportSignal>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MemoryRelay {
        /// URL the client opened.
        #[must_use]
        pub fn url(&self) -> &str {
            &self.url
        }

        /// Sends a relay frame to the client.
        ///
        /// # Errors
        ///
        /// Returns an error if the frame fails to encode.
        pub fn send(&self, message: &RelayMessage) -> NostrResult<()> {
            self.send_raw(&message.to_json()?);
            Ok(())
        }

        /// Sends raw text to the client, valid or not.
        pub fn send_raw(&self, text: &str) {
            let _ = self.to_client.send(TransportSignal::Frame(text.to_string()));
        }

        /// Reports a transport error to the client.
        pub fn fail(&self, message: &str) {
            let _ = self.to_client.send(TransportSignal::Error(message.to_string()));
        }

        /// Drops the link from the relay side.
        pub fn hang_up(&self) {
            let _ = self.to_client.send(TransportSignal::Closed);
        }

        /// Waits for the next frame from the client.
        ///
        /// Returns `None` once the client has closed the link. Frames that
        /// do not decode as client messages are skipped.
        pub async fn recv(&mut self) -> Option<ClientMessage> {
            while let Some(text) = self.from_client.recv().await {
                if let Ok(message) = ClientMessage::from_json(&text) {
                    return Some(message);
                }
            }
            None
        }

        /// Returns every frame the client has sent so far without waiting.
        pub fn drain(&mut self) -> Vec<ClientMessage> {
            let mut frames = Vec::new();
            while let Ok(text) = self.from_client.try_recv() {
                if let Ok(message) = ClientMessage::from_json(&text) {
                    frames.push(message);
                }
            }
            frames
        }

        /// Returns true once the client has dropped its side of the link.
        #[must_use]
        pub fn is_closed_by_client(&self) -> bool {
            self.to_client.is_closed()
        }
    }
}
