//! One link to one relay, with subscription multiplexing.
//!
//! A [`RelayConnection`] owns the link state, answers NIP-42 challenges and
//! keeps at most one live relay subscription per [`SubscriptionHash`]. Local
//! consumers that ask for the same subscription share it:
//!
//! ```text
//! consumer A ─┐
//! consumer B ─┼─► subscription_hash ─► one REQ ─► relay
//! consumer C ─┘
//! ```
//!
//! # Delivery
//!
//! A single reader task processes inbound frames in arrival order. Events
//! are verified before any consumer sees them; invalid frames are dropped.
//! Callbacks run on the reader task and must not block. After
//! [`RelayConnection::close`] returns, no callback fires again.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use nostr::RelayUrl;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::error::{RelayError, RelayResult};
use super::message::{ClientMessage, RelayMessage};
use super::transport::{Transport, TransportSignal};
use super::types::{ConnectionEvent, LinkState, NoticeHandler};
use crate::config::CoreConfig;
use crate::nostr::{
    subscription_hash, Event, Filter, SubscriptionHash, UnsignedEvent, VerifiedEvent,
};
use crate::vault::Signer;

/// Called once per verified event on a subscription.
pub type EventCallback = Arc<dyn Fn(&SubscriptionHash, &VerifiedEvent) + Send + Sync>;

/// Called once when the relay finishes sending stored events.
pub type EoseCallback = Arc<dyn Fn(&SubscriptionHash) + Send + Sync>;

thread_local! {
    /// Connections whose callbacks are running on this thread.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Checks that `url` is a `ws://` or `wss://` relay URL.
///
/// Returns the trimmed URL, which is also the key connections are stored
/// under.
///
/// # Errors
///
/// Returns [`RelayError::InvalidUrl`] for anything else.
pub fn validate_relay_url(url: &str) -> RelayResult<String> {
    let url = url.trim();
    if !(url.starts_with("wss://") || url.starts_with("ws://")) {
        return Err(RelayError::InvalidUrl(format!(
            "{url}: scheme must be ws:// or wss://"
        )));
    }
    RelayUrl::parse(url).map_err(|e| RelayError::InvalidUrl(format!("{url}: {e}")))?;
    Ok(url.to_string())
}

/// A live link to one relay.
///
/// Dropping the connection closes it.
pub struct RelayConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    url: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    signer: Arc<dyn Signer>,
    notices: Arc<dyn NoticeHandler>,
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
    /// Held shared while callbacks run; `close` takes it exclusively.
    delivery_gate: RwLock<()>,
    error_count: AtomicU64,
    subscriptions: Mutex<SubscriptionTable>,
    pending_auth: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct SubscriptionTable {
    live: HashMap<SubscriptionHash, LiveSubscription>,
    next_consumer_id: u64,
}

struct LiveSubscription {
    consumers: Vec<Consumer>,
    eose_seen: bool,
}

struct Consumer {
    id: u64,
    on_event: EventCallback,
    on_eose: EoseCallback,
    eose_delivered: bool,
}

impl RelayConnection {
    /// Opens a link to `url` and starts reading from it.
    ///
    /// # Errors
    ///
    /// - [`RelayError::InvalidUrl`]: `url` is not a relay URL
    /// - [`RelayError::Connection`]: the transport could not open the link
    /// - [`RelayError::Timeout`]: the link did not open within the
    ///   configured connect timeout
    pub async fn connect(
        url: &str,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        notices: Arc<dyn NoticeHandler>,
        config: &CoreConfig,
    ) -> RelayResult<Self> {
        let url = validate_relay_url(url)?;
        let (state, _) = watch::channel(LinkState::Connecting);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        tracing::debug!(relay = %url, "connecting");
        let link = tokio::time::timeout(config.connect_timeout(), transport.open(&url))
            .await
            .map_err(|_| RelayError::Timeout(format!("connecting to {url}")))?
            .inspect_err(|e| tracing::warn!(relay = %url, error = %e, "connect failed"))?;

        let inner = Arc::new(ConnectionInner {
            url,
            outbound: Mutex::new(Some(link.outbound)),
            signer,
            notices,
            state,
            events,
            closed: AtomicBool::new(false),
            delivery_gate: RwLock::new(()),
            error_count: AtomicU64::new(0),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            pending_auth: Mutex::new(None),
            reader: Mutex::new(None),
        });
        inner.set_state(LinkState::Connected);
        tracing::info!(relay = %inner.url, "relay connected");

        let reader = tokio::spawn(run_reader(Arc::clone(&inner), link.inbound));
        *lock(&inner.reader) = Some(reader);

        Ok(Self { inner })
    }

    /// The relay URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Watches link state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to status events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of transport errors seen so far. Never decreases.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.inner.error_count.load(Ordering::Relaxed)
    }

    /// Returns true once the connection is closed or the link was lost.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of live relay subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).live.len()
    }

    /// Number of local consumers attached to `hash`.
    #[must_use]
    pub fn consumer_count(&self, hash: &SubscriptionHash) -> usize {
        lock(&self.inner.subscriptions)
            .live
            .get(hash)
            .map_or(0, |live| live.consumers.len())
    }

    /// Attaches a consumer to the subscription described by `filters`.
    ///
    /// Sends `REQ` only if no live subscription with the same canonical hash
    /// exists. A consumer joining after the relay sent `EOSE` gets its
    /// `on_eose` immediately; stored events it missed are in the local
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Encoding`] for malformed filters and
    /// [`RelayError::Closed`] if the connection is closed.
    pub fn subscribe(
        &self,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_eose: EoseCallback,
    ) -> RelayResult<SubscriptionHandle> {
        if self.inner.is_closed() {
            return Err(RelayError::Closed);
        }
        let hash = subscription_hash(&filters)?;

        let (consumer_id, late_eose) = {
            let mut table = lock(&self.inner.subscriptions);
            let consumer_id = table.next_consumer_id;
            table.next_consumer_id += 1;

            let late_eose = if let Some(live) = table.live.get_mut(&hash) {
                live.consumers.push(Consumer {
                    id: consumer_id,
                    on_event,
                    eose_delivered: live.eose_seen,
                    on_eose: Arc::clone(&on_eose),
                });
                tracing::debug!(relay = %self.inner.url, %hash, consumers = live.consumers.len(), "joined live subscription");
                live.eose_seen
            } else {
                // Sent under the table lock so REQ/CLOSE for one hash stay ordered.
                self.inner.send(&ClientMessage::Req {
                    subscription_id: hash.to_hex(),
                    filters,
                })?;
                table.live.insert(
                    hash,
                    LiveSubscription {
                        consumers: vec![Consumer {
                            id: consumer_id,
                            on_event,
                            on_eose: Arc::clone(&on_eose),
                            eose_delivered: false,
                        }],
                        eose_seen: false,
                    },
                );
                tracing::debug!(relay = %self.inner.url, %hash, "opened subscription");
                false
            };
            (consumer_id, late_eose)
        };

        if late_eose {
            self.inner.deliver([on_eose], |callback| callback(&hash));
        }

        Ok(SubscriptionHandle {
            hash,
            consumer_id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Publishes a signed event.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] if the connection is closed.
    pub fn publish(&self, event: &Event) -> RelayResult<()> {
        self.inner.send(&ClientMessage::Event(event.clone()))?;
        tracing::debug!(relay = %self.inner.url, id = %event.id, "published event");
        Ok(())
    }

    /// Closes the connection. Idempotent.
    ///
    /// When this returns, no callback is running (unless `close` was called
    /// from inside one) and none will fire again, even for frames already
    /// received.
    pub fn close(&self) {
        if !self.inner.shutdown() {
            return;
        }

        if !DeliveryMarker::is_delivering(&self.inner) {
            // Wait out any delivery that passed the closed check before we set it.
            drop(
                self.inner
                    .delivery_gate
                    .write()
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }

        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        let dropped = std::mem::take(&mut lock(&self.inner.subscriptions).live);
        tracing::info!(relay = %self.inner.url, subscriptions = dropped.len(), "relay connection closed");
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .field("error_count", &self.error_count())
            .finish_non_exhaustive()
    }
}

/// A consumer's attachment to a live subscription.
///
/// Dropping the handle does not detach the consumer; call
/// [`SubscriptionHandle::unsubscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    hash: SubscriptionHash,
    consumer_id: u64,
    inner: Weak<ConnectionInner>,
}

impl SubscriptionHandle {
    /// Canonical hash of the subscription.
    #[must_use]
    pub const fn hash(&self) -> SubscriptionHash {
        self.hash
    }

    /// Returns true while this consumer is attached to a live subscription.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            lock(&inner.subscriptions)
                .live
                .get(&self.hash)
                .is_some_and(|live| live.consumers.iter().any(|c| c.id == self.consumer_id))
        })
    }

    /// Detaches this consumer. Sends `CLOSE` if it was the last one.
    ///
    /// Unsubscribing from a closed connection or an already-ended
    /// subscription is a no-op.
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let mut table = lock(&inner.subscriptions);
        let Some(live) = table.live.get_mut(&self.hash) else {
            return;
        };
        live.consumers.retain(|c| c.id != self.consumer_id);
        if !live.consumers.is_empty() {
            return;
        }

        table.live.remove(&self.hash);
        if let Err(e) = inner.send(&ClientMessage::Close(self.hash.to_hex())) {
            tracing::debug!(relay = %inner.url, hash = %self.hash, error = %e, "CLOSE not sent");
        } else {
            tracing::debug!(relay = %inner.url, hash = %self.hash, "closed subscription");
        }
    }
}

impl ConnectionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the connection closed and drops the outbound sender.
    ///
    /// Returns true for the call that performed the shutdown.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        lock(&self.outbound).take();
        lock(&self.pending_auth).take();
        self.set_state(LinkState::Disconnected);
        true
    }

    fn set_state(&self, next: LinkState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(relay = %self.url, state = ?next, "link state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }

    fn send(&self, message: &ClientMessage) -> RelayResult<()> {
        let text = message.to_json()?;
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(RelayError::Closed)?;
        sender.send(text).map_err(|_| RelayError::Closed)
    }

    /// Runs `f` for each item unless the connection closes first.
    fn deliver<T>(&self, items: impl IntoIterator<Item = T>, f: impl Fn(T)) {
        let _gate = self
            .delivery_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let _marker = DeliveryMarker::enter(self);
        for item in items {
            if self.is_closed() {
                break;
            }
            f(item);
        }
    }

    fn handle_frame(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(relay = %self.url, error = %e, "dropping malformed frame");
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(&subscription_id, *event),
            RelayMessage::Eose(subscription_id) => self.handle_eose(&subscription_id),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.handle_ok(&event_id, accepted, message),
            RelayMessage::Notice(message) => {
                self.deliver([message], |message| self.notices.notice(&self.url, &message));
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => self.handle_closed(&subscription_id, message),
            RelayMessage::Auth { challenge } => self.handle_auth(&challenge),
        }
    }

    fn live_hash(&self, subscription_id: &str) -> Option<SubscriptionHash> {
        let hash = SubscriptionHash::from_hex(subscription_id).ok()?;
        lock(&self.subscriptions)
            .live
            .contains_key(&hash)
            .then_some(hash)
    }

    fn handle_event(&self, subscription_id: &str, event: Event) {
        let Some(hash) = self.live_hash(subscription_id) else {
            tracing::trace!(relay = %self.url, subscription_id, "event for unknown subscription");
            return;
        };

        let verified = match event.verify() {
            Ok(verified) => verified,
            Err(e) => {
                tracing::trace!(relay = %self.url, error = %e, "dropping unverifiable event");
                return;
            }
        };

        let callbacks: Vec<EventCallback> = lock(&self.subscriptions)
            .live
            .get(&hash)
            .map(|live| live.consumers.iter().map(|c| Arc::clone(&c.on_event)).collect())
            .unwrap_or_default();

        self.deliver(callbacks, |callback| callback(&hash, &verified));
    }

    fn handle_eose(&self, subscription_id: &str) {
        let Some(hash) = self.live_hash(subscription_id) else {
            return;
        };

        let callbacks: Vec<EoseCallback> = {
            let mut table = lock(&self.subscriptions);
            let Some(live) = table.live.get_mut(&hash) else {
                return;
            };
            live.eose_seen = true;
            live.consumers
                .iter_mut()
                .filter(|c| !c.eose_delivered)
                .map(|c| {
                    c.eose_delivered = true;
                    Arc::clone(&c.on_eose)
                })
                .collect()
        };

        tracing::debug!(relay = %self.url, %hash, "end of stored events");
        self.deliver(callbacks, |callback| callback(&hash));
    }

    fn handle_closed(&self, subscription_id: &str, message: String) {
        let Some(hash) = self.live_hash(subscription_id) else {
            return;
        };
        lock(&self.subscriptions).live.remove(&hash);

        tracing::info!(relay = %self.url, %hash, reason = %message, "relay closed subscription");
        let _ = self
            .events
            .send(ConnectionEvent::SubscriptionClosed { hash, message });
    }

    fn handle_auth(&self, challenge: &str) {
        self.set_state(LinkState::Authenticating);

        let unsigned =
            UnsignedEvent::client_auth(self.signer.public_key(), &self.url, challenge);
        let event = match self.signer.sign(unsigned) {
            Ok(event) => event,
            Err(e) => {
                self.auth_failed(format!("signing failed: {e}"));
                return;
            }
        };

        *lock(&self.pending_auth) = Some(event.id.clone());
        if let Err(e) = self.send(&ClientMessage::Auth(event)) {
            self.auth_failed(e.to_string());
        } else {
            tracing::debug!(relay = %self.url, "sent auth response");
        }
    }

    fn handle_ok(&self, event_id: &str, accepted: bool, message: String) {
        let is_auth = {
            let mut pending = lock(&self.pending_auth);
            if pending.as_deref() == Some(event_id) {
                pending.take();
                true
            } else {
                false
            }
        };

        if !is_auth {
            tracing::debug!(relay = %self.url, event_id, accepted, message = %message, "publish acknowledged");
            return;
        }

        if accepted {
            self.set_state(LinkState::Authenticated);
            tracing::info!(relay = %self.url, "authenticated");
        } else {
            self.auth_failed(message);
        }
    }

    fn auth_failed(&self, reason: String) {
        lock(&self.pending_auth).take();
        if self.is_closed() {
            return;
        }
        self.set_state(LinkState::ConnectedUnauthenticated);
        tracing::warn!(relay = %self.url, reason = %reason, "authentication failed");
        let _ = self.events.send(ConnectionEvent::AuthFailed { reason });
    }

    fn transport_error(&self, message: String) {
        let error_count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(relay = %self.url, error = %message, error_count, "transport error");
        let _ = self.events.send(ConnectionEvent::TransportError {
            message,
            error_count,
        });
    }
}

async fn run_reader(inner: Arc<ConnectionInner>, mut inbound: mpsc::UnboundedReceiver<TransportSignal>) {
    while let Some(signal) = inbound.recv().await {
        if inner.is_closed() {
            return;
        }
        match signal {
            TransportSignal::Frame(text) => inner.handle_frame(&text),
            TransportSignal::Error(message) => inner.transport_error(message),
            TransportSignal::Closed => break,
        }
    }

    if inner.shutdown() {
        lock(&inner.subscriptions).live.clear();
        tracing::warn!(relay = %inner.url, "relay link lost");
    }
}

struct DeliveryMarker {
    key: usize,
}

impl DeliveryMarker {
    fn key(inner: &ConnectionInner) -> usize {
        std::ptr::from_ref(inner) as usize
    }

    fn enter(inner: &ConnectionInner) -> Self {
        let key = Self::key(inner);
        DELIVERING.with_borrow_mut(|keys| keys.push(key));
        Self { key }
    }

    fn is_delivering(inner: &ConnectionInner) -> bool {
        let key = Self::key(inner);
        DELIVERING.with_borrow(|keys| keys.contains(&key))
    }
}

impl Drop for DeliveryMarker {
    fn drop(&mut self) {
        DELIVERING.with_borrow_mut(|keys| {
            if let Some(position) = keys.iter().rposition(|key| *key == self.key) {
                keys.remove(position);
            }
        });
    }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
