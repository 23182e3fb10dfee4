//! Typed publish/subscribe multiplexer for network messages.
//!
//! Producers feed messages through [`Dispatcher::put_message`]; a single
//! cooperative task drains the input channel and fans each message out to
//! the subscribers of its type. Deduplication happens at ingress, per
//! message type, using a bounded fingerprint cache. A saturated subscriber
//! loses the message; other subscribers are unaffected.

use crate::types::hash::Hash;
use dashmap::DashMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Capacity of the dispatcher input channel.
pub const INPUT_CHANNEL_SIZE: usize = 65_536;

/// Capacity of the duplicate-fingerprint cache.
pub const DEDUP_CACHE_SIZE: usize = 51_200;

/// Errors produced by subscriber management.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("conflicting duplicate filter for message type: {0}")]
    ConflictingFilter(String),

    #[error("dispatcher already started")]
    AlreadyStarted,
}

/// A typed network message with a content fingerprint.
#[derive(Debug, Clone)]
pub struct NetMessage {
    msg_type: String,
    from: String,
    data: Vec<u8>,
}

impl NetMessage {
    pub fn new(msg_type: impl Into<String>, from: impl Into<String>, data: Vec<u8>) -> Self {
        NetMessage {
            msg_type: msg_type.into(),
            from: from.into(),
            data,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.msg_type
    }

    /// Identity of the peer the message came from.
    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Content fingerprint used for deduplication.
    ///
    /// Covers the type and payload but not the sender, so the same message
    /// relayed by two peers counts as a duplicate.
    pub fn hash(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(self.msg_type.as_bytes());
        h.update(&self.data);
        h.finalize()
    }
}

static SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A registered consumer of one message type.
///
/// Each subscriber owns a bounded channel; the receiving half stays with
/// the caller.
pub struct Subscriber {
    id: u64,
    msg_type: String,
    do_filter: bool,
    sender: mpsc::Sender<NetMessage>,
}

impl Subscriber {
    /// Creates a subscriber for `msg_type` with the given channel capacity.
    ///
    /// `do_filter` requests ingress deduplication for the whole type.
    pub fn new(
        msg_type: impl Into<String>,
        capacity: usize,
        do_filter: bool,
    ) -> (Subscriber, mpsc::Receiver<NetMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Subscriber {
                id: SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
                msg_type: msg_type.into(),
                do_filter,
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn message_type(&self) -> &str {
        &self.msg_type
    }

    pub fn do_filter(&self) -> bool {
        self.do_filter
    }
}

struct Shared {
    subscribers: DashMap<String, Vec<Subscriber>>,
    filters: DashMap<String, bool>,
    seen: Mutex<LruCache<Hash, ()>>,
    dropped: AtomicU64,
}

impl Shared {
    fn dispatch(&self, msg: NetMessage) {
        let Some(entry) = self.subscribers.get(msg.message_type()) else {
            return;
        };

        for subscriber in entry.iter() {
            match subscriber.sender.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        msg_type = msg.message_type(),
                        subscriber = subscriber.id,
                        "subscriber channel full, message dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(
                        msg_type = msg.message_type(),
                        subscriber = subscriber.id,
                        "subscriber channel closed"
                    );
                }
            }
        }
    }
}

/// Multiplexes typed messages from the network to their subscribers.
pub struct Dispatcher {
    shared: Arc<Shared>,
    input_tx: mpsc::Sender<NetMessage>,
    input_rx: Mutex<Option<mpsc::Receiver<NetMessage>>>,
    quit_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
        Dispatcher {
            shared: Arc::new(Shared {
                subscribers: DashMap::new(),
                filters: DashMap::new(),
                seen: Mutex::new(LruCache::new(
                    NonZeroUsize::new(DEDUP_CACHE_SIZE).expect("cache size is non-zero"),
                )),
                dropped: AtomicU64::new(0),
            }),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            quit_tx: Mutex::new(None),
        }
    }

    /// Registers a subscriber for its message type.
    ///
    /// A registration whose filter flag contradicts the flag already
    /// recorded for the type is rejected rather than silently overwriting.
    pub fn register(&self, subscriber: Subscriber) -> Result<(), DispatchError> {
        let msg_type = subscriber.msg_type.clone();

        match self.shared.filters.entry(msg_type.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                if *entry.get() != subscriber.do_filter {
                    return Err(DispatchError::ConflictingFilter(msg_type));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(subscriber.do_filter);
            }
        }

        self.shared
            .subscribers
            .entry(msg_type)
            .or_default()
            .push(subscriber);
        Ok(())
    }

    /// Removes a subscriber; the type's filter flag goes with the last one.
    pub fn deregister(&self, msg_type: &str, id: u64) {
        let mut empty = false;
        if let Some(mut entry) = self.shared.subscribers.get_mut(msg_type) {
            entry.retain(|sub| sub.id != id);
            empty = entry.is_empty();
        }
        if empty {
            self.shared.subscribers.remove(msg_type);
            self.shared.filters.remove(msg_type);
        }
    }

    /// Number of messages dropped because a subscriber channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Feeds a message into the dispatcher.
    ///
    /// The duplicate check never blocks; a full input channel applies
    /// backpressure to the producer.
    pub async fn put_message(&self, msg: NetMessage) {
        let filtered = self
            .shared
            .filters
            .get(msg.message_type())
            .map(|flag| *flag)
            .unwrap_or(false);
        if filtered {
            let mut seen = self.shared.seen.lock().unwrap();
            if seen.put(msg.hash(), ()).is_some() {
                // Duplicate, drop at ingress.
                return;
            }
        }

        if self.input_tx.send(msg).await.is_err() {
            warn!("dispatcher input channel closed");
        }
    }

    /// Starts the dispatch loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut input_rx = self
            .input_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(DispatchError::AlreadyStarted)?;

        let (quit_tx, mut quit_rx) = oneshot::channel();
        *self.quit_tx.lock().unwrap() = Some(quit_tx);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            info!("started dispatcher");
            loop {
                tokio::select! {
                    _ = &mut quit_rx => {
                        info!("stopped dispatcher");
                        return;
                    }
                    msg = input_rx.recv() => match msg {
                        Some(msg) => shared.dispatch(msg),
                        None => return,
                    }
                }
            }
        });
        Ok(())
    }

    /// Signals the dispatch loop to terminate.
    pub fn stop(&self) {
        if let Some(quit) = self.quit_tx.lock().unwrap().take() {
            let _ = quit.send(());
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
