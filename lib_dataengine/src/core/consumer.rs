//! # Consumers
//!
//! A consumer is anything that wants change notifications for a source. The
//! engine never holds a consumer's state, only a sender: updates are pushed
//! into an unbounded channel whose receiving half belongs to the application.

use crate::core::data_set::DataSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique consumer identity, used for lookup only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    fn next() -> Self {
        Self(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// # Data Update
///
/// One data update notification. Every subscriber reached by the same
/// flush pass receives a clone of the same `Arc`, so nobody can observe a
/// partially written set.
#[derive(Debug, Clone)]
pub struct DataUpdate {
    /// Name of the source that changed.
    pub source: String,
    /// Immutable snapshot of the source's data.
    pub data: Arc<DataSet>,
}

/// # Consumer
///
/// Cheap, cloneable handle registered with a registry. Clones share the id
/// and the channel, so connecting a clone counts as the same consumer.
#[derive(Debug, Clone)]
pub struct Consumer {
    id: ConsumerId,
    label: Arc<str>,
    sender: mpsc::UnboundedSender<DataUpdate>,
}

impl Consumer {
    /// Creates a consumer and the receiver its updates are pushed into.
    pub fn new(label: &str) -> (Self, mpsc::UnboundedReceiver<DataUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = Self {
            id: ConsumerId::next(),
            label: Arc::from(label),
            sender,
        };
        (consumer, receiver)
    }

    /// The consumer's identity.
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Human readable label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the receiving half was dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Pushes an update. `false` means the consumer is gone.
    pub(crate) fn deliver(&self, source: &str, data: &Arc<DataSet>) -> bool {
        self.sender
            .send(DataUpdate {
                source: source.to_string(),
                data: Arc::clone(data),
            })
            .is_ok()
    }
}

/// A consumer as seen by one source: the handle plus the content revision it
/// last received.
#[derive(Debug, Clone)]
pub(crate) struct Subscriber {
    pub(crate) consumer: Consumer,
    pub(crate) seen_revision: u64,
}

impl Subscriber {
    pub(crate) fn new(consumer: Consumer, seen_revision: u64) -> Self {
        Self {
            consumer,
            seen_revision,
        }
    }
}
