//! # Data Source
//!
//! One named source of an engine. It owns the source's [`DataSet`], the relays
//! keyed by `(interval, alignment)` and the set of direct (event driven)
//! subscribers, and it decides who must be told about a change.
//!
//! ## Freshness
//!
//! Every real content change bumps a revision counter. Each subscriber
//! remembers the revision it last received, which gives three guarantees:
//!
//! 1.  A flush or a relay tick never sends the same revision twice to a
//!     subscriber, even when both land in one scheduling quantum.
//! 2.  A relay tick delivers to subscribers that missed a change, so a publish
//!     made just before the tick is not postponed by a whole interval.
//! 3.  A subscriber that moves between relays keeps its history.
//!
//! The source never destroys itself. Removal is always the registry's call.

use crate::core::consumer::{Consumer, ConsumerId, Subscriber};
use crate::core::data_set::{DataSet, Value};
use crate::core::relay::{IntervalAlignment, Relay, RelayKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::delay_queue;

/// # Delivery
///
/// Outcome of one notification pass over a source.
#[derive(Debug, Default)]
pub(crate) struct Delivery {
    /// At least one subscriber was handed a snapshot.
    pub(crate) notified: bool,
    /// Consumers whose receiver is gone. They must be disconnected everywhere.
    pub(crate) ghosts: Vec<ConsumerId>,
}

/// Result of [`DataSource::subscribe`].
#[derive(Debug, Default)]
pub(crate) struct SubscribeOutcome {
    /// A relay was created and needs a timer; the flag asks for an immediate first tick.
    pub(crate) new_relay: Option<(RelayKey, bool)>,
    /// The relay the consumer left, destroyed because it became empty.
    pub(crate) dropped_relay: Option<Relay>,
    /// The immediate delivery found the consumer's receiver closed.
    pub(crate) ghost: bool,
}

/// A subscriber removed from a source.
#[derive(Debug)]
pub(crate) struct Detached {
    pub(crate) subscriber: Subscriber,
    pub(crate) dropped_relay: Option<Relay>,
}

/// Per-relay line of a [`SourceStats`] report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    /// Polling interval in milliseconds.
    pub interval_ms: u64,
    /// Wall-clock alignment.
    pub alignment: IntervalAlignment,
    /// Number of consumers batched on this relay.
    pub subscribers: usize,
    /// Whether the last tick found no fresh data.
    pub pending: bool,
    /// Time left until the next tick, in milliseconds.
    pub next_fire_in_ms: u64,
}

/// # Source Stats
///
/// Diagnostic view of a source: how much data it holds and who listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    /// Source name.
    pub name: String,
    /// Number of keys in the data set.
    pub data_count: usize,
    /// Whether the data is persisted through the storage collaborator.
    pub storage_enabled: bool,
    /// Number of event driven subscribers.
    pub direct_subscribers: usize,
    /// One line per live relay.
    pub relays: Vec<RelayStats>,
}

#[derive(Debug)]
pub(crate) struct DataSource {
    pub(crate) name: String,
    data: DataSet,
    revision: u64,
    needs_update: bool,
    last_update: Option<Instant>,
    pub(crate) storage_enabled: bool,
    pub(crate) needs_store: bool,
    pub(crate) store_timer: Option<delay_queue::Key>,
    pub(crate) relays: BTreeMap<RelayKey, Relay>,
    direct: BTreeMap<ConsumerId, Subscriber>,
    consumers: HashMap<ConsumerId, Option<RelayKey>>,
    pub(crate) on_demand: bool,
}

impl DataSource {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: DataSet::new(),
            revision: 0,
            needs_update: false,
            last_update: None,
            storage_enabled: false,
            needs_store: false,
            store_timer: None,
            relays: BTreeMap::new(),
            direct: BTreeMap::new(),
            consumers: HashMap::new(),
            on_demand: false,
        }
    }

    pub(crate) fn data(&self) -> &DataSet {
        &self.data
    }

    /// Upserts or removes one key. Returns whether the content changed.
    pub(crate) fn set_value(&mut self, key: &str, value: Value) -> bool {
        let changed = self.data.set_value(key, value);
        if changed {
            self.touch_content();
        }
        changed
    }

    /// Applies every entry of `set`, `Value::Null` entries removing keys.
    pub(crate) fn set_data_set(&mut self, set: &DataSet) -> bool {
        let changed = self.data.merge(set);
        if changed {
            self.touch_content();
        }
        changed
    }

    pub(crate) fn clear(&mut self) -> bool {
        let changed = self.data.clear();
        if changed {
            self.touch_content();
        }
        changed
    }

    fn touch_content(&mut self) {
        self.revision += 1;
        self.last_update = Some(Instant::now());
        if self.storage_enabled {
            self.needs_store = true;
        }
    }

    /// Makes the next relay tick report fresh data even if nothing changed.
    pub(crate) fn set_needs_update(&mut self) {
        self.needs_update = true;
    }

    /// `None` when the source was never written.
    pub(crate) fn time_since_last_update(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|at| now.saturating_duration_since(at))
    }

    /// No direct subscriber and no relay left.
    pub(crate) fn is_unused(&self) -> bool {
        self.direct.is_empty() && self.relays.is_empty()
    }

    /// # Subscribe
    ///
    /// Attaches `consumer` directly (`key == None`) or to the relay for `key`.
    ///
    /// ## Logic:
    /// 1.  Reconnecting with the same parameters is a no-op.
    /// 2.  A consumer already attached elsewhere is moved; the relay it leaves
    ///     is destroyed when empty and handed back so its timer can be dropped.
    /// 3.  A newly created relay fires immediately when the consumer was already
    ///     connected or other relays already have consumers.
    /// 4.  A consumer that was not connected before receives the current data
    ///     right away when there is any.
    pub(crate) fn subscribe(&mut self, consumer: &Consumer, key: Option<RelayKey>) -> SubscribeOutcome {
        let id = consumer.id();
        let previous = self.consumers.get(&id).copied();
        if previous == Some(key) {
            return SubscribeOutcome::default();
        }

        let mut outcome = SubscribeOutcome::default();
        let was_connected = previous.is_some();
        let mut seen_revision = self.revision;
        if let Some(detached) = self.detach(id) {
            seen_revision = detached.subscriber.seen_revision;
            outcome.dropped_relay = detached.dropped_relay;
        }

        let immediate_call = !was_connected && !self.data.is_empty();
        let subscriber = Subscriber::new(consumer.clone(), seen_revision);

        match key {
            None => {
                self.direct.insert(id, subscriber);
            }
            Some(relay_key) => {
                let others_on_relays = self.consumers.values().any(Option::is_some);
                let relay = self.relays.entry(relay_key).or_insert_with(|| {
                    outcome.new_relay = Some((relay_key, was_connected || others_on_relays));
                    Relay::new(relay_key)
                });
                relay.subscribers.insert(id, subscriber);
            }
        }
        self.consumers.insert(id, key);

        if immediate_call {
            let snapshot = self.data.snapshot();
            let revision = self.revision;
            if consumer.deliver(&self.name, &snapshot) {
                if let Some(sub) = self.subscriber_mut(id) {
                    sub.seen_revision = revision;
                }
            } else {
                outcome.ghost = true;
            }
        }
        outcome
    }

    /// Removes `id` from whichever relay or direct set holds it.
    pub(crate) fn unsubscribe(&mut self, id: ConsumerId) -> Option<Detached> {
        self.detach(id)
    }

    fn detach(&mut self, id: ConsumerId) -> Option<Detached> {
        match self.consumers.remove(&id)? {
            None => self.direct.remove(&id).map(|subscriber| Detached {
                subscriber,
                dropped_relay: None,
            }),
            Some(relay_key) => {
                let relay = self.relays.get_mut(&relay_key)?;
                let subscriber = relay.subscribers.remove(&id)?;
                let dropped_relay = if relay.is_empty() {
                    self.relays.remove(&relay_key)
                } else {
                    None
                };
                Some(Detached {
                    subscriber,
                    dropped_relay,
                })
            }
        }
    }

    fn subscriber_mut(&mut self, id: ConsumerId) -> Option<&mut Subscriber> {
        match self.consumers.get(&id)? {
            None => self.direct.get_mut(&id),
            Some(relay_key) => self.relays.get_mut(relay_key)?.subscribers.get_mut(&id),
        }
    }

    /// # Flush If Dirty
    ///
    /// Notifies direct subscribers and pending relays with one shared
    /// snapshot, then clears the dirty flag.
    pub(crate) fn flush_if_dirty(&mut self) -> Delivery {
        let mut delivery = Delivery::default();
        if !self.data.is_dirty() {
            return delivery;
        }

        let snapshot = self.data.snapshot();
        let revision = self.revision;

        for sub in self.direct.values_mut() {
            if sub.seen_revision < revision {
                push(&self.name, sub, &snapshot, revision, &mut delivery);
            }
        }

        for relay in self.relays.values_mut().filter(|relay| relay.pending) {
            relay.pending = false;
            for sub in relay.subscribers.values_mut() {
                if sub.seen_revision < revision {
                    push(&self.name, sub, &snapshot, revision, &mut delivery);
                }
            }
        }

        self.data.mark_clean();
        delivery
    }

    /// # Relay Tick
    ///
    /// A relay's timer fired. If the one-shot forced flag is set, every
    /// subscriber of the relay gets the current data. Otherwise subscribers
    /// that missed a revision get it. With nothing to deliver the relay goes
    /// pending and waits for the next flush.
    pub(crate) fn relay_tick(&mut self, key: RelayKey) -> Delivery {
        let mut delivery = Delivery::default();
        let forced = self.needs_update;
        let revision = self.revision;

        let Some(relay) = self.relays.get_mut(&key) else {
            return delivery;
        };

        let stale = relay
            .subscribers
            .values()
            .any(|sub| sub.seen_revision < revision);
        if !forced && !stale {
            relay.pending = true;
            return delivery;
        }

        self.needs_update = false;
        relay.pending = false;
        let snapshot = self.data.snapshot();
        for sub in relay.subscribers.values_mut() {
            if forced || sub.seen_revision < revision {
                push(&self.name, sub, &snapshot, revision, &mut delivery);
            }
        }
        delivery
    }

    /// Flushes dirty data to direct subscribers and pushes the current data to
    /// every relay's subscribers regardless of their timers.
    pub(crate) fn force_immediate_update(&mut self) -> Delivery {
        let snapshot = self.data.snapshot();
        let revision = self.revision;
        let mut delivery = Delivery::default();

        if self.data.is_dirty() {
            for sub in self.direct.values_mut() {
                if sub.seen_revision < revision {
                    push(&self.name, sub, &snapshot, revision, &mut delivery);
                }
            }
            self.data.mark_clean();
        }

        for relay in self.relays.values_mut() {
            relay.pending = false;
            for sub in relay.subscribers.values_mut() {
                push(&self.name, sub, &snapshot, revision, &mut delivery);
            }
        }
        delivery
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            name: self.name.clone(),
            data_count: self.data.len(),
            storage_enabled: self.storage_enabled,
            direct_subscribers: self.direct.len(),
            relays: self
                .relays
                .values()
                .map(|relay| RelayStats {
                    interval_ms: relay.key.interval.as_millis() as u64,
                    alignment: relay.key.alignment,
                    subscribers: relay.subscribers.len(),
                    pending: relay.pending,
                    next_fire_in_ms: relay
                        .next_fire_at
                        .saturating_duration_since(Instant::now())
                        .as_millis() as u64,
                })
                .collect(),
        }
    }
}

fn push(source: &str, sub: &mut Subscriber, snapshot: &Arc<DataSet>, revision: u64, delivery: &mut Delivery) {
    if sub.consumer.deliver(source, snapshot) {
        sub.seen_revision = revision;
        delivery.notified = true;
    } else {
        delivery.ghosts.push(sub.consumer.id());
    }
}
