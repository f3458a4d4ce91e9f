//! # Registry Actor
//!
//! One task per engine owns every piece of registry state: the sources, the
//! LRU queue, the timers and the provider. Commands from handles and timer
//! expiries are handled strictly one after another, so no two publishes or
//! relay ticks of an engine ever interleave.
//!
//! ## Scheduling quantum
//!
//! After handling one event the actor keeps draining whatever is already
//! queued (commands via `try_recv`, timers already due) and only then runs a
//! single flush pass over all dirty sources. Any number of writes landing in
//! one quantum therefore produce one notification per subscriber.
//!
//! ## Timers
//!
//! A single `DelayQueue` holds relay ticks, the engine-wide polling timer and
//! deferred storage writes. Expired entries clear their stored key before
//! anything else so a recycled slot is never cancelled by mistake.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::configs::{EngineConfig, REMOTE_MIN_UPDATE_INTERVAL_MS};
use crate::core::consumer::{Consumer, ConsumerId};
use crate::core::data_set::{DataSet, Value};
use crate::core::data_source::{DataSource, Delivery};
use crate::core::provider::{EngineContext, SourceProvider};
use crate::core::registry::{Command, RegistryEvent, RegistryStats, SourceRegistry};
use crate::core::relay::{alignment_correction, clamp_interval, IntervalAlignment, Relay, RelayKey, MAX_TIMER_DELAY};
use crate::storage::{client_name, StorageBackend, MAX_STORAGE_AGE, STORE_DELAY};

/// What a `DelayQueue` entry stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerKey {
    Relay { source: String, key: RelayKey },
    EnginePoll,
    Store(String),
}

enum Wake {
    Command(Command),
    Timer(TimerKey),
    Closed,
}

fn cancel(timers: &mut DelayQueue<TimerKey>, key: Option<delay_queue::Key>) {
    if let Some(key) = key {
        timers.try_remove(&key);
    }
}

/// Time of day used to place aligned ticks.
pub(crate) type WallClock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

/// The local wall clock.
pub(crate) fn local_clock() -> WallClock {
    Arc::new(|| Local::now().time())
}

/// # Source Table
///
/// Registry state shared by the actor and the provider hooks.
pub(crate) struct SourceTable {
    name: Arc<str>,
    client: String,
    pub(crate) sources: HashMap<String, DataSource>,
    lru: VecDeque<String>,
    max_source_count: usize,
    pub(crate) min_update_interval_ms: i64,
    forces_minimum_interval: bool,
    polling_interval: Duration,
    poll_timer: Option<delay_queue::Key>,
    last_engine_poll: Option<Instant>,
    waiting_source_request: Option<String>,
    pub(crate) flush_scheduled: bool,
    pub(crate) timers: DelayQueue<TimerKey>,
    events: broadcast::Sender<RegistryEvent>,
    storage: Option<Arc<dyn StorageBackend>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    store_tasks: Vec<JoinHandle<()>>,
    clock: WallClock,
}

impl SourceTable {
    fn new(
        config: &EngineConfig,
        storage: Option<Arc<dyn StorageBackend>>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: broadcast::Sender<RegistryEvent>,
        clock: WallClock,
    ) -> Self {
        Self {
            name: Arc::from(config.name.as_str()),
            client: client_name(&config.name),
            sources: HashMap::new(),
            lru: VecDeque::new(),
            max_source_count: config.max_source_count,
            min_update_interval_ms: config.effective_min_update_interval(),
            forces_minimum_interval: config.forces_minimum_interval,
            polling_interval: Duration::ZERO,
            poll_timer: None,
            last_engine_poll: None,
            waiting_source_request: None,
            flush_scheduled: false,
            timers: DelayQueue::new(),
            events,
            storage,
            commands,
            store_tasks: Vec::new(),
            clock,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn wall_clock(&self) -> NaiveTime {
        (self.clock)()
    }

    pub(crate) fn handle(&self) -> SourceRegistry {
        match self.commands.upgrade() {
            Some(commands) => SourceRegistry::from_parts(Arc::clone(&self.name), commands, self.events.clone()),
            None => SourceRegistry::null(),
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No receiver is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn data(&self, source: &str) -> Option<&DataSet> {
        self.sources.get(source).map(DataSource::data)
    }

    pub(crate) fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Moves `name` to the back of the eviction queue.
    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.lru.iter().position(|n| n == name) {
            if let Some(entry) = self.lru.remove(pos) {
                self.lru.push_back(entry);
            }
        }
    }

    /// Evicts least-recently-touched sources until one more fits.
    fn make_room(&mut self) {
        if self.max_source_count == 0 {
            return;
        }
        while self.sources.len() >= self.max_source_count {
            let Some(oldest) = self.lru.front().cloned() else {
                break;
            };
            log::info!("Engine '{}' evicting source '{}'", self.name, oldest);
            self.remove_source(&oldest);
        }
    }

    /// Looks `name` up, touching it, or creates it.
    fn ensure_source(&mut self, name: &str) -> &mut DataSource {
        if self.sources.contains_key(name) {
            self.touch(name);
        } else {
            self.make_room();
            self.lru.push_back(name.to_string());
            // A source produced for a pending request is announced by the request itself.
            if self.waiting_source_request.as_deref() != Some(name) {
                self.emit(RegistryEvent::SourceAdded(name.to_string()));
            }
            log::debug!("Engine '{}' created source '{}'", self.name, name);
        }
        self.sources
            .entry(name.to_string())
            .or_insert_with(|| DataSource::new(name))
    }

    fn after_write(&mut self, source: &str, changed: bool) {
        self.flush_scheduled = true;
        if !changed {
            return;
        }
        let Some(src) = self.sources.get_mut(source) else {
            return;
        };
        if src.storage_enabled && src.store_timer.is_none() {
            src.store_timer = Some(self.timers.insert(TimerKey::Store(source.to_string()), STORE_DELAY));
        }
    }

    pub(crate) fn set_data(&mut self, source: &str, key: &str, value: Value) {
        let changed = self.ensure_source(source).set_value(key, value);
        self.after_write(source, changed);
    }

    pub(crate) fn set_data_set(&mut self, source: &str, data: &DataSet) {
        let changed = self.ensure_source(source).set_data_set(data);
        self.after_write(source, changed);
    }

    pub(crate) fn remove_data(&mut self, source: &str, key: &str) {
        let Some(src) = self.sources.get_mut(source) else {
            return;
        };
        let changed = src.set_value(key, Value::Null);
        self.after_write(source, changed);
    }

    pub(crate) fn remove_all_data(&mut self, source: &str) {
        let Some(src) = self.sources.get_mut(source) else {
            return;
        };
        let changed = src.clear();
        self.after_write(source, changed);
    }

    /// # Remove Source
    ///
    /// Stores the data first when storage is enabled, drops every timer the
    /// source owns, detaches it from the eviction queue and announces it.
    pub(crate) fn remove_source(&mut self, name: &str) -> bool {
        self.lru.retain(|n| n != name);
        let Some(mut src) = self.sources.remove(name) else {
            return false;
        };

        if src.storage_enabled && (src.needs_store || !src.data().is_empty()) {
            self.spawn_store(name, src.data().clone());
        }
        cancel(&mut self.timers, src.store_timer.take());
        for relay in src.relays.values_mut() {
            cancel(&mut self.timers, relay.timer.take());
        }

        self.emit(RegistryEvent::SourceRemoved(name.to_string()));
        log::debug!("Engine '{}' removed source '{}'", self.name, name);
        true
    }

    pub(crate) fn remove_all_sources(&mut self) {
        for name in self.source_names() {
            self.remove_source(&name);
        }
    }

    /// Removes `name` if it was produced on request and nobody listens anymore.
    fn remove_if_unused(&mut self, name: &str) {
        let unused = self
            .sources
            .get(name)
            .is_some_and(|src| src.on_demand && src.is_unused());
        if unused {
            self.remove_source(name);
        }
    }

    fn set_max_source_count(&mut self, limit: usize) {
        self.max_source_count = limit;
        if limit == 0 {
            return;
        }
        while self.sources.len() > limit {
            let Some(oldest) = self.lru.front().cloned() else {
                break;
            };
            log::info!("Engine '{}' evicting source '{}'", self.name, oldest);
            self.remove_source(&oldest);
        }
    }

    fn set_min_update_interval(&mut self, millis: i64) {
        self.min_update_interval_ms = if self.forces_minimum_interval {
            millis.max(REMOTE_MIN_UPDATE_INTERVAL_MS)
        } else {
            millis
        };
    }

    fn set_polling_interval(&mut self, interval: Duration) {
        cancel(&mut self.timers, self.poll_timer.take());
        self.polling_interval = interval.min(MAX_TIMER_DELAY);
        if !self.polling_interval.is_zero() {
            self.poll_timer = Some(self.timers.insert(TimerKey::EnginePoll, self.polling_interval));
        }
    }

    pub(crate) fn set_storage_enabled(&mut self, source: &str, enabled: bool) {
        let Some(src) = self.sources.get_mut(source) else {
            return;
        };
        if src.storage_enabled == enabled {
            return;
        }
        src.storage_enabled = enabled;

        if enabled {
            self.spawn_retrieve(source);
        } else {
            src.needs_store = false;
            cancel(&mut self.timers, src.store_timer.take());
        }
    }

    /// (Re)schedules the timer of a relay, if the relay still exists.
    fn arm_relay(&mut self, source: &str, key: RelayKey, delay_of: impl FnOnce(&mut Relay, NaiveTime) -> Duration) {
        let Some(relay) = self
            .sources
            .get_mut(source)
            .and_then(|src| src.relays.get_mut(&key))
        else {
            return;
        };
        cancel(&mut self.timers, relay.timer.take());
        let delay = delay_of(relay, (self.clock)()).min(MAX_TIMER_DELAY);
        relay.timer = Some(self.timers.insert(
            TimerKey::Relay {
                source: source.to_string(),
                key,
            },
            delay,
        ));
        relay.next_fire_at = Instant::now() + delay;
    }

    /// Disconnects a consumer from every source, dropping on-demand sources it leaves unused.
    fn drop_consumer(&mut self, id: ConsumerId) {
        let mut unused = Vec::new();
        for (name, src) in self.sources.iter_mut() {
            let Some(detached) = src.unsubscribe(id) else {
                continue;
            };
            cancel(&mut self.timers, detached.dropped_relay.and_then(|relay| relay.timer));
            if src.on_demand && src.is_unused() {
                unused.push(name.clone());
            }
        }
        log::info!("Engine '{}' dropped consumer {} (receiver closed)", self.name, id);
        for name in unused {
            self.remove_source(&name);
        }
    }

    fn store_fired(&mut self, source: &str) {
        let Some(src) = self.sources.get_mut(source) else {
            return;
        };
        src.store_timer = None;
        if !(src.storage_enabled && src.needs_store) {
            return;
        }
        src.needs_store = false;
        let data = src.data().clone();
        self.spawn_store(source, data);
    }

    fn store_all(&mut self) {
        let pending: Vec<(String, DataSet)> = self
            .sources
            .values_mut()
            .filter(|src| src.storage_enabled && (src.needs_store || !src.data().is_empty()))
            .map(|src| {
                src.needs_store = false;
                (src.name.clone(), src.data().clone())
            })
            .collect();
        for (name, data) in pending {
            self.spawn_store(&name, data);
        }
    }

    fn spawn_store(&mut self, source: &str, mut data: DataSet) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        data.mark_clean();
        let client = self.client.clone();
        let source = source.to_string();
        self.store_tasks.retain(|task| !task.is_finished());
        self.store_tasks.push(tokio::task::spawn_blocking(move || {
            if let Err(e) = storage.store(&client, &source, &data) {
                log::warn!("Failed to store source '{}' of '{}': {}", source, client, e);
            }
        }));
    }

    fn spawn_retrieve(&self, source: &str) {
        let Some(storage) = self.storage.clone() else {
            log::debug!("Engine '{}' has no storage; '{}' will not be restored", self.name, source);
            return;
        };
        let client = self.client.clone();
        let source = source.to_string();
        let commands = self.commands.clone();
        tokio::task::spawn_blocking(move || {
            match storage.retrieve(&client, &source) {
                Ok(data) => {
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::Restored { source, data });
                    }
                }
                Err(e) => log::warn!("Failed to retrieve source '{}' of '{}': {}", source, client, e),
            }
            match storage.expire(&client, MAX_STORAGE_AGE) {
                Ok(0) => {}
                Ok(n) => log::debug!("Expired {} stored sources of '{}'", n, client),
                Err(e) => log::warn!("Failed to expire stored sources of '{}': {}", client, e),
            }
        });
    }

    /// Stored data arrived: fills the source if it is still empty, then pushes it out.
    fn restored(&mut self, source: &str, data: &DataSet) -> Delivery {
        let Some(src) = self.sources.get_mut(source) else {
            return Delivery::default();
        };
        if src.data().is_empty() && !data.is_empty() {
            src.set_data_set(data);
            src.needs_store = false;
            log::debug!("Engine '{}' restored {} keys into '{}'", self.name, data.len(), source);
        }
        src.force_immediate_update()
    }

    fn stats(&self) -> RegistryStats {
        let mut sources: Vec<_> = self.sources.values().map(DataSource::stats).collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        RegistryStats {
            name: self.name.to_string(),
            valid: true,
            max_source_count: self.max_source_count,
            min_update_interval_ms: self.min_update_interval_ms,
            polling_interval_ms: self.polling_interval.as_millis() as u64,
            sources,
        }
    }
}

/// # Registry Actor
///
/// The task behind a [`SourceRegistry`] handle.
pub(crate) struct RegistryActor {
    table: SourceTable,
    provider: Box<dyn SourceProvider>,
}

impl RegistryActor {
    pub(crate) fn new(
        config: EngineConfig,
        provider: Box<dyn SourceProvider>,
        storage: Option<Arc<dyn StorageBackend>>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: broadcast::Sender<RegistryEvent>,
        clock: WallClock,
    ) -> Self {
        let mut table = SourceTable::new(&config, storage, commands, events, clock);
        if let Some(interval) = config.polling_interval() {
            table.set_polling_interval(interval);
        }
        Self { table, provider }
    }

    /// # Run
    ///
    /// The actor loop. Ends on `Shutdown` or once every handle is gone.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.provider.init(&mut EngineContext::new(&mut self.table));
        self.end_quantum();

        loop {
            let wake = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Closed,
                },
                Some(expired) = poll_fn(|cx| self.table.timers.poll_expired(cx)), if !self.table.timers.is_empty() => {
                    Wake::Timer(expired.into_inner())
                }
            };

            match wake {
                Wake::Command(command) => {
                    if let Some(reply) = self.handle_command(command) {
                        self.shutdown(Some(reply)).await;
                        return;
                    }
                }
                Wake::Timer(timer) => self.handle_timer(timer),
                Wake::Closed => {
                    self.shutdown(None).await;
                    return;
                }
            }

            // --- Drain the rest of this quantum ---
            loop {
                let mut progressed = false;
                while let Ok(command) = commands.try_recv() {
                    progressed = true;
                    if let Some(reply) = self.handle_command(command) {
                        self.shutdown(Some(reply)).await;
                        return;
                    }
                }
                while let Some(Some(expired)) = poll_fn(|cx| self.table.timers.poll_expired(cx)).now_or_never() {
                    progressed = true;
                    self.handle_timer(expired.into_inner());
                }
                if !progressed {
                    break;
                }
            }
            self.end_quantum();
        }
    }

    /// Runs the coalesced flush pass if anything asked for one.
    fn end_quantum(&mut self) {
        if !self.table.flush_scheduled {
            return;
        }
        self.table.flush_scheduled = false;

        let mut ghosts = Vec::new();
        for src in self.table.sources.values_mut() {
            ghosts.extend(src.flush_if_dirty().ghosts);
        }
        self.drop_ghosts(ghosts);
    }

    fn drop_ghosts(&mut self, ghosts: Vec<ConsumerId>) {
        for id in ghosts {
            self.table.drop_consumer(id);
        }
    }

    /// Handles one command. Returns the responder when the command is `Shutdown`.
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Connect {
                source,
                consumer,
                interval,
                alignment,
                reply,
            } => {
                let connected = self.connect(&source, &consumer, interval, alignment);
                let _ = reply.send(connected);
            }
            Command::ConnectAll {
                consumer,
                interval,
                alignment,
            } => {
                for source in self.table.source_names() {
                    self.connect(&source, &consumer, interval, alignment);
                }
            }
            Command::Disconnect { source, consumer } => self.disconnect(&source, consumer),
            Command::Publish { source, key, value } => self.table.set_data(&source, &key, value),
            Command::PublishSet { source, data } => self.table.set_data_set(&source, &data),
            Command::RemoveData { source, key } => self.table.remove_data(&source, &key),
            Command::RemoveAllData { source } => self.table.remove_all_data(&source),
            Command::Query { source, reply } => {
                let data = self.query(&source);
                let _ = reply.send(data);
            }
            Command::Contains { source, reply } => {
                let _ = reply.send(self.table.sources.contains_key(&source));
            }
            Command::RemoveSource { source } => {
                self.table.remove_source(&source);
            }
            Command::RemoveAllSources => self.table.remove_all_sources(),
            Command::SetMaxSourceCount(limit) => self.table.set_max_source_count(limit),
            Command::SetMinUpdateInterval(millis) => self.table.set_min_update_interval(millis),
            Command::SetPollingInterval(interval) => self.table.set_polling_interval(interval),
            Command::SetStorageEnabled { source, enabled } => self.table.set_storage_enabled(&source, enabled),
            Command::ForceImmediateUpdate => self.force_immediate_update(),
            Command::Sources { reply } => {
                let names = self
                    .provider
                    .sources()
                    .unwrap_or_else(|| self.table.source_names());
                let _ = reply.send(names);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.table.stats());
            }
            Command::Restored { source, data } => {
                let delivery = self.table.restored(&source, &data);
                self.drop_ghosts(delivery.ghosts);
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn handle_timer(&mut self, timer: TimerKey) {
        match timer {
            TimerKey::Relay { source, key } => self.relay_fired(&source, key),
            TimerKey::EnginePoll => self.engine_poll(),
            TimerKey::Store(source) => self.table.store_fired(&source),
        }
    }

    /// # Request Source
    ///
    /// Finds `name`, touching it for the eviction order, or asks the provider
    /// to produce it. A source produced this way is removed again once it
    /// becomes unused.
    fn request_source(&mut self, name: &str) -> bool {
        if self.table.sources.contains_key(name) {
            self.table.touch(name);
            return true;
        }

        self.table.waiting_source_request = Some(name.to_string());
        let produced = self
            .provider
            .source_requested(name, &mut EngineContext::new(&mut self.table));
        self.table.waiting_source_request = None;

        let Some(src) = self.table.sources.get_mut(name) else {
            if produced {
                log::warn!(
                    "Provider of '{}' claimed to produce '{}' but never created it",
                    self.table.name,
                    name
                );
            }
            return false;
        };
        src.on_demand = produced;
        self.table.emit(RegistryEvent::SourceAdded(name.to_string()));
        true
    }

    /// # Connect
    ///
    /// ## Logic:
    /// 1.  Resolve or produce the source.
    /// 2.  Clamp the interval against the engine's minimum update spacing.
    /// 3.  Hand the consumer to the source, then reconcile timers: drop the
    ///     timer of a relay the consumer left, arm the timer of a new relay.
    fn connect(&mut self, source: &str, consumer: &Consumer, interval: Duration, alignment: IntervalAlignment) -> bool {
        if !self.request_source(source) {
            log::debug!("Engine '{}' has no source '{}'", self.table.name, source);
            return false;
        }

        let interval = clamp_interval(interval, self.table.min_update_interval_ms);
        let key = (!interval.is_zero()).then_some(RelayKey { interval, alignment });
        let Some(src) = self.table.sources.get_mut(source) else {
            return false;
        };
        let outcome = src.subscribe(consumer, key);

        cancel(
            &mut self.table.timers,
            outcome.dropped_relay.and_then(|relay| relay.timer),
        );
        if let Some((relay_key, immediate)) = outcome.new_relay {
            self.table.arm_relay(source, relay_key, |relay, now| {
                relay.unaligned_tick = immediate;
                relay.first_delay(immediate, now)
            });
        }
        if outcome.ghost {
            self.table.drop_consumer(consumer.id());
        }
        true
    }

    fn disconnect(&mut self, source: &str, consumer: ConsumerId) {
        let Some(src) = self.table.sources.get_mut(source) else {
            return;
        };
        let Some(detached) = src.unsubscribe(consumer) else {
            return;
        };
        cancel(
            &mut self.table.timers,
            detached.dropped_relay.and_then(|relay| relay.timer),
        );
        self.table.remove_if_unused(source);
    }

    /// # Query
    ///
    /// Returns the data as it is now. A stale, pre-existing source is asked
    /// to refresh, but the refresh only shows up in the next flush.
    fn query(&mut self, name: &str) -> DataSet {
        let existed = self.table.sources.contains_key(name);
        if !self.request_source(name) {
            return DataSet::new();
        }
        let Some(src) = self.table.sources.get(name) else {
            return DataSet::new();
        };

        let mut data = src.data().clone();
        data.mark_clean();

        let min = self.table.min_update_interval_ms;
        let stale = existed
            && min >= 0
            && src
                .time_since_last_update(Instant::now())
                .map_or(true, |elapsed| elapsed >= Duration::from_millis(min as u64));
        if stale
            && self
                .provider
                .update_source(name, &mut EngineContext::new(&mut self.table))
        {
            self.table.flush_scheduled = true;
        }

        self.table.remove_if_unused(name);
        data
    }

    /// Asks the provider to refresh `name`, unless it was updated too recently;
    /// then the next relay tick is simply told to report fresh data.
    fn internal_update_source(&mut self, name: &str) {
        let min = self.table.min_update_interval_ms;
        let Some(src) = self.table.sources.get_mut(name) else {
            return;
        };
        let too_soon = min > 0
            && src
                .time_since_last_update(Instant::now())
                .is_some_and(|elapsed| elapsed < Duration::from_millis(min as u64));
        if too_soon {
            src.set_needs_update();
            return;
        }

        if self
            .provider
            .update_source(name, &mut EngineContext::new(&mut self.table))
        {
            self.table.flush_scheduled = true;
        }
    }

    fn relay_fired(&mut self, source: &str, key: RelayKey) {
        let Some(relay) = self
            .table
            .sources
            .get_mut(source)
            .and_then(|src| src.relays.get_mut(&key))
        else {
            return;
        };
        relay.timer = None;

        // An aligned tick that drifted off its boundary is restarted, not run.
        let immediate = std::mem::take(&mut relay.unaligned_tick);
        if !immediate {
            if let Some(correction) = alignment_correction(key.alignment, self.table.wall_clock()) {
                log::debug!("Relay {:?} of '{}' fired off its boundary; rescheduled", key, source);
                self.table.arm_relay(source, key, |_, _| correction);
                return;
            }
        }

        self.internal_update_source(source);

        // The provider may have removed the source meanwhile.
        let Some(src) = self.table.sources.get_mut(source) else {
            return;
        };
        let delivery = src.relay_tick(key);
        if delivery.notified {
            log::trace!("Relay {:?} of '{}' delivered", key, source);
        }
        self.table.arm_relay(source, key, |relay, now| relay.next_delay(now));
        self.drop_ghosts(delivery.ghosts);
    }

    fn engine_poll(&mut self) {
        self.table.poll_timer = None;
        let interval = self.table.polling_interval;
        if !interval.is_zero() {
            self.table.poll_timer = Some(self.table.timers.insert(TimerKey::EnginePoll, interval));
        }

        let min = self.table.min_update_interval_ms;
        if min < 0 {
            return;
        }
        let now = Instant::now();
        let too_soon = self
            .table
            .last_engine_poll
            .is_some_and(|at| now.saturating_duration_since(at) < Duration::from_millis(min as u64));
        if too_soon {
            return;
        }
        self.table.last_engine_poll = Some(now);

        let used: Vec<String> = self
            .table
            .sources
            .iter()
            .filter(|(_, src)| !src.is_unused())
            .map(|(name, _)| name.clone())
            .collect();
        for name in used {
            self.internal_update_source(&name);
        }
        self.table.flush_scheduled = true;
    }

    fn force_immediate_update(&mut self) {
        let mut ghosts = Vec::new();
        for src in self.table.sources.values_mut().filter(|src| !src.is_unused()) {
            ghosts.extend(src.force_immediate_update().ghosts);
        }
        self.drop_ghosts(ghosts);
    }

    /// Persists every storage-enabled source, waits for pending writes and stops.
    async fn shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.table.store_all();
        for task in self.table.store_tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Storage task of '{}' failed: {}", self.table.name, e);
            }
        }
        self.table.timers.clear();
        log::info!("Engine '{}' actor finished", self.table.name);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::NoopProvider;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    fn spawn(config: EngineConfig, provider: impl SourceProvider) -> SourceRegistry {
        SourceRegistry::spawn(config, Box::new(provider), None)
    }

    /// Counts refreshes and writes the count into the `counter` source.
    struct CountingProvider {
        updates: Arc<AtomicUsize>,
        on_demand: bool,
    }

    impl SourceProvider for CountingProvider {
        fn init(&mut self, ctx: &mut EngineContext<'_>) {
            if !self.on_demand {
                ctx.set_data("counter", "value", 0);
            }
        }

        fn source_requested(&mut self, name: &str, ctx: &mut EngineContext<'_>) -> bool {
            if self.on_demand && name == "counter" {
                ctx.set_data(name, "value", 0);
                return true;
            }
            false
        }

        fn update_source(&mut self, name: &str, ctx: &mut EngineContext<'_>) -> bool {
            let count = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.set_data(name, "value", count);
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_quantum_publishes_coalesce() {
        let mut config = EngineConfig::named("time");
        config.min_update_interval_ms = 100;
        let registry = spawn(config, NoopProvider);
        let (consumer, mut rx) = Consumer::new("applet");

        registry.publish("clock", "time", "11:59");
        assert!(registry.connect("clock", &consumer, Duration::ZERO, IntervalAlignment::None).await);
        assert_eq!(rx.recv().await.unwrap().data.get("time"), Some(&json!("11:59")));

        registry.publish("clock", "time", "12:00");
        registry.publish("clock", "time", "12:01");
        registry.stats().await;

        let update = rx.try_recv().unwrap();
        assert_eq!(update.source, "clock");
        assert_eq!(update.data.get("time"), Some(&json!("12:01")));
        assert!(rx.try_recv().is_err(), "two same-quantum publishes must notify once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_does_not_starve_on_late_publish() {
        let registry = spawn(EngineConfig::named("weather"), NoopProvider);
        let (consumer, mut rx) = Consumer::new("slow");

        registry.publish("weather", "temp", 1);
        assert!(
            registry
                .connect("weather", &consumer, Duration::from_millis(1000), IntervalAlignment::None)
                .await
        );
        let t0 = Instant::now();
        assert_eq!(rx.recv().await.unwrap().data.get("temp"), Some(&json!(1)));

        tokio::time::sleep(Duration::from_millis(999)).await;
        registry.publish("weather", "temp", 2);
        registry.stats().await;
        assert!(rx.try_recv().is_err(), "an idle relay waits for its tick");

        let update = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("relay must deliver at its first tick")
            .unwrap();
        assert_eq!(update.data.get("temp"), Some(&json!(2)));
        assert!(Instant::now() - t0 < Duration::from_millis(2000));
    }

    /// Wall clock starting at `start`, advancing with tokio time, plus a
    /// shift in milliseconds the test can change.
    fn test_clock(start: NaiveTime) -> (WallClock, Arc<AtomicI64>) {
        let origin = Instant::now();
        let shift = Arc::new(AtomicI64::new(0));
        let offset = Arc::clone(&shift);
        let clock: WallClock = Arc::new(move || {
            let elapsed = chrono::Duration::from_std(origin.elapsed()).unwrap_or(chrono::Duration::zero());
            start + elapsed + chrono::Duration::milliseconds(offset.load(Ordering::SeqCst))
        });
        (clock, shift)
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_driven_and_minute_aligned_consumers() {
        let (clock, _) = test_clock(at(10, 15, 20));
        let registry = SourceRegistry::spawn_with_clock(EngineConfig::named("weather"), Box::new(NoopProvider), None, clock);
        let t0 = Instant::now();
        let (a, mut rx_a) = Consumer::new("a");
        let (b, mut rx_b) = Consumer::new("b");

        registry.publish_set("weather", DataSet::new());
        assert!(registry.connect("weather", &a, Duration::ZERO, IntervalAlignment::None).await);
        assert!(
            registry
                .connect("weather", &b, Duration::from_millis(5000), IntervalAlignment::AlignToMinute)
                .await
        );

        registry.publish("weather", "temp", 20);
        registry.stats().await;
        assert_eq!(rx_a.try_recv().unwrap().data.get("temp"), Some(&json!(20)));
        assert!(rx_b.try_recv().is_err());

        // First tick at 10:16:00.5, i.e. 40.5s in.
        tokio::time::sleep(Duration::from_millis(40_400)).await;
        registry.stats().await;
        assert!(rx_b.try_recv().is_err());
        let update = tokio::time::timeout(Duration::from_millis(200), rx_b.recv())
            .await
            .expect("aligned tick delivers")
            .unwrap();
        assert_eq!(update.data.get("temp"), Some(&json!(20)));
        assert!(t0.elapsed() >= Duration::from_millis(40_500));

        // The next tick is 10:17:00.5, not 5s later.
        registry.publish("weather", "temp", 21);
        tokio::time::sleep(Duration::from_millis(59_000)).await;
        registry.stats().await;
        assert!(rx_b.try_recv().is_err(), "no tick between minute boundaries");
        let update = tokio::time::timeout(Duration::from_millis(2000), rx_b.recv())
            .await
            .expect("next minute tick delivers")
            .unwrap();
        assert_eq!(update.data.get("temp"), Some(&json!(21)));
        assert!(t0.elapsed() >= Duration::from_millis(100_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drifted_aligned_tick_is_restarted_not_run() {
        let (clock, shift) = test_clock(at(10, 15, 20));
        let registry = SourceRegistry::spawn_with_clock(EngineConfig::named("weather"), Box::new(NoopProvider), None, clock);
        let t0 = Instant::now();
        let (b, mut rx_b) = Consumer::new("b");

        registry.publish("weather", "temp", 1);
        assert!(
            registry
                .connect("weather", &b, Duration::from_millis(5000), IntervalAlignment::AlignToMinute)
                .await
        );
        rx_b.recv().await.unwrap();

        // The timer still expires 40.5s in, but the wall clock then reads 10:16:10.5.
        shift.store(10_000, Ordering::SeqCst);
        registry.publish("weather", "temp", 2);
        tokio::time::sleep(Duration::from_millis(41_000)).await;
        registry.stats().await;
        assert!(rx_b.try_recv().is_err(), "an off-boundary tick must not deliver");

        // Restarted at 10:17:00.5 on the shifted clock, 90.5s in.
        let update = tokio::time::timeout(Duration::from_millis(50_000), rx_b.recv())
            .await
            .expect("corrected tick delivers")
            .unwrap();
        assert_eq!(update.data.get("temp"), Some(&json!(2)));
        assert!(t0.elapsed() >= Duration::from_millis(90_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_intervals_keep_engine_alive() {
        let mut config = EngineConfig::named("weather");
        config.polling_interval_ms = u64::MAX;
        let registry = spawn(config, NoopProvider);
        let (consumer, mut rx) = Consumer::new("patient");

        registry.publish("weather", "temp", 20);
        assert!(
            registry
                .connect("weather", &consumer, Duration::from_secs(100_000_000), IntervalAlignment::None)
                .await
        );
        rx.recv().await.unwrap();
        registry.set_polling_interval(Duration::MAX);

        assert_eq!(registry.query("weather").await.get("temp"), Some(&json!(20)));
        let stats = registry.stats().await;
        assert!(stats.valid);
        assert_eq!(stats.polling_interval_ms, MAX_TIMER_DELAY.as_millis() as u64);
        assert_eq!(stats.sources[0].relays[0].interval_ms, MAX_TIMER_DELAY.as_millis() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_by_touch() {
        let mut config = EngineConfig::named("lru");
        config.max_source_count = 2;
        let registry = spawn(config, NoopProvider);
        let mut events = registry.subscribe_events();

        registry.publish("A", "k", 1);
        registry.publish("B", "k", 1);
        registry.query("A").await;
        registry.publish("C", "k", 1);

        assert_eq!(registry.sources().await, vec!["A".to_string(), "C".to_string()]);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                RegistryEvent::SourceAdded("A".into()),
                RegistryEvent::SourceAdded("B".into()),
                RegistryEvent::SourceRemoved("B".into()),
                RegistryEvent::SourceAdded("C".into()),
            ]
        );

        registry.set_max_source_count(1);
        assert_eq!(registry.sources().await, vec!["C".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_unsubscribe_leaks_nothing() {
        let registry = spawn(EngineConfig::named("weather"), NoopProvider);
        let (consumer, _rx) = Consumer::new("applet");

        registry.publish("weather", "temp", 1);
        registry
            .connect("weather", &consumer, Duration::from_millis(1000), IntervalAlignment::None)
            .await;
        registry.disconnect("weather", &consumer);

        let stats = registry.stats().await;
        assert_eq!(stats.sources.len(), 1);
        assert!(stats.sources[0].relays.is_empty());
        assert_eq!(stats.sources[0].direct_subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_moves_between_relays() {
        let registry = spawn(EngineConfig::named("weather"), NoopProvider);
        let (consumer, mut rx) = Consumer::new("applet");

        registry.publish("weather", "temp", 1);
        registry
            .connect("weather", &consumer, Duration::from_millis(1000), IntervalAlignment::None)
            .await;
        rx.recv().await.unwrap();
        registry
            .connect("weather", &consumer, Duration::from_millis(1000), IntervalAlignment::None)
            .await;
        registry
            .connect("weather", &consumer, Duration::from_millis(2000), IntervalAlignment::None)
            .await;

        let stats = registry.stats().await;
        assert_eq!(stats.sources[0].relays.len(), 1);
        assert_eq!(stats.sources[0].relays[0].interval_ms, 2000);
        assert!(rx.try_recv().is_err(), "reconnecting must not re-deliver");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_is_clamped() {
        let mut config = EngineConfig::named("weather");
        config.min_update_interval_ms = 120;
        let registry = spawn(config, NoopProvider);
        let (consumer, _rx) = Consumer::new("applet");

        registry.publish("weather", "temp", 1);
        registry
            .connect("weather", &consumer, Duration::from_millis(10), IntervalAlignment::None)
            .await;
        let stats = registry.stats().await;
        assert_eq!(stats.sources[0].relays[0].interval_ms, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_returns_pre_refresh_data() {
        let updates = Arc::new(AtomicUsize::new(0));
        let mut config = EngineConfig::named("counter");
        config.min_update_interval_ms = 0;
        let registry = spawn(
            config,
            CountingProvider {
                updates: Arc::clone(&updates),
                on_demand: false,
            },
        );

        assert_eq!(registry.query("counter").await.get("value"), Some(&json!(0)));
        assert_eq!(registry.query("counter").await.get("value"), Some(&json!(1)));
        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert!(registry.query("nothing").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_min_interval_disables_query_refresh() {
        let updates = Arc::new(AtomicUsize::new(0));
        let registry = spawn(
            EngineConfig::named("counter"),
            CountingProvider {
                updates: Arc::clone(&updates),
                on_demand: false,
            },
        );

        registry.query("counter").await;
        registry.query("counter").await;
        assert_eq!(updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_source_removed_when_unused() {
        let registry = spawn(
            EngineConfig::named("counter"),
            CountingProvider {
                updates: Arc::new(AtomicUsize::new(0)),
                on_demand: true,
            },
        );
        let (consumer, mut rx) = Consumer::new("applet");

        assert!(registry.connect("counter", &consumer, Duration::ZERO, IntervalAlignment::None).await);
        assert_eq!(rx.recv().await.unwrap().data.get("value"), Some(&json!(0)));
        assert!(registry.contains("counter").await);

        registry.disconnect("counter", &consumer);
        assert!(!registry.contains("counter").await);
        assert!(!registry.connect("missing", &consumer, Duration::ZERO, IntervalAlignment::None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_polling_refreshes_used_sources() {
        let updates = Arc::new(AtomicUsize::new(0));
        let mut config = EngineConfig::named("counter");
        config.min_update_interval_ms = 0;
        config.polling_interval_ms = 1000;
        let registry = spawn(
            config,
            CountingProvider {
                updates: Arc::clone(&updates),
                on_demand: false,
            },
        );
        let (consumer, mut rx) = Consumer::new("applet");

        // Nobody listens yet: the poll leaves the source alone.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(updates.load(Ordering::SeqCst), 0);

        registry.connect("counter", &consumer, Duration::ZERO, IntervalAlignment::None).await;
        rx.recv().await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.data.get("value"), Some(&json!(1)));

        registry.set_polling_interval(Duration::ZERO);
        let before = updates.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(updates.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_forces_relay_delivery_without_refresh() {
        let updates = Arc::new(AtomicUsize::new(0));
        let mut config = EngineConfig::named("counter");
        config.min_update_interval_ms = 0;
        let registry = spawn(
            config,
            CountingProvider {
                updates: Arc::clone(&updates),
                on_demand: false,
            },
        );
        let (consumer, mut rx) = Consumer::new("applet");

        registry
            .connect("counter", &consumer, Duration::from_millis(1000), IntervalAlignment::None)
            .await;
        assert_eq!(rx.recv().await.unwrap().data.get("value"), Some(&json!(0)));
        registry.set_min_update_interval(10_000);

        // The tick finds the source too fresh to refresh and re-delivers what it has.
        let update = tokio::time::timeout(Duration::from_millis(1500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.data.get("value"), Some(&json!(0)));
        assert_eq!(updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ghost_consumer_is_disconnected() {
        let registry = spawn(EngineConfig::named("weather"), NoopProvider);
        let (consumer, rx) = Consumer::new("gone");

        registry.publish_set("weather", DataSet::new());
        registry.connect("weather", &consumer, Duration::ZERO, IntervalAlignment::None).await;
        drop(rx);
        registry.publish("weather", "temp", 3);

        // The first round trip lands before the flush that finds the ghost.
        registry.stats().await;
        let stats = registry.stats().await;
        assert_eq!(stats.sources[0].direct_subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_immediate_update_reaches_relays() {
        let registry = spawn(EngineConfig::named("weather"), NoopProvider);
        let (consumer, mut rx) = Consumer::new("relay");

        registry.publish("weather", "temp", 1);
        registry
            .connect("weather", &consumer, Duration::from_secs(60), IntervalAlignment::None)
            .await;
        rx.recv().await.unwrap();

        registry.force_immediate_update();
        registry.stats().await;
        assert_eq!(rx.try_recv().unwrap().data.get("temp"), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_data_and_connect_all() {
        let registry = spawn(EngineConfig::named("weather"), NoopProvider);
        let (consumer, mut rx) = Consumer::new("all");

        registry.publish("Paris", "temp", 1);
        registry.publish("Oslo", "temp", -3);
        registry.connect_all_sources(&consumer, Duration::ZERO, IntervalAlignment::None);
        registry.stats().await;
        let mut sources = vec![rx.try_recv().unwrap().source, rx.try_recv().unwrap().source];
        sources.sort();
        assert_eq!(sources, vec!["Oslo".to_string(), "Paris".to_string()]);

        registry.remove_data("Paris", "temp");
        registry.remove_data("Paris", "temp");
        registry.remove_all_data("Oslo");
        assert!(registry.query("Paris").await.is_empty());
        assert!(registry.query("Oslo").await.is_empty());

        registry.remove_all_sources();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_storage_restores_and_stores() {
        let storage = Arc::new(MemoryStorage::new());
        let mut saved = DataSet::new();
        saved.set_value("temp", json!(18));
        storage.store("weather_eu", "Paris", &saved).unwrap();

        let registry = SourceRegistry::spawn(
            EngineConfig::named("weather.eu"),
            Box::new(NoopProvider),
            Some(storage.clone() as Arc<dyn StorageBackend>),
        );
        let (consumer, mut rx) = Consumer::new("applet");

        registry.publish_set("Paris", DataSet::new());
        registry.connect("Paris", &consumer, Duration::ZERO, IntervalAlignment::None).await;
        registry.set_storage_enabled("Paris", true);

        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.data.get("temp"), Some(&json!(18)));

        registry.publish("Paris", "temp", 25);
        registry.shutdown().await;
        assert_eq!(
            storage.retrieve("weather_eu", "Paris").unwrap().get("temp"),
            Some(&json!(25))
        );
    }
}
