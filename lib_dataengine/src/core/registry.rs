//! # Source Registry (Engine Handle)
//!
//! `SourceRegistry` is the consumer- and producer-facing face of one engine.
//! It is a cheap, cloneable handle: all state lives in a single actor task
//! (see `actor.rs`) and every call is turned into a [`Command`] on an
//! unbounded channel. Calls that need an answer carry a `oneshot` responder;
//! everything else is fire-and-forget, so producers never wait on consumers.
//!
//! A registry may also be the *null registry*: always valid to call, never
//! holding a source. Consumers therefore never need to check the handle,
//! only the data it returns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::configs::EngineConfig;
use crate::core::actor::{local_clock, RegistryActor, WallClock};
use crate::core::consumer::{Consumer, ConsumerId};
use crate::core::data_set::{DataSet, Value};
use crate::core::data_source::SourceStats;
use crate::core::provider::SourceProvider;
use crate::core::relay::IntervalAlignment;
use crate::storage::StorageBackend;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "source", rename_all = "camelCase")]
pub enum RegistryEvent {
    /// A source came into existence.
    SourceAdded(String),
    /// A source was removed or evicted.
    SourceRemoved(String),
}

/// # Registry Stats
///
/// Diagnostic dump of a registry: its policy and one line per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Engine name.
    pub name: String,
    /// `false` for the null registry.
    pub valid: bool,
    /// Population cap, 0 for unlimited.
    pub max_source_count: usize,
    /// Effective minimum update interval in milliseconds.
    pub min_update_interval_ms: i64,
    /// Engine-wide polling period in milliseconds, 0 when disabled.
    pub polling_interval_ms: u64,
    /// Sources ordered by name.
    pub sources: Vec<SourceStats>,
}

/// Messages understood by the registry actor.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        source: String,
        consumer: Consumer,
        interval: Duration,
        alignment: IntervalAlignment,
        reply: oneshot::Sender<bool>,
    },
    ConnectAll {
        consumer: Consumer,
        interval: Duration,
        alignment: IntervalAlignment,
    },
    Disconnect {
        source: String,
        consumer: ConsumerId,
    },
    Publish {
        source: String,
        key: String,
        value: Value,
    },
    PublishSet {
        source: String,
        data: DataSet,
    },
    RemoveData {
        source: String,
        key: String,
    },
    RemoveAllData {
        source: String,
    },
    Query {
        source: String,
        reply: oneshot::Sender<DataSet>,
    },
    Contains {
        source: String,
        reply: oneshot::Sender<bool>,
    },
    RemoveSource {
        source: String,
    },
    RemoveAllSources,
    SetMaxSourceCount(usize),
    SetMinUpdateInterval(i64),
    SetPollingInterval(Duration),
    SetStorageEnabled {
        source: String,
        enabled: bool,
    },
    ForceImmediateUpdate,
    Sources {
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
    Restored {
        source: String,
        data: DataSet,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
enum Target {
    Live {
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<RegistryEvent>,
    },
    Null,
}

/// # Source Registry
///
/// Handle to one engine. Clones address the same actor.
#[derive(Clone)]
pub struct SourceRegistry {
    name: Arc<str>,
    target: Target,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl SourceRegistry {
    /// # Spawn
    ///
    /// Starts the actor of a new engine on the current tokio runtime and
    /// returns its handle. The provider's `init` hook runs on the actor before
    /// any command is processed.
    ///
    /// Outside a runtime nothing can be spawned and the null registry is
    /// returned instead.
    pub fn spawn(
        config: EngineConfig,
        provider: Box<dyn SourceProvider>,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        Self::spawn_with_clock(config, provider, storage, local_clock())
    }

    /// Like [`SourceRegistry::spawn`], with aligned ticks placed by `clock`.
    pub(crate) fn spawn_with_clock(
        config: EngineConfig,
        provider: Box<dyn SourceProvider>,
        storage: Option<Arc<dyn StorageBackend>>,
        clock: WallClock,
    ) -> Self {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!(
                    "Cannot start engine '{}' outside a tokio runtime; using the null registry",
                    config.name
                );
                return Self::null();
            }
        };

        let name: Arc<str> = Arc::from(config.name.as_str());
        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = RegistryActor::new(config, provider, storage, commands.downgrade(), events.clone(), clock);
        runtime.spawn(actor.run(receiver));

        log::info!("Engine '{}' started", name);
        Self {
            name,
            target: Target::Live { commands, events },
        }
    }

    /// The shared always-valid, always-empty registry.
    pub fn null() -> Self {
        Self {
            name: Arc::from(""),
            target: Target::Null,
        }
    }

    pub(crate) fn from_parts(
        name: Arc<str>,
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            name,
            target: Target::Live { commands, events },
        }
    }

    /// Engine name, empty for the null registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` for the null registry.
    pub fn is_valid(&self) -> bool {
        matches!(self.target, Target::Live { .. })
    }

    /// Whether two handles address the same engine instance.
    pub fn same_engine(&self, other: &SourceRegistry) -> bool {
        match (&self.target, &other.target) {
            (Target::Live { commands: a, .. }, Target::Live { commands: b, .. }) => a.same_channel(b),
            (Target::Null, Target::Null) => true,
            _ => false,
        }
    }

    fn send(&self, command: Command) -> bool {
        match &self.target {
            Target::Live { commands, .. } => commands.send(command).is_ok(),
            Target::Null => false,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if !self.send(build(reply)) {
            return None;
        }
        response.await.ok()
    }

    /// # Connect
    ///
    /// Subscribes `consumer` to `source`, creating the source on demand
    /// through the provider. A zero `interval` means event driven; any other
    /// value is clamped and shared with every consumer asking for the same
    /// `(interval, alignment)`.
    ///
    /// # Returns
    /// `false` when the source does not exist and could not be produced.
    pub async fn connect(
        &self,
        source: &str,
        consumer: &Consumer,
        interval: Duration,
        alignment: IntervalAlignment,
    ) -> bool {
        self.request(|reply| Command::Connect {
            source: source.to_string(),
            consumer: consumer.clone(),
            interval,
            alignment,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Connects `consumer` to every source that currently exists.
    pub fn connect_all_sources(&self, consumer: &Consumer, interval: Duration, alignment: IntervalAlignment) {
        self.send(Command::ConnectAll {
            consumer: consumer.clone(),
            interval,
            alignment,
        });
    }

    /// Unsubscribes `consumer` from `source`.
    pub fn disconnect(&self, source: &str, consumer: &Consumer) {
        self.send(Command::Disconnect {
            source: source.to_string(),
            consumer: consumer.id(),
        });
    }

    /// # Query
    ///
    /// Current data of `source`, empty when it cannot be produced. A stale
    /// source is refreshed as a side effect, but the call returns the data as
    /// it was before that refresh.
    pub async fn query(&self, source: &str) -> DataSet {
        self.request(|reply| Command::Query {
            source: source.to_string(),
            reply,
        })
        .await
        .unwrap_or_default()
    }

    /// Whether `source` exists right now.
    pub async fn contains(&self, source: &str) -> bool {
        self.request(|reply| Command::Contains {
            source: source.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Sets one key of `source`, creating the source when absent. `Value::Null` removes the key.
    pub fn publish<V: Into<Value>>(&self, source: &str, key: &str, value: V) {
        self.send(Command::Publish {
            source: source.to_string(),
            key: key.to_string(),
            value: value.into(),
        });
    }

    /// Applies a whole data set to `source`, creating the source when absent.
    pub fn publish_set(&self, source: &str, data: DataSet) {
        self.send(Command::PublishSet {
            source: source.to_string(),
            data,
        });
    }

    /// Removes one key of an existing source.
    pub fn remove_data(&self, source: &str, key: &str) {
        self.send(Command::RemoveData {
            source: source.to_string(),
            key: key.to_string(),
        });
    }

    /// Empties an existing source.
    pub fn remove_all_data(&self, source: &str) {
        self.send(Command::RemoveAllData {
            source: source.to_string(),
        });
    }

    /// Removes a source, storing it first when storage is enabled.
    pub fn remove_source(&self, source: &str) {
        self.send(Command::RemoveSource {
            source: source.to_string(),
        });
    }

    /// Removes every source.
    pub fn remove_all_sources(&self) {
        self.send(Command::RemoveAllSources);
    }

    /// Changes the population cap, evicting least-recently-touched sources when lowered.
    pub fn set_max_source_count(&self, limit: usize) {
        self.send(Command::SetMaxSourceCount(limit));
    }

    /// Changes the minimum update spacing in milliseconds (negative disables auto-updates).
    pub fn set_min_update_interval(&self, millis: i64) {
        self.send(Command::SetMinUpdateInterval(millis));
    }

    /// Changes the engine-wide polling period. `Duration::ZERO` disables it.
    pub fn set_polling_interval(&self, interval: Duration) {
        self.send(Command::SetPollingInterval(interval));
    }

    /// Turns persistence of `source` on or off.
    pub fn set_storage_enabled(&self, source: &str, enabled: bool) {
        self.send(Command::SetStorageEnabled {
            source: source.to_string(),
            enabled,
        });
    }

    /// Pushes current data to every subscriber of every used source now.
    pub fn force_immediate_update(&self) {
        self.send(Command::ForceImmediateUpdate);
    }

    /// Names the provider advertises, or the current sources when it advertises none.
    pub async fn sources(&self) -> Vec<String> {
        self.request(|reply| Command::Sources { reply })
            .await
            .unwrap_or_default()
    }

    /// Whether the registry holds no source.
    pub async fn is_empty(&self) -> bool {
        self.stats().await.sources.is_empty()
    }

    /// Diagnostic dump of the registry.
    pub async fn stats(&self) -> RegistryStats {
        self.request(|reply| Command::Stats { reply })
            .await
            .unwrap_or_else(|| RegistryStats {
                name: self.name.to_string(),
                ..RegistryStats::default()
            })
    }

    /// Receiver of `SourceAdded`/`SourceRemoved` events. The null registry's
    /// receiver is closed from the start.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        match &self.target {
            Target::Live { events, .. } => events.subscribe(),
            Target::Null => broadcast::channel(1).1,
        }
    }

    /// Stores persisted sources and stops the actor. Waits for the actor to finish.
    pub(crate) async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_some() {
            log::info!("Engine '{}' stopped", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_registry_answers_empty() {
        let null = SourceRegistry::null();
        let (consumer, _rx) = Consumer::new("applet");

        assert!(!null.is_valid());
        assert!(null.query("anything").await.is_empty());
        assert!(!null.connect("anything", &consumer, Duration::ZERO, IntervalAlignment::None).await);
        assert!(null.sources().await.is_empty());
        assert!(null.is_empty().await);
        assert!(!null.stats().await.valid);

        null.publish("anything", "k", 1);
        assert!(!null.contains("anything").await);
        assert!(null.subscribe_events().recv().await.is_err());
        assert!(null.same_engine(&SourceRegistry::null()));
    }

    #[test]
    fn test_spawn_outside_runtime_yields_null() {
        let registry = SourceRegistry::spawn(
            EngineConfig::named("orphan"),
            Box::new(crate::core::provider::NoopProvider),
            None,
        );
        assert!(!registry.is_valid());
    }
}
