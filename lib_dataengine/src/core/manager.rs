//! # Engine Manager
//!
//! Process-wide registry of engines. Every consumer asking for an engine by
//! name gets a handle to the same instance; the instance is reference counted
//! and stopped once the last user releases it. Unknown names, empty names and
//! load failures all resolve to the shared null registry, so callers never
//! handle a missing engine themselves.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use static_init::dynamic;

use crate::configs::EngineConfig;
use crate::core::provider::SourceProvider;
use crate::core::registry::{RegistryStats, SourceRegistry};
use crate::storage::{JsonFileStorage, StorageBackend};

/// Everything needed to start one engine.
pub struct LoadedEngine {
    /// Engine policy. Its `name` is overwritten with the requested name.
    pub config: EngineConfig,
    /// The plugin host of the engine.
    pub provider: Box<dyn SourceProvider>,
    /// Storage collaborator. When absent and `config.storage_dir` is set, a
    /// [`JsonFileStorage`] rooted there is used.
    pub storage: Option<Arc<dyn StorageBackend>>,
}

impl LoadedEngine {
    /// An engine with the given policy and provider and no explicit storage.
    pub fn new(config: EngineConfig, provider: Box<dyn SourceProvider>) -> Self {
        Self {
            config,
            provider,
            storage: None,
        }
    }

    /// Attaches a storage collaborator.
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// # Engine Loader
///
/// External collaborator constructing engines by name. Loaders run while the
/// manager's table is locked and must not call back into the manager.
pub trait EngineLoader: Send + Sync {
    /// Builds the engine called `name`, or `None` when there is no such engine.
    fn load(&self, name: &str) -> Option<LoadedEngine>;
}

type EngineFactory = Box<dyn Fn() -> LoadedEngine + Send + Sync>;

/// # Provider Catalog
///
/// The default loader: a table of named factories.
#[derive(Default)]
pub struct ProviderCatalog {
    factories: Mutex<HashMap<String, EngineFactory>>,
}

#[dynamic(lazy)]
static CATALOG: Arc<ProviderCatalog> = Arc::new(ProviderCatalog::new());

#[dynamic(lazy)]
static GLOBAL_MANAGER: EngineManager = EngineManager::new(Arc::clone(&*CATALOG) as Arc<dyn EngineLoader>);

impl ProviderCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog behind [`EngineManager::global`].
    pub fn global() -> Arc<ProviderCatalog> {
        Arc::clone(&*CATALOG)
    }

    fn factories(&self) -> MutexGuard<'_, HashMap<String, EngineFactory>> {
        self.factories.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or replaces) the factory of engine `name`.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> LoadedEngine + Send + Sync + 'static,
    {
        self.factories().insert(name.to_string(), Box::new(factory));
        log::debug!("Engine '{}' registered in catalog", name);
    }

    /// Forgets engine `name`. Running instances are not affected.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories().remove(name).is_some()
    }

    /// Registered engine names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories().keys().cloned().collect();
        names.sort();
        names
    }
}

impl EngineLoader for ProviderCatalog {
    fn load(&self, name: &str) -> Option<LoadedEngine> {
        let factories = self.factories();
        let factory = factories.get(name)?;
        let mut loaded = factory();
        loaded.config.name = name.to_string();
        Some(loaded)
    }
}

struct EngineEntry {
    registry: SourceRegistry,
    ref_count: usize,
}

/// # Engine Manager
///
/// Reference-counted table of running engines.
pub struct EngineManager {
    loader: Arc<dyn EngineLoader>,
    engines: Mutex<HashMap<String, EngineEntry>>,
    null: SourceRegistry,
}

impl fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineManager")
            .field("loaded", &self.loaded())
            .finish()
    }
}

impl EngineManager {
    /// Creates an isolated manager loading engines through `loader`.
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            engines: Mutex::new(HashMap::new()),
            null: SourceRegistry::null(),
        }
    }

    /// The process-wide manager, loading from [`ProviderCatalog::global`].
    pub fn global() -> &'static EngineManager {
        &GLOBAL_MANAGER
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<String, EngineEntry>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared null registry.
    pub fn null_registry(&self) -> SourceRegistry {
        self.null.clone()
    }

    /// # Acquire
    ///
    /// Returns engine `name`, loading and starting it on first use, and takes
    /// one reference on it.
    ///
    /// ## Logic:
    /// 1.  Empty names resolve to the null registry.
    /// 2.  A running engine only has its reference count bumped.
    /// 3.  Otherwise the loader builds it; without a tokio runtime or when the
    ///     loader fails, the null registry is returned and nothing is counted.
    pub fn acquire(&self, name: &str) -> SourceRegistry {
        if name.is_empty() {
            return self.null_registry();
        }

        let mut engines = self.engines();
        if let Some(entry) = engines.get_mut(name) {
            entry.ref_count += 1;
            return entry.registry.clone();
        }

        if tokio::runtime::Handle::try_current().is_err() {
            log::warn!("Engine '{}' requested outside a tokio runtime", name);
            return self.null_registry();
        }

        let Some(loaded) = self.loader.load(name) else {
            log::warn!("Engine '{}' could not be loaded", name);
            return self.null_registry();
        };

        let LoadedEngine {
            config,
            provider,
            storage,
        } = loaded;
        let storage = storage.or_else(|| {
            config
                .storage_dir
                .clone()
                .map(|dir| Arc::new(JsonFileStorage::new(dir)) as Arc<dyn StorageBackend>)
        });

        let registry = SourceRegistry::spawn(config, provider, storage);
        if !registry.is_valid() {
            return self.null_registry();
        }
        engines.insert(
            name.to_string(),
            EngineEntry {
                registry: registry.clone(),
                ref_count: 1,
            },
        );
        log::info!("Engine '{}' loaded", name);
        registry
    }

    /// Drops one reference; returns the registry when the count reached zero.
    fn detach(&self, name: &str) -> Option<SourceRegistry> {
        let mut engines = self.engines();
        let entry = engines.get_mut(name)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return None;
        }
        log::info!("Engine '{}' unloaded", name);
        engines.remove(name).map(|entry| entry.registry)
    }

    /// # Release
    ///
    /// Drops one reference on `name`. At zero the engine leaves the table at
    /// once and its actor is told to store persisted sources and stop; the
    /// next `acquire` starts a fresh instance.
    pub fn release(&self, name: &str) {
        let Some(registry) = self.detach(name) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { registry.shutdown().await });
            }
            // Dropping the last handle stops the actor as well.
            Err(_) => drop(registry),
        }
    }

    /// Like [`EngineManager::release`], but waits until a stopped engine has
    /// finished writing its storage.
    pub async fn release_and_wait(&self, name: &str) {
        if let Some(registry) = self.detach(name) {
            registry.shutdown().await;
        }
    }

    /// Running engine `name` without taking a reference; null when not loaded.
    pub fn engine(&self, name: &str) -> SourceRegistry {
        self.engines()
            .get(name)
            .map(|entry| entry.registry.clone())
            .unwrap_or_else(|| self.null_registry())
    }

    /// Current reference count of `name`, 0 when not loaded.
    pub fn ref_count(&self, name: &str) -> usize {
        self.engines().get(name).map_or(0, |entry| entry.ref_count)
    }

    /// Names of the running engines, sorted.
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines().keys().cloned().collect();
        names.sort();
        names
    }

    /// # Report
    ///
    /// Collects and logs the diagnostic dump of every running engine.
    pub async fn report(&self) -> Vec<RegistryStats> {
        let registries: Vec<SourceRegistry> = {
            let engines = self.engines();
            let mut names: Vec<&String> = engines.keys().collect();
            names.sort();
            names.into_iter().map(|name| engines[name].registry.clone()).collect()
        };

        let mut reports = Vec::with_capacity(registries.len());
        for registry in registries {
            let stats = registry.stats().await;
            log::info!(
                "Engine '{}' (refs {}): {} sources",
                stats.name,
                self.ref_count(&stats.name),
                stats.sources.len()
            );
            for source in &stats.sources {
                log::info!(
                    "  '{}': {} keys, stored: {}, direct: {}, relays: {:?}",
                    source.name,
                    source.data_count,
                    source.storage_enabled,
                    source.direct_subscribers,
                    source
                        .relays
                        .iter()
                        .map(|relay| (relay.interval_ms, relay.subscribers))
                        .collect::<Vec<_>>()
                );
            }
            reports.push(stats);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::{EngineContext, NoopProvider};
    use std::time::Duration;

    struct Greeter;

    impl SourceProvider for Greeter {
        fn init(&mut self, ctx: &mut EngineContext<'_>) {
            let name = ctx.engine_name().to_string();
            ctx.set_data("greeting", "engine", name);
        }
    }

    fn catalog() -> Arc<ProviderCatalog> {
        let catalog = Arc::new(ProviderCatalog::new());
        catalog.register("hello", || LoadedEngine::new(EngineConfig::default(), Box::new(Greeter)));
        catalog
    }

    #[tokio::test]
    async fn test_acquire_shares_and_counts() {
        let manager = EngineManager::new(catalog());
        let first = manager.acquire("hello");
        let second = manager.acquire("hello");

        assert!(first.is_valid());
        assert!(first.same_engine(&second));
        assert_eq!(manager.ref_count("hello"), 2);
        assert_eq!(manager.loaded(), vec!["hello".to_string()]);
        assert_eq!(
            first.query("greeting").await.get("engine"),
            Some(&serde_json::json!("hello"))
        );

        manager.release("hello");
        assert_eq!(manager.ref_count("hello"), 1);
        assert!(manager.engine("hello").same_engine(&first));
    }

    #[tokio::test]
    async fn test_release_to_zero_tears_down() {
        let manager = EngineManager::new(catalog());
        let old = manager.acquire("hello");
        manager.release_and_wait("hello").await;

        assert_eq!(manager.ref_count("hello"), 0);
        assert!(!manager.engine("hello").is_valid());
        assert!(old.query("greeting").await.is_empty());

        let fresh = manager.acquire("hello");
        assert!(fresh.is_valid());
        assert!(!fresh.same_engine(&old));
        manager.release("hello");
        manager.release("hello");
        assert_eq!(manager.ref_count("hello"), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_names_yield_null() {
        let manager = EngineManager::new(catalog());
        assert!(!manager.acquire("").is_valid());
        let missing = manager.acquire("nope");
        assert!(!missing.is_valid());
        assert!(missing.query("anything").await.is_empty());
        assert_eq!(manager.ref_count("nope"), 0);
        assert!(manager.loaded().is_empty());
    }

    #[test]
    fn test_acquire_outside_runtime_yields_null() {
        let manager = EngineManager::new(catalog());
        assert!(!manager.acquire("hello").is_valid());
        assert_eq!(manager.ref_count("hello"), 0);
    }

    #[tokio::test]
    async fn test_report_lists_engines() {
        let manager = EngineManager::new(catalog());
        let registry = manager.acquire("hello");
        let (consumer, _rx) = crate::core::consumer::Consumer::new("watcher");
        registry
            .connect("greeting", &consumer, Duration::from_secs(1), Default::default())
            .await;

        let reports = manager.report().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sources[0].relays[0].interval_ms, 1000);
    }

    #[tokio::test]
    async fn test_global_manager_uses_global_catalog() {
        ProviderCatalog::global().register("global-test", || {
            LoadedEngine::new(EngineConfig::default(), Box::new(NoopProvider))
        });
        let registry = EngineManager::global().acquire("global-test");
        assert!(registry.is_valid());
        assert_eq!(registry.name(), "global-test");
        EngineManager::global().release_and_wait("global-test").await;
        assert!(ProviderCatalog::global().unregister("global-test"));
    }
}
