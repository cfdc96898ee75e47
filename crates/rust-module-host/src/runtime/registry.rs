//! Module registry: load, unload and reload
//!
//! The registry is the only place module descriptors are created or removed.
//! Mutations for one name are serialized by a per-name async lock; reads
//! (`get`, `list`, `active`) never take it.
//!
//! A module file is never opened in place. Each load copies it to a unique
//! working copy (`temp/<name>-<generation>.<ext>`), which keeps the original
//! free for the next build and sidesteps the dynamic linker's by-path cache.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use rust_module_host_sdk::event::LifecycleEvent;
use rust_module_host_sdk::host::{KeyValueStore, SessionStore, DEFAULT_REPLY_TIMEOUT};
use rust_module_host_sdk::module::{CorsPolicy, Module, ModuleBox};
use rust_module_host_sdk::{ModuleContext, RouteTable};
use tokio::sync::Mutex;

use super::bridge::ModuleBridge;
use super::context::{CodeImage, ExecutionContext, ImageBound, ImageLoader};
use super::events::EventBus;
use super::messenger::Messenger;
use crate::error::{panic_message, LoadError, LoadOutcome};

/// Lifecycle state of a registered module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    Unloaded = 0,
    Loading = 1,
    Active = 2,
    Unloading = 3,
}

impl ModuleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ModuleState::Loading,
            2 => ModuleState::Active,
            3 => ModuleState::Unloading,
            _ => ModuleState::Unloaded,
        }
    }
}

/// Directory layout under the modules root
#[derive(Debug, Clone)]
pub struct ModulePaths {
    root: PathBuf,
}

impl ModulePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared dependency binaries
    pub fn dependencies(&self) -> PathBuf {
        self.root.join("dependencies")
    }

    /// Working copies; cleared on startup
    pub fn working(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn working_dependencies(&self) -> PathBuf {
        self.working().join("dependencies")
    }

    pub fn working_dependencies_for(&self, module: &str) -> PathBuf {
        self.working_dependencies().join(module)
    }

    pub fn working_copy(&self, module: &str, generation: u64) -> PathBuf {
        self.working()
            .join(format!("{}-{}.{}", module, generation, std::env::consts::DLL_EXTENSION))
    }

    /// Whether `path` lies under the working directory
    pub fn is_working_path(&self, path: &Path) -> bool {
        path.starts_with(self.working())
    }
}

/// Timing knobs of the load/unload lifecycle
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Pause between unload and load during a reload
    pub reload_settle: Duration,
    /// Delay before checking that an unloaded image was reclaimed
    pub unload_confirm: Duration,
    /// Delay before the single retry of a load that hit a file lock
    pub lock_retry_delay: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            reload_settle: Duration::from_millis(200),
            unload_confirm: Duration::from_millis(500),
            lock_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Services handed to every module context
#[derive(Clone)]
pub struct ModuleServices {
    pub storage: Option<Arc<dyn KeyValueStore>>,
    pub sessions: Option<Arc<dyn SessionStore>>,
    pub reply_timeout: Duration,
}

impl Default for ModuleServices {
    fn default() -> Self {
        Self {
            storage: None,
            sessions: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

/// Everything the module itself contributed. Dropped before its image.
struct Loaded {
    module: ModuleBox,
    routes: RouteTable,
}

/// A live module instance: the module, its routes and its context
pub struct ModuleInstance {
    loaded: ImageBound<Loaded>,
    context: ModuleContext,
}

impl ModuleInstance {
    pub fn module(&self) -> &dyn Module {
        self.loaded.module.as_ref()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.loaded.routes
    }

    pub fn context(&self) -> &ModuleContext {
        &self.context
    }

    pub fn image(&self) -> Option<&Arc<CodeImage>> {
        self.loaded.image()
    }
}

/// Registry entry for one module
pub struct ModuleDescriptor {
    name: String,
    source: PathBuf,
    working_copy: PathBuf,
    state: AtomicU8,
    instance: Arc<ModuleInstance>,
    context: Arc<ExecutionContext>,
    cors: CorsPolicy,
    loaded_at: DateTime<Utc>,
}

impl ModuleDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn working_copy(&self) -> &Path {
        &self.working_copy
    }

    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ModuleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state() == ModuleState::Active
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn instance(&self) -> &Arc<ModuleInstance> {
        &self.instance
    }

    pub fn cors(&self) -> &CorsPolicy {
        &self.cors
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("state", &self.state())
            .field("routes", self.instance.routes())
            .finish()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub loaded: usize,
    pub active: usize,
    pub leaked_contexts: usize,
}

pub struct ModuleRegistry {
    paths: ModulePaths,
    options: RegistryOptions,
    services: ModuleServices,
    loader: Arc<dyn ImageLoader>,
    events: Arc<EventBus>,
    messenger: Arc<Messenger>,
    modules: DashMap<String, Arc<ModuleDescriptor>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,
    next_context: AtomicU64,
    leaked: Arc<AtomicUsize>,
}

impl ModuleRegistry {
    pub fn new(
        paths: ModulePaths,
        loader: Arc<dyn ImageLoader>,
        events: Arc<EventBus>,
        messenger: Arc<Messenger>,
    ) -> Self {
        Self {
            paths,
            options: RegistryOptions::default(),
            services: ModuleServices::default(),
            loader,
            events,
            messenger,
            modules: DashMap::new(),
            locks: DashMap::new(),
            generation: AtomicU64::new(0),
            next_context: AtomicU64::new(1),
            leaked: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_services(mut self, services: ModuleServices) -> Self {
        self.services = services;
        self
    }

    pub fn paths(&self) -> &ModulePaths {
        &self.paths
    }

    /// Create the modules and dependency directories and reset the working
    /// directory, discarding working copies left by a previous run.
    pub fn prepare_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.paths.root())?;
        std::fs::create_dir_all(self.paths.dependencies())?;

        let working = self.paths.working();
        if working.exists() {
            std::fs::remove_dir_all(&working)?;
        }
        std::fs::create_dir_all(self.paths.working_dependencies())?;
        Ok(())
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock of a name that is no longer registered, unless another
    /// caller holds it
    fn forget_lock(&self, name: &str) {
        self.locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1 && !self.modules.contains_key(name));
    }

    /// Load the module at `path`
    pub async fn load(&self, path: &Path) -> Result<LoadOutcome, LoadError> {
        let name = module_name(path).ok_or_else(|| LoadError::InvalidName {
            path: path.to_path_buf(),
        })?;
        let lock = self.lock_for(&name);
        let result = {
            let _guard = lock.lock().await;
            self.load_locked(&name, path).await
        };
        drop(lock);
        if result.is_err() {
            self.forget_lock(&name);
        }
        result
    }

    /// Unload a module by name. Returns false if it was not loaded.
    pub async fn unload(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        let lock = self.lock_for(&name);
        let unloaded = {
            let _guard = lock.lock().await;
            self.unload_locked(&name).await
        };
        drop(lock);
        self.forget_lock(&name);
        unloaded
    }

    /// Unload and load again under the same lock
    pub async fn reload(&self, path: &Path) -> Result<LoadOutcome, LoadError> {
        let name = module_name(path).ok_or_else(|| LoadError::InvalidName {
            path: path.to_path_buf(),
        })?;
        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        let was_loaded = self.unload_locked(&name).await;
        tokio::time::sleep(self.options.reload_settle).await;

        let outcome = self.load_locked(&name, path).await?;
        if was_loaded && outcome == LoadOutcome::Loaded {
            tracing::info!(module = %name, "Module reloaded");
            self.events.publish(LifecycleEvent::ModuleReloaded {
                name: name.clone(),
                path: path.to_path_buf(),
            });
        }
        Ok(outcome)
    }

    async fn load_locked(&self, name: &str, path: &Path) -> Result<LoadOutcome, LoadError> {
        if self.modules.contains_key(name) {
            tracing::info!(module = %name, "Module already loaded, skipping");
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let result = match self.try_load(name, path).await {
            Err(err) if err.is_transient() => {
                tracing::warn!(module = %name, error = %err, "Module file locked, retrying");
                tokio::time::sleep(self.options.lock_retry_delay).await;
                self.try_load(name, path).await
            }
            other => other,
        };

        match result {
            Ok(()) => Ok(LoadOutcome::Loaded),
            Err(err) => {
                tracing::error!(module = %name, path = ?path, error = %err, "Failed to load module");
                Err(err)
            }
        }
    }

    async fn try_load(&self, name: &str, path: &Path) -> Result<(), LoadError> {
        let dependency_dir = self.paths.working_dependencies_for(name);
        let copied = sync_dependencies(&self.paths.dependencies(), &dependency_dir)?;
        if copied > 0 {
            tracing::debug!(module = %name, copied, "Dependencies refreshed");
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let working_copy = self.paths.working_copy(name, generation);
        std::fs::create_dir_all(self.paths.working()).map_err(|e| LoadError::io(self.paths.working(), e))?;
        std::fs::copy(path, &working_copy).map_err(|e| LoadError::io(path, e))?;

        let result = self.instantiate(name, path, &working_copy, dependency_dir).await;
        if result.is_err() {
            if let Err(err) = std::fs::remove_file(&working_copy) {
                tracing::warn!(path = ?working_copy, error = %err, "Failed to remove working copy");
            }
        }
        result
    }

    async fn instantiate(
        &self,
        name: &str,
        source: &Path,
        working_copy: &Path,
        dependency_dir: PathBuf,
    ) -> Result<(), LoadError> {
        let context_id = self.next_context.fetch_add(1, Ordering::Relaxed);
        let context = Arc::new(ExecutionContext::new(context_id, name, dependency_dir, self.loader.clone()));
        let module = context.load_image(working_copy)?;

        let declared = guarded(name, || (module.dependencies(), module.cors()))?;
        for dependency in declared.0 {
            context
                .resolve(&dependency)
                .map_err(|source| LoadError::Dependency { name: dependency.clone(), source })?;
        }

        let routes = guarded(name, || {
            let mut routes = RouteTable::new();
            module.routes(&mut routes);
            routes
        })?;

        let image = module.image().map(Arc::downgrade).unwrap_or_else(Weak::new);
        let bridge = Arc::new(
            ModuleBridge::new(
                name,
                context.lease().clone(),
                image,
                self.messenger.clone(),
                self.events.clone(),
            )
            .with_context(Arc::downgrade(&context)),
        );
        let mut module_context = ModuleContext::new(name, bridge.clone(), bridge.clone())
            .with_dependencies(bridge)
            .with_reply_timeout(self.services.reply_timeout);
        if let Some(storage) = &self.services.storage {
            module_context = module_context.with_storage(storage.clone());
        }
        if let Some(sessions) = &self.services.sessions {
            module_context = module_context.with_sessions(sessions.clone());
        }

        let instance = Arc::new(ModuleInstance {
            loaded: module.map(|module| Loaded { module, routes }),
            context: module_context,
        });

        let descriptor = Arc::new(ModuleDescriptor {
            name: name.to_string(),
            source: source.to_path_buf(),
            working_copy: working_copy.to_path_buf(),
            state: AtomicU8::new(ModuleState::Loading as u8),
            instance: instance.clone(),
            context,
            cors: declared.1,
            loaded_at: Utc::now(),
        });
        self.modules.insert(name.to_string(), descriptor.clone());

        let on_load = AssertUnwindSafe(instance.module().on_load(instance.context()))
            .catch_unwind()
            .await;
        let failure = match on_load {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(format!("on_load panicked: {}", panic_message(payload.as_ref()))),
        };

        if let Some(reason) = failure {
            self.modules.remove(name);
            self.release(&descriptor);
            drop(instance);
            drop(descriptor);
            return Err(LoadError::InitFailed(reason));
        }

        descriptor.set_state(ModuleState::Active);
        tracing::info!(
            module = %name,
            routes = instance.routes().len(),
            context = context_id,
            "Module loaded"
        );
        self.events.publish(LifecycleEvent::ModuleLoaded {
            name: name.to_string(),
            path: source.to_path_buf(),
        });
        Ok(())
    }

    /// Revoke everything the module registered with the host
    fn release(&self, descriptor: &ModuleDescriptor) {
        let context = descriptor.context();
        context.lease().revoke();
        let subscriptions = self.events.revoke(context.id());
        let handlers = self.messenger.revoke(context.id());
        tracing::debug!(module = %descriptor.name, subscriptions, handlers, "Module lease revoked");
    }

    async fn unload_locked(&self, name: &str) -> bool {
        let Some(descriptor) = self.modules.get(name).map(|d| d.value().clone()) else {
            return false;
        };

        descriptor.set_state(ModuleState::Unloading);
        self.modules.remove(name);
        self.release(&descriptor);

        let instance = descriptor.instance();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| instance.module().on_unload(instance.context()))) {
            tracing::error!(
                module = %name,
                error = %panic_message(payload.as_ref()),
                "on_unload panicked"
            );
        }

        let image = descriptor.context().unload();
        let working_copy = descriptor.working_copy.clone();
        descriptor.set_state(ModuleState::Unloaded);
        drop(descriptor);

        tracing::info!(module = %name, "Module unloaded");
        self.events.publish(LifecycleEvent::ModuleUnloaded { name: name.to_string() });

        self.spawn_cleanup(name.to_string(), image, working_copy);
        true
    }

    /// Confirm the image was reclaimed, then delete the working copy
    fn spawn_cleanup(&self, name: String, image: Weak<CodeImage>, working_copy: PathBuf) {
        let delay = self.options.unload_confirm;
        let leaked = self.leaked.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if image.strong_count() > 0 {
                leaked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    module = %name,
                    holders = image.strong_count(),
                    "Unloaded module image still referenced"
                );
            }

            if let Err(err) = std::fs::remove_file(&working_copy) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(module = %name, path = ?working_copy, error = %err, "Failed to delete working copy");
                }
            }
        });
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        self.modules.get(&name.to_lowercase()).map(|d| d.value().clone())
    }

    /// The instance of an Active module
    pub fn active(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.get(name)
            .filter(|d| d.is_active())
            .map(|d| d.instance.clone())
    }

    /// Snapshot of all descriptors, sorted by name
    pub fn list(&self) -> Vec<Arc<ModuleDescriptor>> {
        let mut modules: Vec<_> = self.modules.iter().map(|d| d.value().clone()).collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.contains_key(&name.to_lowercase())
    }

    pub fn leaked_contexts(&self) -> usize {
        self.leaked.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RegistryStats {
        let loaded = self.modules.len();
        let active = self.modules.iter().filter(|d| d.is_active()).count();
        RegistryStats {
            loaded,
            active,
            leaked_contexts: self.leaked_contexts(),
        }
    }

    /// Top-level files with the platform library extension
    pub fn discover(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(self.paths.root())? {
            let path = entry?.path();
            if path.is_file() && has_library_extension(&path) {
                found.push(path);
            }
        }
        Ok(found)
    }

    /// Load every module in the modules directory: names in `order` first,
    /// then the rest alphabetically by file name. Returns how many loaded.
    pub async fn load_all(&self, order: &[String]) -> std::io::Result<usize> {
        let mut remaining = self.discover()?;
        remaining.sort_by_key(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default()
        });

        let mut queue = Vec::with_capacity(remaining.len());
        for wanted in order {
            let wanted = wanted.to_lowercase();
            match remaining.iter().position(|p| module_name(p).as_deref() == Some(wanted.as_str())) {
                Some(idx) => queue.push(remaining.remove(idx)),
                None => tracing::warn!(module = %wanted, "Ordered module not found, skipping"),
            }
        }
        queue.extend(remaining);

        let mut loaded = 0;
        for path in queue {
            if let Ok(LoadOutcome::Loaded) = self.load(&path).await {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Unload every module, for shutdown
    pub async fn unload_all(&self) {
        let names: Vec<String> = self.modules.iter().map(|d| d.key().clone()).collect();
        for name in names {
            self.unload(&name).await;
        }
    }
}

/// Run module code, turning a panic into a load failure
fn guarded<T>(name: &str, f: impl FnOnce() -> T) -> Result<T, LoadError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let reason = panic_message(payload.as_ref());
        tracing::error!(module = %name, error = %reason, "Module panicked during load");
        LoadError::InitFailed(reason)
    })
}

pub fn has_library_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
        .unwrap_or(false)
}

/// Module name for a library file: the stem, lowercased, with the platform
/// library prefix (`lib` on Unix) removed.
pub fn module_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let prefix = std::env::consts::DLL_PREFIX;
    let stem = match stem.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() && !rest.is_empty() => rest,
        _ => stem,
    };
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_lowercase())
}

/// Copy shared dependency files that are newer than the module's copies.
/// Each file is written under a temporary name and renamed into place.
fn sync_dependencies(source_dir: &Path, target_dir: &Path) -> Result<usize, LoadError> {
    std::fs::create_dir_all(target_dir).map_err(|e| LoadError::io(target_dir, e))?;
    if !source_dir.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    let entries = std::fs::read_dir(source_dir).map_err(|e| LoadError::io(source_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| LoadError::io(source_dir, e))?;
        let source = entry.path();
        if !source.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        let target = target_dir.join(&file_name);
        if !is_newer(&source, &target) {
            continue;
        }

        let staging = target_dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
        std::fs::copy(&source, &staging).map_err(|e| LoadError::io(&source, e))?;
        std::fs::rename(&staging, &target).map_err(|e| LoadError::io(&target, e))?;
        copied += 1;
    }
    Ok(copied)
}

fn is_newer(source: &Path, target: &Path) -> bool {
    let modified = |p: &Path| -> Option<SystemTime> { std::fs::metadata(p).ok()?.modified().ok() };
    match (modified(source), modified(target)) {
        (Some(src), Some(dst)) => src > dst,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{lib_file, EventLog, FakeLoader, Fixture, Journal, Kind, TestHost};
    use rust_module_host_sdk::Payload;

    #[test]
    fn test_module_name() {
        let ext = std::env::consts::DLL_EXTENSION;
        let prefixed = format!("{}Shop.{}", std::env::consts::DLL_PREFIX, ext);
        assert_eq!(module_name(Path::new(&prefixed)).as_deref(), Some("shop"));
        assert_eq!(module_name(Path::new(&format!("API.{}", ext))).as_deref(), Some("api"));
        assert_eq!(module_name(Path::new("/")), None);
    }

    #[test]
    fn test_library_extension() {
        let ext = std::env::consts::DLL_EXTENSION;
        assert!(has_library_extension(Path::new(&format!("a.{}", ext))));
        assert!(!has_library_extension(Path::new("a.txt")));
    }

    #[tokio::test]
    async fn test_load_activates_and_publishes() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let log = EventLog::attach(&host.events);
        let path = host.module_file("Greeter", "greeter");

        assert_eq!(host.registry.load(&path).await.unwrap(), LoadOutcome::Loaded);

        let descriptor = host.registry.get("GREETER").unwrap();
        assert_eq!(descriptor.state(), ModuleState::Active);
        assert_eq!(descriptor.name(), "greeter");
        assert!(descriptor.working_copy().starts_with(host.registry.paths().working()));
        assert!(descriptor.working_copy().exists());
        assert!(host.registry.active("greeter").is_some());
        assert_eq!(log.names(), vec!["module_loaded:greeter"]);
    }

    #[tokio::test]
    async fn test_load_while_loaded_is_noop() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let log = EventLog::attach(&host.events);
        let path = host.module_file("greeter", "greeter");

        host.registry.load(&path).await.unwrap();
        let first = host.registry.get("greeter").unwrap();

        assert_eq!(host.registry.load(&path).await.unwrap(), LoadOutcome::AlreadyLoaded);
        let second = host.registry.get("greeter").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(host.registry.stats().loaded, 1);
        assert_eq!(host.loader.opens("greeter"), 1);
        assert_eq!(log.names().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_register_once() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let path = host.module_file("greeter", "greeter");

        let (a, b) = tokio::join!(host.registry.load(&path), host.registry.load(&path));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == LoadOutcome::AlreadyLoaded);
        assert_eq!(outcomes, vec![LoadOutcome::Loaded, LoadOutcome::AlreadyLoaded]);
        assert_eq!(host.loader.opens("greeter"), 1);
    }

    #[tokio::test]
    async fn test_failed_on_load_leaves_nothing() {
        let host = TestHost::new(FakeLoader::new().with("broken", Fixture::failing));
        let log = EventLog::attach(&host.events);
        let path = host.module_file("broken", "broken");

        let err = host.registry.load(&path).await.unwrap_err();
        assert!(matches!(err, LoadError::InitFailed(_)));
        assert!(host.registry.get("broken").is_none());
        assert!(log.names().is_empty());
        assert_eq!(host.events.subscription_count(), 1, "only the log subscription remains");

        let leftovers = std::fs::read_dir(host.registry.paths().working())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_unknown_image_is_load_failure() {
        let host = TestHost::new(FakeLoader::new());
        let path = host.module_file("mystery", "mystery");
        assert!(host.registry.load(&path).await.is_err());
        assert!(!host.registry.is_loaded("mystery"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_lock_retried_once() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter).locked_times("greeter", 1));
        let path = host.module_file("greeter", "greeter");

        assert_eq!(host.registry.load(&path).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(host.loader.opens("greeter"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_lock_fails() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter).locked_times("greeter", 2));
        let path = host.module_file("greeter", "greeter");

        assert!(matches!(host.registry.load(&path).await, Err(LoadError::Locked { .. })));
        assert_eq!(host.loader.opens("greeter"), 2);
        assert!(!host.registry.is_loaded("greeter"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_revokes_and_reclaims() {
        let journal = Journal::default();
        let host = TestHost::new(FakeLoader::new().with("chatty", journal.factory("chatty", Kind::Chatty)));
        let log = EventLog::attach(&host.events);
        let path = host.module_file("chatty", "chatty");
        host.registry.load(&path).await.unwrap();

        // chatty subscribes to "*" and registers a message handler in on_load
        assert_eq!(host.events.subscription_count(), 2);
        assert_eq!(host.messenger.handler_count(), 1);
        let working_copy = host.registry.get("chatty").unwrap().working_copy().to_path_buf();

        assert!(host.registry.unload("Chatty").await);
        assert!(!host.registry.unload("chatty").await);

        assert!(host.registry.get("chatty").is_none());
        assert_eq!(host.events.subscription_count(), 1);
        assert_eq!(host.messenger.handler_count(), 0);
        assert!(log.names().contains(&"module_unloaded:chatty".to_string()));
        assert_eq!(journal.entries().last().map(String::as_str), Some("unload:chatty"));
        assert!(journal.entries().contains(&"event:module.loaded".to_string()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(host.registry.leaked_contexts(), 0);
        assert!(!working_copy.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_instance_counts_as_leak() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let path = host.module_file("greeter", "greeter");
        host.registry.load(&path).await.unwrap();

        let held = host.registry.active("greeter").unwrap();
        host.registry.unload("greeter").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(host.registry.leaked_contexts(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_unload_marks_descriptor_and_forgets_lock() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let path = host.module_file("greeter", "greeter");
        host.registry.load(&path).await.unwrap();
        assert_eq!(host.registry.locks.len(), 1);

        let descriptor = host.registry.get("greeter").unwrap();
        assert_eq!(descriptor.state(), ModuleState::Active);

        host.registry.unload("greeter").await;
        assert_eq!(descriptor.state(), ModuleState::Unloaded);
        assert!(host.registry.locks.is_empty());

        // A failed load leaves no lock behind either
        let broken = host.module_file("broken", "nothing registered");
        assert!(host.registry.load(&broken).await.is_err());
        assert!(host.registry.locks.is_empty());

        // Reload keeps the lock of the module it brings back
        host.registry.load(&path).await.unwrap();
        host.registry.reload(&path).await.unwrap();
        assert_eq!(host.registry.locks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_event_order() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let path = host.module_file("greeter", "greeter");
        host.registry.load(&path).await.unwrap();
        let first = host.registry.get("greeter").unwrap().working_copy().to_path_buf();

        let log = EventLog::attach(&host.events);
        assert_eq!(host.registry.reload(&path).await.unwrap(), LoadOutcome::Loaded);

        assert_eq!(
            log.names(),
            vec!["module_unloaded:greeter", "module_loaded:greeter", "module_reloaded:greeter"]
        );
        let second = host.registry.get("greeter").unwrap().working_copy().to_path_buf();
        assert_ne!(first, second);
        assert_eq!(host.loader.opens("greeter"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_of_new_module_only_loads() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let log = EventLog::attach(&host.events);
        let path = host.module_file("greeter", "greeter");

        host.registry.reload(&path).await.unwrap();
        assert_eq!(log.names(), vec!["module_loaded:greeter"]);
    }

    #[tokio::test]
    async fn test_load_all_order() {
        let loader = FakeLoader::new()
            .with("a", Fixture::greeter)
            .with("b", Fixture::greeter)
            .with("c", Fixture::greeter);
        let host = TestHost::new(loader);
        let log = EventLog::attach(&host.events);
        host.module_file("c", "c");
        host.module_file("B", "b");
        host.module_file("a", "a");
        std::fs::write(host.registry.paths().root().join("notes.txt"), "ignored").unwrap();

        let loaded = host
            .registry
            .load_all(&["c".to_string(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(loaded, 3);
        assert_eq!(
            log.names(),
            vec!["module_loaded:c", "module_loaded:a", "module_loaded:b"]
        );
    }

    #[tokio::test]
    async fn test_prepare_directories_clears_working() {
        let host = TestHost::new(FakeLoader::new());
        let stale = host.registry.paths().working().join("old-1.so");
        std::fs::write(&stale, "x").unwrap();

        host.registry.prepare_directories().unwrap();
        assert!(!stale.exists());
        assert!(host.registry.paths().working_dependencies().is_dir());
        assert!(host.registry.paths().dependencies().is_dir());
    }

    #[test]
    fn test_sync_dependencies_copies_newer_only() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("deps");
        let target = dir.path().join("work");
        std::fs::create_dir_all(&source).unwrap();
        lib_file(&source, "shared", "v1");

        assert_eq!(sync_dependencies(&source, &target).unwrap(), 1);
        assert_eq!(sync_dependencies(&source, &target).unwrap(), 0);

        let copied = std::fs::read_dir(&target).unwrap().count();
        assert_eq!(copied, 1, "no staging files left behind");
    }

    #[tokio::test]
    async fn test_module_context_gets_services() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let path = host.module_file("greeter", "greeter");
        host.registry.load(&path).await.unwrap();

        let instance = host.registry.active("greeter").unwrap();
        assert_eq!(instance.context().module_name(), "greeter");
        assert!(instance.context().storage().is_ok());
        assert!(instance.routes().contains_path("hello"));
    }

    #[tokio::test]
    async fn test_module_resolves_dependency_from_private_dir() {
        let host = TestHost::new(FakeLoader::new().with("greeter", Fixture::greeter));
        let shared = host.registry.paths().dependencies().join(libloading::library_filename("codec"));
        std::fs::write(&shared, "codec").unwrap();
        host.registry.load(&host.module_file("greeter", "greeter")).await.unwrap();

        let instance = host.registry.active("greeter").unwrap();
        let first = instance.context().dependency("codec").unwrap();
        let private = host.registry.paths().working_dependencies_for("greeter");
        assert!(first.path().starts_with(&private));
        assert_eq!(first.name(), "codec");

        let second = instance.context().dependency("codec").unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&first), Arc::as_ptr(&second)));

        assert!(instance.context().dependency("surely_not_a_library_xyz").is_err());

        host.registry.unload("greeter").await;
        let err = instance.context().dependency("codec").err().unwrap();
        assert!(matches!(err, rust_module_host_sdk::HandlerError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_modules_message_each_other() {
        let loader = FakeLoader::new()
            .with("greeter", Fixture::greeter)
            .with("chatty", Fixture::chatty);
        let host = TestHost::new(loader);
        host.registry.load(&host.module_file("greeter", "greeter")).await.unwrap();
        host.registry.load(&host.module_file("chatty", "chatty")).await.unwrap();

        let chatty = host.registry.active("chatty").unwrap();
        let reply = chatty
            .context()
            .request("greeter.greet", Payload::new().with("name", "ada"))
            .await
            .unwrap();
        assert_eq!(reply.data.require::<String>("greeting").unwrap(), "hello ada");
        assert_eq!(reply.from, "greeter.greet");
    }
}
