//! Modules directory watcher
//!
//! File events are debounced per path: a module file is reloaded only after it
//! has gone quiet for the stability window and can be opened. Deleting a file
//! that is not pending unloads its module straight away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::registry::{has_library_extension, module_name, ModulePaths, ModuleRegistry};

/// Quiet period before a changed file is reloaded
pub const STABILITY_WINDOW: Duration = Duration::from_secs(2);
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A filesystem change, reduced to what the debouncer cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Changed(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// What the registry should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Reload(PathBuf),
    Unload(String),
}

/// State of a pending file when the stability window expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Still being written, locked, or modified too recently
    Busy,
    Missing,
}

/// Per-path debounce state
pub struct Debouncer {
    paths: ModulePaths,
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(paths: ModulePaths, window: Duration) -> Self {
        Self {
            paths,
            window,
            pending: HashMap::new(),
        }
    }

    /// Top-level library files outside the working directory
    fn accepts(&self, path: &Path) -> bool {
        !self.paths.is_working_path(path)
            && path.parent() == Some(self.paths.root())
            && has_library_extension(path)
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed one change. Deletes act immediately; everything else waits in
    /// the pending set.
    pub fn record(&mut self, change: FileChange, now: Instant) -> Vec<WatchAction> {
        let mut actions = Vec::new();
        match change {
            FileChange::Changed(path) => self.touch(path, now),
            FileChange::Removed(path) => actions.extend(self.removed(&path)),
            FileChange::Renamed { from, to } => {
                actions.extend(self.removed(&from));
                self.touch(to, now);
            }
        }
        actions
    }

    fn touch(&mut self, path: PathBuf, now: Instant) {
        if self.accepts(&path) {
            tracing::trace!(path = %path.display(), "Module file changed");
            self.pending.insert(path, now);
        }
    }

    fn removed(&self, path: &Path) -> Option<WatchAction> {
        if !self.accepts(path) || self.is_pending(path) {
            return None;
        }
        module_name(path).map(WatchAction::Unload)
    }

    /// Paths whose window has expired. A busy file starts a new window; a
    /// file that vanished while pending unloads its module.
    pub fn due(&mut self, now: Instant, probe: impl Fn(&Path) -> Readiness) -> Vec<WatchAction> {
        let expired: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.window)
            .map(|(path, _)| path.clone())
            .collect();

        let mut actions = Vec::new();
        for path in expired {
            match probe(&path) {
                Readiness::Ready => {
                    self.pending.remove(&path);
                    actions.push(WatchAction::Reload(path));
                }
                Readiness::Busy => {
                    self.pending.insert(path, now);
                }
                Readiness::Missing => {
                    self.pending.remove(&path);
                    actions.extend(module_name(&path).map(WatchAction::Unload));
                }
            }
        }
        actions
    }
}

/// Readable, and last written at least `min_age` ago
pub fn probe_file(path: &Path, min_age: Duration) -> Readiness {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Readiness::Missing,
        Err(_) => return Readiness::Busy,
    };
    let age = file
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    match age {
        Some(age) if age >= min_age => Readiness::Ready,
        _ => Readiness::Busy,
    }
}

/// Translate a notify event into debouncer input
pub fn classify(event: notify::Event) -> Vec<FileChange> {
    let notify::Event { kind, mut paths, .. } = event;
    match kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let to = paths.pop();
            let from = paths.pop();
            match (from, to) {
                (Some(from), Some(to)) => vec![FileChange::Renamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            paths.into_iter().map(FileChange::Removed).collect()
        }
        EventKind::Create(_)
        | EventKind::Modify(_)
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            paths.into_iter().map(FileChange::Changed).collect()
        }
        _ => Vec::new(),
    }
}

/// Running watcher. Stops when dropped.
pub struct WatcherHandle {
    _watcher: Option<RecommendedWatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Watch the registry's modules directory (top level only)
    pub fn start(registry: Arc<ModuleRegistry>) -> notify::Result<Self> {
        let root = registry.paths().root();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| match result {
            Ok(event) => {
                for change in classify(event) {
                    let _ = tx.send(change);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Module watcher error"),
        })?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %root.display(), "Watching modules directory");

        let debouncer = Debouncer::new(ModulePaths::new(root), STABILITY_WINDOW);
        let mut handle = Self::spawn(registry, debouncer, rx, |path| probe_file(path, STABILITY_WINDOW));
        handle._watcher = Some(watcher);
        Ok(handle)
    }

    /// Run the poll loop over an arbitrary change source
    pub fn spawn<P>(
        registry: Arc<ModuleRegistry>,
        mut debouncer: Debouncer,
        mut changes: mpsc::UnboundedReceiver<FileChange>,
        probe: P,
    ) -> Self
    where
        P: Fn(&Path) -> Readiness + Send + 'static,
    {
        let (shutdown, mut stop) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let actions = tokio::select! {
                    _ = &mut stop => break,
                    change = changes.recv() => match change {
                        Some(change) => debouncer.record(change, Instant::now()),
                        None => break,
                    },
                    _ = ticker.tick() => debouncer.due(Instant::now(), &probe),
                };
                for action in actions {
                    apply(&registry, action);
                }
            }
            tracing::debug!("Module watcher stopped");
        });

        Self {
            _watcher: None,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply(registry: &Arc<ModuleRegistry>, action: WatchAction) {
    let registry = registry.clone();
    match action {
        WatchAction::Reload(path) => {
            tokio::spawn(async move {
                if let Err(e) = registry.reload(&path).await {
                    tracing::error!(path = %path.display(), error = %e, "Module reload failed");
                }
            });
        }
        WatchAction::Unload(name) => {
            tokio::spawn(async move {
                if registry.unload(&name).await {
                    tracing::info!(module = %name, "Module file removed, unloaded");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{EventLog, FakeLoader, Fixture, TestHost};

    fn lib(root: &Path, stem: &str) -> PathBuf {
        root.join(format!("{}.{}", stem, std::env::consts::DLL_EXTENSION))
    }

    #[test]
    fn test_ignores_foreign_files() {
        let root = PathBuf::from("/srv/modules");
        let mut debouncer = Debouncer::new(ModulePaths::new(&root), STABILITY_WINDOW);
        let now = Instant::now();

        debouncer.record(FileChange::Changed(root.join("notes.txt")), now);
        debouncer.record(FileChange::Changed(lib(&root.join("temp"), "api-1")), now);
        debouncer.record(FileChange::Changed(lib(&root.join("nested"), "api")), now);
        assert_eq!(debouncer.pending_count(), 0);

        let actions = debouncer.record(FileChange::Removed(lib(&root.join("temp"), "api-1")), now);
        assert!(actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_writes_reloads_once() {
        let root = PathBuf::from("/srv/modules");
        let path = lib(&root, "api");
        let mut debouncer = Debouncer::new(ModulePaths::new(&root), STABILITY_WINDOW);
        let start = Instant::now();

        let mut reloads = Vec::new();
        for tick in 0..=20u64 {
            let now = start + POLL_INTERVAL * tick as u32;
            if tick % 2 == 0 && tick <= 6 {
                debouncer.record(FileChange::Changed(path.clone()), now);
            }
            for action in debouncer.due(now, |_| Readiness::Ready) {
                reloads.push((tick, action));
            }
        }

        // Last write at 1.5s, window closes after 3.5s
        assert_eq!(reloads, vec![(15, WatchAction::Reload(path))]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_file_stays_pending() {
        let root = PathBuf::from("/srv/modules");
        let path = lib(&root, "api");
        let mut debouncer = Debouncer::new(ModulePaths::new(&root), STABILITY_WINDOW);
        let start = Instant::now();

        debouncer.record(FileChange::Changed(path.clone()), start);
        let later = start + Duration::from_secs(3);
        assert!(debouncer.due(later, |_| Readiness::Busy).is_empty());
        assert!(debouncer.is_pending(&path));

        // The window restarted at `later`
        assert!(debouncer.due(later + Duration::from_secs(1), |_| Readiness::Ready).is_empty());
        let actions = debouncer.due(later + Duration::from_secs(3), |_| Readiness::Ready);
        assert_eq!(actions, vec![WatchAction::Reload(path)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_unloads_unless_pending() {
        let root = PathBuf::from("/srv/modules");
        let mut debouncer = Debouncer::new(ModulePaths::new(&root), STABILITY_WINDOW);
        let now = Instant::now();

        let actions = debouncer.record(FileChange::Removed(lib(&root, "Shop")), now);
        assert_eq!(actions, vec![WatchAction::Unload("shop".into())]);

        debouncer.record(FileChange::Changed(lib(&root, "api")), now);
        assert!(debouncer.record(FileChange::Removed(lib(&root, "api")), now).is_empty());

        let actions = debouncer.due(now + Duration::from_secs(3), |_| Readiness::Missing);
        assert_eq!(actions, vec![WatchAction::Unload("api".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_is_delete_then_create() {
        let root = PathBuf::from("/srv/modules");
        let mut debouncer = Debouncer::new(ModulePaths::new(&root), STABILITY_WINDOW);

        let actions = debouncer.record(
            FileChange::Renamed {
                from: lib(&root, "old"),
                to: lib(&root, "new"),
            },
            Instant::now(),
        );
        assert_eq!(actions, vec![WatchAction::Unload("old".into())]);
        assert!(debouncer.is_pending(&lib(&root, "new")));
    }

    #[test]
    fn test_classify_rename_pair() {
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/m/a.so"))
            .add_path(PathBuf::from("/m/b.so"));
        assert_eq!(
            classify(event),
            vec![FileChange::Renamed {
                from: PathBuf::from("/m/a.so"),
                to: PathBuf::from("/m/b.so"),
            }]
        );

        let event = notify::Event::new(EventKind::Access(AccessKind::Read)).add_path(PathBuf::from("/m/a.so"));
        assert!(classify(event).is_empty());
    }

    #[test]
    fn test_probe_missing_and_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.bin");
        assert_eq!(probe_file(&path, STABILITY_WINDOW), Readiness::Missing);

        std::fs::write(&path, "x").unwrap();
        assert_eq!(probe_file(&path, STABILITY_WINDOW), Readiness::Busy);
        assert_eq!(probe_file(&path, Duration::ZERO), Readiness::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_drives_registry() {
        let host = TestHost::new(FakeLoader::new().with("api", Fixture::greeter));
        let log = EventLog::attach(&host.events);
        let path = host.module_file("api", "api");
        let root = host.registry.paths().root().to_path_buf();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WatcherHandle::spawn(
            host.registry.clone(),
            Debouncer::new(ModulePaths::new(root), STABILITY_WINDOW),
            rx,
            |_| Readiness::Ready,
        );

        for _ in 0..4 {
            tx.send(FileChange::Changed(path.clone())).unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(host.registry.is_loaded("api"));
        assert_eq!(log.names(), vec!["module_loaded:api"]);

        tx.send(FileChange::Removed(path)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!host.registry.is_loaded("api"));

        handle.shutdown();
    }
}
