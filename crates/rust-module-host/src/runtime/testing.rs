//! In-process modules and a loader for runtime tests
//!
//! [`FakeLoader`] picks a module factory by the text content of the file it
//! is asked to open, so tests write small marker files instead of building
//! real libraries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_module_host_sdk::event::{channels, LifecycleEvent};
use rust_module_host_sdk::module::{CorsPolicy, Module, ModuleBox};
use rust_module_host_sdk::prelude::*;
use tempfile::TempDir;

use super::context::{CodeImage, DependencyLibrary, ImageBound, ImageLoader};
use super::events::EventBus;
use super::messenger::Messenger;
use super::registry::{ModulePaths, ModuleRegistry, ModuleServices};
use super::router::ModuleRouter;
use super::Host;
use crate::error::{ContextError, LoadError};
use crate::session::SessionService;
use crate::storage::SqliteStore;

type Factory = Arc<dyn Fn() -> ModuleBox + Send + Sync>;

#[derive(Default)]
struct FakeImage {
    factory: Option<Factory>,
    locked: AtomicUsize,
    opens: AtomicUsize,
}

/// Loader that instantiates modules linked into the test binary
#[derive(Default)]
pub struct FakeLoader {
    images: HashMap<String, FakeImage>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files whose content is `key` instantiate `factory`
    pub fn with(mut self, key: &str, factory: impl Fn() -> ModuleBox + Send + Sync + 'static) -> Self {
        self.images.entry(key.to_string()).or_default().factory = Some(Arc::new(factory));
        self
    }

    /// Fail the next `times` opens of `key` with a transient lock error
    pub fn locked_times(mut self, key: &str, times: usize) -> Self {
        self.images.entry(key.to_string()).or_default().locked = AtomicUsize::new(times);
        self
    }

    pub fn opens(&self, key: &str) -> usize {
        self.images
            .get(key)
            .map(|i| i.opens.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl ImageLoader for FakeLoader {
    fn open(&self, path: &Path) -> Result<ImageBound<ModuleBox>, LoadError> {
        let key = std::fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        let image = self
            .images
            .get(key.trim())
            .ok_or_else(|| LoadError::InitFailed(format!("no fake image for {:?}", key)))?;
        image.opens.fetch_add(1, Ordering::SeqCst);

        let locked = image
            .locked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if locked {
            return Err(LoadError::io(path, std::io::Error::from(std::io::ErrorKind::WouldBlock)));
        }

        let factory = image
            .factory
            .as_ref()
            .ok_or_else(|| LoadError::MissingEntry { symbol: "module_entry" })?;
        Ok(ImageBound::new(factory(), Arc::new(CodeImage::in_process(path))))
    }

    /// Any existing file stands in for a library; everything else goes
    /// through real resolution and fails there.
    fn open_dependency(&self, name: &str, path: &Path) -> Result<DependencyLibrary, ContextError> {
        if path.is_file() {
            Ok(DependencyLibrary::in_process(name, path))
        } else {
            DependencyLibrary::open(name, path)
        }
    }
}

/// Shared record of what test modules did
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn factory(&self, label: &'static str, kind: Kind) -> impl Fn() -> ModuleBox + Send + Sync + 'static {
        let journal = self.clone();
        move || Box::new(TestModule { label, kind, journal: journal.clone(), cors: CorsPolicy::default() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Replies to messages with a greeting
    Greeter,
    /// Subscribes to every event and records incoming messages
    Chatty,
    /// Subscribes, then fails `on_load`
    Failing,
}

pub struct TestModule {
    label: &'static str,
    kind: Kind,
    journal: Journal,
    cors: CorsPolicy,
}

impl Module for TestModule {
    fn cors(&self) -> CorsPolicy {
        self.cors.clone()
    }

    fn routes(&self, routes: &mut RouteTable) {
        let label = self.label;
        routes.get("", move |_ctx, _req| async move { Response::text(200, format!("root of {}", label)) });
        routes.get("hello", move |ctx, req| async move {
            Response::ok(json!({
                "module": ctx.module_name(),
                "label": label,
                "session": req.session_id,
            }))
        });
        routes.map_result("POST", "login", |_ctx, req| async move {
            let user: String = req.require_field("user")?;
            Ok(Response::ok(json!({ "user": user })))
        });
        routes.get("panic", |_ctx, _req| async move {
            if true {
                panic!("handler exploded");
            }
            Response::ok("unreachable")
        });
        routes.get("slow", |_ctx, _req| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Response::ok("done")
        });
        routes.map_result("GET", "visits", |ctx, req| async move {
            let session = req.session_id.clone().unwrap_or_default();
            let sessions = ctx.sessions()?;
            let visits = sessions.get(&session, "visits")?.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
            sessions.set(&session, "visits", json!(visits))?;
            Ok(Response::ok(json!({ "visits": visits })))
        });
    }

    fn on_load<'a>(&'a self, ctx: &'a ModuleContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.journal.record(format!("load:{}", self.label));
            match self.kind {
                Kind::Greeter => {
                    let replies = ctx.clone();
                    ctx.on_message(move |msg| {
                        let name: String = msg.data.require("name").unwrap_or_default();
                        replies.reply(&msg, Payload::new().with("greeting", format!("hello {}", name)));
                    });
                }
                Kind::Chatty => {
                    let journal = self.journal.clone();
                    ctx.subscribe(channels::GLOBAL, move |event| {
                        journal.record(format!("event:{}", event.channel()));
                    });
                    let journal = self.journal.clone();
                    ctx.on_message(move |msg| journal.record(format!("msg:{}", msg.to)));
                }
                Kind::Failing => {
                    ctx.subscribe(channels::GLOBAL, |_| {});
                    return Err(HandlerError::Internal("refusing to start".into()));
                }
            }
            Ok(())
        })
    }

    fn on_unload(&self, _ctx: &ModuleContext) {
        self.journal.record(format!("unload:{}", self.label));
    }
}

/// Ready-made module factories
pub struct Fixture;

impl Fixture {
    pub fn greeter() -> ModuleBox {
        Box::new(TestModule {
            label: "greeter",
            kind: Kind::Greeter,
            journal: Journal::default(),
            cors: CorsPolicy::default(),
        })
    }

    pub fn chatty() -> ModuleBox {
        Box::new(TestModule {
            label: "chatty",
            kind: Kind::Chatty,
            journal: Journal::default(),
            cors: CorsPolicy::default(),
        })
    }

    pub fn failing() -> ModuleBox {
        Box::new(TestModule {
            label: "failing",
            kind: Kind::Failing,
            journal: Journal::default(),
            cors: CorsPolicy::default(),
        })
    }

    /// A greeter that refuses foreign origins
    pub fn guarded() -> ModuleBox {
        Box::new(TestModule {
            label: "guarded",
            kind: Kind::Greeter,
            journal: Journal::default(),
            cors: CorsPolicy::new()
                .allow_origin("https://app.example")
                .allow_header("content-type")
                .blocking(),
        })
    }
}

/// Records module lifecycle events as `kind:name`
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn attach(events: &EventBus) -> Self {
        let log = Self::default();
        let sink = log.clone();
        events.subscribe_host(channels::GLOBAL, move |event| {
            let entry = match event {
                LifecycleEvent::ModuleLoaded { name, .. } => format!("module_loaded:{}", name),
                LifecycleEvent::ModuleUnloaded { name } => format!("module_unloaded:{}", name),
                LifecycleEvent::ModuleReloaded { name, .. } => format!("module_reloaded:{}", name),
                _ => return,
            };
            sink.0.lock().unwrap().push(entry);
        });
        log
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Write a marker library file named `<stem>.<dll extension>`
pub fn lib_file(dir: &Path, stem: &str, content: &str) -> PathBuf {
    let path = dir.join(format!("{}.{}", stem, std::env::consts::DLL_EXTENSION));
    std::fs::write(&path, content).unwrap();
    path
}

/// A registry over a temporary modules directory
pub struct TestHost {
    _dir: TempDir,
    pub events: Arc<EventBus>,
    pub messenger: Arc<Messenger>,
    pub loader: Arc<FakeLoader>,
    pub registry: Arc<ModuleRegistry>,
    pub sessions: Arc<SessionService>,
}

impl TestHost {
    pub fn new(loader: FakeLoader) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let messenger = Arc::new(Messenger::new(events.clone()));
        let loader = Arc::new(loader);

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sessions = Arc::new(SessionService::new(store.clone(), Duration::from_secs(30 * 60)));
        let services = ModuleServices {
            storage: Some(store),
            sessions: Some(sessions.clone()),
            reply_timeout: Duration::from_secs(2),
        };

        let registry = ModuleRegistry::new(
            ModulePaths::new(dir.path().join("modules")),
            loader.clone(),
            events.clone(),
            messenger.clone(),
        )
        .with_services(services);
        registry.prepare_directories().unwrap();

        Self {
            _dir: dir,
            events,
            messenger,
            loader,
            registry: Arc::new(registry),
            sessions,
        }
    }

    /// The same components assembled as a [`Host`] routing under `base_path`
    pub fn host(&self, base_path: &str) -> Host {
        Host {
            events: self.events.clone(),
            messenger: self.messenger.clone(),
            registry: self.registry.clone(),
            router: Arc::new(ModuleRouter::new(self.registry.clone(), base_path)),
        }
    }

    /// Write a module file into the modules directory
    pub fn module_file(&self, stem: &str, content: &str) -> PathBuf {
        lib_file(self.registry.paths().root(), stem, content)
    }
}
