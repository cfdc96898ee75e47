//! Dynamic module runtime
//!
//! - Execution contexts owning each module's code image and dependency scope
//! - Registry driving load, unload and hot reload
//! - Messenger and event bus bound to module leases
//! - Path-prefix router and the modules directory watcher

pub mod bridge;
pub mod context;
pub mod events;
pub mod lease;
pub mod messenger;
pub mod registry;
pub mod router;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use context::{CodeImage, DependencyLibrary, DylibLoader, ExecutionContext, ImageBound, ImageLoader};
pub use events::EventBus;
pub use messenger::Messenger;
pub use registry::{ModuleDescriptor, ModulePaths, ModuleRegistry, ModuleServices, ModuleState, RegistryOptions};
pub use router::{ModuleRouter, RouteOutcome};
pub use watcher::WatcherHandle;

/// The runtime's shared components, wired together
#[derive(Clone)]
pub struct Host {
    pub events: Arc<EventBus>,
    pub messenger: Arc<Messenger>,
    pub registry: Arc<ModuleRegistry>,
    pub router: Arc<ModuleRouter>,
}

impl Host {
    pub fn new(
        paths: ModulePaths,
        loader: Arc<dyn ImageLoader>,
        services: ModuleServices,
        options: RegistryOptions,
        base_path: &str,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let messenger = Arc::new(Messenger::new(events.clone()));
        let registry = Arc::new(
            ModuleRegistry::new(paths, loader, events.clone(), messenger.clone())
                .with_options(options)
                .with_services(services),
        );
        let router = Arc::new(ModuleRouter::new(registry.clone(), base_path));

        Self {
            events,
            messenger,
            registry,
            router,
        }
    }

    /// A host loading real shared libraries
    pub fn with_dylibs(paths: ModulePaths, services: ModuleServices, base_path: &str) -> Self {
        Self::new(paths, Arc::new(DylibLoader), services, RegistryOptions::default(), base_path)
    }

    /// Watch the modules directory for changes
    pub fn watch(&self) -> notify::Result<WatcherHandle> {
        WatcherHandle::start(self.registry.clone())
    }
}
