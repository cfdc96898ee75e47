//! Execution contexts and code images
//!
//! A [`CodeImage`] is one opened module library. It stays mapped for as long
//! as any `Arc<CodeImage>` exists, and every value whose code lives in the
//! library is wrapped in an [`ImageBound`] that holds one. The
//! [`ExecutionContext`] owns a module's image and its private dependency
//! scope; unloading it releases its hold and hands back a weak reference the
//! registry uses to confirm reclamation.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use libloading::{Library, Symbol};
use rust_module_host_sdk::host::Dependency;
use rust_module_host_sdk::module::{
    AbiVersionFn, ModuleBox, ModuleEntryFn, ABI_VERSION, ABI_VERSION_SYMBOL, MODULE_ENTRY_SYMBOL,
};

use super::lease::{ContextId, Lease};
use crate::error::{ContextError, LoadError};

/// An opened module library
pub struct CodeImage {
    path: PathBuf,
    library: Option<Library>,
}

impl CodeImage {
    pub fn from_library(path: impl Into<PathBuf>, library: Library) -> Self {
        Self {
            path: path.into(),
            library: Some(library),
        }
    }

    /// An image whose code is linked into the host itself
    pub fn in_process(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CodeImage {
    fn drop(&mut self) {
        tracing::debug!(path = ?self.path, "Code image released");
    }
}

impl std::fmt::Debug for CodeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeImage")
            .field("path", &self.path)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}

/// A value whose code lives in a code image.
///
/// `value` is declared before `image`, so it is always dropped first.
/// Host-owned values carry no image.
pub struct ImageBound<T> {
    value: T,
    image: Option<Arc<CodeImage>>,
}

impl<T> ImageBound<T> {
    pub fn new(value: T, image: Arc<CodeImage>) -> Self {
        Self {
            value,
            image: Some(image),
        }
    }

    pub fn host(value: T) -> Self {
        Self { value, image: None }
    }

    pub fn image(&self) -> Option<&Arc<CodeImage>> {
        self.image.as_ref()
    }

    /// Transform the value, keeping the image
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ImageBound<U> {
        ImageBound {
            value: f(self.value),
            image: self.image,
        }
    }
}

impl<T> Deref for ImageBound<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// A dependency library opened for one execution context
pub struct DependencyLibrary {
    name: String,
    path: PathBuf,
    library: Option<Library>,
}

impl DependencyLibrary {
    pub fn open(name: &str, path: &Path) -> Result<Self, ContextError> {
        // Safety: dependencies come from the operator-managed dependencies
        // directory or the platform's library search path.
        let library = unsafe { Library::new(path) }.map_err(|source| ContextError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            library: Some(library),
        })
    }

    /// A dependency whose code is linked into the host itself
    pub fn in_process(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            library: None,
        }
    }
}

impl Dependency for DependencyLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, symbol: &str) -> Option<*const c_void> {
        let library = self.library.as_ref()?;
        // Safety: the address is only handed out; the caller picks its type
        let found: Symbol<*const c_void> = unsafe { library.get(symbol.as_bytes()) }.ok()?;
        Some(*found)
    }
}

impl std::fmt::Debug for DependencyLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// Opens module files and the dependency libraries they resolve
pub trait ImageLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<ImageBound<ModuleBox>, LoadError>;

    fn open_dependency(&self, name: &str, path: &Path) -> Result<DependencyLibrary, ContextError> {
        DependencyLibrary::open(name, path)
    }
}

/// Loads modules from dynamic libraries built with `export_module!`
#[derive(Debug, Default)]
pub struct DylibLoader;

impl ImageLoader for DylibLoader {
    fn open(&self, path: &Path) -> Result<ImageBound<ModuleBox>, LoadError> {
        // Safety: loading a library runs its initializers. Modules are trusted
        // code placed in the modules directory by the operator.
        let library = unsafe { Library::new(path) }.map_err(|source| LoadError::Library {
            path: path.to_path_buf(),
            source,
        })?;

        let raw = {
            let version: Symbol<AbiVersionFn> = unsafe { library.get(ABI_VERSION_SYMBOL) }
                .map_err(|_| LoadError::MissingEntry {
                    symbol: "module_abi_version",
                })?;
            let found = unsafe { version() };
            if found != ABI_VERSION {
                return Err(LoadError::AbiMismatch {
                    expected: ABI_VERSION,
                    found,
                });
            }

            let entry: Symbol<ModuleEntryFn> = unsafe { library.get(MODULE_ENTRY_SYMBOL) }
                .map_err(|_| LoadError::MissingEntry {
                    symbol: "module_entry",
                })?;
            unsafe { entry() }
        };

        if raw.is_null() {
            return Err(LoadError::InitFailed("module constructor panicked".into()));
        }

        // Safety: `module_entry` hands over a pointer from `Box::into_raw`
        let module = *unsafe { Box::from_raw(raw) };
        let image = Arc::new(CodeImage::from_library(path, library));
        Ok(ImageBound::new(module, image))
    }
}

/// Owns one loaded module's code image and private dependency scope
pub struct ExecutionContext {
    id: ContextId,
    module: String,
    lease: Arc<Lease>,
    loader: Arc<dyn ImageLoader>,
    dependency_dir: PathBuf,
    image: Mutex<Option<Arc<CodeImage>>>,
    dependencies: Mutex<HashMap<String, Arc<DependencyLibrary>>>,
    unloaded: AtomicBool,
}

impl ExecutionContext {
    pub fn new(
        id: ContextId,
        module: &str,
        dependency_dir: impl Into<PathBuf>,
        loader: Arc<dyn ImageLoader>,
    ) -> Self {
        Self {
            id,
            module: module.to_string(),
            lease: Lease::new(id),
            loader,
            dependency_dir: dependency_dir.into(),
            image: Mutex::new(None),
            dependencies: Mutex::new(HashMap::new()),
            unloaded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn lease(&self) -> &Arc<Lease> {
        &self.lease
    }

    pub fn dependency_dir(&self) -> &Path {
        &self.dependency_dir
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Open the module image and keep it in this context
    pub fn load_image(&self, path: &Path) -> Result<ImageBound<ModuleBox>, LoadError> {
        if self.is_unloaded() {
            return Err(LoadError::InitFailed(ContextError::Unloaded.to_string()));
        }

        let module = self.loader.open(path)?;
        *self.image.lock().unwrap_or_else(PoisonError::into_inner) = module.image().cloned();
        Ok(module)
    }

    /// Resolve a dependency library: cache, then the private dependency
    /// directory, then default platform resolution.
    pub fn resolve(&self, name: &str) -> Result<Arc<DependencyLibrary>, ContextError> {
        if self.is_unloaded() {
            return Err(ContextError::Unloaded);
        }

        let mut cache = self.dependencies.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(library) = cache.get(name) {
            return Ok(library.clone());
        }

        let candidates = [
            self.dependency_dir.join(libloading::library_filename(name)),
            self.dependency_dir.join(name),
        ];
        let path = candidates
            .into_iter()
            .find(|p| p.is_file())
            .unwrap_or_else(|| PathBuf::from(libloading::library_filename(name)));

        let library = self.loader.open_dependency(name, &path)?;

        tracing::debug!(module = %self.module, dependency = %name, path = ?path, "Dependency resolved");
        let library = Arc::new(library);
        cache.insert(name.to_string(), library.clone());
        Ok(library)
    }

    /// Release this context's hold on its code image. Irreversible.
    ///
    /// Returns a weak reference to the image; it dies once every
    /// [`ImageBound`] value from the module is gone.
    pub fn unload(&self) -> Weak<CodeImage> {
        self.unloaded.store(true, Ordering::Release);
        self.dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        match self.image.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(image) => Arc::downgrade(&image),
            None => Weak::new(),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}
