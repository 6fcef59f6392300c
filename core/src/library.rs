use libloading::Library;
use rsis_model_abi::*;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::error::{Result, RsisError};

/// A plugin whose entry points have been resolved and whose manifest checked
pub struct LibraryHandle {
    name: String,
    plugin_name: String,
    version: String,
    description: String,
    model_types: Vec<String>,
    entry: PluginEntryPoints,
    vtable: ModelVTable,
    path: Option<PathBuf>,
    // Declared last so the code stays mapped until everything above is dropped
    _lib: Option<Library>,
}

// Safety: the entry points are plain C functions and the manifest data is
// copied out at load time. Model instances carry their own synchronization.
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

impl LibraryHandle {
    /// Open a shared object and resolve its entry points
    ///
    /// # Safety
    ///
    /// This loads arbitrary code from a .so/.dll file. Only load trusted plugins.
    pub unsafe fn open(name: &str, path: &Path) -> Result<Self> {
        log::info!("Loading library '{}' from: {}", name, path.display());

        let lib = Library::new(path).map_err(|e| RsisError::LibraryOpen {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let entry = PluginEntryPoints {
            manifest: *symbol::<PluginManifestFn>(&lib, name, PLUGIN_MANIFEST_SYMBOL)?,
            create: *symbol::<PluginCreateFn>(&lib, name, PLUGIN_CREATE_SYMBOL)?,
            vtable: *symbol::<PluginGetVTableFn>(&lib, name, PLUGIN_VTABLE_SYMBOL)?,
            reflect: *symbol::<PluginReflectFn>(&lib, name, PLUGIN_REFLECT_SYMBOL)?,
        };

        Self::from_entry_points(name, entry, Some(lib), Some(path.to_path_buf()))
    }

    /// Wrap entry points of a plugin linked into the host
    ///
    /// # Safety
    ///
    /// The entry points must honour the plugin ABI.
    pub unsafe fn from_static(name: &str, entry: PluginEntryPoints) -> Result<Self> {
        Self::from_entry_points(name, entry, None, None)
    }

    unsafe fn from_entry_points(
        name: &str,
        entry: PluginEntryPoints,
        lib: Option<Library>,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let manifest = (entry.manifest)();
        if manifest.abi_version != ABI_VERSION {
            return Err(RsisError::AbiMismatch {
                library: name.to_string(),
                found: manifest.abi_version,
                expected: ABI_VERSION,
            });
        }

        let vtable_ptr = (entry.vtable)();
        if vtable_ptr.is_null() {
            return Err(RsisError::MissingSymbol {
                library: name.to_string(),
                symbol: "model vtable".to_string(),
            });
        }

        let mut model_types = Vec::with_capacity(manifest.models_len);
        if !manifest.models.is_null() {
            for i in 0..manifest.models_len {
                model_types.push(owned_str(*manifest.models.add(i)));
            }
        }

        let handle = Self {
            name: name.to_string(),
            plugin_name: owned_str(manifest.name),
            version: owned_str(manifest.version),
            description: owned_str(manifest.description),
            model_types,
            entry,
            vtable: *vtable_ptr,
            path,
            _lib: lib,
        };
        log::info!(
            "Loaded library '{}': {} v{} ({} model type(s))",
            handle.name,
            handle.plugin_name,
            handle.version,
            handle.model_types.len()
        );
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_static(&self) -> bool {
        self._lib.is_none()
    }

    pub fn model_types(&self) -> &[String] {
        &self.model_types
    }

    pub fn provides(&self, model_type: &str) -> bool {
        self.model_types.iter().any(|t| t == model_type)
    }

    pub fn vtable(&self) -> &ModelVTable {
        &self.vtable
    }

    /// Call the plugin factory. Null when the type is unknown to the plugin.
    pub fn create_raw(&self, model_type: &str) -> *mut c_void {
        let Ok(type_name) = CString::new(model_type) else {
            return std::ptr::null_mut();
        };
        unsafe { (self.entry.create)(type_name.as_ptr()) }
    }

    /// Run the plugin's reflection push against `callbacks`
    pub fn reflect(&self, callbacks: &ReflectCallbacks) {
        unsafe { (self.entry.reflect)(callbacks) }
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.name)
            .field("plugin", &self.plugin_name)
            .field("version", &self.version)
            .field("model_types", &self.model_types)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        log::info!("Closing library '{}'", self.name);
    }
}

unsafe fn symbol<'lib, T>(
    lib: &'lib Library,
    library: &str,
    symbol: &[u8],
) -> Result<libloading::Symbol<'lib, T>> {
    lib.get::<T>(symbol).map_err(|_| RsisError::MissingSymbol {
        library: library.to_string(),
        symbol: String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol)).into_owned(),
    })
}

unsafe fn owned_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Loaded libraries by name, plus where to look for new ones
pub struct LibraryManager {
    search_dirs: Vec<PathBuf>,
    libraries: HashMap<String, Arc<LibraryHandle>>,
}

impl Default for LibraryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryManager {
    pub fn new() -> Self {
        let mut dirs = vec![PathBuf::from("./plugins")];

        // Add user plugin directory
        if let Some(home) = dirs::home_dir() {
            dirs.push(home.join(".rsis/plugins"));
        }

        Self {
            search_dirs: dirs,
            libraries: HashMap::new(),
        }
    }

    /// Add a directory searched before the defaults
    pub fn add_search_dir(&mut self, dir: PathBuf) {
        if !self.search_dirs.contains(&dir) {
            self.search_dirs.insert(0, dir);
        }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Platform file for `name` in the first search directory that has it,
    /// otherwise the bare file name for the system loader to resolve
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        let file_name = libloading::library_filename(name);
        for dir in &self.search_dirs {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return candidate;
            }
        }
        log::debug!("'{}' not found in plugin directories, using system search path", name);
        PathBuf::from(file_name)
    }

    /// Load `name` from the plugin directories or the system path
    ///
    /// # Safety
    ///
    /// Loads arbitrary code from a shared library.
    pub unsafe fn load_library(&mut self, name: &str) -> Result<Arc<LibraryHandle>> {
        self.ensure_absent(name)?;
        let path = self.resolve_path(name);
        self.insert(LibraryHandle::open(name, &path)?)
    }

    /// Load `name` from an explicit file
    ///
    /// # Safety
    ///
    /// Loads arbitrary code from a shared library.
    pub unsafe fn load_library_from(&mut self, name: &str, path: &Path) -> Result<Arc<LibraryHandle>> {
        self.ensure_absent(name)?;
        self.insert(LibraryHandle::open(name, path)?)
    }

    /// Register a plugin linked into the host binary
    pub fn register_static(&mut self, name: &str, entry: PluginEntryPoints) -> Result<Arc<LibraryHandle>> {
        self.ensure_absent(name)?;
        let handle = unsafe { LibraryHandle::from_static(name, entry)? };
        self.insert(handle)
    }

    /// Forget `name`. The native handle closes once in-flight users drop
    /// their transient references.
    pub fn unload_library(&mut self, name: &str) -> Result<()> {
        let handle = self
            .libraries
            .remove(name)
            .ok_or_else(|| RsisError::UnknownLibrary(name.to_string()))?;
        log::info!("Unloading library '{}'", name);
        if Arc::strong_count(&handle) > 1 {
            log::debug!("Library '{}' still borrowed, closing deferred", name);
        }
        Ok(())
    }

    /// Observe a library without extending its lifetime. Dangling if absent.
    pub fn model_symbols(&self, name: &str) -> Weak<LibraryHandle> {
        self.libraries
            .get(name)
            .map(Arc::downgrade)
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.libraries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    /// Drop every library
    pub fn clear(&mut self) {
        for name in self.names() {
            let _ = self.unload_library(&name);
        }
    }

    fn ensure_absent(&self, name: &str) -> Result<()> {
        if self.libraries.contains_key(name) {
            return Err(RsisError::DuplicateLibrary(name.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, handle: LibraryHandle) -> Result<Arc<LibraryHandle>> {
        let handle = Arc::new(handle);
        self.libraries.insert(handle.name().to_string(), handle.clone());
        Ok(handle)
    }
}
