use std::os::raw::{c_char, c_void};

pub mod layout;

/// Current ABI version - increment when making breaking changes
pub const ABI_VERSION: u32 = 2;

/// Command status for framework and library operations
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Ok = 0,
    Err = 1,
}

/// Result of `config()`. `InterfaceUpdate` tells the host the model's
/// structural schema changed and reflection must be pulled again.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Ok = 0,
    Error = 1,
    InterfaceUpdate = 2,
}

impl ConfigStatus {
    /// Unknown codes are treated as errors
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            2 => Self::InterfaceUpdate,
            _ => Self::Error,
        }
    }
}

/// Result of the runtime lifecycle calls (init, step, pause, stop)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Ok = 0,
    Error = 1,
}

impl RuntimeStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            _ => Self::Error,
        }
    }
}

/// Result of the buffer protocol calls (msg_get, msg_set)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Ok = 0,
    SizeMismatch = 1,
    UnknownField = 2,
    /// Field id was not valid UTF-8 or the size callback returned null
    BadId = 3,
    Error = 4,
    /// The bytes are not a valid value for the field's type
    InvalidValue = 5,
}

impl MsgStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::SizeMismatch,
            2 => Self::UnknownField,
            3 => Self::BadId,
            5 => Self::InvalidValue,
            _ => Self::Error,
        }
    }
}

/// Borrowed `{pointer, size}` view of a byte buffer passed across the boundary
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferStruct {
    pub ptr: *const u8,
    pub size: usize,
}

impl BufferStruct {
    pub fn empty() -> Self {
        Self {
            ptr: std::ptr::null(),
            size: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            size: bytes.len(),
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to `size` readable bytes for the returned lifetime.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.size == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.size)
    }
}

/// Given a requested byte count, return a writable pointer of that size.
/// `ctx` is handed back untouched. Returning null aborts the copy.
pub type SizeCallback = unsafe extern "C" fn(ctx: *mut c_void, size: usize) -> *mut u8;

/// Result of the host channel calls
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Ok = 0,
    /// Nothing queued on a non-blocking receive
    Empty = 1,
    /// Every sender, or the receiver, is gone
    Disconnected = 2,
    Error = 3,
}

impl ChannelStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::Empty,
            2 => Self::Disconnected,
            _ => Self::Error,
        }
    }
}

/// Host-owned byte channels keyed by id, handed to models during `init`.
///
/// The table itself is only valid for the duration of the `init` call. The
/// handles it returns are owned by the model until passed to `release_rx` or
/// `release_tx`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostChannels {
    pub ctx: *mut c_void,
    /// Receiving end of channel `id`, null once someone else took it
    pub request_rx: unsafe extern "C" fn(ctx: *mut c_void, id: i64) -> *mut c_void,
    /// A new sending end of channel `id`
    pub request_tx: unsafe extern "C" fn(ctx: *mut c_void, id: i64) -> *mut c_void,
    /// Returns a `ChannelStatus` code
    pub send: unsafe extern "C" fn(tx: *mut c_void, data: BufferStruct) -> u32,
    /// Copy the next message out through the size callback. Returns a
    /// `ChannelStatus` code.
    pub recv: unsafe extern "C" fn(
        rx: *mut c_void,
        block: bool,
        cb: SizeCallback,
        cb_ctx: *mut c_void,
    ) -> u32,
    pub release_rx: unsafe extern "C" fn(rx: *mut c_void),
    pub release_tx: unsafe extern "C" fn(tx: *mut c_void),
}

/// Plugin manifest - describes the library and the model types it provides
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginManifest {
    pub abi_version: u32,
    pub name: *const c_char,
    pub version: *const c_char,
    pub description: *const c_char,
    /// Model type names constructible through `rsis_plugin_create`
    pub models: *const *const c_char,
    pub models_len: usize,
}

/// VTable for model instances
/// This is the stable C ABI interface that plugins must implement
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModelVTable {
    /// Validate and apply configuration. Returns a `ConfigStatus` code.
    pub config: unsafe extern "C" fn(*mut c_void) -> u32,

    /// One-time setup after a successful config. The channel table may be
    /// null. Returns a `RuntimeStatus` code.
    pub init: unsafe extern "C" fn(*mut c_void, *const HostChannels) -> u32,

    /// Advance one tick
    pub step: unsafe extern "C" fn(*mut c_void) -> u32,

    pub pause: unsafe extern "C" fn(*mut c_void) -> u32,

    pub stop: unsafe extern "C" fn(*mut c_void) -> u32,

    /// Copy a field out through the size callback. Returns a `MsgStatus` code.
    pub msg_get: unsafe extern "C" fn(*mut c_void, BufferStruct, SizeCallback, *mut c_void) -> u32,

    /// Copy caller bytes into a field. Returns a `MsgStatus` code.
    pub msg_set: unsafe extern "C" fn(*mut c_void, BufferStruct, BufferStruct) -> u32,

    /// Raw pointer into live model memory, null for unknown fields.
    /// Invalidated by the next step or destroy.
    pub get_ptr: unsafe extern "C" fn(*mut c_void, BufferStruct) -> *mut u8,

    /// Destroy the model instance
    pub destroy: unsafe extern "C" fn(*mut c_void),
}

/// One reflected field, pushed by the plugin during `rsis_plugin_reflect`
#[repr(C)]
#[derive(Debug)]
pub struct FieldDescriptorAbi {
    pub owner: *const c_char,
    pub name: *const c_char,
    pub type_name: *const c_char,
    pub dims: *const u32,
    pub dims_len: usize,
    /// Byte offset within the owning struct
    pub offset: usize,
    /// Total byte size of the field, dimensions included
    pub size: usize,
    pub units: *const c_char,
    pub description: *const c_char,
}

/// Host-supplied registration callbacks. The plugin calls them synchronously
/// and exhaustively for every struct and field it wants introspectable.
#[repr(C)]
pub struct ReflectCallbacks {
    pub ctx: *mut c_void,
    pub register_class: unsafe extern "C" fn(ctx: *mut c_void, class_name: *const c_char),
    pub register_field: unsafe extern "C" fn(ctx: *mut c_void, field: *const FieldDescriptorAbi),
}

/// Plugin entry points - these must be exported by the plugin .so/.dll

/// Get plugin manifest
pub type PluginManifestFn = unsafe extern "C" fn() -> PluginManifest;

/// Create a new model instance of the named type, null if unknown
pub type PluginCreateFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;

/// Get the vtable shared by every instance of the plugin
pub type PluginGetVTableFn = unsafe extern "C" fn() -> *const ModelVTable;

/// Push every reflected class and field through the callbacks
pub type PluginReflectFn = unsafe extern "C" fn(*const ReflectCallbacks);

/// Symbol names that plugins must export
pub const PLUGIN_MANIFEST_SYMBOL: &[u8] = b"rsis_plugin_manifest\0";
pub const PLUGIN_CREATE_SYMBOL: &[u8] = b"rsis_plugin_create\0";
pub const PLUGIN_VTABLE_SYMBOL: &[u8] = b"rsis_plugin_get_vtable\0";
pub const PLUGIN_REFLECT_SYMBOL: &[u8] = b"rsis_plugin_reflect\0";

/// The resolved entry points of one plugin, either looked up in a shared
/// object or taken directly from a plugin linked into the host.
#[derive(Debug, Clone, Copy)]
pub struct PluginEntryPoints {
    pub manifest: PluginManifestFn,
    pub create: PluginCreateFn,
    pub vtable: PluginGetVTableFn,
    pub reflect: PluginReflectFn,
}
