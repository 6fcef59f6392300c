pub use rsis_model_abi;
// Re-export common types for convenience
pub use rsis_model_abi::layout::{ClassRegistry, FieldDef, LayoutError};
pub use rsis_model_abi::{
    BufferStruct, ChannelStatus, ConfigStatus, HostChannels, ModelVTable, MsgStatus,
    PluginEntryPoints, PluginManifest, ReflectCallbacks, RuntimeStatus, SizeCallback, ABI_VERSION,
};

mod channel;
mod instance;
mod reflect;

pub use channel::{ChannelRx, ChannelTx, Channels};
pub use instance::{create_instance, emit_reflection, FieldTable, VTABLE};
pub use reflect::{field, Reflected, Reflector};

use std::ffi::CStr;
use std::os::raw::c_char;

/// A model type a plugin can construct.
///
/// The model struct is addressed by byte offset from the host, so the
/// offsets given in `reflect` must come from `std::mem::offset_of!` on the
/// same build.
pub trait Model: Default + Send + 'static {
    /// Type name the host passes to the factory
    const TYPE_NAME: &'static CStr;

    /// Register every class reachable from `TYPE_NAME`. The root class must
    /// carry the model's `in`, `out`, `data` and `params` sections.
    fn reflect(reflector: &mut Reflector);

    fn config(&mut self) -> ConfigStatus;

    /// Channels requested here stay open for the model's lifetime
    fn init(&mut self, channels: &mut Channels<'_>) -> RuntimeStatus;
    fn step(&mut self) -> RuntimeStatus;

    fn pause(&mut self) -> RuntimeStatus {
        RuntimeStatus::Ok
    }

    fn stop(&mut self) -> RuntimeStatus {
        RuntimeStatus::Ok
    }
}

/// Static list of C strings placed in the manifest
pub struct CStrSlice(pub &'static [*const c_char]);

// Safety: the pointers refer to immutable 'static string literals
unsafe impl Sync for CStrSlice {}

/// Macro to export the necessary C-ABI symbols for an RSIS plugin.
///
/// ```ignore
/// rsis_model_helper::export_models! {
///     name: "height_sensor",
///     version: "0.1.0",
///     description: "Range-checked height sensor",
///     models: [HeightSensor],
/// }
/// ```
#[macro_export]
macro_rules! export_models {
    (
        name: $name:literal,
        version: $version:literal,
        description: $description:literal,
        models: [$($model:ty),+ $(,)?] $(,)?
    ) => {
        static RSIS_MODEL_NAMES: $crate::CStrSlice = $crate::CStrSlice(&[
            $(<$model as $crate::Model>::TYPE_NAME.as_ptr()),+
        ]);

        // --- MANIFEST ---
        #[no_mangle]
        pub unsafe extern "C" fn rsis_plugin_manifest() -> $crate::PluginManifest {
            $crate::PluginManifest {
                abi_version: $crate::ABI_VERSION,
                name: concat!($name, "\0").as_ptr() as *const std::os::raw::c_char,
                version: concat!($version, "\0").as_ptr() as *const std::os::raw::c_char,
                description: concat!($description, "\0").as_ptr() as *const std::os::raw::c_char,
                models: RSIS_MODEL_NAMES.0.as_ptr(),
                models_len: RSIS_MODEL_NAMES.0.len(),
            }
        }

        // --- CREATE ---
        #[no_mangle]
        pub unsafe extern "C" fn rsis_plugin_create(
            type_name: *const std::os::raw::c_char,
        ) -> *mut std::os::raw::c_void {
            if type_name.is_null() {
                return std::ptr::null_mut();
            }
            let requested = std::ffi::CStr::from_ptr(type_name);
            $(
                if requested == <$model as $crate::Model>::TYPE_NAME {
                    return $crate::create_instance::<$model>();
                }
            )+
            std::ptr::null_mut()
        }

        // --- VTABLE ---
        #[no_mangle]
        pub unsafe extern "C" fn rsis_plugin_get_vtable() -> *const $crate::ModelVTable {
            &$crate::VTABLE as *const _
        }

        // --- REFLECT ---
        #[no_mangle]
        pub unsafe extern "C" fn rsis_plugin_reflect(callbacks: *const $crate::ReflectCallbacks) {
            if callbacks.is_null() {
                return;
            }
            $(
                $crate::emit_reflection::<$model>(&*callbacks);
            )+
        }

        /// Entry points for hosts that link this plugin statically
        pub fn rsis_entry_points() -> $crate::PluginEntryPoints {
            $crate::PluginEntryPoints {
                manifest: rsis_plugin_manifest,
                create: rsis_plugin_create,
                vtable: rsis_plugin_get_vtable,
                reflect: rsis_plugin_reflect,
            }
        }
    };
}
