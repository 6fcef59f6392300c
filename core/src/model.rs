use rsis_model_abi::{
    BufferStruct, ConfigStatus, HostChannels, ModelVTable, MsgStatus, RuntimeStatus,
};
use std::os::raw::c_void;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{Result, RsisError};
use crate::library::LibraryHandle;

struct RawModel(*mut c_void);

// Safety: every access to the instance pointer goes through the mutex
unsafe impl Send for RawModel {}

/// A live plugin model instance.
///
/// Calls are serialized by a per-instance mutex, so host reads and writes
/// never interleave with `step()`. The owning library is only observed; every
/// call upgrades it for its own duration and fails once it is gone.
pub struct ModelInstance {
    name: String,
    model_type: String,
    library_name: String,
    library: Weak<LibraryHandle>,
    vtable: ModelVTable,
    raw: Mutex<RawModel>,
}

unsafe extern "C" fn grow_vec(ctx: *mut c_void, size: usize) -> *mut u8 {
    let buf = &mut *(ctx as *mut Vec<u8>);
    buf.resize(size, 0);
    buf.as_mut_ptr()
}

impl ModelInstance {
    /// Instantiate `model_type` through the library's factory
    pub fn create(library: &Arc<LibraryHandle>, model_type: &str, name: &str) -> Result<Self> {
        let raw = library.create_raw(model_type);
        if raw.is_null() {
            return Err(RsisError::NullModel(model_type.to_string()));
        }
        log::debug!("Created model '{}' of type {}", name, model_type);
        Ok(Self {
            name: name.to_string(),
            model_type: model_type.to_string(),
            library_name: library.name().to_string(),
            library: Arc::downgrade(library),
            vtable: *library.vtable(),
            raw: Mutex::new(RawModel(raw)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    fn lock(&self) -> MutexGuard<'_, RawModel> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<T>(&self, f: impl FnOnce(&ModelVTable, *mut c_void) -> T) -> Result<T> {
        let _library = self
            .library
            .upgrade()
            .ok_or_else(|| RsisError::LibraryUnloaded(self.library_name.clone()))?;
        let raw = self.lock();
        Ok(f(&self.vtable, raw.0))
    }

    fn runtime(&self, op: &'static str, status: u32) -> Result<()> {
        match RuntimeStatus::from_raw(status) {
            RuntimeStatus::Ok => Ok(()),
            RuntimeStatus::Error => Err(RsisError::ModelFailure {
                model: self.name.clone(),
                op,
            }),
        }
    }

    /// `Ok` carries either `ConfigStatus::Ok` or `ConfigStatus::InterfaceUpdate`
    pub fn config(&self) -> Result<ConfigStatus> {
        let status = self.call(|vt, raw| unsafe { (vt.config)(raw) })?;
        match ConfigStatus::from_raw(status) {
            ConfigStatus::Error => Err(RsisError::ModelFailure {
                model: self.name.clone(),
                op: "config",
            }),
            status => Ok(status),
        }
    }

    /// `channels` is only borrowed for the call
    pub fn init(&self, channels: &HostChannels) -> Result<()> {
        let status = self.call(|vt, raw| unsafe { (vt.init)(raw, channels) })?;
        self.runtime("init", status)
    }

    pub fn step(&self) -> Result<()> {
        let status = self.call(|vt, raw| unsafe { (vt.step)(raw) })?;
        self.runtime("step", status)
    }

    pub fn pause(&self) -> Result<()> {
        let status = self.call(|vt, raw| unsafe { (vt.pause)(raw) })?;
        self.runtime("pause", status)
    }

    pub fn stop(&self) -> Result<()> {
        let status = self.call(|vt, raw| unsafe { (vt.stop)(raw) })?;
        self.runtime("stop", status)
    }

    /// Copy a field out of model memory
    pub fn msg_get(&self, field: &str) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::new();
        let status = self.call(|vt, raw| unsafe {
            (vt.msg_get)(
                raw,
                BufferStruct::from_slice(field.as_bytes()),
                grow_vec,
                &mut buf as *mut Vec<u8> as *mut c_void,
            )
        })?;
        self.msg_status(field, status, buf.len())?;
        Ok(buf)
    }

    /// Overwrite a field. `data` must match the field size exactly.
    pub fn msg_set(&self, field: &str, data: &[u8]) -> Result<()> {
        let status = self.call(|vt, raw| unsafe {
            (vt.msg_set)(
                raw,
                BufferStruct::from_slice(field.as_bytes()),
                BufferStruct::from_slice(data),
            )
        })?;
        if MsgStatus::from_raw(status) == MsgStatus::SizeMismatch {
            let expected = self.msg_get(field).map(|b| b.len()).unwrap_or(0);
            return Err(RsisError::SizeMismatch {
                field: field.to_string(),
                expected,
                actual: data.len(),
            });
        }
        self.msg_status(field, status, data.len())
    }

    /// Raw pointer into model memory. Must not be used past the next step or
    /// after the model is destroyed.
    pub fn get_ptr(&self, field: &str) -> Result<*mut u8> {
        let ptr = self.call(|vt, raw| unsafe {
            (vt.get_ptr)(raw, BufferStruct::from_slice(field.as_bytes()))
        })?;
        if ptr.is_null() {
            return Err(RsisError::UnknownField {
                model: self.name.clone(),
                field: field.to_string(),
            });
        }
        Ok(ptr)
    }

    fn msg_status(&self, field: &str, status: u32, actual: usize) -> Result<()> {
        match MsgStatus::from_raw(status) {
            MsgStatus::Ok => Ok(()),
            MsgStatus::SizeMismatch => Err(RsisError::SizeMismatch {
                field: field.to_string(),
                expected: 0,
                actual,
            }),
            MsgStatus::UnknownField | MsgStatus::BadId => Err(RsisError::UnknownField {
                model: self.name.clone(),
                field: field.to_string(),
            }),
            MsgStatus::InvalidValue => Err(RsisError::InvalidValue {
                model: self.name.clone(),
                field: field.to_string(),
            }),
            MsgStatus::Error => Err(RsisError::ModelFailure {
                model: self.name.clone(),
                op: "message",
            }),
        }
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.name)
            .field("model_type", &self.model_type)
            .field("library", &self.library_name)
            .finish()
    }
}

impl Drop for ModelInstance {
    fn drop(&mut self) {
        let raw = self.raw.get_mut().unwrap_or_else(PoisonError::into_inner);
        match self.library.upgrade() {
            Some(_library) => {
                log::debug!("Destroying model '{}'", self.name);
                unsafe { (self.vtable.destroy)(raw.0) };
            }
            None => log::warn!(
                "Library '{}' gone before model '{}', instance leaked",
                self.library_name,
                self.name
            ),
        }
        raw.0 = std::ptr::null_mut();
    }
}
