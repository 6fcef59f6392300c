//! C control surface over one process-wide framework.
//!
//! Every entry point fails (ERR, false, `NoState`, -1 or null) while no
//! framework is alive. Strings returned to the caller stay valid until the
//! next string-returning call on the same thread.

use rsis_model_abi::{BufferStruct, CmdStatus, ConfigStatus, MsgStatus, SizeCallback};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::Config;
use crate::error::{Result, RsisError};
use crate::framework::{Framework, FrameworkConfig, FrameworkState};
use crate::scenario;
use crate::scheduler;

static FRAMEWORK: Mutex<Option<Arc<Framework>>> = Mutex::new(None);

thread_local! {
    static RETURNED: RefCell<CString> = RefCell::new(CString::default());
}

/// Simulated time as seen across the C boundary
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RsisTime {
    pub step: i64,
    pub epoch: i64,
    pub time: f64,
}

fn current() -> Option<Arc<Framework>> {
    FRAMEWORK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .filter(|fw| fw.is_alive())
        .cloned()
}

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        log::error!("Panic caught at the control boundary");
        fallback
    })
}

fn status(result: Result<()>) -> u32 {
    match result {
        Ok(()) => CmdStatus::Ok as u32,
        Err(e) => {
            log::debug!("Control call failed: {}", e);
            CmdStatus::Err as u32
        }
    }
}

/// Run `f` against the live framework, ERR when there is none
fn command(f: impl FnOnce(&Framework) -> Result<()>) -> u32 {
    guarded(CmdStatus::Err as u32, || match current() {
        Some(fw) => status(f(&fw)),
        None => CmdStatus::Err as u32,
    })
}

unsafe fn arg<'a>(ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(RsisError::InvalidArgument("null string".to_string()));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| RsisError::InvalidArgument("string is not UTF-8".to_string()))
}

fn hand_out(text: &str) -> *const c_char {
    let owned = CString::new(text.replace('\0', " ")).unwrap_or_default();
    RETURNED.with(|slot| {
        *slot.borrow_mut() = owned;
        slot.borrow().as_ptr()
    })
}

fn install(framework: Framework) -> u32 {
    let mut slot = FRAMEWORK.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|fw| fw.is_alive()) {
        log::warn!("Framework already initialized");
        return CmdStatus::Err as u32;
    }
    *slot = Some(Arc::new(framework));
    CmdStatus::Ok as u32
}

fn build_from_config(path: &Path) -> anyhow::Result<Framework> {
    let config = Config::load(path)?;
    let framework = Framework::new(config.framework_config())?;
    scenario::apply(&config, &framework)?;
    Ok(framework)
}

// --- LIFECYCLE ---

#[no_mangle]
pub extern "C" fn rsis_framework_initialize() -> u32 {
    guarded(CmdStatus::Err as u32, || {
        if current().is_some() {
            log::warn!("Framework already initialized");
            return CmdStatus::Err as u32;
        }
        match Framework::new(FrameworkConfig::default()) {
            Ok(fw) => install(fw),
            Err(e) => {
                log::error!("Failed to create framework: {}", e);
                CmdStatus::Err as u32
            }
        }
    })
}

/// # Safety
///
/// `path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_initialize_with_config(path: *const c_char) -> u32 {
    guarded(CmdStatus::Err as u32, || {
        if current().is_some() {
            log::warn!("Framework already initialized");
            return CmdStatus::Err as u32;
        }
        let path = match arg(path) {
            Ok(p) => p,
            Err(e) => return status(Err(e)),
        };
        match build_from_config(Path::new(path)) {
            Ok(fw) => install(fw),
            Err(e) => {
                log::error!("Failed to set up framework: {:#}", e);
                CmdStatus::Err as u32
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn rsis_framework_shutdown() -> u32 {
    guarded(CmdStatus::Err as u32, || {
        let taken = FRAMEWORK.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some(fw) if fw.is_alive() => {
                fw.shutdown();
                CmdStatus::Ok as u32
            }
            _ => CmdStatus::Err as u32,
        }
    })
}

#[no_mangle]
pub extern "C" fn rsis_framework_is_alive() -> bool {
    guarded(false, || current().is_some())
}

#[no_mangle]
pub extern "C" fn rsis_framework_get_state() -> u32 {
    guarded(FrameworkState::NoState as u32, || {
        current().map_or(FrameworkState::NoState, |fw| fw.state()) as u32
    })
}

#[no_mangle]
pub extern "C" fn rsis_framework_init_scheduler(block: bool) -> u32 {
    command(|fw| fw.init_scheduler(block))
}

#[no_mangle]
pub extern "C" fn rsis_framework_run_scheduler(block: bool) -> u32 {
    command(|fw| fw.run_scheduler(block))
}

#[no_mangle]
pub extern "C" fn rsis_framework_step_scheduler(steps: u64, block: bool) -> u32 {
    command(|fw| fw.step_scheduler(steps, block))
}

#[no_mangle]
pub extern "C" fn rsis_framework_pause_scheduler(block: bool) -> u32 {
    command(|fw| fw.pause_scheduler(block))
}

#[no_mangle]
pub extern "C" fn rsis_framework_end_scheduler(block: bool) -> u32 {
    command(|fw| fw.end_scheduler(block))
}

// --- LIBRARIES & MODELS ---

/// # Safety
///
/// `name` must be a valid NUL-terminated string. Loads native code.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_load_library(name: *const c_char) -> u32 {
    command(|fw| fw.load_library(arg(name)?))
}

/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_unload_library(name: *const c_char) -> u32 {
    command(|fw| fw.unload_library(arg(name)?))
}

/// # Safety
///
/// All arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_create_model(
    library: *const c_char,
    model_type: *const c_char,
    name: *const c_char,
) -> u32 {
    command(|fw| fw.create_model(arg(library)?, arg(model_type)?, arg(name)?))
}

/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_destroy_model(name: *const c_char) -> u32 {
    command(|fw| fw.destroy_model(arg(name)?))
}

/// Unschedule and destroy a model
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_remove_model(name: *const c_char) -> u32 {
    command(|fw| fw.remove_model(arg(name)?))
}

/// Returns a `ConfigStatus` code
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_config_model(name: *const c_char) -> u32 {
    guarded(ConfigStatus::Error as u32, || {
        let Some(fw) = current() else {
            return ConfigStatus::Error as u32;
        };
        match arg(name).and_then(|name| fw.config_model(name)) {
            Ok(status) => status as u32,
            Err(e) => {
                log::debug!("Config failed: {}", e);
                ConfigStatus::Error as u32
            }
        }
    })
}

// --- THREADS ---

/// Replace the scheduler; only id 0 (non real-time) exists. Drops every
/// thread.
#[no_mangle]
pub extern "C" fn rsis_framework_set_scheduler(id: u32) -> u32 {
    command(|fw| {
        let config = fw.config();
        let replacement = scheduler::by_id(id, config.frequency, config.epoch_duration)?;
        fw.set_scheduler(replacement)
    })
}

/// Returns the new thread index, or -1
#[no_mangle]
pub extern "C" fn rsis_framework_new_thread(frequency: f64) -> i64 {
    guarded(-1, || match current().map(|fw| fw.new_thread(frequency)) {
        Some(Ok(index)) => index as i64,
        _ => -1,
    })
}

#[no_mangle]
pub extern "C" fn rsis_framework_clear_threads() -> u32 {
    command(|fw| fw.clear_threads())
}

/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_schedule_model(
    name: *const c_char,
    thread: u32,
    frequency: f64,
    frame_offset: u64,
) -> u32 {
    command(|fw| fw.schedule_model(arg(name)?, thread as usize, frequency, frame_offset))
}

/// Number of thread handlers, or -1
#[no_mangle]
pub extern "C" fn rsis_framework_get_thread_count() -> i64 {
    guarded(-1, || match current().map(|fw| fw.thread_count()) {
        Some(Ok(count)) => count as i64,
        _ => -1,
    })
}

/// Copy `src_model.src_field` into `dst_model.dst_field` from `thread`
///
/// # Safety
///
/// Every string must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_connect(
    src_model: *const c_char,
    src_field: *const c_char,
    dst_model: *const c_char,
    dst_field: *const c_char,
    thread: u32,
    frequency: f64,
    frame_offset: u64,
) -> u32 {
    command(|fw| {
        fw.connect(
            arg(src_model)?,
            arg(src_field)?,
            arg(dst_model)?,
            arg(dst_field)?,
            thread as usize,
            frequency,
            frame_offset,
        )
    })
}

// --- QUERIES ---

/// # Safety
///
/// `out` must point to writable memory for one `RsisTime`.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_get_time(out: *mut RsisTime) -> u32 {
    if out.is_null() {
        return CmdStatus::Err as u32;
    }
    command(|fw| {
        let t = fw.time();
        *out = RsisTime {
            step: t.step,
            epoch: t.epoch,
            time: t.time,
        };
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn rsis_framework_get_message() -> *const c_char {
    guarded(std::ptr::null(), || match current() {
        Some(fw) => hand_out(&fw.message()),
        None => std::ptr::null(),
    })
}

#[no_mangle]
pub extern "C" fn rsis_framework_get_scheduler_name() -> *const c_char {
    guarded(std::ptr::null(), || match current() {
        Some(fw) => hand_out(&fw.scheduler_name()),
        None => std::ptr::null(),
    })
}

/// Schema of a model's type as JSON, null on failure
///
/// # Safety
///
/// `model` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_get_schema(model: *const c_char) -> *const c_char {
    guarded(std::ptr::null(), || {
        let Some(fw) = current() else {
            return std::ptr::null();
        };
        match arg(model).and_then(|m| fw.schema_json(m)) {
            Ok(json) => hand_out(&json),
            Err(_) => std::ptr::null(),
        }
    })
}

// --- BUFFER PROTOCOL ---

fn msg_status(err: &RsisError) -> MsgStatus {
    match err {
        RsisError::SizeMismatch { .. } => MsgStatus::SizeMismatch,
        RsisError::UnknownField { .. } | RsisError::UnknownModel(_) => MsgStatus::UnknownField,
        RsisError::InvalidArgument(_) => MsgStatus::BadId,
        RsisError::InvalidValue { .. } => MsgStatus::InvalidValue,
        _ => MsgStatus::Error,
    }
}

/// Copy a model field out through `cb`. Returns a `MsgStatus` code.
///
/// # Safety
///
/// `model` and `field` must be valid NUL-terminated strings, and `cb` must
/// return a buffer of at least the requested size or null.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_msg_get(
    model: *const c_char,
    field: *const c_char,
    cb: SizeCallback,
    ctx: *mut c_void,
) -> u32 {
    guarded(MsgStatus::Error as u32, || {
        let Some(fw) = current() else {
            return MsgStatus::Error as u32;
        };
        let bytes = match arg(model).and_then(|m| fw.msg_get(m, arg(field)?)) {
            Ok(bytes) => bytes,
            Err(e) => return msg_status(&e) as u32,
        };
        let dst = cb(ctx, bytes.len());
        if dst.is_null() {
            return MsgStatus::BadId as u32;
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        MsgStatus::Ok as u32
    })
}

/// Overwrite a model field. Returns a `MsgStatus` code.
///
/// # Safety
///
/// `model` and `field` must be valid NUL-terminated strings and `data` must
/// describe readable memory.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_msg_set(
    model: *const c_char,
    field: *const c_char,
    data: BufferStruct,
) -> u32 {
    guarded(MsgStatus::Error as u32, || {
        let Some(fw) = current() else {
            return MsgStatus::Error as u32;
        };
        match arg(model).and_then(|m| fw.msg_set(m, arg(field)?, data.as_slice())) {
            Ok(()) => MsgStatus::Ok as u32,
            Err(e) => msg_status(&e) as u32,
        }
    })
}

/// Pointer into live model memory, null on failure. Invalid after the next
/// step or once the model is destroyed.
///
/// # Safety
///
/// `model` and `field` must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn rsis_framework_get_ptr(model: *const c_char, field: *const c_char) -> *mut u8 {
    guarded(std::ptr::null_mut(), || {
        let Some(fw) = current() else {
            return std::ptr::null_mut();
        };
        arg(model)
            .and_then(|m| fw.get_ptr(m, arg(field)?))
            .unwrap_or(std::ptr::null_mut())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test drives the process-wide slot so parallel tests cannot race on it
    #[test]
    fn test_lifecycle_through_c_surface() {
        assert!(!rsis_framework_is_alive());
        assert_eq!(rsis_framework_get_state(), FrameworkState::NoState as u32);
        assert_eq!(rsis_framework_init_scheduler(true), CmdStatus::Err as u32);
        assert!(rsis_framework_get_message().is_null());

        assert_eq!(rsis_framework_initialize(), CmdStatus::Ok as u32);
        assert_eq!(rsis_framework_initialize(), CmdStatus::Err as u32);
        assert!(rsis_framework_is_alive());
        assert_eq!(rsis_framework_get_state(), FrameworkState::Config as u32);

        let name = unsafe { CStr::from_ptr(rsis_framework_get_scheduler_name()) };
        assert_eq!(name.to_str().unwrap(), "Non Real-Time Scheduler.");

        assert_eq!(rsis_framework_new_thread(1.0), 0);
        assert_eq!(rsis_framework_set_scheduler(7), CmdStatus::Err as u32);
        assert_eq!(rsis_framework_get_thread_count(), 1);
        assert_eq!(rsis_framework_set_scheduler(0), CmdStatus::Ok as u32);
        assert_eq!(rsis_framework_get_thread_count(), 0);

        assert_eq!(rsis_framework_new_thread(1.0), 0);
        assert_eq!(rsis_framework_new_thread(-1.0), -1);
        assert_eq!(rsis_framework_get_thread_count(), 1);
        assert_eq!(rsis_framework_init_scheduler(true), CmdStatus::Ok as u32);
        assert_eq!(rsis_framework_step_scheduler(3, true), CmdStatus::Ok as u32);

        let mut time = RsisTime::default();
        assert_eq!(unsafe { rsis_framework_get_time(&mut time) }, CmdStatus::Ok as u32);
        assert_eq!(time.step, 3);

        let missing = c"ghost";
        assert_eq!(
            unsafe { rsis_framework_destroy_model(missing.as_ptr()) },
            CmdStatus::Err as u32
        );
        assert_eq!(
            unsafe { rsis_framework_remove_model(missing.as_ptr()) },
            CmdStatus::Err as u32
        );
        let message = unsafe { CStr::from_ptr(rsis_framework_get_message()) };
        assert!(message.to_str().unwrap().contains("ghost"));

        assert_eq!(rsis_framework_shutdown(), CmdStatus::Ok as u32);
        assert!(!rsis_framework_is_alive());
        assert_eq!(rsis_framework_shutdown(), CmdStatus::Err as u32);
        assert_eq!(rsis_framework_new_thread(1.0), -1);
        assert_eq!(rsis_framework_get_thread_count(), -1);
        assert!(unsafe { rsis_framework_get_ptr(missing.as_ptr(), missing.as_ptr()) }.is_null());
    }
}
