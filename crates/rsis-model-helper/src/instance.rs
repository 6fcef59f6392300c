use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rsis_model_abi::{
    BufferStruct, ConfigStatus, FieldDescriptorAbi, HostChannels, ModelVTable, MsgStatus,
    ReflectCallbacks, RuntimeStatus, SizeCallback,
};

use crate::{Channels, Model, Reflector};

/// Byte ranges of every addressable field, keyed by dotted path.
///
/// Holds the leaves of the flattened root class plus the root's own
/// sections (`in`, `out`, ...) so whole sections can be copied at once.
#[derive(Debug, Clone, Default)]
pub struct FieldTable {
    fields: HashMap<String, (usize, usize)>,
    /// Offsets of every bool byte in the model, sorted
    bools: Vec<usize>,
}

impl FieldTable {
    pub fn for_model<M: Model>() -> Self {
        let mut reflector = Reflector::new();
        M::reflect(&mut reflector);

        let root = M::TYPE_NAME.to_string_lossy();
        let registry = reflector.registry();
        let mut fields = HashMap::new();
        let mut bools = Vec::new();

        if let Some(class) = registry.class(&root) {
            for f in &class.fields {
                fields.insert(f.name.clone(), (f.offset, f.size));
            }
        }
        if let Ok(leaves) = registry.flatten(&root) {
            for leaf in leaves {
                if leaf.type_name == "bool" {
                    bools.extend(leaf.offset..leaf.offset + leaf.size);
                }
                fields.insert(leaf.path, (leaf.offset, leaf.size));
            }
        }

        // Anything past the end of the struct is a broken reflection
        let limit = std::mem::size_of::<M>();
        fields.retain(|_, (offset, size)| offset.saturating_add(*size) <= limit);
        bools.retain(|b| *b < limit);
        bools.sort_unstable();
        bools.dedup();

        Self { fields, bools }
    }

    pub fn get(&self, path: &str) -> Option<(usize, usize)> {
        self.fields.get(path).copied()
    }

    /// Whether `data` written at `offset` leaves every bool at 0 or 1
    pub fn accepts(&self, offset: usize, data: &[u8]) -> bool {
        let start = self.bools.partition_point(|b| *b < offset);
        self.bools[start..]
            .iter()
            .take_while(|b| **b < offset + data.len())
            .all(|b| data[b - offset] <= 1)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Object-safe view of a model instance, so one vtable serves every type
trait ErasedModel {
    fn config(&mut self) -> ConfigStatus;
    fn init(&mut self, host: Option<&HostChannels>) -> RuntimeStatus;
    fn step(&mut self) -> RuntimeStatus;
    fn pause(&mut self) -> RuntimeStatus;
    fn stop(&mut self) -> RuntimeStatus;
    fn msg_get(&self, id: &[u8], cb: SizeCallback, ctx: *mut c_void) -> MsgStatus;
    fn msg_set(&mut self, id: &[u8], data: &[u8]) -> MsgStatus;
    fn get_ptr(&mut self, id: &[u8]) -> *mut u8;
}

struct Instance<M: Model> {
    model: M,
    fields: FieldTable,
}

impl<M: Model> Instance<M> {
    fn lookup(&self, id: &[u8]) -> Result<(usize, usize), MsgStatus> {
        let path = std::str::from_utf8(id).map_err(|_| MsgStatus::BadId)?;
        self.fields.get(path).ok_or(MsgStatus::UnknownField)
    }
}

impl<M: Model> ErasedModel for Instance<M> {
    fn config(&mut self) -> ConfigStatus {
        self.model.config()
    }

    fn init(&mut self, host: Option<&HostChannels>) -> RuntimeStatus {
        self.model.init(&mut Channels::new(host))
    }

    fn step(&mut self) -> RuntimeStatus {
        self.model.step()
    }

    fn pause(&mut self) -> RuntimeStatus {
        self.model.pause()
    }

    fn stop(&mut self) -> RuntimeStatus {
        self.model.stop()
    }

    fn msg_get(&self, id: &[u8], cb: SizeCallback, ctx: *mut c_void) -> MsgStatus {
        let (offset, size) = match self.lookup(id) {
            Ok(range) => range,
            Err(status) => return status,
        };
        unsafe {
            let dst = cb(ctx, size);
            if dst.is_null() {
                return MsgStatus::BadId;
            }
            let base = &self.model as *const M as *const u8;
            std::ptr::copy_nonoverlapping(base.add(offset), dst, size);
        }
        MsgStatus::Ok
    }

    fn msg_set(&mut self, id: &[u8], data: &[u8]) -> MsgStatus {
        let (offset, size) = match self.lookup(id) {
            Ok(range) => range,
            Err(status) => return status,
        };
        if data.len() != size {
            return MsgStatus::SizeMismatch;
        }
        if !self.fields.accepts(offset, data) {
            return MsgStatus::InvalidValue;
        }
        unsafe {
            let base = &mut self.model as *mut M as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), size);
        }
        MsgStatus::Ok
    }

    fn get_ptr(&mut self, id: &[u8]) -> *mut u8 {
        match self.lookup(id) {
            Ok((offset, _)) => unsafe { (&mut self.model as *mut M as *mut u8).add(offset) },
            Err(_) => std::ptr::null_mut(),
        }
    }
}

type Erased = Box<dyn ErasedModel>;

/// Allocate a model behind the shared vtable.
///
/// Trait objects are fat pointers, so the instance is double boxed to hand a
/// thin pointer across the boundary.
pub fn create_instance<M: Model>() -> *mut c_void {
    let instance: Erased = Box::new(Instance {
        model: M::default(),
        fields: FieldTable::for_model::<M>(),
    });
    Box::into_raw(Box::new(instance)) as *mut c_void
}

/// Push the reflection of `M` through host callbacks
///
/// # Safety
///
/// The callbacks must be valid for the duration of the call.
pub unsafe fn emit_reflection<M: Model>(callbacks: &ReflectCallbacks) {
    let mut reflector = Reflector::new();
    M::reflect(&mut reflector);

    for class in reflector.registry().classes() {
        let Ok(class_name) = CString::new(class.name.as_str()) else {
            continue;
        };
        (callbacks.register_class)(callbacks.ctx, class_name.as_ptr());

        for f in &class.fields {
            let (Ok(name), Ok(type_name), Ok(units), Ok(description)) = (
                CString::new(f.name.as_str()),
                CString::new(f.type_name.as_str()),
                CString::new(f.units.as_str()),
                CString::new(f.description.as_str()),
            ) else {
                continue;
            };
            let descriptor = FieldDescriptorAbi {
                owner: class_name.as_ptr(),
                name: name.as_ptr(),
                type_name: type_name.as_ptr(),
                dims: f.dims.as_ptr(),
                dims_len: f.dims.len(),
                offset: f.offset,
                size: f.size,
                units: units.as_ptr(),
                description: description.as_ptr(),
            };
            (callbacks.register_field)(callbacks.ctx, &descriptor);
        }
    }
}

// --- TRAMPOLINES ---

unsafe fn erased<'a>(instance: *mut c_void) -> Option<&'a mut Erased> {
    (instance as *mut Erased).as_mut()
}

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(fallback)
}

unsafe extern "C" fn model_config(instance: *mut c_void) -> u32 {
    guarded(ConfigStatus::Error as u32, || match erased(instance) {
        Some(model) => model.config() as u32,
        None => ConfigStatus::Error as u32,
    })
}

macro_rules! runtime_trampoline {
    ($fn_name:ident, $method:ident) => {
        unsafe extern "C" fn $fn_name(instance: *mut c_void) -> u32 {
            guarded(RuntimeStatus::Error as u32, || match erased(instance) {
                Some(model) => model.$method() as u32,
                None => RuntimeStatus::Error as u32,
            })
        }
    };
}

unsafe extern "C" fn model_init(instance: *mut c_void, host: *const HostChannels) -> u32 {
    guarded(RuntimeStatus::Error as u32, || match erased(instance) {
        Some(model) => model.init(host.as_ref()) as u32,
        None => RuntimeStatus::Error as u32,
    })
}

runtime_trampoline!(model_step, step);
runtime_trampoline!(model_pause, pause);
runtime_trampoline!(model_stop, stop);

unsafe extern "C" fn model_msg_get(
    instance: *mut c_void,
    id: BufferStruct,
    cb: SizeCallback,
    ctx: *mut c_void,
) -> u32 {
    guarded(MsgStatus::Error as u32, || match erased(instance) {
        Some(model) => model.msg_get(id.as_slice(), cb, ctx) as u32,
        None => MsgStatus::Error as u32,
    })
}

unsafe extern "C" fn model_msg_set(instance: *mut c_void, id: BufferStruct, data: BufferStruct) -> u32 {
    guarded(MsgStatus::Error as u32, || match erased(instance) {
        Some(model) => model.msg_set(id.as_slice(), data.as_slice()) as u32,
        None => MsgStatus::Error as u32,
    })
}

unsafe extern "C" fn model_get_ptr(instance: *mut c_void, id: BufferStruct) -> *mut u8 {
    guarded(std::ptr::null_mut(), || match erased(instance) {
        Some(model) => model.get_ptr(id.as_slice()),
        None => std::ptr::null_mut(),
    })
}

unsafe extern "C" fn model_destroy(instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        drop(Box::from_raw(instance as *mut Erased));
    }));
}

/// VTable shared by every model type exported through `export_models!`
pub static VTABLE: ModelVTable = ModelVTable {
    config: model_config,
    init: model_init,
    step: model_step,
    pause: model_pause,
    stop: model_stop,
    msg_get: model_msg_get,
    msg_set: model_msg_set,
    get_ptr: model_get_ptr,
    destroy: model_destroy,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field;
    use rsis_model_abi::layout::FieldDef;
    use std::ffi::CStr;
    use std::mem::offset_of;

    #[derive(Default)]
    #[repr(C)]
    struct CounterIn {
        gain: f64,
    }

    #[derive(Default)]
    #[repr(C)]
    struct Counter {
        input: CounterIn,
        count: u32,
        fail: bool,
    }

    impl crate::Model for Counter {
        const TYPE_NAME: &'static CStr = c"counter";

        fn reflect(r: &mut Reflector) {
            r.class("counter_in")
                .field("counter_in", field::<f64>("gain", offset_of!(CounterIn, gain)));
            r.class("counter")
                .field("counter", FieldDef::new("in", "counter_in", vec![], offset_of!(Counter, input), 8))
                .field("counter", field::<u32>("count", offset_of!(Counter, count)))
                .field("counter", field::<bool>("fail", offset_of!(Counter, fail)));
        }

        fn config(&mut self) -> ConfigStatus {
            ConfigStatus::Ok
        }

        fn init(&mut self, _channels: &mut Channels<'_>) -> RuntimeStatus {
            RuntimeStatus::Ok
        }

        fn step(&mut self) -> RuntimeStatus {
            if self.fail {
                panic!("asked to fail");
            }
            self.count += 1;
            RuntimeStatus::Ok
        }
    }

    unsafe extern "C" fn grow(ctx: *mut c_void, size: usize) -> *mut u8 {
        let buf = &mut *(ctx as *mut Vec<u8>);
        buf.resize(size, 0);
        buf.as_mut_ptr()
    }

    fn id(path: &str) -> BufferStruct {
        BufferStruct::from_slice(path.as_bytes())
    }

    #[test]
    fn test_field_table_includes_sections_and_leaves() {
        let table = FieldTable::for_model::<Counter>();
        assert_eq!(table.get("in"), Some((offset_of!(Counter, input), 8)));
        assert!(table.get("in.gain").is_some());
        assert_eq!(table.get("count"), Some((offset_of!(Counter, count), 4)));
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn test_step_and_read_through_vtable() {
        let ptr = create_instance::<Counter>();
        unsafe {
            assert_eq!((VTABLE.step)(ptr), RuntimeStatus::Ok as u32);
            assert_eq!((VTABLE.step)(ptr), RuntimeStatus::Ok as u32);

            let mut out: Vec<u8> = Vec::new();
            let status = (VTABLE.msg_get)(ptr, id("count"), grow, &mut out as *mut Vec<u8> as *mut c_void);
            assert_eq!(status, MsgStatus::Ok as u32);
            assert_eq!(out, 2u32.to_ne_bytes().to_vec());

            (VTABLE.destroy)(ptr);
        }
    }

    #[test]
    fn test_msg_set_checks_size_and_name() {
        let ptr = create_instance::<Counter>();
        unsafe {
            let gain = 2.5f64.to_ne_bytes();
            let ok = (VTABLE.msg_set)(ptr, id("in.gain"), BufferStruct::from_slice(&gain));
            assert_eq!(ok, MsgStatus::Ok as u32);

            let short = (VTABLE.msg_set)(ptr, id("in.gain"), BufferStruct::from_slice(&gain[..4]));
            assert_eq!(short, MsgStatus::SizeMismatch as u32);

            let unknown = (VTABLE.msg_set)(ptr, id("in.loss"), BufferStruct::from_slice(&gain));
            assert_eq!(unknown, MsgStatus::UnknownField as u32);

            let p = (VTABLE.get_ptr)(ptr, id("in.gain")) as *const f64;
            assert_eq!(p.read_unaligned(), 2.5);

            (VTABLE.destroy)(ptr);
        }
    }

    #[test]
    fn test_panicking_step_reports_error() {
        let ptr = create_instance::<Counter>();
        unsafe {
            let yes = [1u8];
            (VTABLE.msg_set)(ptr, id("fail"), BufferStruct::from_slice(&yes));
            assert_eq!((VTABLE.step)(ptr), RuntimeStatus::Error as u32);
            (VTABLE.destroy)(ptr);
        }
    }

    #[test]
    fn test_msg_set_rejects_invalid_bool() {
        let ptr = create_instance::<Counter>();
        unsafe {
            let two = [2u8];
            let status = (VTABLE.msg_set)(ptr, id("fail"), BufferStruct::from_slice(&two));
            assert_eq!(status, MsgStatus::InvalidValue as u32);

            let mut out: Vec<u8> = Vec::new();
            (VTABLE.msg_get)(ptr, id("fail"), grow, &mut out as *mut Vec<u8> as *mut c_void);
            assert_eq!(out, vec![0]);

            let one = [1u8];
            let status = (VTABLE.msg_set)(ptr, id("fail"), BufferStruct::from_slice(&one));
            assert_eq!(status, MsgStatus::Ok as u32);
            (VTABLE.destroy)(ptr);
        }
    }

    #[test]
    fn test_accepts_checks_bool_bytes_inside_the_write() {
        let table = FieldTable::for_model::<Counter>();
        let fail = offset_of!(Counter, fail);
        let count = offset_of!(Counter, count);
        assert!(table.accepts(fail, &[1]));
        assert!(!table.accepts(fail, &[7]));
        // Writes that do not cover the bool are not constrained
        assert!(table.accepts(count, &[0xff; 4]));

        let mut whole = vec![0xffu8; std::mem::size_of::<Counter>()];
        assert!(!table.accepts(0, &whole));
        whole[fail] = 0;
        assert!(table.accepts(0, &whole));
    }

    #[test]
    fn test_null_instance_is_rejected() {
        unsafe {
            assert_eq!(
                (VTABLE.init)(std::ptr::null_mut(), std::ptr::null()),
                RuntimeStatus::Error as u32
            );
            assert!((VTABLE.get_ptr)(std::ptr::null_mut(), id("count")).is_null());
        }
    }
}
