use rsis_model_abi::layout::{ClassRegistry, FieldDef, FieldLayout};
use rsis_model_abi::{ConfigStatus, FieldDescriptorAbi, ReflectCallbacks};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use crate::error::{Result, RsisError};
use crate::library::{LibraryHandle, LibraryManager};
use crate::model::ModelInstance;

/// One addressable field of a model type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldInfo {
    pub path: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub dims: Vec<u32>,
    pub offset: usize,
    pub size: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub units: String,
}

impl From<FieldLayout> for FieldInfo {
    fn from(layout: FieldLayout) -> Self {
        Self {
            path: layout.path,
            type_name: layout.type_name,
            dims: layout.dims,
            offset: layout.offset,
            size: layout.size,
            units: layout.units,
        }
    }
}

/// Published schema of a model type
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelReflection {
    pub model_type: String,
    pub library: String,
    pub inputs: Vec<FieldInfo>,
    pub outputs: Vec<FieldInfo>,
    pub data: Vec<FieldInfo>,
    pub params: Vec<FieldInfo>,
    /// Top-level members of the model struct, addressable as a whole
    pub sections: Vec<FieldInfo>,
}

impl ModelReflection {
    fn build(model_type: &str, library: &str, registry: &ClassRegistry) -> Result<Self> {
        let mut reflection = Self {
            model_type: model_type.to_string(),
            library: library.to_string(),
            ..Self::default()
        };
        let Some(root) = registry.class(model_type) else {
            log::warn!("Model type {} from '{}' did not reflect its class", model_type, library);
            return Ok(reflection);
        };
        reflection.sections = root
            .fields
            .iter()
            .map(|f| FieldInfo {
                path: f.name.clone(),
                type_name: f.type_name.clone(),
                dims: f.dims.clone(),
                offset: f.offset,
                size: f.size,
                units: f.units.clone(),
            })
            .collect();

        let leaves = registry
            .flatten(model_type)
            .map_err(|e| RsisError::InvalidArgument(format!("{}: {}", model_type, e)))?;
        for leaf in leaves {
            let info = FieldInfo::from(leaf);
            let section = info.path.split('.').next().unwrap_or_default().to_string();
            match section.as_str() {
                "in" => reflection.inputs.push(info),
                "out" => reflection.outputs.push(info),
                "data" => reflection.data.push(info),
                "params" => reflection.params.push(info),
                _ => log::debug!("{}: field {} outside the standard sections", model_type, info.path),
            }
        }
        Ok(reflection)
    }

    /// Every leaf field, section by section
    pub fn fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.data)
            .chain(&self.params)
    }

    /// Look up a leaf or a whole section by path
    pub fn field(&self, path: &str) -> Option<&FieldInfo> {
        self.fields()
            .find(|f| f.path == path)
            .or_else(|| self.sections.iter().find(|f| f.path == path))
    }
}

#[derive(Default)]
struct Collector {
    registry: ClassRegistry,
    classes: Vec<String>,
    errors: Vec<String>,
}

unsafe fn lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

unsafe extern "C" fn collect_class(ctx: *mut c_void, class_name: *const c_char) {
    let Some(collector) = (ctx as *mut Collector).as_mut() else {
        return;
    };
    if class_name.is_null() {
        collector.errors.push("null class name".to_string());
        return;
    }
    let name = lossy(class_name);
    collector.registry.register_class(&name);
    if !collector.classes.contains(&name) {
        collector.classes.push(name);
    }
}

unsafe extern "C" fn collect_field(ctx: *mut c_void, field: *const FieldDescriptorAbi) {
    let Some(collector) = (ctx as *mut Collector).as_mut() else {
        return;
    };
    let Some(field) = field.as_ref() else {
        collector.errors.push("null field descriptor".to_string());
        return;
    };
    let dims = if field.dims.is_null() || field.dims_len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(field.dims, field.dims_len).to_vec()
    };
    let def = FieldDef::new(
        &lossy(field.name),
        &lossy(field.type_name),
        dims,
        field.offset,
        field.size,
    )
    .units(&lossy(field.units))
    .description(&lossy(field.description));
    if let Err(e) = collector.registry.register_field(&lossy(field.owner), def) {
        collector.errors.push(e.to_string());
    }
}

struct TypeEntry {
    library: String,
    reflection: Arc<ModelReflection>,
}

/// Known model types, their reflected classes, and the live instances
#[derive(Default)]
pub struct ModelRegistration {
    types: HashMap<String, TypeEntry>,
    classes: HashMap<String, ClassRegistry>,
    models: BTreeMap<String, Arc<ModelInstance>>,
}

impl ModelRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull the reflection of `handle` and record the model types it provides
    pub fn register_library(&mut self, handle: &LibraryHandle) -> Result<Vec<String>> {
        let library = handle.name();
        for model_type in handle.model_types() {
            if let Some(entry) = self.types.get(model_type) {
                if entry.library != library {
                    return Err(RsisError::DuplicateModelType {
                        model_type: model_type.clone(),
                        library: entry.library.clone(),
                    });
                }
            }
        }

        let mut collector = Collector::default();
        let callbacks = ReflectCallbacks {
            ctx: &mut collector as *mut Collector as *mut c_void,
            register_class: collect_class,
            register_field: collect_field,
        };
        handle.reflect(&callbacks);
        for error in &collector.errors {
            log::warn!("Reflection of '{}': {}", library, error);
        }
        log::debug!(
            "Library '{}' registered {} class(es)",
            library,
            collector.classes.len()
        );

        let mut reflections = Vec::new();
        for model_type in handle.model_types() {
            let reflection = ModelReflection::build(model_type, library, &collector.registry)?;
            reflections.push((model_type.clone(), reflection));
        }

        self.retract_library(library);
        for (model_type, reflection) in reflections {
            self.types.insert(
                model_type,
                TypeEntry {
                    library: library.to_string(),
                    reflection: Arc::new(reflection),
                },
            );
        }
        self.classes.insert(library.to_string(), collector.registry);
        Ok(handle.model_types().to_vec())
    }

    /// Forget the classes and model types of `library`
    pub fn retract_library(&mut self, library: &str) {
        self.classes.remove(library);
        self.types.retain(|_, entry| entry.library != library);
    }

    pub fn create_model(
        &mut self,
        libraries: &LibraryManager,
        library: &str,
        model_type: &str,
        name: &str,
    ) -> Result<Arc<ModelInstance>> {
        let entry = self
            .types
            .get(model_type)
            .ok_or_else(|| RsisError::UnknownModelType(model_type.to_string()))?;
        if entry.library != library {
            return Err(RsisError::ModelTypeNotInLibrary {
                library: library.to_string(),
                model_type: model_type.to_string(),
            });
        }
        if self.models.contains_key(name) {
            return Err(RsisError::DuplicateModel(name.to_string()));
        }
        let handle = libraries
            .model_symbols(library)
            .upgrade()
            .ok_or_else(|| RsisError::LibraryUnloaded(library.to_string()))?;

        let model = Arc::new(ModelInstance::create(&handle, model_type, name)?);
        self.models.insert(name.to_string(), model.clone());
        log::info!("Created model '{}' ({} from '{}')", name, model_type, library);
        Ok(model)
    }

    /// Drop the bridge's reference; the plugin destructor runs once any
    /// in-flight call returns
    pub fn destroy_model(&mut self, name: &str) -> Result<()> {
        self.models
            .remove(name)
            .map(|_| log::info!("Destroyed model '{}'", name))
            .ok_or_else(|| RsisError::UnknownModel(name.to_string()))
    }

    /// Configure a model, refreshing its library's schema on an interface update
    pub fn config_model(&mut self, libraries: &LibraryManager, name: &str) -> Result<ConfigStatus> {
        let model = self.model(name)?;
        let status = model.config()?;
        if status == ConfigStatus::InterfaceUpdate {
            log::info!("Model '{}' changed its interface, reloading schema", name);
            let handle = libraries
                .model_symbols(model.library_name())
                .upgrade()
                .ok_or_else(|| RsisError::LibraryUnloaded(model.library_name().to_string()))?;
            self.register_library(&handle)?;
        }
        Ok(status)
    }

    pub fn model(&self, name: &str) -> Result<Arc<ModelInstance>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| RsisError::UnknownModel(name.to_string()))
    }

    /// Live instances in name order
    pub fn models(&self) -> Vec<Arc<ModelInstance>> {
        self.models.values().cloned().collect()
    }

    pub fn live_instances(&self, library: &str) -> usize {
        self.models
            .values()
            .filter(|m| m.library_name() == library)
            .count()
    }

    pub fn model_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn reflection(&self, model_type: &str) -> Result<Arc<ModelReflection>> {
        self.types
            .get(model_type)
            .map(|e| e.reflection.clone())
            .ok_or_else(|| RsisError::UnknownModelType(model_type.to_string()))
    }

    /// Schema of the type behind a live model
    pub fn schema(&self, model: &str) -> Result<Arc<ModelReflection>> {
        let model = self.model(model)?;
        self.reflection(model.model_type())
    }

    pub fn schema_json(&self, model: &str) -> Result<String> {
        let schema = self.schema(model)?;
        serde_json::to_string_pretty(schema.as_ref()).map_err(|e| RsisError::Command(e.to_string()))
    }

    pub fn classes(&self, library: &str) -> Option<&ClassRegistry> {
        self.classes.get(library)
    }

    /// Drop every instance
    pub fn clear_models(&mut self) {
        let names: Vec<String> = self.models.keys().cloned().collect();
        for name in names {
            let _ = self.destroy_model(&name);
        }
    }
}
