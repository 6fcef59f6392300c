//! Plain-Rust view of reflected struct layouts.
//!
//! Both sides of the boundary build the same `ClassRegistry`: the plugin from
//! its own `offset_of!` computations, the host from the registration
//! callbacks. Flattening a root class yields the dotted field paths used as
//! field ids by the buffer protocol.

/// Nesting limit when flattening; a class graph deeper than this is cyclic
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub type_name: String,
    pub dims: Vec<u32>,
    /// Byte offset within the owning class
    pub offset: usize,
    /// Total byte size, dimensions included
    pub size: usize,
    pub units: String,
    pub description: String,
}

impl FieldDef {
    pub fn new(name: &str, type_name: &str, dims: Vec<u32>, offset: usize, size: usize) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            dims,
            offset,
            size,
            units: String::new(),
            description: String::new(),
        }
    }

    pub fn units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Number of scalar elements described by the dimensions
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|d| *d as usize).product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

/// A leaf field of a flattened class, addressed by dotted path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub path: String,
    pub type_name: String,
    pub dims: Vec<u32>,
    /// Byte offset from the start of the root class
    pub offset: usize,
    pub size: usize,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    UnknownClass(String),
    DuplicateField { class: String, field: String },
    FieldOutOfBounds { path: String },
    TooDeep(String),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownClass(name) => write!(f, "Class not registered: {}", name),
            Self::DuplicateField { class, field } => {
                write!(f, "Field {} registered twice on class {}", field, class)
            }
            Self::FieldOutOfBounds { path } => write!(f, "Field {} overflows its parent", path),
            Self::TooDeep(path) => write!(f, "Class nesting too deep at {}", path),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Ordered set of reflected classes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a class for field registration. Re-registering an existing class
    /// keeps its fields.
    pub fn register_class(&mut self, name: &str) {
        if self.class(name).is_none() {
            self.classes.push(ClassDef {
                name: name.to_string(),
                fields: Vec::new(),
            });
        }
    }

    pub fn register_field(&mut self, owner: &str, field: FieldDef) -> Result<(), LayoutError> {
        let class = self
            .classes
            .iter_mut()
            .find(|c| c.name == owner)
            .ok_or_else(|| LayoutError::UnknownClass(owner.to_string()))?;
        if class.fields.iter().any(|f| f.name == field.name) {
            return Err(LayoutError::DuplicateField {
                class: owner.to_string(),
                field: field.name,
            });
        }
        class.fields.push(field);
        Ok(())
    }

    /// Remove a class and its fields. Returns false if it was not registered.
    pub fn delete_class(&mut self, name: &str) -> bool {
        let before = self.classes.len();
        self.classes.retain(|c| c.name != name);
        self.classes.len() < before
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Expand `root` into its leaf fields. A field whose type is itself a
    /// registered class and which has no dimensions is descended into;
    /// everything else is a leaf.
    pub fn flatten(&self, root: &str) -> Result<Vec<FieldLayout>, LayoutError> {
        let class = self
            .class(root)
            .ok_or_else(|| LayoutError::UnknownClass(root.to_string()))?;
        let mut out = Vec::new();
        self.flatten_into(class, "", 0, usize::MAX, 0, &mut out)?;
        Ok(out)
    }

    fn flatten_into(
        &self,
        class: &ClassDef,
        prefix: &str,
        base: usize,
        limit: usize,
        depth: usize,
        out: &mut Vec<FieldLayout>,
    ) -> Result<(), LayoutError> {
        for field in &class.fields {
            let path = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{}.{}", prefix, field.name)
            };
            if field.offset.saturating_add(field.size) > limit {
                return Err(LayoutError::FieldOutOfBounds { path });
            }
            let offset = base + field.offset;
            match self.class(&field.type_name) {
                Some(nested) if field.dims.is_empty() => {
                    if depth >= MAX_DEPTH {
                        return Err(LayoutError::TooDeep(path));
                    }
                    self.flatten_into(nested, &path, offset, field.size, depth + 1, out)?;
                }
                _ => out.push(FieldLayout {
                    path,
                    type_name: field.type_name.clone(),
                    dims: field.dims.clone(),
                    offset,
                    size: field.size,
                    units: field.units.clone(),
                }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        reg.register_class("sensor_in");
        reg.register_field("sensor_in", FieldDef::new("signal", "f64", vec![], 0, 8).units("m"))
            .unwrap();
        reg.register_class("sensor_params");
        reg.register_field("sensor_params", FieldDef::new("limits", "f64", vec![2], 0, 16))
            .unwrap();
        reg.register_field("sensor_params", FieldDef::new("noise", "f64", vec![], 16, 8))
            .unwrap();
        reg.register_class("sensor");
        reg.register_field("sensor", FieldDef::new("in", "sensor_in", vec![], 0, 8))
            .unwrap();
        reg.register_field("sensor", FieldDef::new("params", "sensor_params", vec![], 8, 24))
            .unwrap();
        reg
    }

    #[test]
    fn test_flatten_nested_paths() {
        let reg = sensor_registry();
        let fields = reg.flatten("sensor").unwrap();
        let paths: Vec<&str> = fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["in.signal", "params.limits", "params.noise"]);

        let noise = &fields[2];
        assert_eq!(noise.offset, 24);
        assert_eq!(noise.size, 8);
        assert_eq!(fields[0].units, "m");
    }

    #[test]
    fn test_field_on_unknown_class_rejected() {
        let mut reg = ClassRegistry::new();
        let err = reg
            .register_field("ghost", FieldDef::new("x", "f64", vec![], 0, 8))
            .unwrap_err();
        assert_eq!(err, LayoutError::UnknownClass("ghost".to_string()));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut reg = sensor_registry();
        let err = reg
            .register_field("sensor_in", FieldDef::new("signal", "f64", vec![], 0, 8))
            .unwrap_err();
        assert!(matches!(err, LayoutError::DuplicateField { .. }));
    }

    #[test]
    fn test_delete_class() {
        let mut reg = sensor_registry();
        assert!(reg.delete_class("sensor_params"));
        assert!(!reg.delete_class("sensor_params"));

        // The dangling field now flattens as an opaque leaf
        let fields = reg.flatten("sensor").unwrap();
        assert_eq!(fields[1].path, "params");
        assert_eq!(fields[1].size, 24);
    }

    #[test]
    fn test_out_of_bounds_nested_field() {
        let mut reg = sensor_registry();
        reg.register_field("sensor_in", FieldDef::new("extra", "f64", vec![], 8, 8))
            .unwrap();
        let err = reg.flatten("sensor").unwrap_err();
        assert_eq!(
            err,
            LayoutError::FieldOutOfBounds {
                path: "in.extra".to_string()
            }
        );
    }

    #[test]
    fn test_self_referencing_class_is_too_deep() {
        let mut reg = ClassRegistry::new();
        reg.register_class("node");
        reg.register_field("node", FieldDef::new("next", "node", vec![], 0, 0))
            .unwrap();
        assert!(matches!(reg.flatten("node"), Err(LayoutError::TooDeep(_))));
    }
}
