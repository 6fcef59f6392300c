use rsis_model_abi::layout::{ClassRegistry, FieldDef, LayoutError};

/// Types that can appear as reflected fields.
///
/// Plugin structs used as nested sections implement this with their class
/// name as `type_name`.
pub trait Reflected {
    fn type_name() -> &'static str;

    fn dims() -> Vec<u32> {
        Vec::new()
    }
}

macro_rules! reflected_scalar {
    ($($ty:ty => $name:literal),+ $(,)?) => {
        $(
            impl Reflected for $ty {
                fn type_name() -> &'static str {
                    $name
                }
            }
        )+
    };
}

reflected_scalar! {
    bool => "bool",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    f32 => "f32",
    f64 => "f64",
}

impl<T: Reflected, const N: usize> Reflected for [T; N] {
    fn type_name() -> &'static str {
        T::type_name()
    }

    fn dims() -> Vec<u32> {
        let mut dims = vec![N as u32];
        dims.extend(T::dims());
        dims
    }
}

/// Describe a field of type `T` at `offset` within its owner
pub fn field<T: Reflected>(name: &str, offset: usize) -> FieldDef {
    FieldDef::new(name, T::type_name(), T::dims(), offset, std::mem::size_of::<T>())
}

/// Collects a model type's classes during `Model::reflect`.
///
/// Registration mistakes are recorded rather than raised so a plugin can
/// finish describing itself; the host sees the resulting gaps as unknown
/// fields.
#[derive(Debug, Default)]
pub struct Reflector {
    registry: ClassRegistry,
    errors: Vec<LayoutError>,
}

impl Reflector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(&mut self, name: &str) -> &mut Self {
        self.registry.register_class(name);
        self
    }

    pub fn field(&mut self, owner: &str, def: FieldDef) -> &mut Self {
        if let Err(e) = self.registry.register_field(owner, def) {
            self.errors.push(e);
        }
        self
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn errors(&self) -> &[LayoutError] {
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_dims_and_size() {
        let def = field::<[[f32; 3]; 2]>("matrix", 16);
        assert_eq!(def.type_name, "f32");
        assert_eq!(def.dims, vec![2, 3]);
        assert_eq!(def.size, 24);
        assert_eq!(def.offset, 16);
        assert_eq!(def.element_count(), 6);
    }

    #[test]
    fn test_reflector_records_errors() {
        let mut r = Reflector::new();
        r.class("a").field("a", field::<u8>("x", 0));
        r.field("missing", field::<u8>("y", 0));
        assert_eq!(r.errors().len(), 1);
        assert_eq!(r.registry().class("a").unwrap().fields.len(), 1);
    }
}
