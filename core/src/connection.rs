use std::sync::{Arc, Weak};

use crate::error::{Result, RsisError};
use crate::model::ModelInstance;
use crate::registration::ModelReflection;
use crate::thread::Callback;

/// Copies one model field into another every time it runs
#[derive(Debug, Clone)]
pub struct Connection {
    src: Weak<ModelInstance>,
    src_name: String,
    src_field: String,
    dst: Weak<ModelInstance>,
    dst_name: String,
    dst_field: String,
    size: usize,
}

impl Connection {
    /// Validate both ends against their schemas. Fields must exist and have
    /// the same byte size.
    pub fn new(
        src: &Arc<ModelInstance>,
        src_schema: &ModelReflection,
        src_field: &str,
        dst: &Arc<ModelInstance>,
        dst_schema: &ModelReflection,
        dst_field: &str,
    ) -> Result<Self> {
        let from = src_schema
            .field(src_field)
            .ok_or_else(|| RsisError::UnknownField {
                model: src.name().to_string(),
                field: src_field.to_string(),
            })?;
        let to = dst_schema
            .field(dst_field)
            .ok_or_else(|| RsisError::UnknownField {
                model: dst.name().to_string(),
                field: dst_field.to_string(),
            })?;
        if from.size != to.size {
            return Err(RsisError::SizeMismatch {
                field: format!("{}.{}", dst.name(), dst_field),
                expected: to.size,
                actual: from.size,
            });
        }
        if from.type_name != to.type_name {
            log::warn!(
                "Connecting {} ({}) to {} ({}) reinterprets bytes",
                src_field,
                from.type_name,
                dst_field,
                to.type_name
            );
        }
        Ok(Self {
            src: Arc::downgrade(src),
            src_name: src.name().to_string(),
            src_field: src_field.to_string(),
            dst: Arc::downgrade(dst),
            dst_name: dst.name().to_string(),
            dst_field: dst_field.to_string(),
            size: from.size,
        })
    }

    pub fn name(&self) -> String {
        format!(
            "{}.{}->{}.{}",
            self.src_name, self.src_field, self.dst_name, self.dst_field
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn transfer(&self) -> Result<()> {
        let src = self
            .src
            .upgrade()
            .ok_or_else(|| RsisError::ModelDestroyed(self.src_name.clone()))?;
        let dst = self
            .dst
            .upgrade()
            .ok_or_else(|| RsisError::ModelDestroyed(self.dst_name.clone()))?;
        let bytes = src.msg_get(&self.src_field)?;
        dst.msg_set(&self.dst_field, &bytes)
    }

    pub fn into_callback(self, frequency: f64, frame_offset: u64) -> Callback {
        Callback::new(self.name(), frequency, frame_offset, move || self.transfer())
    }
}
