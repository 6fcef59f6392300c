//! Applies a scenario file to a framework and converts between TOML values
//! and raw field bytes using the reflection schema.

use anyhow::Context;
use std::collections::HashMap;

use crate::config::{split_endpoint, Config};
use crate::framework::Framework;
use crate::registration::FieldInfo;

/// Build everything `config` describes on a framework still in `Config`
pub fn apply(config: &Config, framework: &Framework) -> anyhow::Result<HashMap<String, usize>> {
    for lib in &config.libraries {
        let loaded = unsafe {
            match &lib.path {
                Some(path) => framework.load_library_from(&lib.name, path),
                None => framework.load_library(&lib.name),
            }
        };
        loaded.with_context(|| format!("Failed to load library '{}'", lib.name))?;
    }

    let mut threads = HashMap::new();
    for thread in &config.threads {
        let index = framework
            .new_thread(thread.frequency)
            .with_context(|| format!("Failed to create thread '{}'", thread.name))?;
        threads.insert(thread.name.clone(), index);
    }

    for model in &config.models {
        framework
            .create_model(&model.library, &model.model_type, &model.name)
            .with_context(|| format!("Failed to create model '{}'", model.name))?;

        let mut values = Vec::new();
        flatten_table("", &model.values, &mut values);
        for (path, value) in values {
            write_value(framework, &model.name, &path, value)?;
        }

        framework
            .config_model(&model.name)
            .with_context(|| format!("Model '{}' rejected its configuration", model.name))?;

        if let Some(thread) = &model.thread {
            let index = *threads
                .get(thread)
                .with_context(|| format!("Model '{}' uses unknown thread '{}'", model.name, thread))?;
            let frequency = model
                .frequency
                .or_else(|| config.thread_frequency(thread))
                .unwrap_or(config.scheduler.frequency);
            framework
                .schedule_model(&model.name, index, frequency, model.frame_offset)
                .with_context(|| format!("Failed to schedule model '{}'", model.name))?;
        }
    }

    for conn in &config.connections {
        let (src, src_field) = split_endpoint(&conn.from)?;
        let (dst, dst_field) = split_endpoint(&conn.to)?;
        let index = *threads
            .get(&conn.thread)
            .with_context(|| format!("Connection uses unknown thread '{}'", conn.thread))?;
        let frequency = conn
            .frequency
            .or_else(|| config.thread_frequency(&conn.thread))
            .unwrap_or(config.scheduler.frequency);
        framework
            .connect(src, src_field, dst, dst_field, index, frequency, conn.frame_offset)
            .with_context(|| format!("Failed to connect {} -> {}", conn.from, conn.to))?;
    }

    log::info!(
        "Scenario applied: {} model(s), {} thread(s), {} connection(s)",
        config.models.len(),
        threads.len(),
        config.connections.len()
    );
    Ok(threads)
}

/// Write one TOML value into a model field
pub fn write_value(framework: &Framework, model: &str, path: &str, value: &toml::Value) -> anyhow::Result<()> {
    let schema = framework.schema(model)?;
    let field = schema
        .field(path)
        .with_context(|| format!("Model '{}' has no field '{}'", model, path))?;
    let bytes = encode_value(value, field).with_context(|| format!("Bad value for {}.{}", model, path))?;
    framework.msg_set(model, path, &bytes)?;
    Ok(())
}

/// Read one model field as a TOML value
pub fn read_value(framework: &Framework, model: &str, path: &str) -> anyhow::Result<toml::Value> {
    let schema = framework.schema(model)?;
    let field = schema
        .field(path)
        .with_context(|| format!("Model '{}' has no field '{}'", model, path))?;
    let bytes = framework.msg_get(model, path)?;
    decode_value(&bytes, field)
}

fn flatten_table<'a>(prefix: &str, table: &'a toml::Table, out: &mut Vec<(String, &'a toml::Value)>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(nested) => flatten_table(&path, nested, out),
            _ => out.push((path, value)),
        }
    }
}

fn scalar_size(type_name: &str) -> Option<usize> {
    Some(match type_name {
        "bool" | "i8" | "u8" => 1,
        "i16" | "u16" => 2,
        "i32" | "u32" | "f32" => 4,
        "i64" | "u64" | "f64" => 8,
        _ => return None,
    })
}

fn element_count(field: &FieldInfo) -> usize {
    field.dims.iter().map(|d| *d as usize).product()
}

fn collect_scalars<'a>(value: &'a toml::Value, out: &mut Vec<&'a toml::Value>) {
    match value {
        toml::Value::Array(items) => items.iter().for_each(|v| collect_scalars(v, out)),
        other => out.push(other),
    }
}

macro_rules! encode_int {
    ($ty:ty, $value:expr, $out:expr) => {{
        let raw = $value
            .as_integer()
            .with_context(|| format!("expected an integer, got {}", $value))?;
        let v = <$ty>::try_from(raw).with_context(|| format!("{} out of range", raw))?;
        $out.extend_from_slice(&v.to_ne_bytes());
    }};
}

fn encode_scalar(type_name: &str, value: &toml::Value, out: &mut Vec<u8>) -> anyhow::Result<()> {
    let as_float = || -> anyhow::Result<f64> {
        value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
            .with_context(|| format!("expected a number, got {}", value))
    };
    match type_name {
        "bool" => {
            let b = value
                .as_bool()
                .with_context(|| format!("expected a boolean, got {}", value))?;
            out.push(b as u8);
        }
        "i8" => encode_int!(i8, value, out),
        "i16" => encode_int!(i16, value, out),
        "i32" => encode_int!(i32, value, out),
        "i64" => encode_int!(i64, value, out),
        "u8" => encode_int!(u8, value, out),
        "u16" => encode_int!(u16, value, out),
        "u32" => encode_int!(u32, value, out),
        "u64" => encode_int!(u64, value, out),
        "f32" => out.extend_from_slice(&(as_float()? as f32).to_ne_bytes()),
        "f64" => out.extend_from_slice(&as_float()?.to_ne_bytes()),
        other => anyhow::bail!("cannot encode values of type {}", other),
    }
    Ok(())
}

/// Encode `value` in the in-memory layout of `field`
pub fn encode_value(value: &toml::Value, field: &FieldInfo) -> anyhow::Result<Vec<u8>> {
    let mut scalars = Vec::new();
    collect_scalars(value, &mut scalars);
    let expected = element_count(field);
    if scalars.len() != expected {
        anyhow::bail!(
            "{} has {} element(s), got {}",
            field.path,
            expected,
            scalars.len()
        );
    }
    let mut bytes = Vec::with_capacity(field.size);
    for scalar in scalars {
        encode_scalar(&field.type_name, scalar, &mut bytes)?;
    }
    if bytes.len() != field.size {
        anyhow::bail!(
            "{} is {} bytes, encoded {}",
            field.path,
            field.size,
            bytes.len()
        );
    }
    Ok(bytes)
}

fn decode_scalar(type_name: &str, chunk: &[u8]) -> anyhow::Result<toml::Value> {
    macro_rules! int {
        ($ty:ty) => {{
            let v = <$ty>::from_ne_bytes(chunk.try_into()?);
            toml::Value::Integer(i64::try_from(v)?)
        }};
    }
    Ok(match type_name {
        "bool" => toml::Value::Boolean(chunk[0] != 0),
        "i8" => int!(i8),
        "i16" => int!(i16),
        "i32" => int!(i32),
        "i64" => int!(i64),
        "u8" => int!(u8),
        "u16" => int!(u16),
        "u32" => int!(u32),
        "u64" => int!(u64),
        "f32" => toml::Value::Float(f32::from_ne_bytes(chunk.try_into()?) as f64),
        "f64" => toml::Value::Float(f64::from_ne_bytes(chunk.try_into()?)),
        other => anyhow::bail!("cannot decode values of type {}", other),
    })
}

fn nest(mut flat: Vec<toml::Value>, dims: &[u32]) -> toml::Value {
    if dims.len() <= 1 {
        return toml::Value::Array(flat);
    }
    let inner: usize = dims[1..].iter().map(|d| *d as usize).product();
    let mut rows = Vec::with_capacity(dims[0] as usize);
    while !flat.is_empty() {
        let rest = flat.split_off(inner.min(flat.len()));
        rows.push(nest(flat, &dims[1..]));
        flat = rest;
    }
    toml::Value::Array(rows)
}

/// Decode field bytes into a TOML value. Arrays keep their dimensions.
pub fn decode_value(bytes: &[u8], field: &FieldInfo) -> anyhow::Result<toml::Value> {
    let width = scalar_size(&field.type_name)
        .with_context(|| format!("cannot decode values of type {}", field.type_name))?;
    if bytes.len() != width * element_count(field) {
        anyhow::bail!(
            "{} expects {} bytes, got {}",
            field.path,
            width * element_count(field),
            bytes.len()
        );
    }
    let mut values = bytes
        .chunks(width)
        .map(|chunk| decode_scalar(&field.type_name, chunk))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if field.dims.is_empty() {
        return values.pop().context("empty field");
    }
    Ok(nest(values, &field.dims))
}
