use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::framework::FrameworkConfig;

/// A scenario file: scheduler settings, plugins, models and their wiring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub threads: Vec<ThreadConfig>,
    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    #[serde(default)]
    pub epoch_duration: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

fn default_frequency() -> f64 {
    1.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
            epoch_duration: None,
            end_time: None,
            handshake_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadConfig {
    pub name: String,
    pub frequency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    pub name: String,
    /// Explicit file; otherwise looked up by name
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    pub library: String,
    #[serde(rename = "type")]
    pub model_type: String,
    /// Thread stepping this model; unscheduled when absent
    #[serde(default)]
    pub thread: Option<String>,
    /// Step rate, defaults to the thread rate
    #[serde(default)]
    pub frequency: Option<f64>,
    #[serde(default)]
    pub frame_offset: u64,
    /// Initial field values. Nested tables address nested fields.
    #[serde(default)]
    pub values: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// `model.field.path` to copy from
    pub from: String,
    /// `model.field.path` to copy into
    pub to: String,
    pub thread: String,
    #[serde(default)]
    pub frequency: Option<f64>,
    #[serde(default)]
    pub frame_offset: u64,
}

/// Split `model.field.path` at the first dot
pub fn split_endpoint(endpoint: &str) -> anyhow::Result<(&str, &str)> {
    match endpoint.split_once('.') {
        Some((model, field)) if !model.is_empty() && !field.is_empty() => Ok((model, field)),
        _ => anyhow::bail!("Connection endpoint '{}' is not of the form model.field", endpoint),
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| anyhow::anyhow!("Failed to parse scenario: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario: {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid scenario: {}", path.display()))?;

        // Relative paths in the file are relative to the file
        if let Some(base) = path.parent() {
            for dir in &mut config.plugin_dirs {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
            for lib in &mut config.libraries {
                if let Some(p) = lib.path.as_mut().filter(|p| p.is_relative()) {
                    *p = base.join(&*p);
                }
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut threads = HashSet::new();
        for thread in &self.threads {
            if !threads.insert(thread.name.as_str()) {
                anyhow::bail!("Thread '{}' declared twice", thread.name);
            }
        }

        let mut libraries = HashSet::new();
        for lib in &self.libraries {
            if !libraries.insert(lib.name.as_str()) {
                anyhow::bail!("Library '{}' declared twice", lib.name);
            }
        }

        let mut models = HashSet::new();
        for model in &self.models {
            if model.name.is_empty() || model.name.contains('.') {
                anyhow::bail!("Model name '{}' must be non-empty and contain no '.'", model.name);
            }
            if !models.insert(model.name.as_str()) {
                anyhow::bail!("Model '{}' declared twice", model.name);
            }
            if let Some(thread) = &model.thread {
                if !threads.contains(thread.as_str()) {
                    anyhow::bail!("Model '{}' uses unknown thread '{}'", model.name, thread);
                }
            }
        }

        for conn in &self.connections {
            for endpoint in [&conn.from, &conn.to] {
                let (model, _) = split_endpoint(endpoint)?;
                if !models.contains(model) {
                    anyhow::bail!("Connection refers to unknown model '{}'", model);
                }
            }
            if !threads.contains(conn.thread.as_str()) {
                anyhow::bail!("Connection uses unknown thread '{}'", conn.thread);
            }
        }
        Ok(())
    }

    pub fn framework_config(&self) -> FrameworkConfig {
        FrameworkConfig {
            frequency: self.scheduler.frequency,
            epoch_duration: self.scheduler.epoch_duration,
            end_time: self.scheduler.end_time,
            handshake_timeout: self.scheduler.handshake_timeout_ms.map(Duration::from_millis),
            plugin_dirs: self.plugin_dirs.clone(),
        }
    }

    pub fn thread_frequency(&self, name: &str) -> Option<f64> {
        self.threads
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCENARIO: &str = r#"
plugin_dirs = ["plugins"]

[scheduler]
frequency = 10.0
end_time = 1.0
handshake_timeout_ms = 2000

[[threads]]
name = "main"
frequency = 10.0

[[libraries]]
name = "height_sensor"

[[models]]
name = "sensor"
library = "height_sensor"
type = "height_sensor"
thread = "main"

[models.values.params]
limits = [0.0, 10.0]
noise = 0.0

[models.values.in]
signal = 5.0
"#;

    #[test]
    fn test_parse_scenario() {
        let config = Config::from_toml_str(SCENARIO).unwrap();
        assert_eq!(config.scheduler.frequency, 10.0);
        assert_eq!(config.scheduler.end_time, Some(1.0));
        assert_eq!(config.threads.len(), 1);
        assert_eq!(config.models[0].model_type, "height_sensor");
        assert_eq!(config.models[0].frame_offset, 0);
        assert!(config.models[0].values.contains_key("params"));

        let fw = config.framework_config();
        assert_eq!(fw.handshake_timeout, Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.frequency, 1.0);
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_unknown_thread_rejected() {
        let text = r#"
[[models]]
name = "m"
library = "l"
type = "t"
thread = "missing"
"#;
        let err = Config::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("unknown thread"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml_str("[scheduler]\nfrequncy = 3.0\n").is_err());
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("a.out.x").unwrap(), ("a", "out.x"));
        assert!(split_endpoint("nodot").is_err());
        assert!(split_endpoint(".x").is_err());
    }

    #[test]
    fn test_load_resolves_relative_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.plugin_dirs, vec![dir.path().join("plugins")]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read scenario"));
    }
}
