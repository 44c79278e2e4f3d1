//! YAML and TOML configuration file support.
//!
//! A configuration file lists the models to convert in place, whether a
//! failure stops the run, and optional overrides for how large models are
//! saved.

use crate::errors::{FoldError, Result};
use crate::onnx_utils::SaveOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level conversion configuration.
///
/// Can be loaded from a YAML or TOML file with [`Config::from_file`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Models converted in place, in order.
    #[serde(default)]
    pub models: Vec<String>,

    /// Continue with the remaining models after a failure.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Save layout overrides. Defaults apply when absent.
    #[serde(default)]
    pub save: Option<SaveOptions>,
}

impl Config {
    /// Load a config from a YAML or TOML file (auto-detected by extension).
    ///
    /// # Errors
    ///
    /// Returns [`FoldError::Config`] on I/O, parse, or unsupported format errors.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| FoldError::Config {
                reason: "Config file has no extension".into(),
            })?;

        let content = std::fs::read_to_string(path).map_err(|e| FoldError::Config {
            reason: format!("Failed to read config file '{}': {e}", path.display()),
        })?;

        match extension {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(FoldError::Config {
                reason: format!("Unsupported config format: {}", extension),
            }),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| FoldError::Config {
            reason: format!("Failed to parse YAML config: {e}"),
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FoldError::Config {
            reason: format!("Failed to parse TOML config: {e}"),
        })
    }

    /// Validate the configuration (non-empty, unique model paths and sane
    /// save options).
    ///
    /// # Errors
    ///
    /// Returns [`FoldError::Config`] if any field is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(FoldError::Config {
                reason: "No models listed".into(),
            });
        }

        for (idx, model) in self.models.iter().enumerate() {
            if model.is_empty() {
                return Err(FoldError::Config {
                    reason: format!("Model {}: path is empty", idx),
                });
            }
            if self.models[..idx].contains(model) {
                return Err(FoldError::Config {
                    reason: format!("Model {}: '{}' is listed twice", idx, model),
                });
            }
        }

        if let Some(save) = &self.save {
            save.validate()?;
        }

        Ok(())
    }

    /// Effective save options (configured or default).
    pub fn save_options(&self) -> SaveOptions {
        self.save.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
models:
  - model1.onnx
  - nested/model2.onnx
continue_on_error: true

save:
  external_threshold: 4096
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.models.len(), 2);
        assert!(config.continue_on_error);
        config.validate().unwrap();

        let save = config.save_options();
        assert_eq!(save.external_threshold, 4096);
        assert_eq!(save.external_data_file, "model.data");
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
models = ["model1.onnx", "model2.onnx"]

[save]
external_data_file = "weights.bin"
max_single_file_bytes = 1048576
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.models.len(), 2);
        assert!(!config.continue_on_error);
        config.validate().unwrap();

        let save = config.save_options();
        assert_eq!(save.external_data_file, "weights.bin");
        assert_eq!(save.max_single_file_bytes, 1_048_576);
        assert_eq!(save.external_threshold, 1024);
    }

    #[test]
    fn test_defaults_without_save_section() {
        let config = Config::from_yaml("models: [a.onnx]").unwrap();
        assert!(config.save.is_none());
        assert_eq!(config.save_options(), SaveOptions::default());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let empty = Config::default();
        assert!(empty.validate().is_err());

        let duplicate = Config::from_yaml("models: [a.onnx, a.onnx]").unwrap();
        let err = duplicate.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));

        let bad_save = Config::from_yaml(
            "models: [a.onnx]\nsave:\n  external_data_file: ../escape.data\n",
        )
        .unwrap();
        assert!(matches!(bad_save.validate(), Err(FoldError::Config { .. })));
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported config format"));
    }
}
