//! Settings for one lowering run.

use serde::{Deserialize, Serialize};
use telc_backends::EXTERNAL_CODEGEN_NAMESPACE;
use telc_ir::Target;

use crate::error::{LowerError, Result};

pub const MODULE_NAME_ENV: &str = "TELC_MODULE_NAME";
pub const HOST_TARGET_ENV: &str = "TELC_HOST_TARGET";
pub const WORKSPACE_ALIGNMENT_ENV: &str = "TELC_WORKSPACE_ALIGNMENT";
pub const OP_WEIGHTS_ENV: &str = "TELC_OP_WEIGHTS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowerConfig {
    /// Prefix for the names of lowered entries.
    pub module_name: String,
    /// Target shape functions are lowered for.
    pub host_target: Target,
    /// Alignment, in bytes, assumed for workspace allocations.
    pub workspace_byte_alignment: u64,
    /// Whether `lower_module` records use counts in the module attributes.
    pub record_op_weights: bool,
    /// Registry namespace external compilers are looked up in.
    pub external_namespace: String,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            module_name: "default".to_string(),
            host_target: Target::new("llvm"),
            workspace_byte_alignment: 16,
            record_op_weights: true,
            external_namespace: EXTERNAL_CODEGEN_NAMESPACE.to_string(),
        }
    }
}

impl LowerConfig {
    /// Defaults overridden by the `TELC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `TELC_*`
    /// variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(name) = lookup(MODULE_NAME_ENV) {
            config.module_name = name;
        }
        if let Some(target) = lookup(HOST_TARGET_ENV) {
            config.host_target = target
                .parse()
                .map_err(|err| LowerError::Config(format!("{HOST_TARGET_ENV}: {err}")))?;
        }
        if let Some(alignment) = lookup(WORKSPACE_ALIGNMENT_ENV) {
            config.workspace_byte_alignment = alignment.trim().parse().map_err(|_| {
                LowerError::Config(format!(
                    "{WORKSPACE_ALIGNMENT_ENV} must be a byte count, got `{alignment}`"
                ))
            })?;
        }
        if let Some(flag) = lookup(OP_WEIGHTS_ENV) {
            config.record_op_weights = parse_flag(OP_WEIGHTS_ENV, &flag)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the keys of a TOML document.
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::default().apply_toml_str(text)
    }

    /// This configuration with the keys present in a TOML document laid on
    /// top. Keys the document omits keep their current value.
    #[cfg(feature = "toml-config")]
    pub fn apply_toml_str(mut self, text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|err| LowerError::Config(err.to_string()))?;
        if let Some(name) = file.module_name {
            self.module_name = name;
        }
        if let Some(target) = file.host_target {
            self.host_target = target.into_target()?;
        }
        if let Some(alignment) = file.workspace_byte_alignment {
            self.workspace_byte_alignment = alignment;
        }
        if let Some(flag) = file.record_op_weights {
            self.record_op_weights = flag;
        }
        if let Some(namespace) = file.external_namespace {
            self.external_namespace = namespace;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace_byte_alignment == 0 {
            return Err(LowerError::Config(
                "workspace byte alignment must be at least 1".to_string(),
            ));
        }
        if self.external_namespace.is_empty() {
            return Err(LowerError::Config(
                "external codegen namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The keys a config file may set.
#[cfg(feature = "toml-config")]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    module_name: Option<String>,
    host_target: Option<TargetSetting>,
    workspace_byte_alignment: Option<u64>,
    record_op_weights: Option<bool>,
    external_namespace: Option<String>,
}

/// A target written as `"c -mcpu=cortex-m4"` or as a `{ kind, attrs }` table.
#[cfg(feature = "toml-config")]
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetSetting {
    Spec(String),
    Table(Target),
}

#[cfg(feature = "toml-config")]
impl TargetSetting {
    fn into_target(self) -> Result<Target> {
        match self {
            Self::Spec(spec) => spec
                .parse()
                .map_err(|err| LowerError::Config(format!("host_target: {err}"))),
            Self::Table(target) => Ok(target),
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(LowerError::Config(format!(
            "{name} must be a boolean, got `{other}`"
        ))),
    }
}
