//! Hardening configuration.
//!
//! `CfiConfig` is an immutable value threaded through every stage. It is
//! loaded from JSON or YAML (all fields defaulted) and can be overlaid with
//! the classic `TG_*` environment variables through `apply_env`, which takes
//! an explicit key/value iterator so tests never touch the process
//! environment.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::document::{read_document, DocumentError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Invalid boolean for {key}: {value:?} (expected 1/0, on/off, true/false)")]
    InvalidBool { key: String, value: String },

    #[error("Invalid number for {key}: {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with indirect calls that survive rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualMode {
    Off,
    #[default]
    Warn,
    Error,
}

/// Sizes of the runtime branch sleds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Instruction words in the primary sled.
    pub sled_capacity: usize,
    /// Instruction words in the secondary sled.
    pub secondary_capacity: usize,
    /// Page-protection granularity in bytes.
    pub page_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { sled_capacity: 3071, secondary_capacity: 1023, page_size: 0x4000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfiConfig {
    /// Identifiers must fit in this many bits.
    pub id_bitwidth: u32,
    /// First assignable identifier; lower values are reserved sentinels.
    pub min_id: u64,
    /// Repetitions of a site hash before a shared dispatcher is emitted.
    pub dispatcher_limit: usize,
    /// Emit a diagnostic dump before trapping on an invalid target.
    pub debug: bool,
    /// Call sites fall back to the runtime resolver instead of trapping.
    pub external_resolver: bool,
    /// Address-taken functions may be observed by other modules.
    pub dynamic_linking: bool,
    /// Output is a shared object; leaking identifiers start at the module id.
    pub shared_object: bool,
    /// Route every call through the runtime resolver (aarch64 only).
    pub resolve_all: bool,
    /// Synthesize the all-identifier handler even without dynamic linking.
    pub all_id_handler: bool,
    /// Put a speculation barrier at the top of every dispatch case.
    pub protect_spectre_v1: bool,
    pub residual_check: ResidualMode,
    /// Write the statistics side file.
    pub export_stats: bool,
    /// Name of the produced artifact; prefixes the side files.
    pub output_name: String,
    /// Startup routines whose indirect calls are left alone.
    pub carve_out_functions: Vec<String>,
    /// Functions that are never candidates of an unknown-target site.
    pub never_targets: Vec<String>,
    /// Functions exempt from resolve-everything mode.
    pub init_functions: Vec<String>,
    pub runtime: RuntimeConfig,
}

impl Default for CfiConfig {
    fn default() -> Self {
        Self {
            id_bitwidth: 31,
            min_id: 2,
            dispatcher_limit: 5,
            debug: false,
            external_resolver: false,
            dynamic_linking: false,
            shared_object: false,
            resolve_all: false,
            all_id_handler: false,
            protect_spectre_v1: false,
            residual_check: ResidualMode::Warn,
            export_stats: true,
            output_name: "a.out".to_string(),
            carve_out_functions: vec!["libc_start_init".to_string(), "libc_exit_fini".to_string()],
            never_targets: vec![
                "__restore".to_string(),
                "__restore_rt".to_string(),
                "__call_function_ptr_handler".to_string(),
            ],
            init_functions: vec![
                "__do_init".to_string(),
                "_start_c".to_string(),
                "__libc_start_main".to_string(),
                "__init_libc".to_string(),
                "__noic_all_id_handler".to_string(),
            ],
            runtime: RuntimeConfig::default(),
        }
    }
}

impl CfiConfig {
    /// Load from a JSON or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: CfiConfig = read_document(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TG_*` variables. Unknown keys are ignored.
    pub fn apply_env<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut warn = self.residual_check != ResidualMode::Off;
        let mut error = self.residual_check == ResidualMode::Error;

        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "TG_ENFORCE_ID_BITWIDTH" => self.id_bitwidth = parse_narrow(key, value)?,
                "TG_ENFORCE_MIN_ID" => self.min_id = parse_number(key, value)?,
                "TG_ENFORCE_DISPATCHER_LIMIT" => self.dispatcher_limit = parse_narrow(key, value)?,
                "TG_ENFORCE_DEBUG" => self.debug = parse_bool(key, value)?,
                "TG_ENFORCE_JIT" => self.external_resolver = parse_bool(key, value)?,
                "TG_DYNAMIC_LINKING" => self.dynamic_linking = parse_bool(key, value)?,
                "TG_NOIC_JIT_ALL" => {
                    let on = parse_bool(key, value)?;
                    self.resolve_all = on;
                    if on {
                        self.all_id_handler = true;
                    }
                }
                "TG_NOIC_ALL_ID_FUNC" => self.all_id_handler = parse_bool(key, value)?,
                "TG_INDIRECT_CALLS_WARN" => warn = parse_bool(key, value)?,
                "TG_INDIRECT_CALLS_ERROR" => error = parse_bool(key, value)?,
                "TG_PROTECT_SPECTRE_V1" => self.protect_spectre_v1 = parse_bool(key, value)?,
                "TG_EXPORT_NOIC" => self.export_stats = parse_bool(key, value)?,
                _ => {}
            }
        }

        self.residual_check = if error {
            ResidualMode::Error
        } else if warn {
            ResidualMode::Warn
        } else {
            ResidualMode::Off
        };
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_bitwidth == 0 || self.id_bitwidth > 64 {
            return Err(ConfigError::Invalid(format!(
                "id_bitwidth must be within 1..=64, got {}",
                self.id_bitwidth
            )));
        }
        if self.min_id > self.max_id() {
            return Err(ConfigError::Invalid(format!(
                "min_id {} does not fit in {} bits",
                self.min_id, self.id_bitwidth
            )));
        }
        if self.runtime.sled_capacity == 0 || self.runtime.secondary_capacity == 0 {
            return Err(ConfigError::Invalid("sled capacities must be non-zero".to_string()));
        }
        if !self.runtime.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page_size must be a power of two, got {:#x}",
                self.runtime.page_size
            )));
        }
        Ok(())
    }

    /// Largest identifier representable in `id_bitwidth` bits.
    pub fn max_id(&self) -> u64 {
        if self.id_bitwidth >= 64 {
            u64::MAX
        } else {
            (1u64 << self.id_bitwidth) - 1
        }
    }

    pub fn is_carve_out(&self, name: &str) -> bool {
        self.carve_out_functions.iter().any(|n| n == name)
    }

    pub fn is_never_target(&self, name: &str) -> bool {
        self.never_targets.iter().any(|n| n == name)
    }

    pub fn is_init_function(&self, name: &str) -> bool {
        self.init_functions.iter().any(|n| n == name)
    }

    /// Whether the all-identifier handler is synthesized.
    pub fn wants_all_id_handler(&self) -> bool {
        (self.external_resolver && self.dynamic_linking) || self.all_id_handler
    }

    /// Stable fingerprint of the configuration, stored with database runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool { key: key.to_string(), value: value.to_string() }),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| ConfigError::InvalidNumber { key: key.to_string(), value: value.to_string() })
}

/// `parse_number` for fields narrower than 64 bits; out-of-range values are rejected.
fn parse_narrow<T: TryFrom<u64>>(key: &str, value: &str) -> Result<T, ConfigError> {
    T::try_from(parse_number(key, value)?)
        .map_err(|_| ConfigError::InvalidNumber { key: key.to_string(), value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overlay_maps_classic_variables() {
        let config = CfiConfig::default()
            .apply_env([
                ("TG_ENFORCE_MIN_ID", "0x10"),
                ("TG_ENFORCE_JIT", "on"),
                ("TG_NOIC_JIT_ALL", "1"),
                ("TG_INDIRECT_CALLS_ERROR", "true"),
                ("PATH", "/usr/bin"),
            ])
            .expect("valid overlay");
        assert_eq!(config.min_id, 16);
        assert!(config.external_resolver);
        assert!(config.resolve_all);
        assert!(config.all_id_handler);
        assert_eq!(config.residual_check, ResidualMode::Error);
    }

    #[test]
    fn disabling_warnings_turns_check_off() {
        let config = CfiConfig::default().apply_env([("TG_INDIRECT_CALLS_WARN", "off")]).expect("overlay");
        assert_eq!(config.residual_check, ResidualMode::Off);
    }

    #[test]
    fn rejects_garbage_booleans() {
        let err = CfiConfig::default().apply_env([("TG_ENFORCE_DEBUG", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }

    #[test]
    fn out_of_range_widths_are_rejected_not_truncated() {
        let err = CfiConfig::default().apply_env([("TG_ENFORCE_ID_BITWIDTH", "4294967297")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { ref key, .. } if key == "TG_ENFORCE_ID_BITWIDTH"));

        let config = CfiConfig::default()
            .apply_env([("TG_ENFORCE_ID_BITWIDTH", "48"), ("TG_ENFORCE_DISPATCHER_LIMIT", "0x8")])
            .expect("overlay");
        assert_eq!(config.id_bitwidth, 48);
        assert_eq!(config.dispatcher_limit, 8);
    }
}
