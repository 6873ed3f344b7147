mod defaults;
mod limits;
mod types;

use std::path::Path;

use dupvault_types::error::Result;

pub use self::limits::{ConcurrencyConfig, LimitsConfig, CPU_INTENSITY_UNLIMITED};
pub use self::types::*;

/// Load and validate a YAML config file.
pub fn load_config(path: &Path) -> Result<BackupConfig> {
    let raw = std::fs::read_to_string(path)?;
    BackupConfig::from_yaml_str(&raw)
}
