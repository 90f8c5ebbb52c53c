/*!
 * Validate Command - check a configuration file
 *
 * Loads the file, applies `BUSGUARD_*` environment overrides, validates the
 * result and renders the effective configuration as TOML.
 */

use crate::config::BusguardConfig;
use anyhow::Result;
use std::path::Path;
use tracing::info;

/// Load and validate `path`, returning the effective configuration
pub fn run_validate(path: &Path) -> Result<String> {
    let config = BusguardConfig::load(path)?;
    info!(
        path = %path.display(),
        primary = %config.primary.name,
        secondary = ?config.secondary.as_ref().map(|s| s.name.as_str()),
        "configuration is valid"
    );
    let rendered = config.to_toml()?;
    Ok(rendered)
}
