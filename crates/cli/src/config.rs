//! Loading the gateway configuration file.

use anyhow::Context;
use econet_core::GatewayConfig;
use std::path::{Path, PathBuf};

/// Read, parse and validate a TOML configuration file.
///
/// Relative rule file paths are taken relative to the configuration file.
pub fn load(path: &Path) -> anyhow::Result<GatewayConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut config: GatewayConfig =
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for table in [
        &mut config.tables.interfaces,
        &mut config.tables.routes,
        &mut config.tables.nat,
    ] {
        if let Some(file) = table.as_mut() {
            *file = resolve(base, file);
        }
    }

    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn resolve(base: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base.join(file)
    }
}
