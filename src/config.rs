//! Host configuration: optional JSON file plus command-line overrides.

use picolink_repl::repl::{BusyPolicy, ReplConfig, ReplError, ReplErrorKind, ReplResult};
use std::path::Path;

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub busy_policy: Option<BusyPolicy>,
}

/// Read `path` (if any), apply `overrides` and validate the result.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> ReplResult<ReplConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ReplError::invalid_config(format!("cannot read {}: {}", path.display(), e))
            })?;
            serde_json::from_str::<ReplConfig>(&raw).map_err(|e| {
                ReplError::new(
                    ReplErrorKind::InvalidConfig,
                    format!("{}: {}", path.display(), e),
                )
            })?
        }
        None => ReplConfig::default(),
    };

    if let Some(port) = &overrides.port {
        config.port_name = Some(port.clone());
    }
    if let Some(baud) = overrides.baud {
        config.baud_rate = baud;
    }
    if let Some(policy) = overrides.busy_policy {
        config.busy_policy = policy;
    }

    config.validate().map_err(ReplError::invalid_config)?;
    log::debug!("effective config: {:?}", config);
    Ok(config)
}
