//! `medic config` subcommands.

use medic_core::config::{MedicConfig, default_config_path};
use medic_core::error::{ConfigError, MedicError};
use std::path::Path;

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default configuration file
    Init,
    /// Show the effective configuration
    Show,
}

pub fn handle_config(
    action: ConfigAction,
    path: Option<&Path>,
    config: &MedicConfig,
) -> Result<(), MedicError> {
    match action {
        ConfigAction::Init => {
            let target = path
                .map(Path::to_path_buf)
                .unwrap_or_else(default_config_path);
            if target.exists() {
                return Err(ConfigError::Invalid {
                    message: format!("refusing to overwrite existing {}", target.display()),
                }
                .into());
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, MedicConfig::default_yaml())?;
            println!("wrote {}", target.display());
            Ok(())
        }
        ConfigAction::Show => {
            let yaml = serde_yaml::to_string(config).map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
            println!("{yaml}");
            Ok(())
        }
    }
}
