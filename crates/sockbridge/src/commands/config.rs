use std::path::{Path, PathBuf};

use sockbridge_core::BridgeConfig;
use sockbridge_settings::{BridgeSettings, ConfigLoader};

use crate::cli::{ConfigSource, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub async fn config(args: crate::cli::ConfigArgs, cwd: PathBuf) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global, force } => init(global, force, &cwd),
        ConfigSubcommand::Show { format, source } => show(format, &source, &cwd),
    }
}

fn init(global: bool, force: bool, cwd: &Path) -> Result<(), CliError> {
    let path = if global {
        ConfigLoader::global_config_path()
    } else {
        ConfigLoader::project_config_path(cwd)
    };

    if path.exists() && !force {
        return Err(CliError::Other(format!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        )));
    }

    BridgeSettings::from_bridge_config(&BridgeConfig::default()).save(&path)?;
    println!("Created config: {}", path.display());
    Ok(())
}

fn show(format: OutputFormat, source: &ConfigSource, cwd: &Path) -> Result<(), CliError> {
    let settings = ConfigLoader::load_layered(
        cwd,
        source.extra_config.as_deref(),
        !source.no_config,
    )?;
    let effective = BridgeSettings::from_bridge_config(&settings.to_bridge_config()?);

    match format {
        OutputFormat::Toml => {
            let toml = effective.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&effective)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}
