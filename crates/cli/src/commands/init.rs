use loomweave_assets::AssetKind;
use loomweave_config::AppConfig;
use std::path::Path;
use tracing::info;

use super::CmdResult;

pub async fn run(force: bool) -> CmdResult {
    let config_dir = AppConfig::config_dir();
    let written = write_config(&config_dir, force)?;

    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    create_data_dirs(&config)?;

    if written {
        println!("✅ Wrote {}", config_dir.join("config.toml").display());
    } else {
        println!("ℹ️  Kept existing {} (use --force to overwrite)", config_dir.join("config.toml").display());
    }
    println!("📂 Data directory: {}", config.storage.data_dir.display());
    println!();
    println!("Next: drop character JSON files into {}", config.storage.assets_dir().join(AssetKind::Character.dir_name()).display());
    println!("      then run `loomweave serve`");
    Ok(())
}

/// Returns whether a config file was written.
fn write_config(config_dir: &Path, force: bool) -> CmdResult<bool> {
    std::fs::create_dir_all(config_dir)?;
    let path = config_dir.join("config.toml");
    if path.exists() && !force {
        return Ok(false);
    }
    std::fs::write(&path, AppConfig::default_toml())?;
    info!(path = %path.display(), "Config written");
    Ok(true)
}

fn create_data_dirs(config: &AppConfig) -> CmdResult {
    let storage = &config.storage;
    std::fs::create_dir_all(storage.conversations_dir())?;
    std::fs::create_dir_all(storage.variables_dir())?;
    for kind in AssetKind::ALL {
        std::fs::create_dir_all(storage.assets_dir().join(kind.dir_name()))?;
    }
    Ok(())
}
