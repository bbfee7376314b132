pub mod build;
pub mod init;
pub mod merge;
pub mod serve;
pub mod tree;

use loomweave_config::AppConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub type CmdResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn load_config() -> CmdResult<AppConfig> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// A JSON argument: inline text, or `@path` to read a file.
pub fn read_json(arg: &str) -> CmdResult<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {path}: {e}"))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text).map_err(|e| format!("Invalid JSON in {arg:?}: {e}"))?)
}

/// Parse a snake_case enum value the way the HTTP API spells it.
pub fn parse_name<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|_| format!("unknown value: {raw}"))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
