use super::{CmdResult, load_config};

pub async fn run(port: Option<u16>, host: Option<String>) -> CmdResult {
    let mut config = load_config()?;

    if let Some(p) = port {
        config.gateway.port = p;
    }
    if let Some(h) = host {
        config.gateway.host = h;
    }
    config.validate().map_err(|e| format!("Invalid config: {e}"))?;

    println!("🧵 Loomweave gateway");
    println!("   Listening:  http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Data:       {}", config.storage.data_dir.display());
    println!("   Model:      {}", config.llm.model);
    println!();
    println!("   Engine:     POST /v1/engine/build, /v1/engine/complete");
    println!("   Legacy:     POST /api/chat/build, /api/chat/complete");
    println!("   Trees:      /v1/conversations");
    println!("   Plugins:    /v1/hooks");
    println!();

    loomweave_gateway::start(config).await
}
