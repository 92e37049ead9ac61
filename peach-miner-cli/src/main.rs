use std::sync::Arc;

use peach_miner_lib::{ConfigSettings, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config: ConfigSettings = ConfigSettings::load(true)?;
    let server = Arc::new(Server::from_config(config)?);
    server.run().await?;

    Ok(())
}
