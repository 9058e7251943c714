mod server;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sfumeet_core::{logging, Config};

use server::SfuMeetServer;

#[derive(Parser, Debug)]
#[command(name = "sfumeet")]
#[command(about = "SfuMeet SFU signaling server", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML); missing files are skipped
    #[arg(long, env = "SFUMEET_CONFIG_PATH", default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(Some(&args.config))
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("SfuMeet server starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        listen_ip = %config.media.listen_ip,
        announced_ip = %config.announced_ip(),
        rtc_ports = %format!("{}-{}", config.media.rtc_min_port, config.media.rtc_max_port),
        "Media engine settings"
    );

    // 4. Serve
    SfuMeetServer::new(config).start().await
}
