use clap::Parser;

use shroud_ingress::app;
use shroud_ingress::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    app::run(config).await
}
