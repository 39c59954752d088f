//! QNet HA node - main executable

use qnet_ha_node::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli_args = cli::parse();

    // Execute command
    cli::execute(cli_args).await
}
