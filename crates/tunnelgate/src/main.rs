mod tunnelgate;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tunnelgate",
    version,
    about = "tunnelgate - expose a local HTTP service through a public tunnel server"
)]
struct Cli {
    /// Path to tunnelgate config file (.toml/.yaml/.yml). If omitted, uses TUNNELGATE_CONFIG; then auto-detects tunnelgate.toml > tunnelgate.yaml > tunnelgate.yml from CWD; then falls back to the OS default path (Linux: /etc/tunnelgate/tunnelgate.toml; others: user config dir).
    #[arg(long, env = "TUNNELGATE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Overrides `client.local_port` from the config file.
    #[arg(long)]
    local_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tunnelgate::run(cli.config, cli.local_port).await
}
