mod lodestone;

use clap::Parser;

use crate::lodestone::config;

#[derive(Debug, Parser)]
#[command(
    name = "lodestone",
    version,
    about = "Transparent hostname-routing reverse proxy for Minecraft Java Edition"
)]
struct Cli {
    /// TCP port to accept Minecraft clients on (default 25565).
    #[arg(long, env = "LODESTONE_PORT")]
    port: Option<u16>,

    /// Optional management/observability endpoint, e.g. "127.0.0.1:8080" or ":8080".
    #[arg(long, env = "LODESTONE_API_BINDING")]
    api_binding: Option<String>,

    /// Static default backend used when no mapping matches.
    #[arg(long, env = "LODESTONE_DEFAULT")]
    default: Option<String>,

    /// Static hostname mapping, host=endpoint. Repeatable; also accepts a
    /// comma-separated list.
    #[arg(long, env = "LODESTONE_MAPPING", value_delimiter = ',')]
    mapping: Vec<String>,

    /// Path to a lodestone.toml config file. Flags override file values.
    #[arg(long, env = "LODESTONE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lodestone::run(config::Options {
        config_path: cli.config,
        port: cli.port,
        api_binding: cli.api_binding,
        default_route: cli.default,
        mappings: cli.mapping,
    })
    .await
}
