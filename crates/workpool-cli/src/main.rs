mod config;
mod serve_cmd;
#[cfg(test)]
mod test_util;

use clap::{CommandFactory, Parser, Subcommand};

use config::{CliOverrides, WorkpoolConfig};

#[derive(Parser)]
#[command(
    name = "workpool",
    version,
    about = "Job coordinator with a live WebSocket progress feed"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a workpool config file with every key at its default
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the coordinator and its WebSocket front door
    Serve {
        /// Address to bind (overrides WORKPOOL_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides WORKPOOL_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Number of concurrent worker slots (overrides WORKPOOL_POOL_SIZE)
        #[arg(long)]
        pool_size: Option<usize>,
        /// Coordinator idle backoff in milliseconds (overrides WORKPOOL_POLL_BACKOFF_MS)
        #[arg(long)]
        poll_backoff_ms: Option<u64>,
        /// Simulated worker tick in milliseconds (overrides WORKPOOL_TICK_MS)
        #[arg(long)]
        tick_ms: Option<u64>,
    },
    /// Print shell completions to stdout
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::with_defaults();
    config::save_config_to(&path, &cfg)?;

    println!("Config written to {}", path.display());
    if let (Some(bind), Some(port)) = (&cfg.server.bind, cfg.server.port) {
        println!("  server = {bind}:{port}");
    }
    if let Some(size) = cfg.pool.size {
        println!("  pool.size = {size}");
    }
    println!();
    println!("Next: run `workpool serve`.");

    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Serve {
            bind,
            port,
            pool_size,
            poll_backoff_ms,
            tick_ms,
        } => {
            let resolved = WorkpoolConfig::resolve(&CliOverrides {
                bind,
                port,
                pool_size,
                poll_backoff_ms,
                tick_ms,
            })?;
            serve_cmd::run_serve(resolved).await?;
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "workpool",
            "serve",
            "--port",
            "8123",
            "--pool-size",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve {
                port, pool_size, bind, ..
            } => {
                assert_eq!(port, Some(8123));
                assert_eq!(pool_size, Some(2));
                assert_eq!(bind, None);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn unknown_shell_is_rejected() {
        assert!(Cli::try_parse_from(["workpool", "completions", "teletype"]).is_err());
    }
}
