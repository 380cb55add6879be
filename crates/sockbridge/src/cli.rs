use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "sockbridge",
    about = "Bridge SOCKS5 clients on the local network to an HTTP debugging proxy"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the bridge and serve until interrupted
    Run(RunArgs),
    /// Validate configuration, probe the upstream proxy and the listen port
    Check(CheckArgs),
    /// Manage sockbridge configuration
    Config(ConfigArgs),
}

/// Where settings come from.
#[derive(Args, Clone, Default)]
pub struct ConfigSource {
    /// Load an additional config file on top of the global and project files
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore global and project config files
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Port for the SOCKS5 listener
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Upstream HTTP debugging proxy
    #[arg(long, value_name = "HOST:PORT", value_parser = parse_upstream)]
    pub upstream: Option<(String, u16)>,

    /// Maximum concurrent connections
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Idle timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Disable heartbeat probes
    #[arg(long)]
    pub no_heartbeat: bool,

    /// Certificate fingerprint to advertise
    #[arg(long, value_name = "FINGERPRINT")]
    pub fingerprint: Option<String>,

    /// Print bridge events to stdout as JSON lines
    #[arg(long)]
    pub events: bool,

    #[command(flatten)]
    pub source: ConfigSource,
}

#[derive(Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub source: ConfigSource,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        /// Write the global file instead of the project file
        #[arg(long)]
        global: bool,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration, defaults included
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,

        #[command(flatten)]
        source: ConfigSource,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}

/// Parse `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_upstream(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {value:?}"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(format!("missing host in {value:?}"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in {value:?}: {e}"))?;
    Ok((host.to_string(), port))
}
