use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};
use magg_core::OutputFormat;

#[derive(Parser)]
#[command(name = "magg", version)]
#[command(about = "Aggregating MCP proxy: one endpoint over a fleet of MCP servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy (HTTP+SSE by default, or a single stdio session)
    #[command(group(ArgGroup::new("filtering").args(["tags", "tag_filter", "preset"])))]
    Serve {
        /// Config file path (default: $MAGG_CONFIG, then XDG config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control socket path override
        #[arg(long)]
        socket: Option<PathBuf>,

        /// HTTP bind address override
        #[arg(long)]
        http_bind: Option<String>,

        /// HTTP port override (0 = ephemeral)
        #[arg(long)]
        http_port: Option<u16>,

        /// Serve one session on stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,

        /// Comma-separated tag list for the stdio session (simple OR)
        #[arg(long)]
        tags: Option<String>,

        /// Tag filter expression for the stdio session
        #[arg(long = "tag-filter")]
        tag_filter: Option<String>,

        /// Named preset for the stdio session
        #[arg(long)]
        preset: Option<String>,
    },

    /// Show the status of a running proxy
    Status {
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Stop a running proxy
    Stop {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}
