use anyhow::Result;
use clap::Parser;
use magg_proxy::{ServeOptions, handle_serve_command, handle_status_command, handle_stop_command};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdio-mode MCP framing stays clean on stdout.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            socket,
            http_bind,
            http_port,
            stdio,
            tags,
            tag_filter,
            preset,
        } => {
            handle_serve_command(ServeOptions {
                config_path: config,
                socket_override: socket,
                http_bind_override: http_bind,
                http_port_override: http_port,
                stdio,
                tags,
                tag_filter,
                preset,
            })
            .await
        }
        Commands::Status { socket } => handle_status_command(socket, cli.format).await,
        Commands::Stop { socket } => handle_stop_command(socket).await,
    }
}
