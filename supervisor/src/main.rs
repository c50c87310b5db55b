use anyhow::Result;
use clap::Parser;

use mcp_supervisor::config::SupervisorFileConfig;
use mcp_supervisor::logging::init_tracing;

mod cli;
mod handlers;

use cli::{Cli, Commands};
use handlers::{CommandContext, StartArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let file_config = SupervisorFileConfig::load()?;
    let ctx = CommandContext::new(cli.socket, file_config);

    match cli.command {
        Commands::Daemon { no_autostart } => handlers::run_daemon(&ctx, !no_autostart).await,
        Commands::Ping => handlers::run_ping(&ctx).await,
        Commands::Shutdown => handlers::run_shutdown(&ctx).await,
        Commands::Start {
            name,
            command,
            cwd,
            env,
            systemd,
            kind,
            log_file,
            no_stdio,
        } => {
            let args = StartArgs {
                name,
                command,
                cwd,
                env,
                systemd,
                kind,
                log_file,
                no_stdio,
            };
            handlers::run_start(&ctx, args).await
        }
        Commands::Stop { name } => handlers::run_stop(&ctx, &name).await,
        Commands::Restart { name } => handlers::run_restart(&ctx, &name).await,
        Commands::Status { name } => handlers::run_status(&ctx, &name).await,
        Commands::List => handlers::run_list(&ctx).await,
        Commands::Call { name, tool, args } => {
            handlers::run_call_tool(&ctx, &name, &tool, args).await
        }
        Commands::Tools { name } => handlers::run_tools(&ctx, &name).await,
    }
}
