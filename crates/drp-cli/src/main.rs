//! `drp`: run registry, broker and provider nodes, or talk to a broker as a consumer.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands, ConsumerCommands};
use clap::Parser;

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.json_logs);

    let result = match cli.command {
        Commands::Registry { node } => cmd::node::cmd_registry(cli.config, node),
        Commands::Broker { node } => cmd::node::cmd_broker(cli.config, node),
        Commands::Provider { node, interval_ms } => {
            cmd::node::cmd_provider(cli.config, node, interval_ms)
        }
        Commands::Consumer { broker, action } => match action {
            ConsumerCommands::Watch {
                topic,
                filter,
                webhook,
            } => cmd::consumer::cmd_watch(cli.config, broker, &topic, filter, webhook),
            ConsumerCommands::Cmd {
                cmd,
                params,
                service,
            } => cmd::consumer::cmd_call(cli.config, broker, &cmd, &params, service),
            ConsumerCommands::Path { path, list_only } => {
                cmd::consumer::cmd_path(cli.config, broker, &path, list_only)
            }
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
