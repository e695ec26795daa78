//! Clap CLI definitions for the `drp` tool.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  drp registry --listen 0.0.0.0:8080
  drp broker --listen 0.0.0.0:8081 --registry ws://127.0.0.1:8080/registry
  drp provider --listen 0.0.0.0:8082 --registry ws://127.0.0.1:8080/registry
  drp consumer --broker ws://127.0.0.1:8081/broker watch ticks
  drp consumer --broker ws://127.0.0.1:8081/broker path Providers --list-only";

/// Run and query DRP mesh nodes.
#[derive(Parser)]
#[command(name = "drp", version, about = "DRP mesh node runner", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.drp/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that override values from the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct NodeArgs {
    /// Node identifier.
    #[arg(long)]
    pub node_id: Option<String>,

    /// Address to listen on.
    #[arg(long)]
    pub listen: Option<String>,

    /// URL peers use to reach this node.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Registry URL to connect to.
    #[arg(long)]
    pub registry: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a registry node.
    Registry {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Run a broker node attached to a registry.
    Broker {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Run a demo provider publishing a `ticks` stream.
    Provider {
        #[command(flatten)]
        node: NodeArgs,

        /// Milliseconds between ticks.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Talk to a broker as a consumer [*].
    Consumer {
        /// Broker URL (overrides `broker_url` from config).
        #[arg(long)]
        broker: Option<String>,

        #[command(subcommand)]
        action: ConsumerCommands,
    },
}

#[derive(Subcommand)]
pub enum ConsumerCommands {
    /// Subscribe to a topic and print each message.
    Watch {
        /// Topic name.
        topic: String,

        /// JSON filter applied by the provider.
        #[arg(long)]
        filter: Option<String>,

        /// Relay messages to this HTTP endpoint instead of printing them.
        #[arg(long)]
        webhook: Option<String>,
    },
    /// Send a command to the broker and print the reply.
    Cmd {
        /// Command name.
        cmd: String,

        /// JSON parameters.
        #[arg(default_value = "null")]
        params: String,

        /// Route to a service instead of the broker itself.
        #[arg(long)]
        service: Option<String>,
    },
    /// Browse the mesh object tree.
    Path {
        /// Slash-separated path, e.g. `Providers/p1/Streams`.
        #[arg(default_value = "")]
        path: String,

        /// Only list child names.
        #[arg(long)]
        list_only: bool,
    },
}
