use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Control plane for ephemeral CI build VMs",
    version
)]
pub struct Cli {
    /// Base URL of a running kiln server, for the read/terminate commands.
    #[arg(long, env = "KILN_URL", global = true, default_value = "http://127.0.0.1:7070")]
    pub server: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane: HTTP API plus the scaling and GC workers.
    Serve {
        /// Path to the YAML settings file. Defaults apply when omitted.
        #[arg(long, env = "KILN_CONFIG")]
        config: Option<PathBuf>,
    },

    /// List leases on a running server.
    Leases {
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        host_id: Option<String>,
    },

    /// List registered hosts with their availability.
    Hosts,

    /// Show the recent audit event feed.
    Events {
        #[arg(long)]
        lease_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Flag a lease for termination; the reconciler tears it down.
    Terminate {
        lease_id: String,
        #[arg(long, default_value = "manual_terminate")]
        reason: String,
    },
}
