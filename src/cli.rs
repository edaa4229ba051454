use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "dockhand",
    version,
    about = "A terminal companion for a local container engine."
)]
pub struct CliArgs {
    /// Engine endpoint (unix:///path, http://host:port or tcp://host:port)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Refresh interval in milliseconds
    #[arg(long, global = true)]
    pub refresh_ms: Option<u64>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List containers
    Ps {
        /// Include stopped containers
        #[arg(short, long)]
        all: bool,
        /// Case-insensitive substring filter
        #[arg(long)]
        filter: Option<String>,
    },
    /// List images
    Images {
        #[arg(long)]
        filter: Option<String>,
    },
    /// List volumes
    Volumes {
        #[arg(long)]
        filter: Option<String>,
    },
    /// List networks
    Networks {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Show engine information
    Info,
    /// Print or follow a container's log
    Logs(LogsArgs),
    /// Follow a container's resource usage
    Stats { id: String },
    Start { id: String },
    Stop {
        id: String,
        /// Seconds to wait before killing
        #[arg(short, long)]
        time: Option<u64>,
    },
    Restart {
        id: String,
        #[arg(short, long)]
        time: Option<u64>,
    },
    Pause { id: String },
    Unpause { id: String },
    /// Remove a container
    Rm {
        id: String,
        #[arg(short, long)]
        force: bool,
        /// Remove anonymous volumes too
        #[arg(short, long)]
        volumes: bool,
    },
    Rename { id: String, name: String },
    /// Snapshot a container into an image
    Commit {
        id: String,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Remove an image
    Rmi {
        id: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Create a container from an image or a YAML config file
    Create(CreateArgs),
    /// Create and start a container
    Run(CreateArgs),
    /// Recreate a container's configuration under a new name
    Copy {
        id: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Open an interactive shell in a running container
    Exec(ExecArgs),
    /// Keep the store refreshed and print a status line on every change
    Watch,
}

#[derive(Debug, Clone, Args)]
pub struct LogsArgs {
    pub id: String,
    #[arg(short, long)]
    pub follow: bool,
    /// Number of lines from the end
    #[arg(long)]
    pub tail: Option<u64>,
    #[arg(short, long)]
    pub timestamps: bool,
    /// Unix timestamp lower bound
    #[arg(long)]
    pub since: Option<i64>,
    /// Demultiplex the engine's framed stdout/stderr stream
    #[arg(long)]
    pub multiplexed: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    /// Image to create from; ignored when --config names an image
    pub image: Option<String>,
    #[arg(long)]
    pub name: Option<String>,
    /// YAML file describing memory, cpus, ports, volumes and environment
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    pub id: String,
    #[arg(long)]
    pub shell: Option<String>,
    /// auto, socket or polling
    #[arg(long)]
    pub mode: Option<String>,
}
