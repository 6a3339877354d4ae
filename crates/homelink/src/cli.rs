//! Clap derive structures for the `homelink` CLI.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// homelink -- live telemetry and device control for a homelink server
#[derive(Debug, Parser)]
#[command(
    name = "homelink",
    version,
    about = "Watch telemetry and control devices on a homelink server",
    long_about = "Streams live metrics and device updates over MQTT, falling back to\n\
        the server's event stream when the broker is unreachable. The latest\n\
        reading, recent history and device list are cached locally.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Server base URL (overrides config)
    #[arg(long, short = 's', global = true)]
    pub server: Option<String>,

    /// Username (overrides config)
    #[arg(long, short = 'u', global = true)]
    pub username: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates from the server
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Request timeout in seconds (overrides config)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream live metrics and device updates until interrupted
    Watch(WatchArgs),

    /// Fetch metrics on a fixed interval until interrupted
    Poll(PollArgs),

    /// Show the latest metrics reading
    Latest(CachedArgs),

    /// Show recent metrics history from the local cache
    History(HistoryArgs),

    /// List devices and their state
    Devices(CachedArgs),

    /// Toggle a device on or off
    Toggle(ToggleArgs),

    /// Show server capabilities and local cache state
    Status,

    /// Manage CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Only print status changes, not metrics or device updates
    #[arg(long)]
    pub status_only: bool,
}

#[derive(Debug, Args)]
pub struct PollArgs {
    /// Seconds between fetches (defaults to refresh_interval from config)
    #[arg(long, short = 'i')]
    pub interval: Option<u64>,
}

#[derive(Debug, Args)]
pub struct CachedArgs {
    /// Read from the local cache without contacting the server
    #[arg(long)]
    pub cached: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Maximum number of readings to show, newest last
    #[arg(long, short = 'l', default_value = "50")]
    pub limit: usize,

    /// Delete all cached history instead of showing it
    #[arg(long)]
    pub clear: bool,
}

#[derive(Debug, Args)]
pub struct ToggleArgs {
    /// Device ID
    pub id: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the config file location
    Path,

    /// Display current resolved configuration
    Show,

    /// Store a password in the system keyring
    SetPassword {
        /// User the password belongs to (defaults to the configured username)
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
