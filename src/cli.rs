//! Command-line definitions

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "hypeman",
    author,
    version,
    about = "Copy files to and from hypeman instances and run commands inside them"
)]
pub struct Cli {
    /// API base URL (overrides HYPEMAN_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Append transfer events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Print per-frame debug lines on stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy files/folders between an instance and the local filesystem
    #[command(after_help = CP_EXAMPLES)]
    Cp(CpArgs),
    /// Execute a command in a running instance
    Exec(ExecArgs),
    /// Follow the event stream of a build
    BuildLogs(BuildLogsArgs),
}

const CP_EXAMPLES: &str = "\
Paths are either local (/path, ./path, ../path, ~/path) or <instance>:/path.
Use - as the local path to stream a tar archive on stdin/stdout.

Examples:
  hypeman cp ./local-file.txt myinstance:/app/file.txt
  hypeman cp myinstance:/app/output.txt ./local-output.txt
  hypeman cp ./local-dir/. myinstance:/app/dir
  hypeman cp myinstance:/var/log - | tar -tv";

#[derive(Debug, Args)]
pub struct CpArgs {
    /// Archive mode (copy all uid/gid information)
    #[arg(short = 'a', long)]
    pub archive: bool,

    /// Always follow symbolic links in source
    #[arg(short = 'L', long = "follow-links")]
    pub follow_links: bool,

    /// Suppress progress output during copy
    #[arg(short, long)]
    pub quiet: bool,

    /// Source path
    pub src: String,

    /// Destination path
    pub dst: String,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Enable interactive TTY mode
    #[arg(short = 'i', short_alias = 't', long = "it")]
    pub it: bool,

    /// Disable TTY allocation
    #[arg(short = 'T', long = "no-tty")]
    pub no_tty: bool,

    /// Set environment variable (KEY=VALUE, can be repeated)
    #[arg(short = 'e', long = "env", action = ArgAction::Append)]
    pub env: Vec<String>,

    /// Working directory inside the instance
    #[arg(long)]
    pub cwd: Option<String>,

    /// Execution timeout in seconds (0 = no timeout)
    #[arg(long, default_value_t = 0)]
    pub timeout: u32,

    /// Instance ID, ID prefix or name
    pub instance: String,

    /// Command to run (defaults to the instance shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct BuildLogsArgs {
    /// Build ID
    pub build_id: String,
}
