//! Clap derive structures for the `arcanum` command line.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// arcanum -- one tun2socks interface per proxy, one Sandboxie box per interface
#[derive(Debug, Parser)]
#[command(
    name = "arcanum",
    version,
    about = "Provision proxy interfaces and bind Sandboxie boxes to them",
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

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, env = "ARCANUM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Kill running tunnels and provision one interface per proxy
    Start(StartArgs),

    /// Kill every running tun2socks process
    Stop,

    /// List adapters a box can be bound to
    Adapters(OutputArgs),

    /// List sandboxed application shortcuts by group
    #[command(alias = "ls")]
    Shortcuts(ShortcutsArgs),

    /// Read or change a box's adapter binding
    #[command(subcommand)]
    Binding(BindingCommand),

    /// Open a shortcut through the shell
    Launch {
        /// Path to the .lnk file
        path: PathBuf,
    },

    /// Inspect or edit saved settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Proxy list, one `host:port:user:password` per line
    ///
    /// Without it, piped stdin is read; otherwise the last saved list is used.
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ShortcutsArgs {
    /// Directory holding the shortcuts (remembered for next time)
    pub directory: Option<PathBuf>,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Subcommand)]
pub enum BindingCommand {
    /// Show the adapter a box is bound to ("None" when unbound)
    Get {
        #[arg(value_name = "BOX")]
        box_name: String,
    },

    /// Bind a box to an adapter; "clean" or "None" removes the binding
    Set {
        #[arg(value_name = "BOX")]
        box_name: String,
        adapter: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective settings as TOML
    Show,

    /// Set one of tun2socks, wintun, sandboxie_ini, sbie_ini_exe
    SetPath { name: String, value: String },

    /// Print the settings file location
    Path,
}
