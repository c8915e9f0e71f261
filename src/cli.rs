use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gsmcord")]
#[command(about = "Discord front-end for LinuxGSM-managed game servers", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Parse the config directory and connect to Discord.
    Run {
        /// Directory holding settings.json, commands.json and servers.json.
        #[arg(long, default_value = "./configs")]
        config_dir: PathBuf,
    },

    /// Validate the config directory and print what would load, then exit.
    Check {
        /// Directory holding settings.json, commands.json and servers.json.
        #[arg(long, default_value = "./configs")]
        config_dir: PathBuf,
    },
}
