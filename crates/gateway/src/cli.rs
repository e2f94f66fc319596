use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "voxgate", version, about = "Voice-capable conversational agent server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the server (the default when no subcommand is given).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the effective configuration and exit nonzero on errors.
    Validate,
    /// Print the effective configuration (after env overrides) as TOML.
    Show,
}
