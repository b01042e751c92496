use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rolegate-server", version)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Serve,
    Migrate,
    /// Creates the partner if needed, then the organization under it.
    ProvisionOrganization {
        #[arg(long)]
        partner: String,
        #[arg(long)]
        name: String,
    },
    /// Writes the built-in roles and pushes their permissions to the engine.
    SeedRoles,
}
