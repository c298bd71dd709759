//! CLI command definitions and dispatch.

mod find;
mod flatten;
mod head;
mod login;
mod logout;
mod version;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use ocifold_core::FoldConfig;

/// ocifold - flatten container images to a single layer.
#[derive(Parser)]
#[command(name = "ocifold", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.ocifold/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Flatten an image's layers into a single layer
    Flatten(flatten::FlattenArgs),
    /// Print the descriptor of a remote manifest as JSON
    Head(head::HeadArgs),
    /// Find the image for a platform in an OCI layout
    Find(find::FindArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load `path`, or the default config file when present.
pub(crate) fn load_config(path: Option<&Path>) -> Result<FoldConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => FoldConfig::load(path)?,
        None => FoldConfig::load_default()?,
    };
    config.validate()?;
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(?config, "Loaded configuration");

    match cli.command {
        Command::Flatten(args) => flatten::execute(args, &config).await,
        Command::Head(args) => head::execute(args, &config).await,
        Command::Find(args) => find::execute(args, &config).await,
        Command::Login(args) => login::execute(args).await,
        Command::Logout(args) => logout::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
