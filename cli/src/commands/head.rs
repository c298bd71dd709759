//! `ocifold head` command - Show the descriptor of a remote manifest.

use clap::Args;
use ocifold_core::FoldConfig;
use ocifold_runtime::{ImageReference, RegistryAuth};

#[derive(Args)]
pub struct HeadArgs {
    /// Image reference
    pub reference: String,
}

pub async fn execute(args: HeadArgs, config: &FoldConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.reference)?;
    let auth = RegistryAuth::from_credential_store(&reference.registry);
    let descriptor = ocifold_runtime::head(&reference, &auth, config).await?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}
