//! `ocifold logout` command - Remove stored registry credentials.

use clap::Args;
use ocifold_runtime::CredentialStore;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server
    pub server: String,
}

pub async fn execute(args: LogoutArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = CredentialStore::open_default()?;
    let removed = store.remove(&args.server)?;

    if removed {
        println!("Removing login credentials for {}", args.server);
    } else {
        println!("Not logged in to {}", args.server);
    }

    Ok(())
}
