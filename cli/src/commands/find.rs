//! `ocifold find` command - Locate a platform's image in an OCI layout.

use std::path::PathBuf;

use clap::Args;
use ocifold_core::{FoldConfig, TargetPlatform};
use ocifold_runtime::read_platform_image;

use crate::output;

#[derive(Args)]
pub struct FindArgs {
    /// OCI layout directory
    pub layout: PathBuf,

    /// Platform as os/arch[/variant] (default from config)
    #[arg(long)]
    pub platform: Option<TargetPlatform>,

    /// Also list the image's layers
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn execute(args: FindArgs, config: &FoldConfig) -> Result<(), Box<dyn std::error::Error>> {
    let platform = args
        .platform
        .unwrap_or_else(|| config.default_platform.clone());
    let image = read_platform_image(&args.layout, &platform, config).await?;
    println!("{}", image.digest());

    if args.verbose {
        let mut table = output::new_table(&["DIGEST", "MEDIA TYPE", "SIZE"]);
        for layer in image.layers() {
            table.add_row([
                output::short_digest(layer.digest(), false),
                layer.media_type().to_string(),
                output::format_bytes(layer.size().max(0) as u64),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}
