//! `ocifold flatten` command - Collapse every image in a tree to one layer.

use std::path::Path;

use clap::Args;
use ocifold_core::FoldConfig;
use ocifold_runtime::{
    flatten_layout, flatten_remote, Format, ImageReference, RegistryAuth, SourceRef,
};

#[derive(Args)]
pub struct FlattenArgs {
    /// Image reference, or layout directory with `--format oci`
    pub source: String,

    /// New tag to apply to the flattened image. Without one, the result is
    /// pushed by digest to the source repository. Destination directory
    /// with `--format oci`.
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Source format (tarball, legacy, oci)
    #[arg(long, default_value = "tarball")]
    pub format: Format,
}

pub async fn execute(
    args: FlattenArgs,
    config: &FoldConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match SourceRef::parse(&args.source, args.format)? {
        SourceRef::Layout(src) => {
            let dst = args.tag.as_deref().map(Path::new);
            let written = flatten_layout(&src, dst, config).await?;
            println!("{}", written.display());
        }
        SourceRef::Registry(src) => {
            let dst = args
                .tag
                .as_deref()
                .map(ImageReference::parse)
                .transpose()?;
            let (src_auth, dst_auth) =
                registry_auths(&src, dst.as_ref(), RegistryAuth::from_credential_store);
            let flat = flatten_remote(&src, dst.as_ref(), &src_auth, &dst_auth, config).await?;
            println!("{}", flat);
        }
    }
    Ok(())
}

/// Credentials for the source registry and for the destination registry.
fn registry_auths(
    src: &ImageReference,
    dst: Option<&ImageReference>,
    lookup: impl Fn(&str) -> RegistryAuth,
) -> (RegistryAuth, RegistryAuth) {
    let src_auth = lookup(&src.registry);
    let dst_auth = match dst {
        Some(dst) if dst.registry != src.registry => lookup(&dst.registry),
        _ => src_auth.clone(),
    };
    (src_auth, dst_auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(registry: &str) -> RegistryAuth {
        match registry {
            "src.example" => RegistryAuth::basic("reader", "r"),
            "dst.example" => RegistryAuth::basic("writer", "w"),
            _ => RegistryAuth::anonymous(),
        }
    }

    #[test]
    fn test_registry_auths_per_registry() {
        let src = ImageReference::parse("src.example/app:v1").unwrap();
        let dst = ImageReference::parse("dst.example/app:flat").unwrap();
        let (src_auth, dst_auth) = registry_auths(&src, Some(&dst), lookup);
        assert_eq!(format!("{:?}", src_auth), format!("{:?}", lookup("src.example")));
        assert_eq!(format!("{:?}", dst_auth), format!("{:?}", lookup("dst.example")));

        let public = ImageReference::parse("alpine").unwrap();
        let (src_auth, dst_auth) = registry_auths(&public, Some(&dst), lookup);
        assert!(src_auth.is_anonymous());
        assert!(!dst_auth.is_anonymous());
    }

    #[test]
    fn test_registry_auths_default_destination() {
        let src = ImageReference::parse("src.example/app:v1").unwrap();
        let (src_auth, dst_auth) = registry_auths(&src, None, lookup);
        assert!(!src_auth.is_anonymous());
        assert_eq!(format!("{:?}", src_auth), format!("{:?}", dst_auth));
    }
}
