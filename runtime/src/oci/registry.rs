//! Registry access.
//!
//! [`RegistrySource`] reads a manifest tree through `oci-distribution`.
//! [`RemoteWriter`] uploads flattened layers and pushes rewritten trees over
//! the registry HTTP API in [`super::api`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use oci_spec::image::Descriptor;
use ocifold_core::config::FoldConfig;
use ocifold_core::error::{FoldError, Result};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::api::RegistryApi;
use super::credentials::CredentialStore;
use super::digest::{sha256_file, split_digest, verify};
use super::layer::{LayerContent, StreamLayer};
use super::media::MANIFEST_MEDIA_TYPES;
use super::reference::ImageReference;
use super::source::ImageSource;
use super::tree::{Image, Node};
use super::writer::ImageWriter;

/// Credentials for a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, or anonymous when either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Stored login for `registry`, then the environment, then anonymous.
    pub fn from_credential_store(registry: &str) -> Self {
        let stored = CredentialStore::open_default().and_then(|store| store.get(registry));
        match stored {
            Ok(Some((username, password))) => Self::basic(username, password),
            Ok(None) => Self::from_env(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                Self::from_env()
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    pub(crate) fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    pub(crate) fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Client protocol honouring the configured plain-HTTP registries.
fn client_protocol(config: &FoldConfig) -> ClientProtocol {
    if config.insecure_registries.is_empty() {
        ClientProtocol::Https
    } else {
        ClientProtocol::HttpsExcept(config.insecure_registries.clone())
    }
}

fn new_client(config: &FoldConfig) -> Client {
    Client::new(ClientConfig {
        protocol: client_protocol(config),
        ..Default::default()
    })
}

/// Same repository as `reference`, addressed by `digest`.
fn digest_reference(reference: &ImageReference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry.clone(),
        reference.repository.clone(),
        digest.to_string(),
    )
}

fn layer_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: descriptor.media_type().to_string(),
        digest: descriptor.digest().to_string(),
        size: descriptor.size(),
        ..Default::default()
    }
}

/// Reads a manifest tree from a registry.
pub struct RegistrySource {
    client: Client,
    api: RegistryApi,
    auth: OciRegistryAuth,
    reference: ImageReference,
}

impl RegistrySource {
    pub fn new(reference: ImageReference, auth: &RegistryAuth, config: &FoldConfig) -> Self {
        Self {
            client: new_client(config),
            api: RegistryApi::new(&reference, auth, config).read_only(),
            auth: auth.to_oci_auth(),
            reference,
        }
    }

    async fn pull_raw(&self, reference: &Reference, subject: &str) -> Result<Vec<u8>> {
        let (raw, _) = self
            .client
            .pull_manifest_raw(reference, &self.auth, MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| FoldError::read(subject, e))?;
        Ok(raw.into())
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    async fn resolve(&self) -> Result<Node> {
        tracing::debug!(reference = %self.reference, "Resolving reference");
        let subject = self.reference.to_string();
        let raw = self
            .pull_raw(&self.reference.to_oci_reference()?, &subject)
            .await?;
        if let Some(ref digest) = self.reference.digest {
            verify(&raw, digest)?;
        }
        self.node_from_raw(raw, None, &subject).await
    }

    async fn read_manifest(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let reference = digest_reference(&self.reference, descriptor.digest());
        let raw = self.pull_raw(&reference, descriptor.digest()).await?;
        verify(&raw, descriptor.digest())?;
        Ok(raw)
    }

    async fn read_config(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let reference = self.reference.to_oci_reference()?;
        let mut data = Vec::new();
        self.client
            .pull_blob(&reference, &layer_descriptor(descriptor), &mut data)
            .await
            .map_err(|e| FoldError::read(descriptor.digest(), e))?;
        verify(&data, descriptor.digest())?;
        Ok(data)
    }

    async fn fetch_blob(&self, descriptor: &Descriptor, scratch: &Path) -> Result<PathBuf> {
        let (_, encoded) = split_digest(descriptor.digest())?;
        let path = scratch.join(encoded);
        let reference = self.reference.to_oci_reference()?;

        tracing::debug!(
            digest = %descriptor.digest(),
            size = descriptor.size(),
            "Pulling layer"
        );
        let mut file = tokio::fs::File::create(&path).await?;
        self.client
            .pull_blob(&reference, &layer_descriptor(descriptor), &mut file)
            .await
            .map_err(|e| FoldError::read(descriptor.digest(), e))?;
        file.flush().await?;
        drop(file);

        let check = path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&check))
            .await
            .map_err(|e| FoldError::Other(format!("digest task failed: {}", e)))??;
        if actual.as_str() != descriptor.digest() {
            return Err(FoldError::read(
                descriptor.digest(),
                format!("content digest mismatch (got {})", actual),
            ));
        }
        Ok(path)
    }

    async fn head(&self) -> Result<Descriptor> {
        self.api
            .head_manifest(self.reference.manifest_reference())
            .await
    }
}

/// Uploads layers to a repository and pushes finished trees.
///
/// Blob uploads happen as the engine produces layers. Images are not pushed
/// on commit; [`RemoteWriter::push_tree`] pushes the whole result once the
/// flatten finishes.
pub struct RemoteWriter {
    api: RegistryApi,
    uploaded: Mutex<HashSet<String>>,
}

impl RemoteWriter {
    pub fn new(repository: &ImageReference, auth: &RegistryAuth, config: &FoldConfig) -> Self {
        Self {
            api: RegistryApi::new(repository, auth, config),
            uploaded: Mutex::new(HashSet::new()),
        }
    }

    fn is_uploaded(&self, digest: &str) -> bool {
        self.uploaded.lock().contains(digest)
    }

    async fn push_blob(&self, data: &[u8], digest: &str) -> Result<()> {
        if self.is_uploaded(digest) {
            return Ok(());
        }
        self.api.push_blob(data, digest).await?;
        self.uploaded.lock().insert(digest.to_string());
        tracing::debug!(digest, size = data.len(), "Uploaded blob");
        Ok(())
    }

    async fn push_blob_file(&self, path: &Path, digest: &str) -> Result<()> {
        if self.is_uploaded(digest) {
            return Ok(());
        }
        self.api.push_blob_file(path, digest).await?;
        self.uploaded.lock().insert(digest.to_string());
        tracing::debug!(digest, path = %path.display(), "Uploaded layer");
        Ok(())
    }

    async fn push_manifest(&self, node: &Node, reference: &ImageReference) -> Result<()> {
        self.api
            .push_manifest(
                reference.manifest_reference(),
                node.media_type(),
                node.raw_manifest(),
            )
            .await
            .map_err(|e| FoldError::Push {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;
        tracing::info!(reference = %reference, digest = %node.digest(), "Pushed manifest");
        Ok(())
    }

    async fn push_image(&self, img: &Image) -> Result<()> {
        self.push_blob(img.raw_config(), img.config_descriptor().digest())
            .await?;
        for layer in img.layers() {
            if let LayerContent::Spooled(_) = layer.content() {
                if let Some(path) = layer.local_path() {
                    self.push_blob_file(path, layer.digest()).await?;
                }
            }
        }
        Ok(())
    }

    /// Push `node` and everything below it. Index children are pushed by
    /// digest before the index itself.
    pub fn push_tree<'a>(
        &'a self,
        node: &'a Node,
        reference: &'a ImageReference,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match node {
                Node::Image(img) => self.push_image(img).await?,
                Node::Index(idx) => {
                    for child in idx.children() {
                        let by_digest = reference.with_digest(child.digest());
                        self.push_tree(child, &by_digest).await?;
                    }
                }
            }
            self.push_manifest(node, reference).await
        }
        .boxed()
    }
}

#[async_trait]
impl ImageWriter for RemoteWriter {
    async fn upload_layer(&self, layer: &mut StreamLayer) -> Result<()> {
        layer.consume().await?;
        let digest = layer.digest()?.to_string();
        self.push_blob_file(layer.path()?, &digest).await
    }

    async fn commit_image(&self, _image: &Image) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::flatten::{FlattenOptions, Flattener};
    use crate::oci::fold::destination_references;
    use crate::oci::layout::LayoutSource;
    use crate::oci::testutil::LayoutFixture;
    use httpmock::prelude::*;
    use httpmock::Mock;
    use std::panic;
    use tempfile::TempDir;

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(auth.is_anonymous());
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("robot", "token");
        assert!(!auth.is_anonymous());
        match auth.to_oci_auth() {
            OciRegistryAuth::Basic(u, p) => {
                assert_eq!(u, "robot");
                assert_eq!(p, "token");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[test]
    fn test_client_protocol() {
        let config = FoldConfig::default();
        assert!(matches!(client_protocol(&config), ClientProtocol::Https));

        let config = FoldConfig {
            insecure_registries: vec!["localhost:5000".to_string()],
            ..Default::default()
        };
        match client_protocol(&config) {
            ClientProtocol::HttpsExcept(hosts) => assert_eq!(hosts, vec!["localhost:5000"]),
            _ => panic!("expected HttpsExcept"),
        }
    }

    #[test]
    fn test_digest_reference() {
        let r = ImageReference::parse("registry.example/team/app:v1").unwrap();
        let digest = format!("sha256:{:064x}", 1);
        let oci = digest_reference(&r, &digest);
        assert_eq!(oci.registry(), "registry.example");
        assert_eq!(oci.repository(), "team/app");
        assert_eq!(oci.digest(), Some(digest.as_str()));
    }

    #[test]
    fn test_layer_descriptor() {
        let desc = Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar+gzip".into(),
            12,
            "sha256:abc",
        );
        let oci = layer_descriptor(&desc);
        assert_eq!(oci.digest, "sha256:abc");
        assert_eq!(oci.size, 12);
        assert_eq!(oci.media_type, "application/vnd.oci.image.layer.v1.tar+gzip");
    }

    #[tokio::test]
    async fn test_remote_writer_commit_is_noop() {
        let repo = ImageReference::parse("registry.invalid/app").unwrap();
        let writer = RemoteWriter::new(&repo, &RegistryAuth::anonymous(), &FoldConfig::default());
        let img = Image::empty(crate::oci::media::MediaFamily::Oci).unwrap();
        writer.commit_image(&img).await.unwrap();
        assert!(!writer.is_uploaded(img.digest()));
    }

    fn start_server() -> Option<MockServer> {
        panic::catch_unwind(MockServer::start).ok()
    }

    /// Writer for `<server>/app:flat` over plain HTTP.
    fn writer_for(server: &MockServer) -> (RemoteWriter, ImageReference) {
        let registry = server.address().to_string();
        let reference = ImageReference::parse(&format!("{}/app:flat", registry)).unwrap();
        let config = FoldConfig {
            insecure_registries: vec![registry],
            ..Default::default()
        };
        let writer = RemoteWriter::new(&reference, &RegistryAuth::anonymous(), &config);
        (writer, reference)
    }

    /// Upload session start and finish. Blob existence checks fall through to
    /// the server's default 404.
    fn upload_mocks(server: &MockServer) -> (Mock<'_>, Mock<'_>) {
        let start = server.mock(|when, then| {
            when.method(POST).path("/v2/app/blobs/uploads/");
            then.status(202)
                .header("Location", "/v2/app/blobs/uploads/session");
        });
        let finish = server.mock(|when, then| {
            when.method(PUT).path("/v2/app/blobs/uploads/session");
            then.status(201);
        });
        (start, finish)
    }

    fn manifest_mock<'a>(server: &'a MockServer, reference: &str, status: u16) -> Mock<'a> {
        let path = format!("/v2/app/manifests/{}", reference);
        server.mock(|when, then| {
            when.method(PUT).path(path.as_str());
            then.status(status);
        })
    }

    async fn flatten_layout_with(writer: &RemoteWriter, fixture: &LayoutFixture) -> Node {
        let source = LayoutSource::open(fixture.root()).unwrap();
        let root = source.resolve().await.unwrap();
        Flattener::new(&source, writer, FlattenOptions::default())
            .flatten(&root)
            .await
            .unwrap()
    }

    fn two_platforms(dir: &TempDir) -> LayoutFixture {
        let fixture = LayoutFixture::new(dir.path());
        let amd = fixture.image(&[&[("a", "1")], &[("b", "2")]], "linux/amd64");
        let arm = fixture.image(&[&[("c", "3")]], "linux/arm64");
        fixture.finish(vec![amd, arm]);
        fixture
    }

    #[tokio::test]
    async fn test_push_tree_uploads_blobs_then_children_then_index() {
        let Some(server) = start_server() else {
            eprintln!("skipping: unable to bind mock server in this environment");
            return;
        };
        let dir = TempDir::new().unwrap();
        let fixture = two_platforms(&dir);
        let (start, finish) = upload_mocks(&server);
        let (writer, reference) = writer_for(&server);

        let flat = flatten_layout_with(&writer, &fixture).await;
        // Layers are uploaded while flattening.
        assert_eq!(start.hits(), 2);
        assert_eq!(finish.hits(), 2);

        let Node::Index(idx) = &flat else {
            panic!("expected an index");
        };
        let children: Vec<_> = idx
            .children()
            .iter()
            .map(|child| manifest_mock(&server, child.digest(), 201))
            .collect();
        let index = manifest_mock(&server, "flat", 201);

        writer.push_tree(&flat, &reference).await.unwrap();
        // One config blob per image, then every manifest once.
        assert_eq!(start.hits(), 4);
        assert_eq!(finish.hits(), 4);
        for child in &children {
            child.assert();
        }
        index.assert();
    }

    #[tokio::test]
    async fn test_push_tree_stops_before_parent_when_child_fails() {
        let Some(server) = start_server() else {
            eprintln!("skipping: unable to bind mock server in this environment");
            return;
        };
        let dir = TempDir::new().unwrap();
        let fixture = two_platforms(&dir);
        let (_start, _finish) = upload_mocks(&server);
        let (writer, reference) = writer_for(&server);
        let flat = flatten_layout_with(&writer, &fixture).await;

        let Node::Index(idx) = &flat else {
            panic!("expected an index");
        };
        let first = idx.children()[0].digest().to_string();
        let rejected = manifest_mock(&server, &first, 500);
        let index = manifest_mock(&server, "flat", 201);

        let err = writer.push_tree(&flat, &reference).await.unwrap_err();
        match err {
            FoldError::Push { reference, .. } => assert!(reference.ends_with(&first)),
            other => panic!("unexpected {:?}", other),
        }
        rejected.assert();
        assert_eq!(index.hits(), 0);
    }

    #[tokio::test]
    async fn test_push_image_uploads_config_before_manifest() {
        let Some(server) = start_server() else {
            eprintln!("skipping: unable to bind mock server in this environment");
            return;
        };
        let dir = TempDir::new().unwrap();
        let fixture = LayoutFixture::new(dir.path());
        let image = fixture.image(&[&[("a", "1")]], "linux/amd64");
        fixture.finish(vec![image]);
        let (mut start, _finish) = upload_mocks(&server);
        let (writer, reference) = writer_for(&server);
        let flat = flatten_layout_with(&writer, &fixture).await;

        start.delete();
        let refused = server.mock(|when, then| {
            when.method(POST).path("/v2/app/blobs/uploads/");
            then.status(500);
        });
        let Node::Index(idx) = &flat else {
            panic!("expected an index");
        };
        let child = &idx.children()[0];
        let manifest = manifest_mock(&server, child.digest(), 201);

        let err = writer
            .push_tree(child, &reference.with_digest(child.digest()))
            .await
            .unwrap_err();
        assert!(matches!(err, FoldError::Upload { .. }));
        refused.assert();
        assert_eq!(manifest.hits(), 0);
    }

    #[tokio::test]
    async fn test_digest_destination_pushes_by_new_digest() {
        let Some(server) = start_server() else {
            eprintln!("skipping: unable to bind mock server in this environment");
            return;
        };
        let dir = TempDir::new().unwrap();
        let fixture = LayoutFixture::new(dir.path());
        let image = fixture.image(&[&[("a", "1")], &[("a", "2")]], "linux/amd64");
        fixture.finish(vec![image]);
        let (_start, _finish) = upload_mocks(&server);
        let (writer, reference) = writer_for(&server);
        let flat = flatten_layout_with(&writer, &fixture).await;

        let old = format!("sha256:{}", "ab".repeat(32));
        let src = reference.with_digest(old.as_str());
        let (push, reported) = destination_references(&src, &reference, flat.digest());
        let by_digest = manifest_mock(&server, flat.digest(), 201);
        let Node::Index(idx) = &flat else {
            panic!("expected an index");
        };
        let children: Vec<_> = idx
            .children()
            .iter()
            .map(|child| manifest_mock(&server, child.digest(), 201))
            .collect();
        let tag = manifest_mock(&server, "flat", 201);

        writer.push_tree(&flat, &push).await.unwrap();
        by_digest.assert();
        children[0].assert();
        assert_eq!(tag.hits(), 0);
        assert_eq!(reported.digest.as_deref(), Some(flat.digest()));
    }
}
