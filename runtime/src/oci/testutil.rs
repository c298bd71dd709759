//! On-disk layout fixtures for tests.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use super::digest::sha256_digest;
use super::media::{MediaFamily, OCI_INDEX};

/// Builds an OCI layout blob by blob. Descriptors are plain JSON values.
pub struct LayoutFixture {
    root: PathBuf,
}

impl LayoutFixture {
    pub fn new(root: &Path) -> Self {
        std::fs::create_dir_all(root.join("blobs").join("sha256")).unwrap();
        std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob(&self, data: &[u8]) -> String {
        let digest = sha256_digest(data);
        let hex = digest.trim_start_matches("sha256:");
        std::fs::write(self.root.join("blobs").join("sha256").join(hex), data).unwrap();
        digest
    }

    /// Gzipped tar layer. Returns its descriptor and diff-ID.
    pub fn layer(&self, files: &[(&str, &str)], family: MediaFamily) -> (Value, String) {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(body.len() as u64);
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        let diff_id = sha256_digest(&tar);

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&tar).unwrap();
        let compressed = gz.finish().unwrap();
        let digest = self.blob(&compressed);

        let desc = json!({
            "mediaType": family.layer(),
            "digest": digest,
            "size": compressed.len(),
        });
        (desc, diff_id)
    }

    /// OCI image for `platform` (`os/arch[/variant]`).
    pub fn image(&self, layers: &[&[(&str, &str)]], platform: &str) -> Value {
        self.image_with(layers, platform, MediaFamily::Oci, &[])
    }

    pub fn image_with(
        &self,
        layers: &[&[(&str, &str)]],
        platform: &str,
        family: MediaFamily,
        annotations: &[(&str, &str)],
    ) -> Value {
        let mut parts = platform.split('/');
        let mut config = json!({
            "os": parts.next().unwrap_or("linux"),
            "architecture": parts.next().unwrap_or("amd64"),
            "config": { "Env": ["PATH=/usr/bin"] },
        });
        if let Some(variant) = parts.next() {
            config["variant"] = json!(variant);
        }
        self.build_image(layers, config, family, annotations)
    }

    /// Image around a caller supplied config. `rootfs` and `history` are
    /// filled in from `layers`; the descriptor platform comes from the config.
    pub fn image_with_config(
        &self,
        layers: &[&[(&str, &str)]],
        config: Value,
        family: MediaFamily,
    ) -> Value {
        self.build_image(layers, config, family, &[])
    }

    fn build_image(
        &self,
        layers: &[&[(&str, &str)]],
        mut config: Value,
        family: MediaFamily,
        annotations: &[(&str, &str)],
    ) -> Value {
        let mut layer_descs = Vec::new();
        let mut diff_ids = Vec::new();
        let mut history = Vec::new();
        for (i, files) in layers.iter().enumerate() {
            let (desc, diff_id) = self.layer(files, family);
            layer_descs.push(desc);
            diff_ids.push(diff_id);
            history.push(json!({ "created_by": format!("step {}", i + 1) }));
        }
        config["rootfs"] = json!({ "type": "layers", "diff_ids": diff_ids });
        config["history"] = json!(history);

        let mut platform = json!({ "os": config["os"], "architecture": config["architecture"] });
        if let Some(variant) = config.get("variant") {
            platform["variant"] = variant.clone();
        }

        let config = serde_json::to_vec(&config).unwrap();
        let config_digest = self.blob(&config);

        let mut manifest = json!({
            "schemaVersion": 2,
            "mediaType": family.manifest(),
            "config": {
                "mediaType": family.config(),
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layer_descs,
        });
        if !annotations.is_empty() {
            manifest["annotations"] = annotation_map(annotations);
        }
        let manifest = serde_json::to_vec(&manifest).unwrap();
        let digest = self.blob(&manifest);

        json!({
            "mediaType": family.manifest(),
            "digest": digest,
            "size": manifest.len(),
            "platform": platform,
        })
    }

    /// Attestation-style manifest with platform `unknown/unknown`.
    pub fn attestation(&self) -> Value {
        let mut desc = self.image(&[&[("statement.json", "{}")]], "unknown/unknown");
        desc["annotations"] = json!({ "vnd.docker.reference.type": "attestation-manifest" });
        desc
    }

    /// Nested index blob. `media_type` of `None` leaves it out of the body.
    pub fn index(
        &self,
        children: Vec<Value>,
        media_type: Option<&str>,
        annotations: &[(&str, &str)],
    ) -> Value {
        let mut body = json!({ "schemaVersion": 2, "manifests": children });
        if let Some(mt) = media_type {
            body["mediaType"] = json!(mt);
        }
        if !annotations.is_empty() {
            body["annotations"] = annotation_map(annotations);
        }
        let raw = serde_json::to_vec(&body).unwrap();
        let digest = self.blob(&raw);
        json!({
            "mediaType": media_type.unwrap_or(OCI_INDEX),
            "digest": digest,
            "size": raw.len(),
        })
    }

    /// A chain of `depth` indices ending in `leaf`. Returns the outermost descriptor.
    pub fn nested(&self, depth: usize, leaf: Value) -> Value {
        let mut desc = leaf;
        for _ in 0..depth {
            desc = self.index(vec![desc], Some(OCI_INDEX), &[]);
        }
        desc
    }

    /// Write `index.json`.
    pub fn finish(&self, manifests: Vec<Value>) {
        self.finish_with(manifests, None, &[]);
    }

    pub fn finish_with(
        &self,
        manifests: Vec<Value>,
        media_type: Option<&str>,
        annotations: &[(&str, &str)],
    ) {
        let mut body = json!({ "schemaVersion": 2, "manifests": manifests });
        if let Some(mt) = media_type {
            body["mediaType"] = json!(mt);
        }
        if !annotations.is_empty() {
            body["annotations"] = annotation_map(annotations);
        }
        std::fs::write(
            self.root.join("index.json"),
            serde_json::to_vec_pretty(&body).unwrap(),
        )
        .unwrap();
    }
}

fn annotation_map(annotations: &[(&str, &str)]) -> Value {
    Value::Object(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect(),
    )
}
