//! Registry HTTP API calls used for pushing and for manifest HEAD requests.
//!
//! Blobs go through the monolithic upload flow (`POST` an upload session, then
//! `PUT` the content with `?digest=`). Spooled layers are streamed from disk.
//! A `401` answer is met with the challenge in `WWW-Authenticate`: a bearer
//! token is fetched from the realm, or basic credentials are attached.

use std::path::Path;

use oci_spec::image::Descriptor;
use ocifold_core::config::FoldConfig;
use ocifold_core::error::{FoldError, Result};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::media::MANIFEST_MEDIA_TYPES;
use super::reference::ImageReference;
use super::registry::RegistryAuth;

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "index.docker.io";
const CONTENT_DIGEST: &str = "docker-content-digest";

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
    },
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let params = challenge_params(params);
        let find = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        };
        Some(Challenge::Bearer {
            realm: find("realm")?,
            service: find("service"),
        })
    }
}

/// `key="value", key=value` pairs. Quoted values may contain commas.
fn challenge_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = rest[eq + 1..].trim_start();
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        out.push((key, value));
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }
    out
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
enum Authorization {
    None,
    Basic,
    Bearer(String),
}

/// Registry API client bound to one repository.
pub struct RegistryApi {
    http: Client,
    base: String,
    registry: String,
    repository: String,
    auth: RegistryAuth,
    actions: &'static str,
    authorization: Mutex<Authorization>,
}

impl RegistryApi {
    /// Plain HTTP is used for registries listed in `insecure_registries`.
    pub fn new(reference: &ImageReference, auth: &RegistryAuth, config: &FoldConfig) -> Self {
        let scheme = if config.is_insecure(&reference.registry) {
            "http"
        } else {
            "https"
        };
        let host = if reference.registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            reference.registry.as_str()
        };
        Self {
            http: Client::new(),
            base: format!("{}://{}", scheme, host),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            auth: auth.clone(),
            actions: "pull,push",
            authorization: Mutex::new(Authorization::None),
        }
    }

    /// Request tokens scoped to `pull` only.
    pub fn read_only(mut self) -> Self {
        self.actions = "pull";
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}/{}", self.base, self.repository, path)
    }

    fn registry_error(&self, message: impl std::fmt::Display) -> FoldError {
        FoldError::Registry {
            registry: self.registry.clone(),
            message: message.to_string(),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &*self.authorization.lock() {
            Authorization::None => request,
            Authorization::Basic => match self.auth.credentials() {
                Some((username, password)) => request.basic_auth(username, Some(password)),
                None => request,
            },
            Authorization::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Send a request, answering one authentication challenge. `build` is
    /// called again for the retry, so the body must be rebuildable.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self
            .authorize(build(&self.http))
            .send()
            .await
            .map_err(|e| self.registry_error(e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| self.registry_error("unauthorized without a usable challenge"))?;
        self.login(challenge).await?;

        self.authorize(build(&self.http))
            .send()
            .await
            .map_err(|e| self.registry_error(e))
    }

    async fn login(&self, challenge: Challenge) -> Result<()> {
        let authorization = match challenge {
            Challenge::Basic => {
                if self.auth.is_anonymous() {
                    return Err(self.registry_error("registry requires credentials"));
                }
                Authorization::Basic
            }
            Challenge::Bearer { realm, service } => {
                let scope = format!("repository:{}:{}", self.repository, self.actions);
                let mut query = vec![("scope", scope)];
                if let Some(service) = service {
                    query.push(("service", service));
                }
                let mut request = self.http.get(&realm).query(&query);
                if let Some((username, password)) = self.auth.credentials() {
                    request = request.basic_auth(username, Some(password));
                }
                let response = request
                    .send()
                    .await
                    .and_then(Response::error_for_status)
                    .map_err(|e| self.registry_error(format!("authentication failed: {}", e)))?;
                let body: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| self.registry_error(format!("invalid token response: {}", e)))?;
                let token = body
                    .token
                    .or(body.access_token)
                    .ok_or_else(|| self.registry_error("token response carries no token"))?;
                tracing::debug!(registry = %self.registry, "Received registry token");
                Authorization::Bearer(token)
            }
        };
        *self.authorization.lock() = authorization;
        Ok(())
    }

    /// Whether the repository already holds `digest`.
    pub async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let url = self.url(&format!("blobs/{}", digest));
        let response = self.send(|http| http.head(&url)).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(self.registry_error(format!("blob check for {} returned {}", digest, other))),
        }
    }

    /// Open an upload session and return its location.
    async fn start_upload(&self, digest: &str) -> Result<String> {
        let url = self.url("blobs/uploads/");
        let response = self
            .send(|http| http.post(&url).header(CONTENT_LENGTH, 0))
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(upload_error(digest, format!("upload start returned {}", response.status())));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| upload_error(digest, "upload start returned no location"))?;
        Ok(self.absolute(location))
    }

    fn absolute(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{}", self.base, location)
        }
    }

    async fn finish_upload(&self, location: &str, digest: &str, size: u64, body: Body) -> Result<()> {
        let separator = if location.contains('?') { '&' } else { '?' };
        let url = format!("{}{}digest={}", location, separator, digest);
        let response = self
            .authorize(self.http.put(&url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| upload_error(digest, e))?;
        if !response.status().is_success() {
            return Err(upload_error(digest, format!("upload returned {}", response.status())));
        }
        Ok(())
    }

    /// Upload an in-memory blob unless the repository already has it.
    pub async fn push_blob(&self, data: &[u8], digest: &str) -> Result<()> {
        if self.blob_exists(digest).await? {
            tracing::debug!(digest, "Blob already present");
            return Ok(());
        }
        let location = self.start_upload(digest).await?;
        self.finish_upload(&location, digest, data.len() as u64, Body::from(data.to_vec()))
            .await
    }

    /// Upload a blob from disk, streaming the file as the request body.
    pub async fn push_blob_file(&self, path: &Path, digest: &str) -> Result<()> {
        if self.blob_exists(digest).await? {
            tracing::debug!(digest, "Blob already present");
            return Ok(());
        }
        let location = self.start_upload(digest).await?;
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        self.finish_upload(&location, digest, size, body).await
    }

    /// `PUT` a manifest under `reference` (a tag or a digest).
    pub async fn push_manifest(&self, reference: &str, media_type: &str, body: &[u8]) -> Result<()> {
        let url = self.url(&format!("manifests/{}", reference));
        let response = self
            .send(|http| {
                http.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(body.to_vec())
            })
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(self.registry_error(format!(
                "manifest {} rejected with {}: {}",
                reference, status, detail
            )));
        }
        Ok(())
    }

    /// Descriptor of a manifest from a `HEAD` request.
    pub async fn head_manifest(&self, reference: &str) -> Result<Descriptor> {
        let url = self.url(&format!("manifests/{}", reference));
        let accept = MANIFEST_MEDIA_TYPES.join(", ");
        let response = self
            .send(|http| http.head(&url).header(ACCEPT, accept.as_str()))
            .await?;
        let subject = format!("{}/{}:{}", self.registry, self.repository, reference);
        if !response.status().is_success() {
            return Err(FoldError::read(subject, format!("HEAD returned {}", response.status())));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let media_type = header("content-type")
            .ok_or_else(|| FoldError::read(&subject, "response has no Content-Type"))?;
        let digest = header(CONTENT_DIGEST)
            .ok_or_else(|| FoldError::read(&subject, "response has no Docker-Content-Digest"))?;
        let size = header("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| FoldError::read(&subject, "response has no Content-Length"))?;
        Ok(Descriptor::new(media_type.as_str().into(), size, digest))
    }
}

fn upload_error(digest: &str, message: impl std::fmt::Display) -> FoldError {
    FoldError::Upload {
        digest: digest.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::media::OCI_MANIFEST;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;
    use serde_json::json;
    use std::panic;

    fn start_server() -> Option<MockServer> {
        panic::catch_unwind(MockServer::start).ok()
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:team/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.example/token".to_string(),
                service: Some("registry.example".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_challenge_variants() {
        assert_eq!(Challenge::parse("Basic realm=\"registry\""), Some(Challenge::Basic));
        assert_eq!(
            Challenge::parse("bearer realm=https://auth.example/token"),
            Some(Challenge::Bearer {
                realm: "https://auth.example/token".to_string(),
                service: None,
            })
        );
        assert_eq!(Challenge::parse("Bearer service=\"x\""), None);
        assert_eq!(Challenge::parse("Negotiate"), None);
    }

    #[test]
    fn test_base_url() {
        let config = FoldConfig {
            insecure_registries: vec!["localhost:5000".to_string()],
            ..Default::default()
        };
        let local = ImageReference::parse("localhost:5000/app:v1").unwrap();
        let api = RegistryApi::new(&local, &RegistryAuth::anonymous(), &config);
        assert_eq!(api.url("manifests/v1"), "http://localhost:5000/v2/app/manifests/v1");

        let hub = ImageReference::parse("alpine").unwrap();
        let api = RegistryApi::new(&hub, &RegistryAuth::anonymous(), &config);
        assert_eq!(
            api.url("blobs/uploads/"),
            "https://index.docker.io/v2/library/alpine/blobs/uploads/"
        );
    }

    #[test]
    fn test_absolute_location() {
        let r = ImageReference::parse("registry.example/app").unwrap();
        let api = RegistryApi::new(&r, &RegistryAuth::anonymous(), &FoldConfig::default());
        assert_eq!(
            api.absolute("/v2/app/blobs/uploads/abc?state=1"),
            "https://registry.example/v2/app/blobs/uploads/abc?state=1"
        );
        assert_eq!(api.absolute("https://cdn.example/up"), "https://cdn.example/up");
    }

    #[tokio::test]
    async fn test_bearer_token_is_used_for_head() {
        let Some(server) = start_server() else {
            eprintln!("skipping: unable to bind mock server in this environment");
            return;
        };
        let registry = server.address().to_string();
        let reference = ImageReference::parse(&format!("{}/app:v1", registry)).unwrap();
        let config = FoldConfig {
            insecure_registries: vec![registry],
            ..Default::default()
        };
        let manifest = br#"{"schemaVersion":2}"#;
        let digest = format!("sha256:{}", "cd".repeat(32));

        let token = server.mock(|when, then| {
            when.method(GET)
                .path("/token")
                .query_param("scope", "repository:app:pull")
                .query_param("service", "registry.test")
                .header("authorization", "Basic cm9ib3Q6c2VjcmV0");
            then.status(200).json_body(json!({ "access_token": "abc" }));
        });
        let head = server.mock(|when, then| {
            when.method(HEAD)
                .path("/v2/app/manifests/v1")
                .header("authorization", "Bearer abc");
            then.status(200)
                .header("content-type", OCI_MANIFEST)
                .header("docker-content-digest", digest.as_str())
                .body(manifest.as_slice());
        });

        let api = RegistryApi::new(&reference, &RegistryAuth::basic("robot", "secret"), &config)
            .read_only();
        api.login(Challenge::Bearer {
            realm: server.url("/token"),
            service: Some("registry.test".to_string()),
        })
        .await
        .unwrap();
        let descriptor = api.head_manifest(reference.manifest_reference()).await.unwrap();

        token.assert();
        head.assert();
        assert_eq!(descriptor.digest(), &digest);
        assert_eq!(descriptor.size(), manifest.len() as i64);
        assert_eq!(descriptor.media_type().to_string(), OCI_MANIFEST);
    }

    #[tokio::test]
    async fn test_basic_challenge_needs_credentials() {
        let r = ImageReference::parse("registry.example/app").unwrap();
        let api = RegistryApi::new(&r, &RegistryAuth::anonymous(), &FoldConfig::default());
        let err = api.login(Challenge::Basic).await.unwrap_err();
        assert!(matches!(err, FoldError::Registry { .. }));
    }
}
