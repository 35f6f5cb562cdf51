use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use secpol_common::{PolicyError, PolicyResult};
use secpol_oci::image::media_types;
use secpol_oci::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::credentials::RegistryCredential;
use crate::layer::LayerBlob;
use crate::reference::ImageReference;
use crate::source::{ImageHandle, ImageSource};

/// Registry client speaking the distribution v2 API.
pub struct RegistryClient {
    client: Client,
    platform: Platform,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

impl RegistryClient {
    /// Create a client resolving multi-platform images to `platform`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Network`] if the HTTP client cannot be built.
    pub fn new(platform: Platform) -> PolicyResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("secpol/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PolicyError::Network {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self { client, platform })
    }

    /// Platform picked from multi-platform indexes.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }
}

#[async_trait]
impl ImageSource for RegistryClient {
    async fn resolve(
        &self,
        reference: &str,
        credential: &RegistryCredential,
    ) -> PolicyResult<Box<dyn ImageHandle>> {
        let image_ref = ImageReference::parse(reference)?;
        tracing::debug!(
            reference = %image_ref,
            credential = credential.kind(),
            "Resolving image"
        );

        let mut session = RegistrySession::new(self.client.clone(), &image_ref, credential);
        let manifest = session.manifest(&self.platform).await?;

        let config_bytes = session.blob(&manifest.config).await?;
        let config: ImageConfig =
            serde_json::from_slice(&config_bytes).map_err(|e| PolicyError::Registry {
                message: format!("Failed to parse image config of {image_ref}: {e}"),
            })?;

        tracing::info!(
            reference = %image_ref,
            layers = manifest.layers.len(),
            "Image resolved"
        );

        Ok(Box::new(RemoteImage {
            reference: image_ref.full_reference(),
            session,
            config,
            layers: manifest.layers,
        }))
    }
}

/// Connection state for one repository.
struct RegistrySession {
    client: Client,
    base_url: String,
    registry: String,
    repository: String,
    reference: ImageReference,
    credential: RegistryCredential,
    authorization: Option<String>,
}

impl RegistrySession {
    fn new(client: Client, reference: &ImageReference, credential: &RegistryCredential) -> Self {
        // Registry tokens are sent up front; basic credentials wait for a challenge.
        let authorization = match credential {
            RegistryCredential::Bearer { .. } => credential.authorization(),
            RegistryCredential::Anonymous | RegistryCredential::Basic { .. } => None,
        };

        Self {
            client,
            base_url: reference.api_base(),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            reference: reference.clone(),
            credential: credential.clone(),
            authorization,
        }
    }

    async fn manifest(&mut self, platform: &Platform) -> PolicyResult<ImageManifest> {
        let tag = self.reference.reference.as_str().to_string();
        match self.fetch_manifest(&tag).await? {
            Manifest::Image(manifest) => Ok(manifest),
            Manifest::Index(index) => {
                let chosen = index.find_platform(platform).ok_or_else(|| {
                    PolicyError::ImageNotFound {
                        reference: format!("{} ({platform})", self.reference),
                    }
                })?;
                let digest = chosen.descriptor.digest.clone();
                tracing::debug!(digest = %digest, platform = %platform, "Selected platform manifest");

                match self.fetch_manifest(&digest).await? {
                    Manifest::Image(manifest) => Ok(manifest),
                    Manifest::Index(_) => Err(PolicyError::Registry {
                        message: format!("Nested image index at {digest}"),
                    }),
                }
            }
        }
    }

    async fn fetch_manifest(&mut self, tag_or_digest: &str) -> PolicyResult<Manifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repository, tag_or_digest
        );
        tracing::debug!(url = %url, "Getting manifest");

        let response = self
            .get(&url, Some(&media_types::accepted_manifests()))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PolicyError::ImageNotFound {
                reference: self.reference.full_reference(),
            });
        }
        if !response.status().is_success() {
            return Err(PolicyError::Registry {
                message: format!("Registry error: {} for {url}", response.status()),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        let body = response.bytes().await.map_err(|e| PolicyError::Network {
            message: format!("Failed to read manifest body: {e}"),
        })?;

        if tag_or_digest.contains(':') {
            verify_digest(tag_or_digest, &body)?;
        }

        Manifest::parse(&content_type, &body)
    }

    async fn open_blob(&self, descriptor: &Descriptor) -> PolicyResult<Response> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, self.repository, descriptor.digest
        );
        tracing::debug!(url = %url, size = descriptor.size, "Getting blob");

        let response = self.denied_to_error(self.send(&url, None).await?, &url)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PolicyError::Registry {
                message: format!("Blob {} not found in {}", descriptor.digest, self.repository),
            });
        }
        if !response.status().is_success() {
            return Err(PolicyError::Registry {
                message: format!("Registry error: {} for {url}", response.status()),
            });
        }

        Ok(response)
    }

    /// Small blobs (image configs), held in memory.
    async fn blob(&self, descriptor: &Descriptor) -> PolicyResult<Bytes> {
        let response = self.open_blob(descriptor).await?;
        let bytes = response.bytes().await.map_err(|e| PolicyError::Network {
            message: format!("Failed to read blob body: {e}"),
        })?;

        verify_digest(&descriptor.digest, &bytes)?;
        Ok(bytes)
    }

    /// Stream a layer blob into a temporary file, hashing it on the way.
    async fn spool_blob(&self, descriptor: &Descriptor) -> PolicyResult<NamedTempFile> {
        let mut response = self.open_blob(descriptor).await?;
        let mut file = NamedTempFile::new()?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(|e| PolicyError::Network {
            message: format!("Failed to read blob body: {e}"),
        })? {
            hasher.update(&chunk);
            file.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        file.flush()?;

        check_digest(&descriptor.digest, &hex::encode(hasher.finalize()))?;
        tracing::debug!(digest = %descriptor.digest, bytes = written, "Blob spooled");
        Ok(file)
    }

    /// GET with one round of challenge handling.
    async fn get(&mut self, url: &str, accept: Option<&str>) -> PolicyResult<Response> {
        let response = self.send(url, accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.denied_to_error(response, url);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.authenticate(challenge.as_deref()).await?;

        let response = self.send(url, accept).await?;
        self.denied_to_error(response, url)
    }

    async fn send(&self, url: &str, accept: Option<&str>) -> PolicyResult<Response> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        request.send().await.map_err(|e| PolicyError::Network {
            message: format!("Failed to request {url}: {e}"),
        })
    }

    fn denied_to_error(&self, response: Response, url: &str) -> PolicyResult<Response> {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PolicyError::Auth {
                registry: self.registry.clone(),
                message: format!("{} for {url}", response.status()),
            }),
            _ => Ok(response),
        }
    }

    async fn authenticate(&mut self, challenge: Option<&str>) -> PolicyResult<()> {
        let header = challenge.ok_or_else(|| PolicyError::Auth {
            registry: self.registry.clone(),
            message: "401 without a usable WWW-Authenticate header".to_string(),
        })?;

        tracing::debug!(header, "Authenticating");
        let (scheme, params) = parse_challenge(header);

        if scheme.eq_ignore_ascii_case("basic") {
            return match &self.credential {
                RegistryCredential::Basic { .. } => {
                    self.authorization = self.credential.authorization();
                    Ok(())
                }
                _ => Err(PolicyError::Auth {
                    registry: self.registry.clone(),
                    message: "registry requires a username and password".to_string(),
                }),
            };
        }

        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(PolicyError::Auth {
                registry: self.registry.clone(),
                message: format!("unsupported authentication scheme '{scheme}'"),
            });
        }

        if matches!(self.credential, RegistryCredential::Bearer { .. }) {
            return Err(PolicyError::Auth {
                registry: self.registry.clone(),
                message: "registry rejected the bearer token".to_string(),
            });
        }

        let realm = params.get("realm").ok_or_else(|| PolicyError::Auth {
            registry: self.registry.clone(),
            message: "missing realm in WWW-Authenticate".to_string(),
        })?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));

        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        tracing::debug!(realm = %realm, "Requesting token");
        let mut request = self.client.get(realm).query(&query);
        if let RegistryCredential::Basic { username, password } = &self.credential {
            request = request.basic_auth(username, Some(password));
        }

        let token_response = request.send().await.map_err(|e| PolicyError::Network {
            message: format!("Failed to request token: {e}"),
        })?;

        if matches!(
            token_response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(PolicyError::Auth {
                registry: self.registry.clone(),
                message: format!("token endpoint returned {}", token_response.status()),
            });
        }
        if !token_response.status().is_success() {
            return Err(PolicyError::Registry {
                message: format!("Token endpoint error: {}", token_response.status()),
            });
        }

        let token: TokenResponse = token_response.json().await.map_err(|e| PolicyError::Registry {
            message: format!("Failed to parse token response: {e}"),
        })?;

        let token = token
            .token
            .or(token.access_token)
            .ok_or_else(|| PolicyError::Registry {
                message: "No token in response".to_string(),
            })?;

        self.authorization = Some(format!("Bearer {token}"));
        Ok(())
    }
}

enum Manifest {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl Manifest {
    fn parse(content_type: &str, body: &[u8]) -> PolicyResult<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| PolicyError::Registry {
                message: format!("Failed to parse manifest: {e}"),
            })?;

        let media_type = value
            .get("mediaType")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(content_type);

        let parsed = if media_types::is_index(media_type) || value.get("manifests").is_some() {
            serde_json::from_value(value).map(Self::Index)
        } else {
            serde_json::from_value(value).map(Self::Image)
        };

        parsed.map_err(|e| PolicyError::Registry {
            message: format!("Failed to parse manifest: {e}"),
        })
    }
}

/// A resolved remote image.
struct RemoteImage {
    reference: String,
    session: RegistrySession,
    config: ImageConfig,
    layers: Vec<Descriptor>,
}

#[async_trait]
impl ImageHandle for RemoteImage {
    fn reference(&self) -> &str {
        &self.reference
    }

    fn config(&self) -> &ImageConfig {
        &self.config
    }

    fn layers(&self) -> &[Descriptor] {
        &self.layers
    }

    async fn fetch_layer(&self, index: usize) -> PolicyResult<LayerBlob> {
        let descriptor = self.layers.get(index).ok_or_else(|| PolicyError::Internal {
            message: format!(
                "Layer {index} requested but {} has {} layers",
                self.reference,
                self.layers.len()
            ),
        })?;

        let file = self.session.spool_blob(descriptor).await?;
        Ok(LayerBlob::spooled(descriptor.clone(), file)?)
    }
}

/// Check `data` against a `sha256:<hex>` digest.
fn verify_digest(expected: &str, data: &[u8]) -> PolicyResult<()> {
    check_digest(expected, &hex::encode(Sha256::digest(data)))
}

/// Compare a computed sha256 hex string with a `sha256:<hex>` digest.
fn check_digest(expected: &str, actual: &str) -> PolicyResult<()> {
    let Some(expected_hex) = expected.strip_prefix("sha256:") else {
        tracing::warn!(digest = expected, "Skipping verification of non-sha256 digest");
        return Ok(());
    };

    if actual != expected_hex {
        return Err(PolicyError::Registry {
            message: format!("Digest mismatch: expected {expected}, got sha256:{actual}"),
        });
    }
    Ok(())
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
///
/// Quoted values may contain commas (`scope="repository:a:pull,push"`).
fn parse_challenge(header: &str) -> (String, HashMap<String, String>) {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.next_if(|c| *c == ',' || c.is_whitespace()).is_some() {}

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }

        params.insert(key, value.trim().to_string());
    }

    (scheme.to_string(), params)
}
