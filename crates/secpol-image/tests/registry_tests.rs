//! Registry client tests against a local mock registry.

use std::io::Read;

use mockito::{Matcher, Server, ServerGuard};
use secpol_common::PolicyError;
use secpol_image::{ImageHandle as _, ImageSource, RegistryClient, RegistryCredential};
use secpol_oci::Platform;
use secpol_oci::image::media_types;
use sha2::{Digest, Sha256};

fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

struct Fixture {
    config: Vec<u8>,
    layer: Vec<u8>,
    manifest: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        let config = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Entrypoint": ["/bin/app"], "Cmd": ["--serve"], "WorkingDir": "/srv"},
            "rootfs": {"type": "layers", "diff_ids": []}
        }"#
        .to_vec();
        let layer = b"layer bytes".to_vec();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::MANIFEST,
            "config": {"mediaType": media_types::CONFIG, "digest": digest(&config), "size": config.len()},
            "layers": [{"mediaType": media_types::LAYER_TAR, "digest": digest(&layer), "size": layer.len()}]
        })
        .to_string()
        .into_bytes();

        Self {
            config,
            layer,
            manifest,
        }
    }

    async fn serve_blobs(&self, server: &mut ServerGuard, authorization: Matcher) {
        for blob in [&self.config, &self.layer] {
            server
                .mock("GET", format!("/v2/team/app/blobs/{}", digest(blob)).as_str())
                .match_header("authorization", authorization.clone())
                .with_status(200)
                .with_body(blob.clone())
                .create_async()
                .await;
        }
    }
}

fn client() -> RegistryClient {
    RegistryClient::new(Platform::linux_amd64()).unwrap()
}

#[tokio::test]
async fn resolves_tagged_image_anonymously() {
    let mut server = Server::new_async().await;
    let fixture = Fixture::new();

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(fixture.manifest.clone())
        .create_async()
        .await;
    fixture.serve_blobs(&mut server, Matcher::Missing).await;

    let reference = format!("{}/team/app:v1", server.host_with_port());
    let image = client()
        .resolve(&reference, &RegistryCredential::Anonymous)
        .await
        .unwrap();

    assert_eq!(image.reference(), reference);
    assert_eq!(image.config().default_command(), vec!["/bin/app", "--serve"]);
    assert_eq!(image.config().working_dir(), Some("/srv"));
    assert_eq!(image.layers().len(), 1);

    let layer = image.fetch_layer(0).await.unwrap();
    let mut content = Vec::new();
    layer.uncompressed().unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, fixture.layer);
    assert!(image.fetch_layer(1).await.is_err());
}

#[tokio::test]
async fn missing_manifest_is_image_not_found() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v2/team/app/manifests/nope")
        .with_status(404)
        .create_async()
        .await;

    let reference = format!("{}/team/app:nope", server.host_with_port());
    let err = client()
        .resolve(&reference, &RegistryCredential::Anonymous)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, PolicyError::ImageNotFound { .. }));
}

#[tokio::test]
async fn bearer_challenge_exchanges_basic_credentials_for_a_token() {
    let mut server = Server::new_async().await;
    let fixture = Fixture::new();
    let realm = format!("{}/token", server.url());

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_header(
            "www-authenticate",
            &format!(r#"Bearer realm="{realm}",service="registry.test",scope="repository:team/app:pull""#),
        )
        .create_async()
        .await;

    let token = server
        .mock("GET", "/token")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("service".into(), "registry.test".into()),
            Matcher::UrlEncoded("scope".into(), "repository:team/app:pull".into()),
        ]))
        .match_header("authorization", "Basic dXNlcjpwYXNzMTIz")
        .with_status(200)
        .with_body(r#"{"token": "abc"}"#)
        .expect(1)
        .create_async()
        .await;

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .match_header("authorization", "Bearer abc")
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(fixture.manifest.clone())
        .create_async()
        .await;
    fixture
        .serve_blobs(&mut server, Matcher::Exact("Bearer abc".into()))
        .await;

    let credential = RegistryCredential::from_parts("user", "pass123", "").unwrap();
    let reference = format!("{}/team/app:v1", server.host_with_port());
    let image = client().resolve(&reference, &credential).await.unwrap();

    token.assert_async().await;
    assert!(image.fetch_layer(0).await.is_ok());
}

#[tokio::test]
async fn registry_token_is_sent_directly() {
    let mut server = Server::new_async().await;
    let fixture = Fixture::new();

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .match_header("authorization", "Bearer registry-token")
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(fixture.manifest.clone())
        .create_async()
        .await;
    fixture
        .serve_blobs(&mut server, Matcher::Exact("Bearer registry-token".into()))
        .await;

    let credential = RegistryCredential::from_parts("", "", "registry-token").unwrap();
    let reference = format!("{}/team/app:v1", server.host_with_port());
    assert!(client().resolve(&reference, &credential).await.is_ok());
}

#[tokio::test]
async fn basic_challenge_without_credentials_is_an_auth_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .with_status(401)
        .with_header("www-authenticate", r#"Basic realm="private""#)
        .create_async()
        .await;

    let reference = format!("{}/team/app:v1", server.host_with_port());
    let err = client()
        .resolve(&reference, &RegistryCredential::Anonymous)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, PolicyError::Auth { .. }));
}

#[tokio::test]
async fn index_resolves_to_requested_platform() {
    let mut server = Server::new_async().await;
    let fixture = Fixture::new();
    let manifest_digest = digest(&fixture.manifest);

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::INDEX,
        "manifests": [
            {
                "mediaType": media_types::MANIFEST,
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                "size": 1,
                "platform": {"os": "linux", "architecture": "arm64"}
            },
            {
                "mediaType": media_types::MANIFEST,
                "digest": manifest_digest,
                "size": fixture.manifest.len(),
                "platform": {"os": "linux", "architecture": "amd64"}
            }
        ]
    });

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .with_status(200)
        .with_header("content-type", media_types::INDEX)
        .with_body(index.to_string())
        .create_async()
        .await;
    server
        .mock("GET", format!("/v2/team/app/manifests/{manifest_digest}").as_str())
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(fixture.manifest.clone())
        .create_async()
        .await;
    fixture.serve_blobs(&mut server, Matcher::Missing).await;

    let reference = format!("{}/team/app:v1", server.host_with_port());
    let image = client()
        .resolve(&reference, &RegistryCredential::Anonymous)
        .await
        .unwrap();
    assert_eq!(image.layers()[0].digest, digest(&fixture.layer));
}

#[tokio::test]
async fn tampered_blob_is_rejected() {
    let mut server = Server::new_async().await;
    let fixture = Fixture::new();

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .with_status(200)
        .with_body(fixture.manifest.clone())
        .create_async()
        .await;
    server
        .mock("GET", format!("/v2/team/app/blobs/{}", digest(&fixture.config)).as_str())
        .with_status(200)
        .with_body(b"{}".to_vec())
        .create_async()
        .await;

    let reference = format!("{}/team/app:v1", server.host_with_port());
    let err = client()
        .resolve(&reference, &RegistryCredential::Anonymous)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, PolicyError::Registry { .. }));
}

#[tokio::test]
async fn tampered_layer_is_rejected_while_streaming() {
    let mut server = Server::new_async().await;
    let fixture = Fixture::new();

    server
        .mock("GET", "/v2/team/app/manifests/v1")
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(fixture.manifest.clone())
        .create_async()
        .await;
    server
        .mock("GET", format!("/v2/team/app/blobs/{}", digest(&fixture.config)).as_str())
        .with_status(200)
        .with_body(fixture.config.clone())
        .create_async()
        .await;
    server
        .mock("GET", format!("/v2/team/app/blobs/{}", digest(&fixture.layer)).as_str())
        .with_status(200)
        .with_body(b"layer bytes, altered".to_vec())
        .create_async()
        .await;

    let reference = format!("{}/team/app:v1", server.host_with_port());
    let image = client()
        .resolve(&reference, &RegistryCredential::Anonymous)
        .await
        .unwrap();

    let err = image.fetch_layer(0).await.err().unwrap();
    assert!(matches!(err, PolicyError::Registry { .. }));
}
