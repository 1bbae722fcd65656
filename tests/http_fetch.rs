//! Integration tests for the built-in HTTP transport against a local
//! mock server.

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use imgpull::policy::{PolicyOverride, PullPolicy, VerifyMode};
use imgpull::puller::PullError;
use imgpull::{orchestrator, DirStore, HttpFetcher, ImageKind, PullOutcome};

const IMAGE_BODY: &[u8] = b"pretend this is a filesystem image";

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn policy_for(root: &TempDir, verify: VerifyMode) -> PullPolicy {
    PullPolicy::resolve([
        PolicyOverride::ImageRoot(root.path().to_path_buf()),
        PolicyOverride::Verify(verify),
    ])
}

async fn serve(server: &MockServer, url_path: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

async fn run_pull(
    kind: ImageKind,
    url: &str,
    name: Option<&str>,
    policy: &PullPolicy,
) -> Result<PullOutcome, PullError> {
    let store = DirStore::new(&policy.image_root);
    let request = orchestrator::prepare(kind, url, name, policy, &store).unwrap();
    let fetcher = HttpFetcher::new().unwrap();
    let (_tx, rx) = watch::channel(false);
    orchestrator::run(request, &fetcher, rx).await
}

#[tokio::test]
async fn test_downloads_image_and_published_sidecars() {
    let server = MockServer::start().await;
    serve(&server, "/images/disk.raw", IMAGE_BODY).await;
    serve(&server, "/images/disk.nspawn", b"[Exec]\n").await;
    serve(&server, "/images/disk.roothash", b"roothash-data").await;
    // No .roothash.p7s and no .verity published: both must be tolerated.

    let root = TempDir::new().unwrap();
    let policy = policy_for(&root, VerifyMode::No);
    let url = format!("{}/images/disk.raw", server.uri());

    let outcome = run_pull(ImageKind::Raw, &url, None, &policy).await.unwrap();
    assert_eq!(outcome, PullOutcome::Completed);

    assert_eq!(
        std::fs::read(root.path().join("disk.raw")).unwrap(),
        IMAGE_BODY
    );
    assert_eq!(
        std::fs::read(root.path().join("disk.nspawn")).unwrap(),
        b"[Exec]\n"
    );
    assert_eq!(
        std::fs::read(root.path().join("disk.roothash")).unwrap(),
        b"roothash-data"
    );
    assert!(!root.path().join("disk.roothash.p7s").exists());
    assert!(!root.path().join("disk.verity").exists());
}

#[tokio::test]
async fn test_tar_pull_requests_no_verity_sidecars() {
    let server = MockServer::start().await;
    serve(&server, "/foo.tar.xz", IMAGE_BODY).await;
    serve(&server, "/foo.nspawn", b"settings").await;

    let root = TempDir::new().unwrap();
    let policy = policy_for(&root, VerifyMode::No);
    let url = format!("{}/foo.tar.xz", server.uri());

    let outcome = run_pull(ImageKind::Tar, &url, None, &policy).await.unwrap();
    assert_eq!(outcome, PullOutcome::Completed);

    // Local name "foo" resolved from the URL, stored as foo.tar.
    assert_eq!(
        std::fs::read(root.path().join("foo.tar")).unwrap(),
        IMAGE_BODY
    );
    assert_eq!(
        std::fs::read(root.path().join("foo.nspawn")).unwrap(),
        b"settings"
    );

    // The kind mask keeps tar pulls from even asking for verity data.
    let roothash_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().contains("roothash") || r.url.path().contains("verity"))
        .count();
    assert_eq!(roothash_requests, 0);
}

#[tokio::test]
async fn test_checksum_verification_passes() {
    let server = MockServer::start().await;
    serve(&server, "/images/disk.raw", IMAGE_BODY).await;
    let sums = format!("{}  disk.raw\n", sha256_hex(IMAGE_BODY));
    serve(&server, "/images/SHA256SUMS", sums.as_bytes()).await;

    let root = TempDir::new().unwrap();
    let mut policy = policy_for(&root, VerifyMode::Checksum);
    // Keep the test focused on the main image.
    policy.flags = imgpull::PullFlags::NONE;
    let url = format!("{}/images/disk.raw", server.uri());

    let outcome = run_pull(ImageKind::Raw, &url, None, &policy).await.unwrap();
    assert_eq!(outcome, PullOutcome::Completed);
    assert_eq!(
        std::fs::read(root.path().join("disk.raw")).unwrap(),
        IMAGE_BODY
    );
}

#[tokio::test]
async fn test_checksum_mismatch_fails_and_cleans_up() {
    let server = MockServer::start().await;
    serve(&server, "/images/disk.raw", IMAGE_BODY).await;
    let sums = format!("{}  disk.raw\n", sha256_hex(b"different content"));
    serve(&server, "/images/SHA256SUMS", sums.as_bytes()).await;

    let root = TempDir::new().unwrap();
    let mut policy = policy_for(&root, VerifyMode::Checksum);
    policy.flags = imgpull::PullFlags::NONE;
    let url = format!("{}/images/disk.raw", server.uri());

    let err = run_pull(ImageKind::Raw, &url, None, &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, PullError::ChecksumMismatch { .. }));

    // Neither the image nor the staging file may be left behind.
    assert!(!root.path().join("disk.raw").exists());
    assert!(!root.path().join(".pull-disk.raw.tmp").exists());
}

#[tokio::test]
async fn test_missing_checksum_entry_fails_before_download() {
    let server = MockServer::start().await;
    serve(&server, "/images/disk.raw", IMAGE_BODY).await;
    serve(&server, "/images/SHA256SUMS", b"0123abcd  other.raw\n").await;

    let root = TempDir::new().unwrap();
    let mut policy = policy_for(&root, VerifyMode::Checksum);
    policy.flags = imgpull::PullFlags::NONE;
    let url = format!("{}/images/disk.raw", server.uri());

    let err = run_pull(ImageKind::Raw, &url, None, &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, PullError::MissingChecksum { .. }));
    assert!(!root.path().join("disk.raw").exists());
}

#[tokio::test]
async fn test_signature_mode_is_rejected_by_builtin_transport() {
    let server = MockServer::start().await;

    let root = TempDir::new().unwrap();
    let policy = policy_for(&root, VerifyMode::Signature);
    let url = format!("{}/images/disk.raw", server.uri());

    let err = run_pull(ImageKind::Raw, &url, None, &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, PullError::SignatureUnsupported));

    // Rejected before any request went out.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_http_error_on_main_image_fails() {
    let server = MockServer::start().await; // serves 404 for everything

    let root = TempDir::new().unwrap();
    let policy = policy_for(&root, VerifyMode::No);
    let url = format!("{}/images/disk.raw", server.uri());

    let err = run_pull(ImageKind::Raw, &url, None, &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, PullError::Status { status: 404, .. }));
    assert!(!root.path().join("disk.raw").exists());
}

#[tokio::test]
async fn test_explicit_name_renames_download() {
    let server = MockServer::start().await;
    serve(&server, "/images/upstream-build-1234.raw.xz", IMAGE_BODY).await;

    let root = TempDir::new().unwrap();
    let mut policy = policy_for(&root, VerifyMode::No);
    policy.flags = imgpull::PullFlags::NONE;
    let url = format!("{}/images/upstream-build-1234.raw.xz", server.uri());

    let outcome = run_pull(ImageKind::Raw, &url, Some("stable"), &policy)
        .await
        .unwrap();
    assert_eq!(outcome, PullOutcome::Completed);
    assert_eq!(
        std::fs::read(root.path().join("stable.raw")).unwrap(),
        IMAGE_BODY
    );
}
