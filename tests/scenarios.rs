//! End-to-end scenarios (spec §8 S3/S6), exercised against the public
//! API the way `crates/psql2/tests/integration.rs` exercises its crate
//! from outside. S1 (PVE offline capture with stubbed deps) lives in
//! `src/lib.rs`'s own test module, since it needs the `CollectorDeps`
//! injection seam that isn't part of the public API.

use std::path::Path;

use proxsave::config::{CollectorConfig, FlavorKind};
use proxsave::error::CoreError;
use tokio_util::sync::CancellationToken;

/// S3 (extended): an archive encrypted to one recipient decrypts under
/// that recipient's identity and fails under an unrelated one.
#[tokio::test]
async fn encrypted_archive_round_trips_for_its_recipient_only() {
	use proxsave::archive::encrypt::{encrypt_stream, parse_recipients};
	use tokio_util::compat::FuturesAsyncReadCompatExt as _;

	let identity = age::x25519::Identity::generate();
	let other_identity = age::x25519::Identity::generate();
	let recipient = identity.to_public().to_string();

	let plaintext = b"staged tar bytes".to_vec();
	let mut ciphertext = Vec::new();
	let recipients = parse_recipients(&[recipient]).unwrap();
	encrypt_stream(recipients, plaintext.as_slice(), &mut ciphertext).await.unwrap();

	let mut decrypted = Vec::new();
	let mut reader = age::Decryptor::new_async(futures::io::Cursor::new(ciphertext.clone()))
		.await
		.unwrap()
		.decrypt_async(std::iter::once(&identity as &dyn age::Identity))
		.unwrap()
		.compat();
	tokio::io::copy(&mut reader, &mut decrypted).await.unwrap();
	assert_eq!(decrypted, plaintext);

	let wrong_result = age::Decryptor::new_async(futures::io::Cursor::new(ciphertext))
		.await
		.unwrap()
		.decrypt_async(std::iter::once(&other_identity as &dyn age::Identity));
	assert!(wrong_result.is_err(), "decryption must fail for an unrelated identity");
}

/// S6: a pre-cancelled root token makes `collect_all` return a
/// `CoreError::Cancelled` instead of running the pipeline.
#[tokio::test]
async fn collect_all_returns_cancelled_when_token_is_already_cancelled() {
	let root = tempfile::tempdir().unwrap();
	tokio::fs::create_dir_all(root.path().join("etc/pve")).await.unwrap();

	let config = CollectorConfig {
		system_root_prefix: root.path().to_path_buf(),
		dry_run: true,
		..Default::default()
	};

	let cancel = CancellationToken::new();
	cancel.cancel();

	let out_dir = tempfile::tempdir().unwrap();
	let output: &Path = &out_dir.path().join("proxsave-test");

	let result = proxsave::collect_all(config, output, FlavorKind::Pve, cancel).await;
	assert!(result.is_err());
	let report = result.unwrap_err();
	assert!(matches!(report.downcast_ref::<CoreError>(), Some(CoreError::Cancelled)));
	assert_eq!(
		proxsave::exit_code_for(&Err::<proxsave::CollectAllReport, _>(report)),
		2
	);
}
