//! Archiver + manifest (§4.9 C9): builds a tar stream from `tempDir`,
//! pipes it through an external compressor and (optionally) age
//! encryption, and writes the accompanying manifest.
//!
//! Grounded on the teacher's `tokio_tar::Builder` usage in
//! `beyondessential-bestool/crates/bestool/src/actions/tamanu/backup_configs.rs`,
//! generalized to pipe into an external compressor subprocess rather than
//! writing the tar directly to a file.

pub mod compression;
pub mod encrypt;
pub mod manifest;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use miette::{IntoDiagnostic as _, Result};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use walkdir::WalkDir;

use crate::config::{CollectorConfig, CompressionType};

pub use manifest::{load_manifest, ClusterMode, Manifest};

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
	pub archive_path: PathBuf,
	pub archive_size: u64,
	pub sha256: String,
}

/// Builds the archive filename: `<base>` + compressor extension + `.age`
/// when encryption is enabled (§6).
pub fn archive_file_name(base: &str, kind: CompressionType, encrypted: bool) -> String {
	let mut name = format!("{base}{}", compression::archive_extension(kind));
	if encrypted {
		name.push_str(".age");
	}
	name
}

#[instrument(level = "info", skip(config, cancel))]
pub async fn create_archive(
	source_dir: &Path,
	output_path: &Path,
	config: &CollectorConfig,
	cancel: &CancellationToken,
) -> Result<ArchiveOutcome> {
	let resolved = compression::resolve_compression(
		config.compression_type,
		config.compression_level,
		config.compression_mode,
		config.compression_threads,
		|name| crate::collector::look_path(name).is_some(),
	);

	if config.dry_run {
		let estimated_size = estimate_tree_size(source_dir).await;
		info!(path = %output_path.display(), estimated_size, "dry-run: archive not written");
		return Ok(ArchiveOutcome {
			archive_path: output_path.to_path_buf(),
			archive_size: estimated_size,
			sha256: String::new(),
		});
	}

	if let Some(parent) = output_path.parent() {
		tokio::fs::create_dir_all(parent).await.into_diagnostic()?;
	}

	let (tar_read, tar_write) = tokio::io::duplex(64 * 1024);
	let source_dir_owned = source_dir.to_path_buf();
	let tar_task = tokio::spawn(async move { build_tar_stream(&source_dir_owned, tar_write).await });

	let mut output_file = tokio::fs::File::create(output_path).await.into_diagnostic()?;

	let result = if let Some(binary) = compression::binary_name(resolved.kind) {
		pipe_through_compressor(binary, &resolved, config, tar_read, &mut output_file, cancel).await
	} else if config.encrypt_archive {
		let recipients = encrypt::parse_recipients(&config.age_recipients)?;
		encrypt::encrypt_stream(recipients, tar_read, &mut output_file).await
	} else {
		let mut reader = tar_read;
		tokio::io::copy(&mut reader, &mut output_file).await.into_diagnostic().map(|_| ())
	};

	tar_task.await.into_diagnostic()??;
	result?;
	output_file.flush().await.into_diagnostic()?;
	drop(output_file);

	let (size, sha256) = hash_file(output_path).await?;

	Ok(ArchiveOutcome {
		archive_path: output_path.to_path_buf(),
		archive_size: size,
		sha256,
	})
}

async fn pipe_through_compressor(
	binary: &str,
	resolved: &compression::ResolvedCompression,
	config: &CollectorConfig,
	mut tar_read: tokio::io::DuplexStream,
	output_file: &mut tokio::fs::File,
	cancel: &CancellationToken,
) -> Result<()> {
	let argv = compression::build_argv(resolved);
	let mut cmd = tokio::process::Command::new(binary);
	cmd.args(&argv);
	cmd.stdin(Stdio::piped());
	cmd.stdout(Stdio::piped());
	cmd.stderr(Stdio::null());

	let mut child = cmd.spawn().into_diagnostic()?;
	let mut child_stdin = child.stdin.take().expect("stdin piped");
	let child_stdout = child.stdout.take().expect("stdout piped");

	let feed = tokio::spawn(async move {
		let result = tokio::io::copy(&mut tar_read, &mut child_stdin).await;
		let _ = child_stdin.shutdown().await;
		result
	});

	let downstream: Result<()> = if config.encrypt_archive {
		let recipients = encrypt::parse_recipients(&config.age_recipients)?;
		encrypt::encrypt_stream(recipients, child_stdout, output_file).await
	} else {
		let mut reader = child_stdout;
		tokio::io::copy(&mut reader, output_file).await.into_diagnostic().map(|_| ())
	};

	tokio::select! {
		_ = cancel.cancelled() => {
			let _ = child.kill().await;
			Err(miette::miette!("cancelled"))
		}
		status = child.wait() => {
			feed.await.into_diagnostic()?.into_diagnostic()?;
			downstream?;
			let status = status.into_diagnostic()?;
			if !status.success() {
				return Err(miette::miette!("{binary} exited with {:?}", status.code()));
			}
			Ok(())
		}
	}
}

async fn build_tar_stream(source_dir: &Path, writer: tokio::io::DuplexStream) -> Result<()> {
	let mut builder = tokio_tar::Builder::new(writer);

	let mut paths: Vec<PathBuf> = WalkDir::new(source_dir)
		.into_iter()
		.filter_map(|e| e.ok())
		.map(|e| e.path().to_path_buf())
		.filter(|p| p != source_dir)
		.collect();
	paths.sort();

	for path in paths {
		let rel = path.strip_prefix(source_dir).into_diagnostic()?;
		let meta = tokio::fs::symlink_metadata(&path).await.into_diagnostic()?;
		if meta.is_dir() {
			builder.append_dir(rel, &path).await.into_diagnostic()?;
		} else if meta.file_type().is_symlink() {
			let target = tokio::fs::read_link(&path).await.into_diagnostic()?;
			let mut header = tokio_tar::Header::new_gnu();
			header.set_entry_type(tokio_tar::EntryType::Symlink);
			header.set_size(0);
			header.set_path(rel).into_diagnostic()?;
			header.set_link_name(&target).into_diagnostic()?;
			header.set_cksum();
			builder
				.append_link(&mut header, rel, &target)
				.await
				.into_diagnostic()?;
		} else {
			let mut file = tokio::fs::File::open(&path).await.into_diagnostic()?;
			builder.append_file(rel, &mut file).await.into_diagnostic()?;
		}
	}

	builder.finish().await.into_diagnostic()?;
	Ok(())
}

async fn estimate_tree_size(source_dir: &Path) -> u64 {
	let mut total = 0u64;
	for entry in WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
		if let Ok(meta) = entry.metadata() {
			if meta.is_file() {
				total += meta.len();
			}
		}
	}
	total
}

async fn hash_file(path: &Path) -> Result<(u64, String)> {
	let mut file = tokio::fs::File::open(path).await.into_diagnostic()?;
	let mut hasher = Sha256::new();
	let mut buf = [0u8; 64 * 1024];
	let mut total = 0u64;
	loop {
		let n = file.read(&mut buf).await.into_diagnostic()?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		total += n as u64;
	}
	Ok((total, hex::encode(hasher.finalize())))
}

/// Confirms the archive exists, is non-zero, and (for a known
/// compression type) that the external decompressor can read its header.
/// When `encrypted` is set, the archive's outer layer is ciphertext the
/// decompressor can't parse, so the header check is skipped.
pub async fn verify_archive(path: &Path, kind: CompressionType, encrypted: bool) -> Result<()> {
	let meta = tokio::fs::metadata(path).await.into_diagnostic()?;
	if meta.len() == 0 {
		return Err(miette::miette!("archive {} is empty", path.display()));
	}

	if encrypted {
		return Ok(());
	}

	let Some(binary) = compression::binary_name(kind) else {
		return Ok(());
	};
	if crate::collector::look_path(binary).is_none() {
		return Ok(());
	}

	let test_flag = match kind {
		CompressionType::Gzip => "-t",
		CompressionType::Xz => "-t",
		CompressionType::Zstd => "-t",
		CompressionType::None => return Ok(()),
	};

	let output = tokio::process::Command::new(binary)
		.arg(test_flag)
		.arg(path)
		.output()
		.await
		.into_diagnostic()?;

	if !output.status.success() {
		return Err(miette::miette!(
			"archive verification failed: {} {test_flag} {} exited with {:?}",
			binary,
			path.display(),
			output.status.code()
		));
	}
	Ok(())
}

pub async fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
	let (_, actual) = hash_file(path).await?;
	if actual != expected {
		return Err(miette::miette!(
			"checksum mismatch for {}: expected {expected}, got {actual}",
			path.display()
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn archive_file_name_appends_age_suffix_when_encrypted() {
		assert_eq!(
			archive_file_name("proxsave-host", CompressionType::Zstd, true),
			"proxsave-host.tar.zst.age"
		);
		assert_eq!(
			archive_file_name("proxsave-host", CompressionType::None, false),
			"proxsave-host.tar"
		);
	}

	#[tokio::test]
	async fn create_archive_dry_run_never_writes_a_file() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();
		let config = CollectorConfig {
			dry_run: true,
			compression_type: CompressionType::None,
			..Default::default()
		};
		let output = dir.path().join("out.tar");
		let outcome = create_archive(dir.path(), &output, &config, &CancellationToken::new())
			.await
			.unwrap();
		assert!(!output.exists());
		assert_eq!(outcome.archive_size, 5);
	}

	#[tokio::test]
	async fn create_archive_uncompressed_produces_readable_tar() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.txt"), b"hello world").await.unwrap();
		let config = CollectorConfig {
			dry_run: false,
			compression_type: CompressionType::None,
			encrypt_archive: false,
			..Default::default()
		};
		let output_dir = tempfile::tempdir().unwrap();
		let output = output_dir.path().join("out.tar");
		let outcome = create_archive(dir.path(), &output, &config, &CancellationToken::new())
			.await
			.unwrap();
		assert!(output.exists());
		assert!(outcome.archive_size > 0);
		assert_eq!(outcome.sha256.len(), 64);
	}

	#[tokio::test]
	async fn verify_checksum_detects_mismatch() {
		let dir = tempfile::tempdir().unwrap();
		let f = dir.path().join("f.bin");
		tokio::fs::write(&f, b"data").await.unwrap();
		assert!(verify_checksum(&f, "wrong").await.is_err());
		let (_, actual) = hash_file(&f).await.unwrap();
		assert!(verify_checksum(&f, &actual).await.is_ok());
	}
}
