//! Dedup stage (§4.8): replaces byte-identical regular files with
//! relative symlinks to the first-seen copy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use miette::{IntoDiagnostic as _, Result};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::instrument;

const SENSITIVE_PATHS: &[&str] = &["etc/resolv.conf", "etc/hostname", "etc/hosts", "etc/fstab"];

/// Walks `root`, replacing byte-identical duplicates (by streaming
/// SHA-256) with relative symlinks to the first occurrence. Returns the
/// number of files deduplicated.
#[instrument(level = "debug", skip(root))]
pub async fn dedup_tree(root: &Path) -> Result<u64> {
	let mut seen: HashMap<String, PathBuf> = HashMap::new();
	let mut deduped = 0u64;
	let mut stack = vec![root.to_path_buf()];

	while let Some(dir) = stack.pop() {
		let mut entries = tokio::fs::read_dir(&dir).await.into_diagnostic()?;
		while let Some(entry) = entries.next_entry().await.into_diagnostic()? {
			let path = entry.path();
			let file_type = entry.file_type().await.into_diagnostic()?;
			if file_type.is_dir() {
				stack.push(path);
				continue;
			}
			if !file_type.is_file() {
				continue;
			}

			let rel = path.strip_prefix(root).unwrap_or(&path);
			if is_sensitive(rel) {
				continue;
			}

			let meta = tokio::fs::metadata(&path).await.into_diagnostic()?;
			if meta.len() == 0 {
				continue;
			}

			let hash = hash_file(&path).await?;
			match seen.get(&hash) {
				Some(first_path) if first_path != &path => {
					replace_with_symlink(first_path, &path).await?;
					deduped += 1;
				}
				_ => {
					seen.insert(hash, path);
				}
			}
		}
	}

	Ok(deduped)
}

fn is_sensitive(rel: &Path) -> bool {
	let normalized = rel.to_string_lossy().replace('\\', "/");
	SENSITIVE_PATHS.contains(&normalized.as_str())
}

async fn hash_file(path: &Path) -> Result<String> {
	let mut file = tokio::fs::File::open(path).await.into_diagnostic()?;
	let mut hasher = Sha256::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = file.read(&mut buf).await.into_diagnostic()?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hex::encode(hasher.finalize()))
}

async fn replace_with_symlink(first_path: &Path, duplicate: &Path) -> Result<()> {
	let relative_target = relative_path(duplicate.parent().unwrap_or(duplicate), first_path);

	let tmp = {
		let mut name = duplicate.file_name().map(|n| n.to_os_string()).unwrap_or_default();
		name.push(".proxsave-dedup-tmp");
		duplicate.with_file_name(name)
	};
	tokio::fs::symlink(&relative_target, &tmp).await.into_diagnostic()?;
	tokio::fs::rename(&tmp, duplicate).await.into_diagnostic()?;
	Ok(())
}

/// Computes a relative path from `from_dir` to `to`, used so the
/// resulting symlink remains valid if the staging tree is moved.
fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
	let from_components: Vec<_> = from_dir.components().collect();
	let to_components: Vec<_> = to.components().collect();

	let common = from_components
		.iter()
		.zip(to_components.iter())
		.take_while(|(a, b)| a == b)
		.count();

	let mut result = PathBuf::new();
	for _ in common..from_components.len() {
		result.push("..");
	}
	for component in &to_components[common..] {
		result.push(component);
	}
	result
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn identical_files_become_symlinks() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.bin"), b"same bytes").await.unwrap();
		tokio::fs::write(dir.path().join("b.bin"), b"same bytes").await.unwrap();

		let count = dedup_tree(dir.path()).await.unwrap();
		assert_eq!(count, 1);

		let b_meta = tokio::fs::symlink_metadata(dir.path().join("b.bin")).await.unwrap();
		assert!(b_meta.file_type().is_symlink());
	}

	#[tokio::test]
	async fn distinct_files_are_left_alone() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.bin"), b"one").await.unwrap();
		tokio::fs::write(dir.path().join("b.bin"), b"two").await.unwrap();

		let count = dedup_tree(dir.path()).await.unwrap();
		assert_eq!(count, 0);
	}

	#[tokio::test]
	async fn sensitive_paths_are_never_deduped() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("etc")).await.unwrap();
		tokio::fs::write(dir.path().join("etc/hosts"), b"same").await.unwrap();
		tokio::fs::write(dir.path().join("etc/fstab"), b"same").await.unwrap();

		let count = dedup_tree(dir.path()).await.unwrap();
		assert_eq!(count, 0);
	}
}
