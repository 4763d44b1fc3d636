//! Inventory primitives (§4.5 C5): point-in-time snapshots of a file,
//! directory, or command's output, used to build the JSON reports that
//! accompany a staged copy rather than replace it.

use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::collector::Collector;

#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
	pub logical_path: String,
	pub source_path: String,
	pub exists: bool,
	pub skipped: bool,
	pub reason: Option<String>,
	pub error: Option<String>,
	pub size_bytes: u64,
	pub sha256: String,
	pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirFileEntry {
	pub relative_path: String,
	pub size_bytes: u64,
	pub sha256: String,
	pub is_symlink: bool,
	pub symlink_target: Option<String>,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirSnapshot {
	pub logical_path: String,
	pub source_path: String,
	pub exists: bool,
	pub skipped: bool,
	pub reason: Option<String>,
	pub error: Option<String>,
	pub files: Vec<DirFileEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandSnapshot {
	pub logical_path: String,
	pub source_path: String,
	pub exists: bool,
	pub skipped: bool,
	pub reason: Option<String>,
	pub error: Option<String>,
	pub command: String,
	pub output: String,
}

fn hex_sha256(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

impl Collector {
	/// Snapshots a single file. Content is embedded verbatim (lossy UTF-8)
	/// since this is only ever called for configuration-class files.
	pub async fn capture_inventory_file(&self, src: &Path, logical: &str) -> FileSnapshot {
		let source_path = src.to_string_lossy().into_owned();
		let base = FileSnapshot {
			logical_path: logical.to_string(),
			source_path: source_path.clone(),
			exists: false,
			skipped: false,
			reason: None,
			error: None,
			size_bytes: 0,
			sha256: String::new(),
			content: String::new(),
		};

		if self.exclude_for_inventory(src) {
			return FileSnapshot {
				skipped: true,
				reason: Some("excluded by pattern".into()),
				..base
			};
		}

		match tokio::fs::read(src).await {
			Ok(bytes) => FileSnapshot {
				exists: true,
				size_bytes: bytes.len() as u64,
				sha256: hex_sha256(&bytes),
				content: String::from_utf8_lossy(&bytes).into_owned(),
				..base
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => base,
			Err(e) => FileSnapshot {
				error: Some(e.to_string()),
				..base
			},
		}
	}

	pub async fn capture_inventory_dir(&self, src: &Path, logical: &str) -> DirSnapshot {
		self.capture_inventory_dir_filtered(src, logical, None).await
	}

	/// As [`Self::capture_inventory_dir`] but only records entries whose
	/// relative path matches `include` (a basename glob; `None` = all).
	pub async fn capture_inventory_dir_filtered(
		&self,
		src: &Path,
		logical: &str,
		include: Option<&glob::Pattern>,
	) -> DirSnapshot {
		let source_path = src.to_string_lossy().into_owned();
		let base = DirSnapshot {
			logical_path: logical.to_string(),
			source_path: source_path.clone(),
			exists: false,
			skipped: false,
			reason: None,
			error: None,
			files: Vec::new(),
		};

		if self.exclude_for_inventory(src) {
			return DirSnapshot {
				skipped: true,
				reason: Some("excluded by pattern".into()),
				..base
			};
		}

		if tokio::fs::symlink_metadata(src).await.is_err() {
			return base;
		}

		let mut files = Vec::new();
		if let Err(e) = walk_dir_into(src, src, include, &mut files).await {
			return DirSnapshot {
				exists: true,
				error: Some(e.to_string()),
				files,
				..base
			};
		}
		files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

		DirSnapshot {
			exists: true,
			files,
			..base
		}
	}

	pub async fn capture_inventory_command(
		&self,
		pretty: &str,
		name: &str,
		args: &[&str],
		logical: &str,
	) -> CommandSnapshot {
		let source_path = name.to_string();
		let base = CommandSnapshot {
			logical_path: logical.to_string(),
			source_path,
			exists: true,
			skipped: false,
			reason: None,
			error: None,
			command: pretty.to_string(),
			output: String::new(),
		};

		if self.deps.look_path(name).await.is_none() {
			return CommandSnapshot {
				skipped: true,
				exists: false,
				reason: Some("command not found".into()),
				..base
			};
		}

		let cancel = CancellationToken::new();
		match self.deps.run_command(&cancel, name, args).await {
			Ok(output) if output.success() => CommandSnapshot {
				output: String::from_utf8_lossy(&output.combined).into_owned(),
				..base
			},
			Ok(output) => CommandSnapshot {
				output: String::from_utf8_lossy(&output.combined).into_owned(),
				error: Some(format!("exited with {:?}", output.status)),
				..base
			},
			Err(e) => CommandSnapshot {
				error: Some(e.to_string()),
				..base
			},
		}
	}

	/// `captureInventoryCommandFromFile`: reads `path`'s content and reports
	/// it as a command-style snapshot (`cat <path>`), for kernel/virtual
	/// files that carry command-like informational text without needing a
	/// real subprocess.
	pub async fn capture_inventory_command_from_file(&self, path: &Path, logical: &str) -> CommandSnapshot {
		let base = CommandSnapshot {
			logical_path: logical.to_string(),
			source_path: path.to_string_lossy().into_owned(),
			exists: true,
			skipped: false,
			reason: None,
			error: None,
			command: format!("cat {}", path.display()),
			output: String::new(),
		};

		match tokio::fs::read(path).await {
			Ok(bytes) => CommandSnapshot {
				output: String::from_utf8_lossy(&bytes).into_owned(),
				..base
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => CommandSnapshot {
				exists: false,
				..base
			},
			Err(e) => CommandSnapshot {
				error: Some(e.to_string()),
				..base
			},
		}
	}

	fn exclude_for_inventory(&self, path: &Path) -> bool {
		self.exclude
			.is_excluded(path, &self.temp_dir, &self.config.system_root_prefix)
	}
}

fn walk_dir_into<'a>(
	root: &'a Path,
	current: &'a Path,
	include: Option<&'a glob::Pattern>,
	out: &'a mut Vec<DirFileEntry>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
	Box::pin(async move {
		let mut entries = tokio::fs::read_dir(current).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			let file_type = entry.file_type().await?;
			if file_type.is_dir() {
				walk_dir_into(root, &path, include, out).await?;
				continue;
			}

			let relative_path = path
				.strip_prefix(root)
				.unwrap_or(&path)
				.to_string_lossy()
				.replace('\\', "/");

			if let Some(pattern) = include {
				let matches_name = entry
					.file_name()
					.to_str()
					.map(|n| pattern.matches(n))
					.unwrap_or(false);
				if !matches_name {
					continue;
				}
			}

			if file_type.is_symlink() {
				let target = tokio::fs::read_link(&path).await.ok();
				out.push(DirFileEntry {
					relative_path,
					size_bytes: 0,
					sha256: String::new(),
					is_symlink: true,
					symlink_target: target.map(|t| t.to_string_lossy().into_owned()),
					error: None,
				});
				continue;
			}

			match tokio::fs::read(&path).await {
				Ok(bytes) => out.push(DirFileEntry {
					relative_path,
					size_bytes: bytes.len() as u64,
					sha256: hex_sha256(&bytes),
					is_symlink: false,
					symlink_target: None,
					error: None,
				}),
				Err(e) => out.push(DirFileEntry {
					relative_path,
					size_bytes: 0,
					sha256: String::new(),
					is_symlink: false,
					symlink_target: None,
					error: Some(e.to_string()),
				}),
			}
		}
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CollectorConfig, RealDeps};
	use std::sync::Arc;

	fn new_collector(temp: &Path) -> Collector {
		Collector::new(
			CollectorConfig::default(),
			Arc::new(RealDeps),
			temp.to_path_buf(),
			CancellationToken::new(),
		)
	}

	#[tokio::test]
	async fn file_snapshot_embeds_content_and_hash() {
		let dir = tempfile::tempdir().unwrap();
		let f = dir.path().join("a.conf");
		tokio::fs::write(&f, b"hello").await.unwrap();
		let c = new_collector(dir.path());
		let snap = c.capture_inventory_file(&f, "a.conf").await;
		assert!(snap.exists);
		assert_eq!(snap.content, "hello");
		assert_eq!(snap.sha256.len(), 64);
	}

	#[tokio::test]
	async fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let c = new_collector(dir.path());
		let snap = c.capture_inventory_file(&dir.path().join("nope"), "x").await;
		assert!(!snap.exists);
		assert!(snap.error.is_none());
	}

	#[tokio::test]
	async fn dir_snapshot_sorts_and_records_symlinks() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("b.txt"), b"2").await.unwrap();
		tokio::fs::write(dir.path().join("a.txt"), b"1").await.unwrap();
		tokio::fs::symlink("a.txt", dir.path().join("c.txt")).await.unwrap();

		let c = new_collector(dir.path());
		let snap = c.capture_inventory_dir(dir.path(), "root").await;
		let names: Vec<_> = snap.files.iter().map(|f| f.relative_path.clone()).collect();
		assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
		assert!(snap.files[2].is_symlink);
		assert_eq!(snap.files[2].symlink_target.as_deref(), Some("a.txt"));
	}
}
