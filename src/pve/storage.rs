//! Storage metadata (§4.6 step 5): merges `pvesh` storage JSON with the
//! parsed `storage.cfg` grammar, samples each accessible storage
//! directory, and computes disk usage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use serde::Serialize;
use tracing::warn;

use crate::collector::Collector;
use crate::sampling;

#[derive(Debug, Clone, Default)]
pub struct ParsedStorage {
	pub kind: String,
	pub name: String,
	pub fields: HashMap<String, String>,
}

/// Parses the `storage.cfg` grammar: a `kind: name` header line followed
/// by indented `key value` body lines.
pub fn parse_storage_cfg(text: &str) -> Vec<ParsedStorage> {
	let mut out = Vec::new();
	let mut current: Option<ParsedStorage> = None;

	for line in text.lines() {
		if line.is_empty() {
			continue;
		}
		if !line.starts_with([' ', '\t']) {
			if let Some(entry) = current.take() {
				out.push(entry);
			}
			if let Some((kind, name)) = line.split_once(':') {
				current = Some(ParsedStorage {
					kind: kind.trim().to_string(),
					name: name.trim().to_string(),
					fields: HashMap::new(),
				});
			}
		} else if let Some(entry) = current.as_mut() {
			let trimmed = line.trim();
			if let Some((key, value)) = trimmed.split_once(char::is_whitespace) {
				entry.fields.insert(key.trim().to_string(), value.trim().to_string());
			} else {
				entry.fields.insert(trimmed.to_string(), String::new());
			}
		}
	}
	if let Some(entry) = current.take() {
		out.push(entry);
	}
	out
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DiskUsage {
	pub used_bytes: u64,
	pub total_bytes: u64,
	pub free_bytes: u64,
}

pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
	let stat = statvfs(path).ok()?;
	let block_size = stat.fragment_size().max(1);
	let total_bytes = stat.blocks() * block_size;
	let free_bytes = stat.blocks_free() * block_size;
	Some(DiskUsage {
		used_bytes: total_bytes.saturating_sub(free_bytes),
		total_bytes,
		free_bytes,
	})
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageMetadata {
	pub name: String,
	pub path: String,
	pub disk_usage: Option<DiskUsage>,
	pub sampled_directories: Vec<String>,
	pub sampled_files: Vec<String>,
	pub notes: Vec<String>,
}

const DEFAULT_BACKUP_PATTERNS: &[&str] = &["*.vma*", "*.tar*", "*.log", "*.notes"];

impl Collector {
	/// Builds per-storage `metadata.json`/`metadata.txt` content (§4.6
	/// step 5): up to 20 directories at depth ≤ 2, up to 100 files
	/// matching the configured backup patterns.
	pub async fn collect_storage_metadata(&self, name: &str, path: &Path) -> StorageMetadata {
		let mut notes = Vec::new();

		let disk_usage = disk_usage(path);
		if disk_usage.is_none() {
			notes.push(format!("statfs failed for {}", path.display()));
			warn!(storage = name, path = %path.display(), "statfs failed");
		}

		let sampled_directories = sampling::sample_directories_bounded(
			path,
			2,
			20,
			&self.exclude,
			&self.temp_dir,
			&self.config.system_root_prefix,
			std::time::Duration::from_secs(5),
		)
		.await;

		let patterns: Vec<glob::Pattern> = DEFAULT_BACKUP_PATTERNS
			.iter()
			.filter_map(|p| glob::Pattern::new(p).ok())
			.collect();

		let all_files = sampling::sample_files_bounded(
			path,
			4,
			1000,
			&self.exclude,
			&self.temp_dir,
			&self.config.system_root_prefix,
			std::time::Duration::from_secs(5),
		)
		.await;

		let sampled_files: Vec<String> = all_files
			.into_iter()
			.filter(|f| {
				let base = Path::new(f).file_name().and_then(|n| n.to_str()).unwrap_or(f);
				patterns.iter().any(|p| p.matches(base))
			})
			.take(100)
			.collect();

		if sampled_directories.is_empty() {
			notes.push("no directories sampled".into());
		}

		StorageMetadata {
			name: name.to_string(),
			path: path.to_string_lossy().into_owned(),
			disk_usage,
			sampled_directories,
			sampled_files,
			notes,
		}
	}
}

pub fn metadata_text_report(metadata: &[StorageMetadata]) -> String {
	let mut out = String::new();
	for m in metadata {
		out.push_str(&format!("## {} ({})\n", m.name, m.path));
		if let Some(usage) = &m.disk_usage {
			out.push_str(&format!(
				"used={} total={} free={}\n",
				usage.used_bytes, usage.total_bytes, usage.free_bytes
			));
		}
		out.push_str(&format!("directories: {}\n", m.sampled_directories.len()));
		out.push_str(&format!("files: {}\n", m.sampled_files.len()));
		if !m.notes.is_empty() {
			out.push_str("\n## Data Quality Notes\n");
			for note in &m.notes {
				out.push_str(&format!("- {note}\n"));
			}
		}
		out.push('\n');
	}
	out
}

pub fn storages_with_accessible_paths(storages: &[(String, PathBuf)]) -> Vec<&(String, PathBuf)> {
	storages.iter().filter(|(_, p)| p.is_dir()).collect()
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PatternCount {
	pub pattern: String,
	pub files: u64,
	pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BackupFilesSummary {
	pub storage: String,
	pub counts: Vec<PatternCount>,
	pub small_files_copied: u64,
	pub included_files_copied: u64,
}

impl Collector {
	/// Full storage-tree walk (§4.6 step 5, `BackupPVEBackupFiles`): unlike
	/// [`Self::collect_storage_metadata`]'s bounded sample, this visits every
	/// file once, classifying it against every default pattern simultaneously
	/// (`patternWriter` sinks), and optionally stages copies.
	pub async fn collect_pve_backup_files(&self, name: &str, path: &Path) -> BackupFilesSummary {
		let patterns: Vec<(String, glob::Pattern)> = DEFAULT_BACKUP_PATTERNS
			.iter()
			.filter_map(|p| glob::Pattern::new(p).ok().map(|compiled| (p.to_string(), compiled)))
			.collect();
		let include_pattern = self
			.config
			.pve_backup_include_pattern
			.as_deref()
			.and_then(|p| glob::Pattern::new(p).ok());

		let mut counts: Vec<PatternCount> = patterns
			.iter()
			.map(|(raw, _)| PatternCount { pattern: raw.clone(), ..Default::default() })
			.collect();
		let mut small_files_copied = 0u64;
		let mut included_files_copied = 0u64;

		let small_staging = self.temp_dir.join("var/lib/proxsave-info/backup-files/small").join(name);
		let included_staging = self.temp_dir.join("var/lib/proxsave-info/backup-files/included").join(name);

		let mut stack = vec![path.to_path_buf()];
		while let Some(dir) = stack.pop() {
			if self.is_excluded_for_storage_walk(&dir) {
				continue;
			}
			let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { continue };
			while let Ok(Some(entry)) = entries.next_entry().await {
				let entry_path = entry.path();
				if self.is_excluded_for_storage_walk(&entry_path) {
					continue;
				}
				let Ok(meta) = entry.metadata().await else { continue };
				if meta.is_dir() {
					stack.push(entry_path);
					continue;
				}

				let base = entry.file_name();
				let base = base.to_string_lossy();
				let size = meta.len();

				for (count, (_, compiled)) in counts.iter_mut().zip(patterns.iter()) {
					if compiled.matches(&base) {
						count.files += 1;
						count.bytes += size;
					}
				}

				if size <= self.config.max_pve_backup_size_bytes {
					let dest = small_staging.join(&*base);
					if self.safe_copy_file(&entry_path, &dest, "pve backup file (small)").await.is_ok() {
						small_files_copied += 1;
					}
				}

				if let Some(include) = &include_pattern {
					if include.matches(&base) {
						let dest = included_staging.join(&*base);
						if self.safe_copy_file(&entry_path, &dest, "pve backup file (included)").await.is_ok() {
							included_files_copied += 1;
						}
					}
				}
			}
		}

		BackupFilesSummary { storage: name.to_string(), counts, small_files_copied, included_files_copied }
	}

	fn is_excluded_for_storage_walk(&self, path: &Path) -> bool {
		self.exclude
			.is_excluded(path, &self.temp_dir, &self.config.system_root_prefix)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_kind_name_header_and_indented_body() {
		let cfg = "dir: local\n\tpath /var/lib/vz\n\tcontent images\n\nlvm: local-lvm\n\tvgname pve\n";
		let parsed = parse_storage_cfg(cfg);
		assert_eq!(parsed.len(), 2);
		assert_eq!(parsed[0].kind, "dir");
		assert_eq!(parsed[0].name, "local");
		assert_eq!(parsed[0].fields.get("path"), Some(&"/var/lib/vz".to_string()));
		assert_eq!(parsed[1].name, "local-lvm");
	}

	#[test]
	fn data_quality_notes_section_present_when_step_failed() {
		let metadata = vec![StorageMetadata {
			name: "local".into(),
			path: "/var/lib/vz".into(),
			disk_usage: None,
			sampled_directories: Vec::new(),
			sampled_files: Vec::new(),
			notes: vec!["statfs failed for /var/lib/vz".into()],
		}];
		let text = metadata_text_report(&metadata);
		assert!(text.contains("## Data Quality Notes"));
	}
}
