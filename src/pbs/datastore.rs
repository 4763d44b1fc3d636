//! Datastore enumeration and inventory (§4.7 steps 1–2).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;

use crate::collector::Collector;
use crate::inventory::{CommandSnapshot, DirSnapshot, FileSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct DatastoreDefinition {
	pub name: String,
	pub path: PathBuf,
	pub comment: Option<String>,
	pub sources: Vec<String>,
}

/// Synthesizes a datastore name from a path basename, validated against
/// `^[a-zA-Z0-9_-]+$`, falling back to `datastore_<n>`.
pub fn synthesize_name(path: &Path, index: usize) -> String {
	let name_re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
	match path.file_name().and_then(|n| n.to_str()) {
		Some(candidate) if name_re.is_match(candidate) => candidate.to_string(),
		_ => format!("datastore_{index}"),
	}
}

/// Merges `proxmox-backup-manager datastore list` JSON output with
/// `PBS_DATASTORE_PATH`-style overrides.
pub fn merge_datastores(cli_json: &[u8], overrides: &[PathBuf]) -> Vec<DatastoreDefinition> {
	let mut out = Vec::new();
	let mut seen_names: HashSet<String> = HashSet::new();

	if let Ok(entries) = serde_json::from_slice::<Vec<serde_json::Value>>(cli_json) {
		for entry in entries {
			let name = entry.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
			let path = entry.get("path").and_then(|v| v.as_str()).unwrap_or_default();
			if name.is_empty() {
				continue;
			}
			seen_names.insert(name.clone());
			out.push(DatastoreDefinition {
				name,
				path: PathBuf::from(path),
				comment: entry.get("comment").and_then(|v| v.as_str()).map(String::from),
				sources: vec!["datastore.cfg".into()],
			});
		}
	}

	for (index, path) in overrides.iter().enumerate() {
		let name = synthesize_name(path, index);
		if seen_names.contains(&name) {
			continue;
		}
		seen_names.insert(name.clone());
		out.push(DatastoreDefinition {
			name,
			path: path.clone(),
			comment: None,
			sources: vec!["PBS_DATASTORE_PATH".into()],
		});
	}

	out
}

const REFERENCED_FILE_KEYS: &[&str] = &["credentials", "cred", "passwd", "passfile", "keyfile", "identityfile"];
const PBS_MARKERS: &[&str] = &[".chunks", ".lock", ".gc-status", "vm", "ct"];

/// Parses `crypttab`'s third field (key-file path), excluding `none`/`-`.
pub fn crypttab_key_files(text: &str) -> Vec<String> {
	let mut out = Vec::new();
	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let fields: Vec<&str> = line.split_whitespace().collect();
		if let Some(key_file) = fields.get(2) {
			if *key_file != "none" && *key_file != "-" && key_file.starts_with('/') {
				out.push(key_file.to_string());
			}
		}
	}
	out.sort();
	out.dedup();
	out
}

/// Parses `fstab` option-value pairs whose key names a credentials file
/// and whose value is an absolute path.
pub fn fstab_referenced_files(text: &str) -> Vec<String> {
	let mut out = Vec::new();
	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let fields: Vec<&str> = line.split_whitespace().collect();
		let Some(options) = fields.get(3) else { continue };
		for option in options.split(',') {
			if let Some((key, value)) = option.split_once('=') {
				if REFERENCED_FILE_KEYS.contains(&key.to_lowercase().as_str()) && value.starts_with('/') {
					out.push(value.to_string());
				}
			}
		}
	}
	out.sort();
	out.dedup();
	out
}

#[derive(Debug, Clone, Serialize)]
pub struct DatastoreInventoryEntry {
	pub definition: DatastoreDefinition,
	pub path_ok: bool,
	pub markers: Vec<String>,
	pub mount: Option<CommandSnapshot>,
	pub disk_usage: Option<CommandSnapshot>,
}

impl Collector {
	/// Checks accessibility and scans for PBS presence markers
	/// (`.chunks`, `.lock`, `.gc-status`, `vm`, `ct`). When host commands
	/// are enabled, also captures per-path `findmnt -J -T <path>` and
	/// `df -T <path>` snapshots (§4.7 step 2).
	pub async fn inspect_datastore(&self, definition: &DatastoreDefinition) -> DatastoreInventoryEntry {
		let path_ok = tokio::fs::metadata(&definition.path)
			.await
			.map(|m| m.is_dir())
			.unwrap_or(false);

		let mut markers = Vec::new();
		if path_ok {
			for marker in PBS_MARKERS {
				if tokio::fs::metadata(definition.path.join(marker)).await.is_ok() {
					markers.push(marker.to_string());
				}
			}
		}

		let (mount, disk_usage) = if path_ok && self.config.system_root_prefix.as_os_str().is_empty() {
			let path_str = definition.path.to_string_lossy().into_owned();
			let mount = self
				.capture_inventory_command(
					&format!("findmnt -J -T {path_str}"),
					"findmnt",
					&["-J", "-T", &path_str],
					&format!("{}/mount", definition.name),
				)
				.await;
			let disk_usage = self
				.capture_inventory_command(
					&format!("df -T {path_str}"),
					"df",
					&["-T", &path_str],
					&format!("{}/disk_usage", definition.name),
				)
				.await;
			(Some(mount), Some(disk_usage))
		} else {
			(None, None)
		};

		DatastoreInventoryEntry { definition: definition.clone(), path_ok, markers, mount, disk_usage }
	}

	/// Referenced files (§4.7 step 2): secret files named by `fstab`
	/// option-values or `crypttab`'s key-file field, captured and
	/// physically staged so the restored system still has them.
	pub async fn collect_referenced_files(&self, fstab_text: &str, crypttab_text: &str) -> Vec<FileSnapshot> {
		let mut paths: Vec<String> = Vec::new();
		paths.extend(fstab_referenced_files(fstab_text));
		paths.extend(crypttab_key_files(crypttab_text));
		paths.sort();
		paths.dedup();

		let mut out = Vec::new();
		for path in paths {
			let src = self.config.under_root(Path::new(&path));
			let snapshot = self.capture_inventory_file(&src, &path).await;
			if snapshot.exists {
				let dest = self.temp_dir.join(path.trim_start_matches('/'));
				let _ = self.safe_copy_file(&src, &dest, "referenced secret file").await;
			}
			out.push(snapshot);
		}
		out
	}

	pub async fn collect_datastore_inventory_files(&self, logical_root: &Path) -> Vec<FileSnapshot> {
		const FILES: &[&str] = &[
			"/etc/fstab",
			"/etc/crypttab",
			"/proc/mdstat",
			"/proc/mounts",
			"/etc/os-release",
			"/etc/lvm/lvm.conf",
			"/etc/multipath.conf",
			"/etc/multipath/bindings",
			"/etc/multipath/wwids",
			"/etc/mdadm/mdadm.conf",
			"/etc/iscsi/initiatorname.iscsi",
			"/etc/iscsi/iscsid.conf",
			"/etc/auto.master",
			"/etc/autofs.conf",
			"/etc/zfs/zpool.cache",
		];

		let mut out = Vec::new();
		for file in FILES {
			let src = self.config.under_root(Path::new(file));
			let logical = logical_root.join(file.trim_start_matches('/')).to_string_lossy().into_owned();
			out.push(self.capture_inventory_file(&src, &logical).await);
		}
		out
	}

	pub async fn collect_datastore_inventory_dirs(&self) -> Vec<DirSnapshot> {
		const DIRS: &[&str] = &["/etc/iscsi", "/var/lib/iscsi", "/etc/multipath", "/etc/mdadm", "/etc/lvm/backup", "/etc/lvm/archive", "/etc/zfs", "/etc/auto.master.d"];

		let mut out = Vec::new();
		for dir in DIRS {
			let src = self.config.under_root(Path::new(dir));
			out.push(self.capture_inventory_dir(&src, dir).await);
		}

		let systemd_dir = self.config.under_root(Path::new("/etc/systemd/system"));
		let mount_pattern = glob::Pattern::new("*.mount").unwrap();
		out.push(self.capture_inventory_dir_filtered(&systemd_dir, "/etc/systemd/system", Some(&mount_pattern)).await);

		out
	}

	/// Only run when `SystemRootPrefix` is real root, since these probe
	/// live kernel/hardware state meaningless under a test prefix.
	pub async fn collect_datastore_inventory_commands(&self) -> Vec<CommandSnapshot> {
		if !self.config.system_root_prefix.as_os_str().is_empty() {
			return vec![
				self
					.capture_inventory_command("(skipped under test root prefix)", "", &[], "skipped")
					.await,
			];
		}

		let calls: &[(&str, &[&str])] = &[
			("uname", &["-a"]),
			("blkid", &[]),
			("lsblk", &["-J", "-O"]),
			("findmnt", &["-J"]),
			("nfsstat", &["-m"]),
			("dmsetup", &["ls", "--tree"]),
			("pvs", &["--reportformat", "json", "--units", "b"]),
			("vgs", &["--reportformat", "json", "--units", "b"]),
			("lvs", &["--reportformat", "json", "--units", "b"]),
			("mdadm", &["--detail", "--scan"]),
			("multipath", &["-ll"]),
			("iscsiadm", &["-m", "session"]),
			("iscsiadm", &["-m", "node"]),
			("iscsiadm", &["-m", "iface"]),
			("zpool", &["status"]),
			("zpool", &["list"]),
			("zfs", &["list"]),
		];

		let mut out = Vec::new();
		for (cmd, args) in calls {
			out.push(self.capture_inventory_command(&format!("{cmd} {}", args.join(" ")), cmd, args, cmd).await);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn synthesizes_fallback_name_for_invalid_basename() {
		assert_eq!(synthesize_name(Path::new("/mnt/my store!"), 2), "datastore_2");
		assert_eq!(synthesize_name(Path::new("/mnt/backup01"), 0), "backup01");
	}

	#[test]
	fn crypttab_excludes_none_and_dash() {
		let text = "luks1 /dev/sdb1 /root/key.bin luks\nluks2 /dev/sdc1 none luks\nluks3 /dev/sdd1 - luks\n";
		let files = crypttab_key_files(text);
		assert_eq!(files, vec!["/root/key.bin".to_string()]);
	}

	#[test]
	fn fstab_extracts_credential_options() {
		let text = "//server/share /mnt/share cifs credentials=/etc/smb-secret,ro 0 0\n";
		let files = fstab_referenced_files(text);
		assert_eq!(files, vec!["/etc/smb-secret".to_string()]);
	}

	#[test]
	fn merge_prefers_cli_entries_over_overrides_with_same_name() {
		let cli_json = br#"[{"name": "store1", "path": "/mnt/store1"}]"#;
		let overrides = vec![PathBuf::from("/mnt/store1")];
		let merged = merge_datastores(cli_json, &overrides);
		assert_eq!(merged.len(), 1);
		assert_eq!(merged[0].sources, vec!["datastore.cfg".to_string()]);
	}

	#[tokio::test]
	async fn inspect_datastore_skips_mount_capture_under_test_root_prefix() {
		use crate::config::{CollectorConfig, RealDeps};
		use std::sync::Arc;
		use tokio_util::sync::CancellationToken;

		let dir = tempfile::tempdir().unwrap();
		let store_path = dir.path().join("store1");
		tokio::fs::create_dir_all(store_path.join(".chunks")).await.unwrap();

		let collector = Collector::new(
			CollectorConfig { system_root_prefix: dir.path().to_path_buf(), ..Default::default() },
			Arc::new(RealDeps),
			dir.path().join("stage"),
			CancellationToken::new(),
		);

		let definition = DatastoreDefinition {
			name: "store1".into(),
			path: store_path,
			comment: None,
			sources: vec!["datastore.cfg".into()],
		};
		let entry = collector.inspect_datastore(&definition).await;
		assert!(entry.path_ok);
		assert!(entry.markers.contains(&".chunks".to_string()));
		assert!(entry.mount.is_none());
		assert!(entry.disk_usage.is_none());
	}

	#[tokio::test]
	async fn referenced_files_are_captured_and_staged() {
		use crate::config::{CollectorConfig, RealDeps};
		use std::sync::Arc;
		use tokio_util::sync::CancellationToken;

		let dir = tempfile::tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("etc/smb")).await.unwrap();
		tokio::fs::write(dir.path().join("etc/smb/secret"), b"s3cr3t").await.unwrap();

		let stage = dir.path().join("stage");
		let collector = Collector::new(
			CollectorConfig { system_root_prefix: dir.path().to_path_buf(), ..Default::default() },
			Arc::new(RealDeps),
			stage.clone(),
			CancellationToken::new(),
		);

		let fstab = "//server/share /mnt/share cifs credentials=/etc/smb/secret,ro 0 0\n";
		let snapshots = collector.collect_referenced_files(fstab, "").await;
		assert_eq!(snapshots.len(), 1);
		assert!(snapshots[0].exists);
		assert_eq!(snapshots[0].content, "s3cr3t");
		assert!(tokio::fs::metadata(stage.join("etc/smb/secret")).await.is_ok());
	}
}
