//! PVE pipeline (§4.6 C6): detects a Proxmox VE host, captures its
//! cluster/node configuration, storage metadata, and (if present) Ceph
//! state.

pub mod ceph;
pub mod cluster;
pub mod storage;

use std::path::{Path, PathBuf};

use miette::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::collector::{write_report_file, Collector};
use crate::error::CoreError;
pub use cluster::ClusterMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
	Collected,
	Disabled,
	Skipped,
	NotFound,
	Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
	pub feature: String,
	pub status: ManifestStatus,
	pub size: u64,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PveReport {
	pub cluster_mode: ClusterMode,
	pub manifest: Vec<ManifestEntry>,
}

impl Collector {
	/// `CollectPVEConfigs(ctx)` (§4.6).
	pub async fn collect_pve_configs(&self) -> Result<PveReport> {
		let pve_path = self.config.effective_pve_config_path();

		if tokio::fs::symlink_metadata(&pve_path).await.is_err() {
			return Err(CoreError::Pve(anyhow::anyhow!("not a PVE system: {} not found", pve_path.display())).into());
		}

		let mut manifest = Vec::new();
		let cluster_mode = self.detect_cluster_mode(&pve_path).await;
		info!(?cluster_mode, "detected PVE cluster mode");

		self.capture_pve_directory(&pve_path, &mut manifest).await;

		if self.config.backup_cluster_config {
			self.capture_cluster_config(&mut manifest, &pve_path, cluster_mode).await;
		} else {
			manifest.push(disabled_entry("cluster_config", "BackupClusterConfig"));
		}

		if self.config.backup_network_configs {
			self.capture_network_config(&mut manifest).await;
		} else {
			manifest.push(disabled_entry("network_config", "BackupNetworkConfigs"));
		}

		if self.config.backup_vzdump_config {
			let src = self.config.under_root(&self.config.vzdump_config_path);
			let dest = self.temp_dir.join("etc/vzdump.conf");
			match self.safe_copy_file(&src, &dest, "vzdump.conf").await {
				Ok(()) => manifest.push(collected_entry("vzdump.conf", 0)),
				Err(e) => manifest.push(failed_entry("vzdump.conf", &e)),
			}
		} else {
			manifest.push(disabled_entry("vzdump.conf", "BackupVZDumpConfig"));
		}

		self.run_pve_commands(&mut manifest).await?;
		self.collect_pve_storage(&mut manifest).await;

		if self.detect_ceph(&self.config.under_root(&self.config.ceph_config_path)).await {
			if self.config.backup_ceph_config {
				let commands_dir = self.commands_dir("pve");
				if let Err(e) = self.capture_ceph_status(&commands_dir).await {
					manifest.push(failed_entry("ceph", &e));
				} else {
					manifest.push(collected_entry("ceph", 0));
				}
			} else {
				manifest.push(disabled_entry("ceph", "BackupCephConfig"));
			}
		}

		Ok(PveReport { cluster_mode, manifest })
	}

	/// `/etc/pve` directory copy (§4.6 step 3), excluding subtrees whose
	/// backup toggle is off. Each gated subtree is then captured (or
	/// recorded as disabled/not-found) as its own manifest entry.
	async fn capture_pve_directory(&self, pve_path: &Path, manifest: &mut Vec<ManifestEntry>) {
		let staging_pve = self.temp_dir.join("etc/pve");
		let gated_names: Vec<&str> = GATED_PVE_ENTRIES.iter().map(|(name, ..)| *name).collect();

		let mut entries = match tokio::fs::read_dir(pve_path).await {
			Ok(entries) => entries,
			Err(e) => {
				manifest.push(failed_entry("etc/pve", &miette::miette!("reading /etc/pve: {e}")));
				return;
			}
		};

		let mut had_error = false;
		loop {
			let next = entries.next_entry().await;
			let entry = match next {
				Ok(Some(entry)) => entry,
				Ok(None) => break,
				Err(_) => {
					had_error = true;
					break;
				}
			};
			let name = entry.file_name();
			let name_str = name.to_string_lossy().into_owned();
			if gated_names.contains(&name_str.as_str()) {
				continue;
			}
			let src = entry.path();
			let dest = staging_pve.join(&name);
			let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
			let result = if is_dir {
				self.safe_copy_dir(&src, &dest, &name_str).await
			} else {
				self.safe_copy_file(&src, &dest, &name_str).await
			};
			if result.is_err() {
				had_error = true;
			}
		}

		let copied_size = dir_size(&staging_pve).await;
		if had_error {
			manifest.push(ManifestEntry {
				feature: "etc/pve".into(),
				status: ManifestStatus::Failed,
				size: copied_size,
				error: Some("one or more /etc/pve entries failed to copy".into()),
			});
		} else {
			manifest.push(collected_entry("etc/pve", copied_size));
		}

		for (name, toggle, hint) in GATED_PVE_ENTRIES {
			let feature = format!("etc/pve/{name}");
			if !toggle(&self.config) {
				manifest.push(disabled_entry(&feature, hint));
				continue;
			}

			let src = pve_path.join(name);
			if tokio::fs::symlink_metadata(&src).await.is_err() {
				manifest.push(not_found_entry(&feature));
				continue;
			}

			let dest = staging_pve.join(name);
			let is_dir = tokio::fs::metadata(&src).await.map(|m| m.is_dir()).unwrap_or(false);
			let result = if is_dir {
				self.safe_copy_dir(&src, &dest, &feature).await
			} else {
				self.safe_copy_file(&src, &dest, &feature).await
			};
			match result {
				Ok(()) => manifest.push(collected_entry(&feature, 0)),
				Err(e) => manifest.push(failed_entry(&feature, &e)),
			}
		}
	}

	/// Debian-style network config (§3 `BackupNetworkConfigs`): not part of
	/// `/etc/pve`, so captured as its own step alongside corosync/ceph.
	async fn capture_network_config(&self, manifest: &mut Vec<ManifestEntry>) {
		let interfaces_src = self.config.under_root(Path::new("/etc/network/interfaces"));
		let interfaces_dest = self.temp_dir.join("etc/network/interfaces");
		match self.safe_copy_file(&interfaces_src, &interfaces_dest, "network interfaces").await {
			Ok(()) => manifest.push(collected_entry("network_config", 0)),
			Err(e) => manifest.push(failed_entry("network_config", &e)),
		}

		let interfaces_d_src = self.config.under_root(Path::new("/etc/network/interfaces.d"));
		let interfaces_d_dest = self.temp_dir.join("etc/network/interfaces.d");
		let _ = self.safe_copy_dir(&interfaces_d_src, &interfaces_d_dest, "network interfaces.d").await;
	}

	async fn capture_cluster_config(
		&self,
		manifest: &mut Vec<ManifestEntry>,
		pve_path: &Path,
		cluster_mode: ClusterMode,
	) {
		let corosync_src = self.config.under_root(&self.config.corosync_config_path);
		let corosync_dest = self.temp_dir.join("etc/pve/corosync.conf");
		match self.safe_copy_file(&corosync_src, &corosync_dest, "corosync.conf").await {
			Ok(()) => manifest.push(collected_entry("corosync.conf", 0)),
			Err(e) => manifest.push(failed_entry("corosync.conf", &e)),
		}

		let authkey_src = self.config.under_root(Path::new("/etc/corosync/authkey"));
		let authkey_dest = self.temp_dir.join("etc/corosync/authkey");
		let _ = self.safe_copy_file(&authkey_src, &authkey_dest, "corosync authkey").await;

		// Legacy pre-corosync cluster config, best-effort (most hosts won't have it).
		let legacy_cluster_src = self.config.under_root(&self.config.pve_cluster_path);
		let legacy_cluster_dest = self.temp_dir.join("etc/pve/cluster.conf");
		let _ = self.safe_copy_file(&legacy_cluster_src, &legacy_cluster_dest, "legacy cluster.conf").await;

		if cluster_mode == ClusterMode::Cluster {
			let cluster_dir = pve_path.join("priv");
			let dest = self.temp_dir.join("etc/pve/priv");
			let _ = self.safe_copy_dir(&cluster_dir, &dest, "cluster private data").await;
		}

		let config_db_src = self.config.under_root(Path::new("/var/lib/pve-cluster/config.db"));
		let config_db_dest = self.temp_dir.join("var/lib/pve-cluster/config.db");
		match self.safe_copy_file(&config_db_src, &config_db_dest, "config.db").await {
			Ok(()) => manifest.push(collected_entry("config.db", 0)),
			Err(e) => manifest.push(failed_entry("config.db", &e)),
		}
	}

	async fn run_pve_commands(&self, manifest: &mut Vec<ManifestEntry>) -> Result<()> {
		let commands_dir = self.commands_dir("pve");

		let pveversion_path = commands_dir.join("pveversion.txt");
		if let Err(e) = self
			.safe_cmd_output("pveversion", &["-v"], &pveversion_path, "pveversion -v", true)
			.await
		{
			manifest.push(failed_entry("pveversion", &e));
			return Err(CoreError::Pve(anyhow::anyhow!("{e}")).into());
		}
		manifest.push(collected_entry("pveversion", 0));

		let nodes_path = commands_dir.join("pvesh.txt");
		let nodes_json = self
			.capture_command_output(
				"pvesh",
				&["get", "/nodes", "--output-format=json"],
				Some(&nodes_path),
				"pvesh get /nodes",
				false,
			)
			.await
			.unwrap_or_else(|e| {
				warn!(command = "pvesh", error = %e, "non-critical PVE command failed");
				None
			});

		let user_list_path = commands_dir.join("pveum.txt");
		let user_list_json = self
			.capture_command_output(
				"pveum",
				&["user", "list", "--output-format=json"],
				Some(&user_list_path),
				"pveum user list",
				false,
			)
			.await
			.unwrap_or_else(|e| {
				warn!(command = "pveum", error = %e, "non-critical PVE command failed");
				None
			});

		for (cmd, args) in [("pvecm", &["status"][..]), ("pvesm", &["status"][..])] {
			let out_path = commands_dir.join(format!("{cmd}.txt"));
			if let Err(e) = self.safe_cmd_output(cmd, args, &out_path, cmd, false).await {
				warn!(command = cmd, error = %e, "non-critical PVE command failed");
			}
		}

		let node_names: Vec<String> = nodes_json
			.as_deref()
			.and_then(|bytes| serde_json::from_slice::<Vec<serde_json::Value>>(bytes).ok())
			.map(|entries| {
				entries
					.into_iter()
					.filter_map(|entry| entry.get("node").and_then(|v| v.as_str()).map(String::from))
					.collect()
			})
			.unwrap_or_default();

		let mut backup_history = serde_json::Map::new();
		let mut replication_status = serde_json::Map::new();

		for node in &node_names {
			let history_path = commands_dir.join(format!("{node}_backup_history.json"));
			match self
				.capture_command_output(
					"pvesh",
					&["get", &format!("/nodes/{node}/tasks"), "--typefilter", "vzdump", "--output-format=json"],
					Some(&history_path),
					"pvesh get node vzdump task history",
					false,
				)
				.await
			{
				Ok(Some(bytes)) => {
					if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
						backup_history.insert(node.clone(), value);
					}
				}
				Ok(None) => {}
				Err(e) => warn!(node = %node, error = %e, "vzdump task history capture failed"),
			}

			let replication_path = commands_dir.join(format!("{node}_replication_status.json"));
			match self
				.capture_command_output(
					"pvesh",
					&["get", &format!("/nodes/{node}/replication"), "--output-format=json"],
					Some(&replication_path),
					"pvesh get node replication status",
					false,
				)
				.await
			{
				Ok(Some(bytes)) => {
					if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
						replication_status.insert(node.clone(), value);
					}
				}
				Ok(None) => {}
				Err(e) => warn!(node = %node, error = %e, "replication status capture failed"),
			}
		}

		let aliased = nodes_json.is_some() || user_list_json.is_some();
		self.write_pve_info_aliases(nodes_json.as_deref(), user_list_json.as_deref(), &backup_history, &replication_status)
			.await;
		if aliased {
			manifest.push(collected_entry("pve_info_aliases", 0));
		}

		Ok(())
	}

	/// §4.6 step 7: canonical-named aliases under `/var/lib/pve-cluster/info`
	/// for the node list and user list, plus aggregation of the per-node
	/// vzdump task history / replication status captured above into single
	/// top-level files keyed by node name.
	async fn write_pve_info_aliases(
		&self,
		nodes_json: Option<&[u8]>,
		user_list_json: Option<&[u8]>,
		backup_history: &serde_json::Map<String, serde_json::Value>,
		replication_status: &serde_json::Map<String, serde_json::Value>,
	) {
		let info_dir = self.temp_dir.join("var/lib/pve-cluster/info");
		if self.ensure_dir(&info_dir).await.is_err() {
			return;
		}

		if let Some(bytes) = nodes_json {
			let _ = write_report_file(&info_dir.join("nodes_status.json"), bytes).await;
		}
		if let Some(bytes) = user_list_json {
			let _ = write_report_file(&info_dir.join("user_list.json"), bytes).await;
		}
		if !backup_history.is_empty() {
			let json = serde_json::to_vec_pretty(backup_history).unwrap_or_default();
			let _ = write_report_file(&info_dir.join("backup_history.json"), &json).await;
		}
		if !replication_status.is_empty() {
			let json = serde_json::to_vec_pretty(replication_status).unwrap_or_default();
			let _ = write_report_file(&info_dir.join("replication_status.json"), &json).await;
		}
	}

	/// Storage metadata (§4.6 step 5): merges `pvesh ... storage` JSON
	/// with the parsed `storage.cfg` grammar, then samples each storage
	/// whose resolved path is an accessible directory.
	async fn collect_pve_storage(&self, manifest: &mut Vec<ManifestEntry>) {
		let cfg_path = self.config.effective_pve_config_path().join("storage.cfg");
		let cfg_text = match tokio::fs::read_to_string(&cfg_path).await {
			Ok(text) => text,
			Err(e) => {
				manifest.push(failed_entry("storage", &miette::miette!("reading storage.cfg: {e}")));
				return;
			}
		};
		let parsed = storage::parse_storage_cfg(&cfg_text);

		let hostname = tokio::fs::read_to_string(self.config.under_root(Path::new("/etc/hostname")))
			.await
			.map(|s| s.trim().to_string())
			.unwrap_or_default();
		let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

		let json_paths = self.query_pvesh_storage_paths(&short_hostname).await;

		let resolved: Vec<(String, PathBuf)> = parsed
			.iter()
			.filter_map(|entry| {
				let path = entry
					.fields
					.get("path")
					.map(PathBuf::from)
					.or_else(|| json_paths.get(&entry.name).cloned())?;
				Some((entry.name.clone(), self.config.under_root(&path)))
			})
			.collect();

		let accessible = storage::storages_with_accessible_paths(&resolved);
		if accessible.is_empty() {
			manifest.push(disabled_entry("storage", "no accessible storage paths"));
			return;
		}

		let mut all_metadata = Vec::new();
		let mut backup_files_summaries = Vec::new();
		for (name, path) in &accessible {
			let metadata = self.collect_storage_metadata(name, path).await;
			all_metadata.push(metadata);

			if self.config.backup_pve_backup_files {
				backup_files_summaries.push(self.collect_pve_backup_files(name, path).await);
			}
		}

		let storage_dir = self.temp_dir.join("var/lib/proxsave-info/storage");
		if self.ensure_dir(&storage_dir).await.is_ok() {
			let json = serde_json::to_vec_pretty(&all_metadata).unwrap_or_default();
			let _ = write_report_file(&storage_dir.join("metadata.json"), &json).await;
			let text = storage::metadata_text_report(&all_metadata);
			let _ = write_report_file(&storage_dir.join("metadata.txt"), text.as_bytes()).await;
		}

		manifest.push(collected_entry("storage", all_metadata.len() as u64));

		if self.config.backup_pve_backup_files {
			if self.ensure_dir(&storage_dir).await.is_ok() {
				let json = serde_json::to_vec_pretty(&backup_files_summaries).unwrap_or_default();
				let _ = write_report_file(&storage_dir.join("backup-files.json"), &json).await;
			}
			let copied: u64 = backup_files_summaries
				.iter()
				.map(|s| s.small_files_copied + s.included_files_copied)
				.sum();
			manifest.push(collected_entry("storage_backup_files", copied));
		} else {
			manifest.push(disabled_entry("storage_backup_files", "BackupPVEBackupFiles"));
		}
	}

	async fn query_pvesh_storage_paths(&self, short_hostname: &str) -> std::collections::HashMap<String, PathBuf> {
		let mut out = std::collections::HashMap::new();
		let Ok(Some(bytes)) = self
			.capture_command_output(
				"pvesh",
				&["get", &format!("/nodes/{short_hostname}/storage"), "--output-format=json"],
				None,
				"pvesh storage list",
				false,
			)
			.await
		else {
			return out;
		};
		let Ok(entries) = serde_json::from_slice::<Vec<serde_json::Value>>(&bytes) else {
			return out;
		};
		for entry in entries {
			let (Some(name), Some(path)) = (
				entry.get("storage").and_then(|v| v.as_str()),
				entry.get("path").and_then(|v| v.as_str()),
			) else {
				continue;
			};
			out.insert(name.to_string(), PathBuf::from(path));
		}
		out
	}

	fn commands_dir(&self, flavor: &str) -> std::path::PathBuf {
		self.temp_dir
			.join("var/lib/proxsave-info/commands")
			.join(flavor)
	}
}

async fn dir_size(path: &Path) -> u64 {
	let mut total = 0u64;
	let mut stack = vec![path.to_path_buf()];
	while let Some(dir) = stack.pop() {
		let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { continue };
		while let Ok(Some(entry)) = entries.next_entry().await {
			let path = entry.path();
			if let Ok(meta) = entry.metadata().await {
				if meta.is_dir() {
					stack.push(path);
				} else {
					total += meta.len();
				}
			}
		}
	}
	total
}

fn collected_entry(feature: &str, size: u64) -> ManifestEntry {
	ManifestEntry { feature: feature.into(), status: ManifestStatus::Collected, size, error: None }
}

fn disabled_entry(feature: &str, toggle_hint: &str) -> ManifestEntry {
	ManifestEntry {
		feature: feature.into(),
		status: ManifestStatus::Disabled,
		size: 0,
		error: Some(format!("disabled via {toggle_hint}")),
	}
}

fn failed_entry(feature: &str, error: &miette::Report) -> ManifestEntry {
	ManifestEntry { feature: feature.into(), status: ManifestStatus::Failed, size: 0, error: Some(error.to_string()) }
}

fn not_found_entry(feature: &str) -> ManifestEntry {
	ManifestEntry { feature: feature.into(), status: ManifestStatus::NotFound, size: 0, error: None }
}

/// Direct children of `/etc/pve` whose capture is gated by a toggle
/// (§3 "Toggles"), excluded from the bulk directory copy and captured
/// individually instead.
const GATED_PVE_ENTRIES: &[(&str, fn(&crate::config::CollectorConfig) -> bool, &str)] = &[
	("qemu-server", |c| c.backup_vm_configs, "BackupVMConfigs"),
	("lxc", |c| c.backup_vm_configs, "BackupVMConfigs"),
	("firewall", |c| c.backup_pve_firewall, "BackupPVEFirewall"),
	("user.cfg", |c| c.backup_pve_acl, "BackupPVEACL"),
	("domains.cfg", |c| c.backup_pve_acl, "BackupPVEACL"),
	("jobs.cfg", |c| c.backup_pve_jobs, "BackupPVEJobs"),
	("vzdump.cron", |c| c.backup_pve_schedules, "BackupPVESchedules"),
	("replication.cfg", |c| c.backup_pve_replication, "BackupPVEReplication"),
];

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CollectorConfig, RealDeps};
	use std::sync::Arc;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn missing_pve_config_path_is_not_a_pve_system() {
		let dir = tempfile::tempdir().unwrap();
		let collector = Collector::new(
			CollectorConfig { system_root_prefix: dir.path().to_path_buf(), ..Default::default() },
			Arc::new(RealDeps),
			dir.path().join("stage"),
			CancellationToken::new(),
		);
		let err = collector.collect_pve_configs().await.unwrap_err();
		assert!(err.to_string().contains("not a PVE system"));
	}
}
