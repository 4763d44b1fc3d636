//! PBS pipeline (§4.7 C7): enumerates datastores, captures per-datastore
//! inventory, pxar metadata, and namespaces.

pub mod datastore;
pub mod namespaces;
pub mod pxar;

use std::path::Path;

use miette::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::collector::Collector;
use crate::error::CoreError;
pub use datastore::{DatastoreDefinition, DatastoreInventoryEntry};
pub use pxar::PxarDatastoreMetadata;

#[derive(Debug, Clone, Serialize)]
pub struct PbsDatastoreReport {
	pub definition: DatastoreDefinition,
	pub inventory: DatastoreInventoryEntry,
	pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PbsReport {
	pub datastores: Vec<PbsDatastoreReport>,
	pub pxar_metadata: Vec<PxarDatastoreMetadata>,
}

impl Collector {
	/// `CollectPBSConfigs(ctx)` (§4.7).
	pub async fn collect_pbs_configs(&self) -> Result<PbsReport> {
		let pbs_path = self.config.effective_pbs_config_path();
		if tokio::fs::symlink_metadata(&pbs_path).await.is_err() {
			return Err(CoreError::Pbs(anyhow::anyhow!("not a PBS system: {} not found", pbs_path.display())).into());
		}

		let staging_pbs = self.temp_dir.join("etc/proxmox-backup");
		if let Err(e) = self.safe_copy_dir(&pbs_path, &staging_pbs, "/etc/proxmox-backup").await {
			warn!(error = %e, "failed to copy /etc/proxmox-backup");
		}

		let definitions = self.enumerate_datastores().await?;
		info!(count = definitions.len(), "enumerated PBS datastores");

		let commands_dir = self.temp_dir.join("var/lib/proxsave-info/commands/pbs");
		let inventory_dir = self.temp_dir.join("var/lib/proxsave-info/inventory");

		let mut files = self.collect_datastore_inventory_files(&inventory_dir).await;

		let fstab_text = files.iter().find(|f| f.logical_path.ends_with("etc/fstab")).map(|f| f.content.as_str()).unwrap_or_default();
		let crypttab_text = files.iter().find(|f| f.logical_path.ends_with("etc/crypttab")).map(|f| f.content.as_str()).unwrap_or_default();
		let referenced = self.collect_referenced_files(fstab_text, crypttab_text).await;
		files.extend(referenced);

		self.write_json_report(&inventory_dir.join("host_files.json"), &files).await;

		let dirs = self.collect_datastore_inventory_dirs().await;
		self.write_json_report(&inventory_dir.join("host_dirs.json"), &dirs).await;

		let commands = self.collect_datastore_inventory_commands().await;
		self.write_json_report(&inventory_dir.join("host_commands.json"), &commands).await;

		let mut datastore_reports = Vec::new();
		let mut pxar_inputs = Vec::new();
		for definition in &definitions {
			let inventory = self.inspect_datastore(definition).await;
			let namespaces = self.collect_pbs_namespaces(&definition.name, &definition.path).await;

			let ds_commands_dir = commands_dir.join(&definition.name);
			self.run_datastore_commands(&definition.name, &ds_commands_dir).await;

			if inventory.path_ok {
				pxar_inputs.push((definition.name.clone(), definition.path.clone()));
			}

			datastore_reports.push(PbsDatastoreReport { definition: definition.clone(), inventory, namespaces });
		}

		let pxar_metadata = pxar::collect_pbs_pxar_metadata(self, pxar_inputs).await;
		for metadata in &pxar_metadata {
			let report_path = commands_dir.join(format!("{}_pxar.txt", metadata.datastore));
			let text = pxar::pxar_text_report(metadata);
			if let Err(e) = crate::collector::write_report_file(&report_path, text.as_bytes()).await {
				warn!(datastore = %metadata.datastore, error = %e, "failed to write pxar report");
			}
		}

		Ok(PbsReport { datastores: datastore_reports, pxar_metadata })
	}

	async fn enumerate_datastores(&self) -> Result<Vec<DatastoreDefinition>> {
		let cli_json = self
			.capture_command_output_with_pbs_auth(
				"proxmox-backup-manager",
				&["datastore", "list", "--output-format=json"],
				None,
				"datastore list",
				false,
			)
			.await?
			.unwrap_or_default();

		Ok(datastore::merge_datastores(&cli_json, &self.config.pbs_datastore_paths))
	}

	async fn run_datastore_commands(&self, name: &str, commands_dir: &Path) {
		let calls: &[(&str, &[&str])] = &[
			("proxmox-backup-manager", &["datastore", "show"]),
			("proxmox-backup-client", &["group", "list"]),
			("proxmox-backup-client", &["snapshot", "list"]),
		];

		for (cmd, args) in calls {
			let mut full_args: Vec<&str> = args.to_vec();
			full_args.push(name);
			let out_path = commands_dir.join(format!("{cmd}.txt"));
			if let Ok(Some(output)) = self
				.capture_command_output_with_pbs_auth_for_datastore(cmd, &full_args, name, Some(&out_path), cmd, false)
				.await
			{
				if output.is_empty() {
					warn!(datastore = name, command = cmd, "empty output");
				}
			}
		}
	}

	async fn write_json_report<T: Serialize>(&self, path: &Path, value: &T) {
		match serde_json::to_vec_pretty(value) {
			Ok(bytes) => {
				if let Err(e) = crate::collector::write_report_file(path, &bytes).await {
					warn!(path = %path.display(), error = %e, "failed to write inventory report");
				}
			}
			Err(e) => warn!(path = %path.display(), error = %e, "failed to serialize inventory report"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CollectorConfig, RealDeps};
	use std::sync::Arc;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn missing_pbs_config_path_is_not_a_pbs_system() {
		let dir = tempfile::tempdir().unwrap();
		let collector = Collector::new(
			CollectorConfig { system_root_prefix: dir.path().to_path_buf(), ..Default::default() },
			Arc::new(RealDeps),
			dir.path().join("stage"),
			CancellationToken::new(),
		);
		let err = collector.collect_pbs_configs().await.unwrap_err();
		assert!(err.to_string().contains("not a PBS system"));
	}
}
