//! Namespace enumeration (§4.7 step 4): prefers the CLI, falls back to a
//! bounded filesystem walk of `ns/*` directories.

use std::path::Path;

use crate::collector::Collector;

const MAX_NAMESPACE_DEPTH: usize = 8;

impl Collector {
	/// Enumerates namespaces for `datastore`. Tries
	/// `proxmox-backup-manager namespace list --output-format=json` first;
	/// on CLI failure falls back to walking `ns/` directories under
	/// `datastore_path` up to 8 levels deep.
	pub async fn collect_pbs_namespaces(&self, datastore: &str, datastore_path: &Path) -> Vec<String> {
		if let Ok(Some(output)) = self
			.capture_command_output_with_pbs_auth_for_datastore(
				"proxmox-backup-manager",
				&["namespace", "list", "--output-format=json", "--store", datastore],
				datastore,
				None,
				"namespace list",
				false,
			)
			.await
		{
			if let Ok(entries) = serde_json::from_slice::<Vec<serde_json::Value>>(&output) {
				let mut names: Vec<String> = entries
					.into_iter()
					.filter_map(|entry| entry.get("ns").and_then(|v| v.as_str()).map(String::from))
					.collect();
				names.sort();
				return names;
			}
		}

		walk_namespace_dirs(datastore_path).await
	}
}

async fn walk_namespace_dirs(datastore_path: &Path) -> Vec<String> {
	let mut out = Vec::new();
	walk_ns_level(datastore_path, String::new(), 0, &mut out).await;
	out.sort();
	out
}

fn walk_ns_level<'a>(
	dir: &'a Path,
	prefix: String,
	depth: usize,
	out: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
	Box::pin(async move {
		if depth >= MAX_NAMESPACE_DEPTH {
			return;
		}
		let ns_dir = dir.join("ns");
		let Ok(mut entries) = tokio::fs::read_dir(&ns_dir).await else { return };
		while let Ok(Some(entry)) = entries.next_entry().await {
			let Ok(file_type) = entry.file_type().await else { continue };
			if !file_type.is_dir() {
				continue;
			}
			let name = entry.file_name().to_string_lossy().into_owned();
			let ns_path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
			out.push(ns_path.clone());
			walk_ns_level(&entry.path(), ns_path, depth + 1, out).await;
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CollectorConfig, RealDeps};
	use std::sync::Arc;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn falls_back_to_filesystem_walk_when_cli_missing() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("ns/team-a/ns/sub1")).await.unwrap();
		tokio::fs::create_dir_all(dir.path().join("ns/team-b")).await.unwrap();

		let collector = Collector::new(
			CollectorConfig::default(),
			Arc::new(RealDeps),
			dir.path().join("stage"),
			CancellationToken::new(),
		);
		let namespaces = collector.collect_pbs_namespaces("store1", dir.path()).await;
		assert!(namespaces.contains(&"team-a".to_string()));
		assert!(namespaces.contains(&"team-b".to_string()));
		assert!(namespaces.contains(&"team-a/sub1".to_string()));
	}
}
