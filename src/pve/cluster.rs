//! Cluster heuristics (§4.6 step 2): evaluated in order, stop at first
//! positive.

use std::path::Path;

use crate::collector::Collector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
	Standalone,
	Cluster,
}

const COROSYNC_MARKERS: &[&str] = &["cluster_name", "nodelist", "ring0_addr"];

impl Collector {
	pub async fn detect_cluster_mode(&self, pve_config_path: &Path) -> ClusterMode {
		let corosync_path = pve_config_path.join("corosync.conf");
		let corosync_present = match tokio::fs::read_to_string(&corosync_path).await {
			Ok(text) => {
				let lower = text.to_lowercase();
				if COROSYNC_MARKERS.iter().any(|m| lower.contains(m)) {
					return ClusterMode::Cluster;
				}
				true
			}
			Err(_) => false,
		};

		if corosync_present {
			let nodes_dir = pve_config_path.join("nodes");
			if let Ok(mut entries) = tokio::fs::read_dir(&nodes_dir).await {
				let mut count = 0;
				while entries.next_entry().await.ok().flatten().is_some() {
					count += 1;
				}
				if count > 1 {
					return ClusterMode::Cluster;
				}
			}

			if let Some(output) = self
				.capture_command_output("systemctl", &["is-active", "corosync.service"], None, "corosync status", false)
				.await
				.ok()
				.flatten()
			{
				if String::from_utf8_lossy(&output).trim() == "active" {
					return ClusterMode::Cluster;
				}
			}
		}

		if let Some(output) = self
			.capture_command_output("pvecm", &["status"], None, "pvecm status", false)
			.await
			.ok()
			.flatten()
		{
			let text = String::from_utf8_lossy(&output);
			if text.contains("Cluster information") {
				return ClusterMode::Cluster;
			}
			if text.contains("corosync config") && text.contains("does not exist") {
				return ClusterMode::Standalone;
			}
		}

		ClusterMode::Standalone
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CollectorConfig, RealDeps};
	use std::sync::Arc;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn corosync_markers_indicate_cluster() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("corosync.conf"), "nodelist {\n  node {}\n}\n")
			.await
			.unwrap();
		let collector = Collector::new(
			CollectorConfig::default(),
			Arc::new(RealDeps),
			dir.path().to_path_buf(),
			CancellationToken::new(),
		);
		assert_eq!(collector.detect_cluster_mode(dir.path()).await, ClusterMode::Cluster);
	}

	#[tokio::test]
	async fn missing_corosync_config_defaults_standalone() {
		let dir = tempfile::tempdir().unwrap();
		let collector = Collector::new(
			CollectorConfig::default(),
			Arc::new(RealDeps),
			dir.path().to_path_buf(),
			CancellationToken::new(),
		);
		assert_eq!(collector.detect_cluster_mode(dir.path()).await, ClusterMode::Standalone);
	}
}
