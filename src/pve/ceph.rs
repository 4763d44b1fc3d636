//! Ceph detection and capture (§4.6 step 6).

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::collector::Collector;

const CEPH_MARKERS: &[&str] = &["fsid", "mon_host", "mon_initial_members"];

impl Collector {
	/// Ceph is declared present if any detection heuristic fires.
	pub async fn detect_ceph(&self, ceph_config_path: &Path) -> bool {
		if let Ok(text) = tokio::fs::read_to_string(ceph_config_path).await {
			let lower = text.to_lowercase();
			if CEPH_MARKERS.iter().any(|m| lower.contains(m)) {
				return true;
			}
		}

		if let Some(parent) = ceph_config_path.parent() {
			if let Ok(mut entries) = tokio::fs::read_dir(parent).await {
				while let Ok(Some(entry)) = entries.next_entry().await {
					if entry.file_name().to_string_lossy().ends_with(".keyring") {
						return true;
					}
				}
			}
		}

		if let Some(output) = self
			.capture_command_output("systemctl", &["is-active", "ceph.target"], None, "ceph.target", false)
			.await
			.ok()
			.flatten()
		{
			if String::from_utf8_lossy(&output).trim() == "active" {
				return true;
			}
		}

		if let Some(output) = self
			.capture_command_output("pvesm", &["status"], None, "pvesm status", false)
			.await
			.ok()
			.flatten()
		{
			let text = String::from_utf8_lossy(&output).to_lowercase();
			if text.contains("cephfs") || text.contains("rbd") {
				return true;
			}
		}

		if let Ok(Ok(Some(output))) = tokio::time::timeout(
			Duration::from_secs(5),
			self.capture_command_output("ceph", &["-s"], None, "ceph -s", false),
		)
		.await
		{
			if output.is_empty() {
				// command ran and produced no output; still a positive signal that the binary responded.
			}
			return true;
		}

		if let Some(output) = self
			.capture_command_output("pgrep", &["-f", "ceph-"], None, "pgrep ceph", false)
			.await
			.ok()
			.flatten()
		{
			if !output.is_empty() {
				return true;
			}
		}

		false
	}

	/// Runs the standard ceph status command suite once presence is
	/// confirmed, writing each under the commands report tree.
	pub async fn capture_ceph_status(&self, commands_dir: &Path) -> miette::Result<()> {
		let calls: &[(&str, &[&str])] = &[
			("ceph", &["-s"]),
			("ceph", &["osd", "df"]),
			("ceph", &["osd", "tree"]),
			("ceph", &["mon", "stat"]),
			("ceph", &["pg", "stat"]),
			("ceph", &["health", "detail"]),
		];

		for (cmd, args) in calls {
			let report = commands_dir.join(format!("{}_{}.txt", cmd, args.join("_")));
			if let Err(e) = self.safe_cmd_output(cmd, args, &report, "ceph status", false).await {
				info!(command = cmd, error = %e, "ceph command failed");
			}
		}
		Ok(())
	}
}
