//! Archive manifest (§3 `Manifest`, §4.9, §6): the sidecar JSON (or
//! legacy `KEY=VALUE`) that describes an archive without needing to
//! decompress it.

use std::path::Path;

use miette::{IntoDiagnostic as _, Result};
use serde::{Deserialize, Serialize};

use crate::config::{CompressionMode, CompressionType, EncryptionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
	Standalone,
	Cluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
	pub archive_path: String,
	pub archive_size: u64,
	pub sha256: String,
	pub created_at: String,
	pub compression_type: CompressionType,
	pub compression_level: u32,
	pub compression_mode: CompressionMode,
	pub proxmox_type: String,
	pub proxmox_targets: Vec<String>,
	pub proxmox_version: String,
	pub hostname: String,
	pub script_version: String,
	pub encryption_mode: EncryptionMode,
	pub cluster_mode: ClusterMode,
}

impl Manifest {
	pub fn sidecar_path(archive_path: &Path) -> std::path::PathBuf {
		let mut name = archive_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
		name.push(".manifest.json");
		archive_path.with_file_name(name)
	}

	pub fn legacy_sidecar_path(archive_path: &Path) -> std::path::PathBuf {
		archive_path.with_extension("metadata")
	}

	pub fn checksum_sidecar_path(archive_path: &Path) -> std::path::PathBuf {
		let mut name = archive_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
		name.push(".sha256");
		archive_path.with_file_name(name)
	}

	pub async fn write(&self, archive_path: &Path) -> Result<()> {
		let json = serde_json::to_vec_pretty(self).into_diagnostic()?;
		tokio::fs::write(Self::sidecar_path(archive_path), json)
			.await
			.into_diagnostic()
	}
}

/// Loads a manifest from either its JSON form or a legacy `KEY=VALUE`
/// sidecar. In legacy mode, size/mtime come from `stat`-ing the adjacent
/// archive, and a `.sha256` sidecar (`<hex> <basename>`) supplies the
/// checksum when present.
pub async fn load_manifest(archive_path: &Path) -> Result<Manifest> {
	let json_path = Manifest::sidecar_path(archive_path);
	if let Ok(bytes) = tokio::fs::read(&json_path).await {
		return serde_json::from_slice(&bytes).into_diagnostic();
	}

	let legacy_path = Manifest::legacy_sidecar_path(archive_path);
	let legacy_text = tokio::fs::read_to_string(&legacy_path)
		.await
		.into_diagnostic()
		.map_err(|e| miette::miette!("no manifest found for {}: {e}", archive_path.display()))?;

	let mut fields = std::collections::HashMap::new();
	for line in legacy_text.lines() {
		if let Some((key, value)) = line.split_once('=') {
			fields.insert(key.trim().to_string(), value.trim().to_string());
		}
	}

	let meta = tokio::fs::metadata(archive_path).await.into_diagnostic()?;
	let sha256 = match tokio::fs::read_to_string(Manifest::checksum_sidecar_path(archive_path)).await {
		Ok(text) => text.split_whitespace().next().unwrap_or_default().to_string(),
		Err(_) => fields.get("SHA256").cloned().unwrap_or_default(),
	};

	Ok(Manifest {
		archive_path: archive_path.to_string_lossy().into_owned(),
		archive_size: meta.len(),
		sha256,
		created_at: fields.get("CREATED_AT").cloned().unwrap_or_else(|| {
			chrono::DateTime::<chrono::Utc>::from(meta.modified().unwrap_or(std::time::SystemTime::now())).to_rfc3339()
		}),
		compression_type: parse_compression_type(fields.get("COMPRESSION_TYPE").map(String::as_str)),
		compression_level: fields.get("COMPRESSION_LEVEL").and_then(|v| v.parse().ok()).unwrap_or(0),
		compression_mode: CompressionMode::Standard,
		proxmox_type: fields.get("PROXMOX_TYPE").cloned().unwrap_or_default(),
		proxmox_targets: Vec::new(),
		proxmox_version: fields.get("PROXMOX_VERSION").cloned().unwrap_or_default(),
		hostname: fields.get("HOSTNAME").cloned().unwrap_or_default(),
		script_version: fields.get("SCRIPT_VERSION").cloned().unwrap_or_default(),
		encryption_mode: if archive_path.extension().and_then(|e| e.to_str()) == Some("age") {
			EncryptionMode::Age
		} else {
			EncryptionMode::Plain
		},
		cluster_mode: if fields.get("CLUSTER_MODE").map(String::as_str) == Some("cluster") {
			ClusterMode::Cluster
		} else {
			ClusterMode::Standalone
		},
	})
}

fn parse_compression_type(value: Option<&str>) -> CompressionType {
	match value {
		Some("gzip") => CompressionType::Gzip,
		Some("xz") => CompressionType::Xz,
		Some("zstd") => CompressionType::Zstd,
		_ => CompressionType::None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_manifest() -> Manifest {
		Manifest {
			archive_path: "/tmp/out.tar.zst".into(),
			archive_size: 1234,
			sha256: "a".repeat(64),
			created_at: "2026-07-28T00:00:00Z".into(),
			compression_type: CompressionType::Zstd,
			compression_level: 19,
			compression_mode: CompressionMode::Standard,
			proxmox_type: "pve".into(),
			proxmox_targets: vec!["node1".into()],
			proxmox_version: "8.2".into(),
			hostname: "node1".into(),
			script_version: "1.0.0".into(),
			encryption_mode: EncryptionMode::Plain,
			cluster_mode: ClusterMode::Standalone,
		}
	}

	#[tokio::test]
	async fn json_manifest_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("out.tar.zst");
		tokio::fs::write(&archive, b"x").await.unwrap();

		let manifest = sample_manifest();
		manifest.write(&archive).await.unwrap();

		let loaded = load_manifest(&archive).await.unwrap();
		assert_eq!(loaded.sha256, manifest.sha256);
		assert_eq!(loaded.proxmox_type, "pve");
	}

	#[tokio::test]
	async fn legacy_sidecar_fills_size_from_stat() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("out.tar.gz");
		tokio::fs::write(&archive, b"0123456789").await.unwrap();
		tokio::fs::write(
			dir.path().join("out.metadata"),
			"PROXMOX_TYPE=pbs\nHOSTNAME=store1\n",
		)
		.await
		.unwrap();
		tokio::fs::write(dir.path().join("out.tar.gz.sha256"), format!("{} out.tar.gz", "b".repeat(64)))
			.await
			.unwrap();

		let loaded = load_manifest(&archive).await.unwrap();
		assert_eq!(loaded.archive_size, 10);
		assert_eq!(loaded.proxmox_type, "pbs");
		assert_eq!(loaded.sha256, "b".repeat(64));
	}
}
