#![deny(rust_2018_idioms)]

pub mod archive;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod exclude;
pub mod inventory;
pub mod logging;
pub mod optimize;
pub mod pbs;
pub mod privilege;
pub mod pve;
pub mod safefs;
pub mod sampling;
pub mod stats;

use std::path::Path;
use std::sync::Arc;

use miette::{IntoDiagnostic as _, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use archive::{ArchiveOutcome, ClusterMode, Manifest};
use config::{CollectorConfig, CollectorDeps, EncryptionMode, FlavorKind, RealDeps};
use error::CoreError;
use pve::ClusterMode as PveClusterMode;

pub(crate) const SCRIPT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Disambiguates concurrent `collect_all` invocations within the same
/// process (notably in the test suite, where `std::process::id()` alone
/// would collide across parallel `#[tokio::test]` runs).
static TEMP_DIR_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Generic, flavor-independent host facts (§2 "generic system capture")
/// gathered before the PVE/PBS pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct GenericSystemInfo {
	pub hostname: String,
	pub os_release: String,
}

#[derive(Debug, Clone)]
pub struct CollectAllReport {
	pub flavor: FlavorKind,
	pub generic: GenericSystemInfo,
	pub stats: stats::StatsSnapshot,
	pub archive: Option<ArchiveOutcome>,
}

/// Probes `/etc/pve` then `/etc/proxmox-backup` to resolve `FlavorKind`
/// when the caller passes `auto` (§6 CLI surface).
pub async fn detect_flavor(config: &CollectorConfig) -> FlavorKind {
	if tokio::fs::symlink_metadata(config.effective_pve_config_path()).await.is_ok() {
		FlavorKind::Pve
	} else if tokio::fs::symlink_metadata(config.effective_pbs_config_path()).await.is_ok() {
		FlavorKind::Pbs
	} else {
		FlavorKind::Unknown
	}
}

async fn collect_generic_system_info(collector: &collector::Collector) -> GenericSystemInfo {
	let hostname = tokio::fs::read_to_string(collector.config.under_root(Path::new("/etc/hostname")))
		.await
		.map(|s| s.trim().to_string())
		.unwrap_or_default();
	let os_release = tokio::fs::read_to_string(collector.config.under_root(Path::new("/etc/os-release")))
		.await
		.unwrap_or_default();

	let generic_dir = collector.temp_dir.join("var/lib/proxsave-info");
	let _ = collector.ensure_dir(&generic_dir).await;
	let _ = collector::write_report_file(&generic_dir.join("hostname.txt"), hostname.as_bytes()).await;
	let _ = collector::write_report_file(&generic_dir.join("os-release.txt"), os_release.as_bytes()).await;

	let kernel_version = collector
		.capture_inventory_command_from_file(&collector.config.under_root(Path::new("/proc/version")), "kernel_version")
		.await;
	let _ = collector::write_report_file(&generic_dir.join("kernel-version.txt"), kernel_version.output.as_bytes()).await;

	GenericSystemInfo { hostname, os_release }
}

/// `CollectAll(ctx)` (§2 data flow): generic capture, flavor pipeline,
/// optimization stage, archiving, manifest.
#[instrument(level = "info", skip(config, cancel))]
pub async fn collect_all(
	config: CollectorConfig,
	output_base: &Path,
	flavor: FlavorKind,
	cancel: CancellationToken,
) -> Result<CollectAllReport> {
	collect_all_with_deps(config, output_base, flavor, cancel, Arc::new(RealDeps)).await
}

/// As [`collect_all`], but with the [`CollectorDeps`] seam exposed so
/// tests can substitute `LookPath`/`RunCommand` without a real Proxmox
/// host (§9 "dynamic dispatch over injectable functions").
async fn collect_all_with_deps(
	config: CollectorConfig,
	output_base: &Path,
	flavor: FlavorKind,
	cancel: CancellationToken,
	deps: Arc<dyn CollectorDeps>,
) -> Result<CollectAllReport> {
	if cancel.is_cancelled() {
		return Err(CoreError::Cancelled.into());
	}

	let instance = TEMP_DIR_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	let temp_dir = std::env::temp_dir().join(format!("proxsave-{}-{instance}", std::process::id()));
	tokio::fs::create_dir_all(&temp_dir).await.into_diagnostic()?;

	let collector = collector::Collector::new(config.clone(), deps, temp_dir.clone(), cancel.clone());

	let generic = collect_generic_system_info(&collector).await;

	if cancel.is_cancelled() {
		let _ = tokio::fs::remove_dir_all(&temp_dir).await;
		return Err(CoreError::Cancelled.into());
	}

	let (proxmox_type, proxmox_targets, proxmox_version, cluster_mode) = match flavor {
		FlavorKind::Pve => {
			let report = collector.collect_pve_configs().await?;
			let version = extract_pveversion(&collector.temp_dir).await;
			let cluster_mode = match report.cluster_mode {
				PveClusterMode::Cluster => ClusterMode::Cluster,
				PveClusterMode::Standalone => ClusterMode::Standalone,
			};
			("pve".to_string(), vec![generic.hostname.clone()], version, cluster_mode)
		}
		FlavorKind::Pbs => {
			let report = collector.collect_pbs_configs().await?;
			let targets = report.datastores.iter().map(|d| d.definition.name.clone()).collect();
			("pbs".to_string(), targets, String::new(), ClusterMode::Standalone)
		}
		FlavorKind::Unknown => {
			warn!("host is neither a PVE nor a PBS system; generic capture only");
			("unknown".to_string(), Vec::new(), String::new(), ClusterMode::Standalone)
		}
	};

	if cancel.is_cancelled() {
		return Err(CoreError::Cancelled.into());
	}

	let optimize_report = optimize::run(&temp_dir, &config.optimize).await;
	info!(?optimize_report, "optimization stage complete");

	let encrypted = config.encrypt_archive;
	let archive_name = archive::archive_file_name(
		&output_base.file_name().and_then(|n| n.to_str()).unwrap_or("proxsave").to_string(),
		config.compression_type,
		encrypted,
	);
	let archive_path = output_base.with_file_name(archive_name);

	let outcome = archive::create_archive(&temp_dir, &archive_path, &config, &cancel)
		.await
		.map_err(|e| CoreError::Archive(anyhow::anyhow!("{e}")))?;

	if !config.dry_run {
		let manifest = Manifest {
			archive_path: outcome.archive_path.to_string_lossy().into_owned(),
			archive_size: outcome.archive_size,
			sha256: outcome.sha256.clone(),
			created_at: chrono::Utc::now().to_rfc3339(),
			compression_type: config.compression_type,
			compression_level: config.compression_level.unwrap_or(0),
			compression_mode: config.compression_mode,
			proxmox_type,
			proxmox_targets,
			proxmox_version,
			hostname: generic.hostname.clone(),
			script_version: SCRIPT_VERSION.to_string(),
			encryption_mode: if encrypted { EncryptionMode::Age } else { EncryptionMode::Plain },
			cluster_mode,
		};
		manifest.write(&outcome.archive_path).await.map_err(|e| CoreError::Archive(anyhow::anyhow!("{e}")))?;

		archive::verify_archive(&outcome.archive_path, config.compression_type, encrypted)
			.await
			.map_err(|e| CoreError::Integrity(e.to_string()))?;
		archive::verify_checksum(&outcome.archive_path, &outcome.sha256)
			.await
			.map_err(|e| CoreError::Integrity(e.to_string()))?;
	}

	let stats = collector.stats.snapshot();
	let _ = tokio::fs::remove_dir_all(&temp_dir).await;

	Ok(CollectAllReport {
		flavor,
		generic,
		stats,
		archive: Some(outcome),
	})
}

async fn extract_pveversion(temp_dir: &Path) -> String {
	let path = temp_dir.join("var/lib/proxsave-info/commands/pve/pveversion.txt");
	tokio::fs::read_to_string(path)
		.await
		.ok()
		.and_then(|s| s.lines().next().map(String::from))
		.unwrap_or_default()
}

/// Sets up the root cancellation token and wires `ctrlc` to it, matching
/// the single-token-threaded-everywhere control flow of §2.
pub fn install_ctrlc_cancellation() -> CancellationToken {
	let cancel = CancellationToken::new();
	let handler_cancel = cancel.clone();
	let _ = ctrlc::set_handler(move || {
		handler_cancel.cancel();
	});
	cancel
}

/// Maps a top-level result to the exit codes of §6: `0` success, `1`
/// fatal error, `2` cancelled by signal, `3` archive verification failed.
pub fn exit_code_for(result: &Result<CollectAllReport>) -> i32 {
	match result {
		Ok(_) => 0,
		Err(report) => {
			if let Some(CoreError::Cancelled) = report.downcast_ref::<CoreError>() {
				2
			} else if let Some(CoreError::Integrity(_)) = report.downcast_ref::<CoreError>() {
				3
			} else {
				1
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn detect_flavor_prefers_pve_over_pbs() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("etc/pve")).await.unwrap();
		tokio::fs::create_dir_all(dir.path().join("etc/proxmox-backup")).await.unwrap();
		let config = CollectorConfig { system_root_prefix: dir.path().to_path_buf(), ..Default::default() };
		assert_eq!(detect_flavor(&config).await, FlavorKind::Pve);
	}

	#[tokio::test]
	async fn detect_flavor_falls_back_to_unknown() {
		let dir = tempfile::tempdir().unwrap();
		let config = CollectorConfig { system_root_prefix: dir.path().to_path_buf(), ..Default::default() };
		assert_eq!(detect_flavor(&config).await, FlavorKind::Unknown);
	}

	#[test]
	fn exit_code_maps_cancelled_to_2() {
		let err: Result<CollectAllReport> = Err(CoreError::Cancelled.into());
		assert_eq!(exit_code_for(&err), 2);
	}

	#[test]
	fn exit_code_maps_integrity_failure_to_3() {
		let err: Result<CollectAllReport> = Err(CoreError::Integrity("mismatch".into()).into());
		assert_eq!(exit_code_for(&err), 3);
	}

	#[test]
	fn exit_code_maps_generic_error_to_1() {
		let err: Result<CollectAllReport> = Err(CoreError::Pve(anyhow::anyhow!("boom")).into());
		assert_eq!(exit_code_for(&err), 1);
	}

	/// Always reports every binary present and every command as
	/// succeeding with empty output, so the PVE/PBS pipelines can run
	/// end to end without a real Proxmox host (§9 "dynamic dispatch
	/// over injectable functions").
	#[derive(Debug, Default, Clone, Copy)]
	struct StubDeps;

	#[async_trait::async_trait]
	impl CollectorDeps for StubDeps {
		async fn look_path(&self, name: &str) -> Option<std::path::PathBuf> {
			Some(std::path::PathBuf::from(format!("/usr/bin/{name}")))
		}

		async fn stat(&self, path: &Path) -> std::io::Result<std::fs::Metadata> {
			let path = path.to_owned();
			tokio::task::spawn_blocking(move || std::fs::symlink_metadata(&path))
				.await
				.expect("stat blocking task panicked")
		}

		async fn run_command(
			&self,
			_cancel: &CancellationToken,
			_name: &str,
			_args: &[&str],
		) -> Result<config::CommandOutput> {
			Ok(config::CommandOutput { status: Some(0), combined: Vec::new() })
		}

		async fn run_command_with_env(
			&self,
			_cancel: &CancellationToken,
			_extra_env: &[(String, String)],
			_name: &str,
			_args: &[&str],
		) -> Result<config::CommandOutput> {
			Ok(config::CommandOutput { status: Some(0), combined: Vec::new() })
		}

		async fn detect_unprivileged_container(&self) -> (bool, Option<config::UnprivilegedEvidence>) {
			(false, None)
		}
	}

	/// S1: PVE offline capture against an empty `<tmp>/etc/pve/`, with
	/// stubbed deps standing in for real Proxmox binaries, succeeds and
	/// stages the directory plus generic system facts.
	#[tokio::test]
	async fn pve_offline_capture_with_stubbed_deps_succeeds() {
		let root = tempfile::tempdir().unwrap();
		tokio::fs::create_dir_all(root.path().join("etc/pve")).await.unwrap();
		tokio::fs::write(root.path().join("etc/hostname"), b"pve-test\n").await.unwrap();
		tokio::fs::write(root.path().join("etc/os-release"), b"NAME=test\n").await.unwrap();

		let config = CollectorConfig {
			system_root_prefix: root.path().to_path_buf(),
			backup_ceph_config: false,
			dry_run: true,
			..Default::default()
		};

		let out_dir = tempfile::tempdir().unwrap();
		let output = out_dir.path().join("proxsave-test");

		let result = collect_all_with_deps(
			config,
			&output,
			FlavorKind::Pve,
			CancellationToken::new(),
			Arc::new(StubDeps),
		)
		.await;
		assert!(result.is_ok(), "{result:?}");
		let report = result.unwrap();
		assert_eq!(report.generic.hostname, "pve-test");
		assert_eq!(report.stats.files_failed, 0);
		assert_eq!(exit_code_for(&Ok(report)), 0);
	}
}
