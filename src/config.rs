//! Data model (§3): `FlavorKind`, `CollectorConfig`, and the `CollectorDeps`
//! dependency-injection seam used throughout the engine for testability.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use miette::Result;

/// Which Proxmox flavor is running on the host. `Unknown` runs generic
/// capture only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlavorKind {
	Pve,
	Pbs,
	#[default]
	Unknown,
}

/// Evidence that the host is an unprivileged container, returned by
/// [`CollectorDeps::detect_unprivileged_container`]. Carrying free-text
/// evidence (rather than a hardcoded hint) is what lets the privilege
/// classifier (§4.2) stay decoupled from any particular runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprivilegedEvidence(pub String);

/// The output of running a subprocess to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
	pub status: Option<i32>,
	/// Combined stdout+stderr, as the privilege classifier (§4.2) and
	/// systemctl special-casing (§4.3) both match against combined output.
	pub combined: Vec<u8>,
}

impl CommandOutput {
	pub fn success(&self) -> bool {
		self.status == Some(0)
	}
}

/// Dependency-injection seam (§3 "CollectorDeps"). Read-only after
/// construction; a real implementation backs onto the OS, a test
/// implementation can substitute every operation.
#[async_trait]
pub trait CollectorDeps: Send + Sync {
	/// Resolve `name` against `$PATH`, returning the absolute path.
	async fn look_path(&self, name: &str) -> Option<PathBuf>;

	async fn stat(&self, path: &Path) -> std::io::Result<std::fs::Metadata>;

	/// Run a command to completion, racing it against `cancel`.
	async fn run_command(
		&self,
		cancel: &tokio_util::sync::CancellationToken,
		name: &str,
		args: &[&str],
	) -> Result<CommandOutput>;

	/// As [`CollectorDeps::run_command`], but with extra environment
	/// variables appended to the child's environment. Values are never
	/// logged (§6).
	async fn run_command_with_env(
		&self,
		cancel: &tokio_util::sync::CancellationToken,
		extra_env: &[(String, String)],
		name: &str,
		args: &[&str],
	) -> Result<CommandOutput>;

	async fn detect_unprivileged_container(&self) -> (bool, Option<UnprivilegedEvidence>);
}

/// The real, OS-backed [`CollectorDeps`]. See [`crate::collector::proc_exec`]
/// for the shared subprocess-execution implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealDeps;

#[async_trait]
impl CollectorDeps for RealDeps {
	async fn look_path(&self, name: &str) -> Option<PathBuf> {
		crate::collector::look_path(name)
	}

	async fn stat(&self, path: &Path) -> std::io::Result<std::fs::Metadata> {
		let path = path.to_owned();
		tokio::task::spawn_blocking(move || std::fs::symlink_metadata(&path))
			.await
			.expect("stat blocking task panicked")
	}

	async fn run_command(
		&self,
		cancel: &tokio_util::sync::CancellationToken,
		name: &str,
		args: &[&str],
	) -> Result<CommandOutput> {
		crate::collector::proc_exec::run(cancel, &[], name, args).await
	}

	async fn run_command_with_env(
		&self,
		cancel: &tokio_util::sync::CancellationToken,
		extra_env: &[(String, String)],
		name: &str,
		args: &[&str],
	) -> Result<CommandOutput> {
		crate::collector::proc_exec::run(cancel, extra_env, name, args).await
	}

	async fn detect_unprivileged_container(&self) -> (bool, Option<UnprivilegedEvidence>) {
		crate::privilege::detect_unprivileged_container().await
	}
}

/// Compression algorithm selection (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum CompressionType {
	#[default]
	None,
	Gzip,
	Xz,
	Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum CompressionMode {
	#[default]
	Standard,
	Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
	#[default]
	Plain,
	Age,
}

/// Immutable, fully-parsed collection configuration (§3 "CollectorConfig").
#[derive(Debug, Clone)]
pub struct CollectorConfig {
	// Paths
	pub system_root_prefix: PathBuf,
	pub pve_config_path: PathBuf,
	pub pve_cluster_path: PathBuf,
	pub pbs_config_path: PathBuf,
	pub corosync_config_path: PathBuf,
	pub ceph_config_path: PathBuf,
	pub vzdump_config_path: PathBuf,
	pub pbs_datastore_paths: Vec<PathBuf>,

	// Toggles
	pub backup_cluster_config: bool,
	pub backup_network_configs: bool,
	pub backup_vm_configs: bool,
	pub backup_vzdump_config: bool,
	pub backup_pve_firewall: bool,
	pub backup_pve_acl: bool,
	pub backup_pve_jobs: bool,
	pub backup_pve_schedules: bool,
	pub backup_pve_replication: bool,
	pub backup_pve_backup_files: bool,
	pub backup_ceph_config: bool,
	pub backup_small_pve_backups: bool,

	// PBS auth (never placed in argv; passed via extra_env only)
	pub pbs_repository: Option<String>,
	pub pbs_password: Option<String>,
	pub pbs_fingerprint: Option<String>,

	// Sampling/tuning
	pub pxar_scan_fanout_level: usize,
	pub pxar_scan_max_roots: usize,
	pub pxar_enum_workers: usize,
	pub pxar_enum_budget_ms: u64,
	pub pxar_stop_on_cap: bool,
	pub pxar_datastore_concurrency: usize,
	pub pxar_intra_concurrency: usize,
	pub pxar_file_include_patterns: Vec<String>,
	pub pxar_file_exclude_patterns: Vec<String>,

	// Exclusions
	pub exclude_patterns: Vec<String>,

	// Sizing
	pub max_pve_backup_size_bytes: u64,
	pub pve_backup_include_pattern: Option<String>,

	// Optimization stage
	pub optimize: OptimizeConfig,

	// Archiver
	pub compression_type: CompressionType,
	pub compression_level: Option<u32>,
	pub compression_mode: CompressionMode,
	pub compression_threads: u32,
	pub encrypt_archive: bool,
	pub age_recipients: Vec<String>,

	pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct OptimizeConfig {
	pub enabled: bool,
	pub prefilter_max_file_size_bytes: u64,
	pub chunk_threshold_bytes: u64,
	pub chunk_size_bytes: u64,
}

impl Default for OptimizeConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			prefilter_max_file_size_bytes: 8 * 1024 * 1024,
			chunk_threshold_bytes: 50 * 1024 * 1024,
			chunk_size_bytes: 10 * 1024 * 1024,
		}
	}
}

impl Default for CollectorConfig {
	fn default() -> Self {
		let root = PathBuf::new();
		Self {
			system_root_prefix: root.clone(),
			pve_config_path: PathBuf::from("/etc/pve"),
			pve_cluster_path: PathBuf::from("/etc/pve/cluster.conf"),
			pbs_config_path: PathBuf::from("/etc/proxmox-backup"),
			corosync_config_path: PathBuf::from("/etc/pve/corosync.conf"),
			ceph_config_path: PathBuf::from("/etc/pve/ceph.conf"),
			vzdump_config_path: PathBuf::from("/etc/vzdump.conf"),
			pbs_datastore_paths: Vec::new(),

			backup_cluster_config: true,
			backup_network_configs: true,
			backup_vm_configs: true,
			backup_vzdump_config: true,
			backup_pve_firewall: true,
			backup_pve_acl: true,
			backup_pve_jobs: true,
			backup_pve_schedules: true,
			backup_pve_replication: true,
			backup_pve_backup_files: false,
			backup_ceph_config: true,
			backup_small_pve_backups: false,

			pbs_repository: None,
			pbs_password: None,
			pbs_fingerprint: None,

			pxar_scan_fanout_level: 2,
			pxar_scan_max_roots: 64,
			pxar_enum_workers: 4,
			pxar_enum_budget_ms: 5_000,
			pxar_stop_on_cap: true,
			pxar_datastore_concurrency: 2,
			pxar_intra_concurrency: 4,
			pxar_file_include_patterns: vec!["*.pxar".into(), "*.pxar.*".into(), "catalog.pxar*".into()],
			pxar_file_exclude_patterns: Vec::new(),

			exclude_patterns: Vec::new(),

			max_pve_backup_size_bytes: 200 * 1024 * 1024,
			pve_backup_include_pattern: None,

			optimize: OptimizeConfig::default(),

			compression_type: CompressionType::Zstd,
			compression_level: None,
			compression_mode: CompressionMode::Standard,
			compression_threads: 0,
			encrypt_archive: false,
			age_recipients: Vec::new(),

			dry_run: false,
		}
	}
}

impl CollectorConfig {
	/// `<SystemRootPrefix>/etc/pve`, i.e. the effective PVE config path
	/// after applying the test-only root prefix (§4.6 step 1).
	pub fn effective_pve_config_path(&self) -> PathBuf {
		self.under_root(&self.pve_config_path)
	}

	pub fn effective_pbs_config_path(&self) -> PathBuf {
		self.under_root(&self.pbs_config_path)
	}

	/// Join `path` under `system_root_prefix` when it is non-empty and
	/// `path` is absolute (the common case for every hardcoded host path in
	/// this spec); otherwise return `path` unchanged.
	pub fn under_root(&self, path: &Path) -> PathBuf {
		if self.system_root_prefix.as_os_str().is_empty() {
			return path.to_path_buf();
		}
		if let Ok(rel) = path.strip_prefix("/") {
			self.system_root_prefix.join(rel)
		} else {
			self.system_root_prefix.join(path)
		}
	}
}
