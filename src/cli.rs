//! Command-line surface (§6): a single `run` binary mirroring the
//! teacher's `Args`/`Context` pattern, translated to `CollectorConfig`.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::config::{CollectorConfig, CompressionMode, CompressionType};

/// proxsave — agentless, read-only configuration and inventory capture
/// for Proxmox PVE/PBS hosts.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Args {
	/// Set diagnostic log level; repeat for more detail (up to `-vvv`)
	#[arg(long, short, action = ArgAction::Count, global = true)]
	pub verbose: u8,

	/// Write diagnostic logs to a file (JSON format) instead of stderr
	#[arg(long, global = true, value_name = "PATH")]
	pub log_file: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
	/// Capture host configuration and inventory into an archive
	Run(RunArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
#[clap(rename_all = "lowercase")]
pub enum FlavorArg {
	Pve,
	Pbs,
	#[default]
	Auto,
}

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
	/// Output path prefix; the archive and manifest are written alongside it
	#[arg(long, value_name = "PATH")]
	pub output: PathBuf,

	/// Chroot-style prefix for every hardcoded host path (test use only)
	#[arg(long, default_value = "", value_name = "PATH")]
	pub system_root: PathBuf,

	/// Which Proxmox flavor to collect; "auto" probes /etc/pve then /etc/proxmox-backup
	#[arg(long, value_enum, default_value = "auto")]
	pub flavor: FlavorArg,

	/// Run the full pipeline without writing anything to disk
	#[arg(long)]
	pub dry_run: bool,

	#[arg(long = "no-cluster-config", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_cluster_config: bool,
	#[arg(long = "no-network-configs", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_network_configs: bool,
	#[arg(long = "no-vm-configs", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_vm_configs: bool,
	#[arg(long = "no-vzdump-config", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_vzdump_config: bool,
	#[arg(long = "no-pve-firewall", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_pve_firewall: bool,
	#[arg(long = "no-pve-acl", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_pve_acl: bool,
	#[arg(long = "no-pve-jobs", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_pve_jobs: bool,
	#[arg(long = "no-pve-schedules", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_pve_schedules: bool,
	#[arg(long = "no-pve-replication", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_pve_replication: bool,
	#[arg(long = "pve-backup-files", action = ArgAction::SetTrue, default_value_t = false)]
	pub backup_pve_backup_files: bool,
	#[arg(long = "no-ceph-config", action = ArgAction::SetFalse, default_value_t = true)]
	pub backup_ceph_config: bool,
	#[arg(long = "small-pve-backups", action = ArgAction::SetTrue, default_value_t = false)]
	pub backup_small_pve_backups: bool,

	/// Archive compression
	#[arg(long, value_enum, default_value = "zstd")]
	pub compression: CompressionType,
	/// Compressor level; defaults per-algorithm when unset
	#[arg(long)]
	pub compression_level: Option<u32>,
	/// zstd-only: "ultra" raises the level ceiling to 22
	#[arg(long, value_enum, default_value = "standard")]
	pub compression_mode: CompressionMode,
	/// Compressor thread count; 0 lets the compressor choose
	#[arg(long, default_value_t = 0)]
	pub compression_threads: u32,

	/// age recipient (public key or path to a recipients file); repeatable
	#[arg(long = "encrypt-to", value_name = "RECIPIENT")]
	pub encrypt_to: Vec<String>,

	/// PBS repository string (`user@realm@host:datastore`)
	#[arg(long, env = "PBS_REPOSITORY")]
	pub pbs_repository: Option<String>,
	/// PBS server TLS fingerprint
	#[arg(long, env = "PBS_FINGERPRINT")]
	pub pbs_fingerprint: Option<String>,

	/// Extra PBS_DATASTORE_PATH-style overrides, merged with CLI-discovered datastores
	#[arg(long = "pbs-datastore-path", value_name = "PATH")]
	pub pbs_datastore_paths: Vec<PathBuf>,
}

impl RunArgs {
	/// Builds a [`CollectorConfig`] from parsed arguments. `PBS_PASSWORD`
	/// is read directly from the environment (§6: "password via
	/// $PBS_PASSWORD only" — never accepted as a flag, so it can't leak
	/// into `ps`/shell history).
	pub fn into_collector_config(self) -> CollectorConfig {
		let pbs_password = std::env::var("PBS_PASSWORD").ok();
		CollectorConfig {
			system_root_prefix: self.system_root,
			backup_cluster_config: self.backup_cluster_config,
			backup_network_configs: self.backup_network_configs,
			backup_vm_configs: self.backup_vm_configs,
			backup_vzdump_config: self.backup_vzdump_config,
			backup_pve_firewall: self.backup_pve_firewall,
			backup_pve_acl: self.backup_pve_acl,
			backup_pve_jobs: self.backup_pve_jobs,
			backup_pve_schedules: self.backup_pve_schedules,
			backup_pve_replication: self.backup_pve_replication,
			backup_pve_backup_files: self.backup_pve_backup_files,
			backup_ceph_config: self.backup_ceph_config,
			backup_small_pve_backups: self.backup_small_pve_backups,
			pbs_repository: self.pbs_repository,
			pbs_password,
			pbs_fingerprint: self.pbs_fingerprint,
			pbs_datastore_paths: self.pbs_datastore_paths,
			compression_type: self.compression,
			compression_level: self.compression_level,
			compression_mode: self.compression_mode,
			compression_threads: self.compression_threads,
			encrypt_archive: !self.encrypt_to.is_empty(),
			age_recipients: self.encrypt_to,
			dry_run: self.dry_run,
			..CollectorConfig::default()
		}
	}
}

pub fn parse() -> Args {
	if std::env::var("RUST_LOG").is_ok() {
		tracing::warn!("RUST_LOG is set; -v/--log-file verbosity flags have no effect");
	}
	let args = Args::parse();
	debug!(?args, "parsed CLI arguments");
	args
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn cli_definition_is_valid() {
		Args::command().debug_assert();
	}

	#[test]
	fn run_defaults_match_collector_config_defaults() {
		let args = Args::parse_from(["proxsave", "run", "--output", "/tmp/out"]);
		let Command::Run(run) = args.command;
		let config = run.into_collector_config();
		assert!(config.backup_cluster_config);
		assert!(!config.backup_pve_backup_files);
		assert_eq!(config.compression_type, CompressionType::Zstd);
		assert!(!config.encrypt_archive);
	}

	#[test]
	fn encrypt_to_flag_enables_encryption() {
		let args = Args::parse_from(["proxsave", "run", "--output", "/tmp/out", "--encrypt-to", "age1abc"]);
		let Command::Run(run) = args.command;
		let config = run.into_collector_config();
		assert!(config.encrypt_archive);
		assert_eq!(config.age_recipients, vec!["age1abc".to_string()]);
	}
}
