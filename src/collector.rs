//! Collector engine (§4.3 C3): safe filesystem copies with metadata
//! preservation, subprocess execution under cancellation, and failure
//! classification.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::{miette, Context as _, IntoDiagnostic as _, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{CollectorConfig, CollectorDeps};
use crate::error::kind_error;
use crate::exclude::ExcludeSet;
use crate::privilege::{self, PrivilegeReason};
use crate::stats::Stats;

pub mod proc_exec;

/// Scan `$PATH` for an executable named `name` (the `CollectorDeps.LookPath`
/// contract — implemented by hand since it's core plumbing, not an ambient
/// concern that warrants a crate).
pub fn look_path(name: &str) -> Option<PathBuf> {
	if name.contains('/') {
		let path = PathBuf::from(name);
		return is_executable(&path).then_some(path);
	}
	let path_var = std::env::var_os("PATH")?;
	for dir in std::env::split_paths(&path_var) {
		let candidate = dir.join(name);
		if is_executable(&candidate) {
			return Some(candidate);
		}
	}
	None
}

fn is_executable(path: &Path) -> bool {
	match std::fs::metadata(path) {
		Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
		Err(_) => false,
	}
}

static SYSTEMD_UNIT_NOT_FOUND: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)unit .* could not be found\.").unwrap());

pub struct Collector {
	pub config: CollectorConfig,
	pub deps: Arc<dyn CollectorDeps>,
	pub stats: Stats,
	pub temp_dir: PathBuf,
	pub exclude: ExcludeSet,
	pub cancel: CancellationToken,
}

impl Collector {
	pub fn new(
		config: CollectorConfig,
		deps: Arc<dyn CollectorDeps>,
		temp_dir: PathBuf,
		cancel: CancellationToken,
	) -> Self {
		let exclude = ExcludeSet::new(&config.exclude_patterns);
		Self {
			config,
			deps,
			stats: Stats::new(),
			temp_dir,
			exclude,
			cancel,
		}
	}

	fn is_excluded(&self, path: &Path) -> bool {
		self.exclude
			.is_excluded(path, &self.temp_dir, &self.config.system_root_prefix)
	}

	fn check_cancelled(&self) -> Result<()> {
		if self.cancel.is_cancelled() {
			return Err(miette!("cancelled"));
		}
		Ok(())
	}

	/// `ensureDir`: create `path` recursively (mode 0o755). In dry-run,
	/// updates stats only.
	#[instrument(level = "debug", skip(self))]
	pub async fn ensure_dir(&self, path: &Path) -> Result<()> {
		self.check_cancelled()?;
		if self.config.dry_run {
			self.stats.inc_dirs_created();
			return Ok(());
		}
		match tokio::fs::create_dir_all(path).await {
			Ok(()) => {
				self.stats.inc_dirs_created();
				let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await;
				Ok(())
			}
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
			Err(e) => Err(e).into_diagnostic().wrap_err("ensure_dir"),
		}
	}

	/// `safeCopyFile`: the workhorse copy primitive (§4.3).
	#[instrument(level = "debug", skip(self, description))]
	pub async fn safe_copy_file(
		&self,
		src: &Path,
		dest: &Path,
		description: &str,
	) -> Result<()> {
		self.check_cancelled()?;

		if self.is_excluded(src) || self.is_excluded(dest) {
			return Ok(());
		}

		let meta = match tokio::fs::symlink_metadata(src).await {
			Ok(m) => m,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				self.stats.inc_files_not_found();
				return Ok(());
			}
			Err(e) => {
				self.stats.inc_files_failed();
				return Err(kind_error("stat", format!("failed to stat: {e}")).into());
			}
		};

		let file_type = meta.file_type();

		if file_type.is_symlink() {
			return self.copy_symlink(src, dest).await;
		}

		if file_type.is_file() {
			return self.copy_regular_file(src, dest, &meta, description).await;
		}

		// fifo, device, socket: skip silently.
		Ok(())
	}

	async fn copy_symlink(&self, src: &Path, dest: &Path) -> Result<()> {
		if self.config.dry_run {
			self.stats.inc_files_processed();
			return Ok(());
		}

		let target = tokio::fs::read_link(src).await.map_err(|e| {
			self.stats.inc_files_failed();
			kind_error("symlink read failed", e)
		})?;

		if let Some(parent) = dest.parent() {
			self.ensure_dir(parent).await.map_err(|e| {
				self.stats.inc_files_failed();
				e
			})?;
		}

		if tokio::fs::symlink_metadata(dest).await.is_ok() {
			let remove = if tokio::fs::metadata(dest).await.map(|m| m.is_dir()).unwrap_or(false) {
				tokio::fs::remove_dir_all(dest).await
			} else {
				tokio::fs::remove_file(dest).await
			};
			if let Err(e) = remove {
				self.stats.inc_files_failed();
				return Err(kind_error("file replacement failed", e).into());
			}
		}

		if let Err(e) = tokio::fs::symlink(&target, dest).await {
			self.stats.inc_files_failed();
			return Err(kind_error("symlink creation failed", e).into());
		}

		if let Ok(meta) = tokio::fs::symlink_metadata(src).await {
			let _ = nix::unistd::lchown(
				dest,
				Some(nix::unistd::Uid::from_raw(meta.uid())),
				Some(nix::unistd::Gid::from_raw(meta.gid())),
			);
		}

		self.stats.inc_files_processed();
		Ok(())
	}

	async fn copy_regular_file(
		&self,
		src: &Path,
		dest: &Path,
		meta: &std::fs::Metadata,
		_description: &str,
	) -> Result<()> {
		if self.config.dry_run {
			self.stats.inc_files_processed();
			self.stats.add_bytes_copied(meta.len());
			return Ok(());
		}

		if let Some(parent) = dest.parent() {
			self.ensure_dir(parent).await?;
		}

		let tmp_dest = {
			let mut name = dest
				.file_name()
				.map(|n| n.to_os_string())
				.unwrap_or_default();
			name.push(".proxsave-tmp");
			dest.with_file_name(name)
		};

		let bytes = {
			let mut reader = tokio::fs::File::open(src).await.map_err(|e| {
				self.stats.inc_files_failed();
				kind_error("open failed", e)
			})?;
			let mut writer = tokio::fs::File::create(&tmp_dest).await.map_err(|e| {
				self.stats.inc_files_failed();
				kind_error("create failed", e)
			})?;
			let bytes = tokio::io::copy(&mut reader, &mut writer).await.map_err(|e| {
				self.stats.inc_files_failed();
				kind_error("copy failed", e)
			})?;
			writer.sync_all().await.map_err(|e| {
				self.stats.inc_files_failed();
				kind_error("fsync failed", e)
			})?;
			bytes
		};

		if let Err(e) = tokio::fs::rename(&tmp_dest, dest).await {
			self.stats.inc_files_failed();
			let _ = tokio::fs::remove_file(&tmp_dest).await;
			return Err(kind_error("rename failed", e).into());
		}

		let _ = tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(meta.mode())).await;
		let _ = nix::unistd::chown(
			dest,
			Some(nix::unistd::Uid::from_raw(meta.uid())),
			Some(nix::unistd::Gid::from_raw(meta.gid())),
		);
		if let Ok(file) = std::fs::File::open(dest) {
			let _ = file.set_modified(meta.modified().unwrap_or(std::time::SystemTime::now()));
		}

		self.stats.inc_files_processed();
		self.stats.add_bytes_copied(bytes);
		Ok(())
	}

	/// `safeCopyDir`: recursive walk reusing [`Self::safe_copy_file`].
	#[instrument(level = "debug", skip(self, description))]
	pub async fn safe_copy_dir(&self, src: &Path, dest: &Path, description: &str) -> Result<()> {
		self.check_cancelled()?;

		if self.is_excluded(src) {
			self.stats.inc_files_skipped();
			return Ok(());
		}

		let meta = match tokio::fs::symlink_metadata(src).await {
			Ok(m) => m,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				self.stats.inc_files_not_found();
				return Ok(());
			}
			Err(e) => {
				self.stats.inc_files_failed();
				return Err(kind_error("stat", format!("failed to stat: {e}")).into());
			}
		};

		if meta.file_type().is_symlink() {
			return self.copy_symlink(src, dest).await;
		}

		self.ensure_dir(dest).await?;

		let mut entries = tokio::fs::read_dir(src).await.map_err(|e| {
			self.stats.inc_files_failed();
			kind_error("readdir failed", e)
		})?;

		while let Some(entry) = entries.next_entry().await.map_err(|e| {
			self.stats.inc_files_failed();
			kind_error("readdir failed", e)
		})? {
			self.check_cancelled()?;

			let entry_src = entry.path();
			if self.is_excluded(&entry_src) {
				self.stats.inc_files_skipped();
				continue;
			}
			let entry_dest = dest.join(entry.file_name());
			let file_type = entry.file_type().await.map_err(|e| {
				self.stats.inc_files_failed();
				kind_error("stat failed", e)
			})?;

			if file_type.is_dir() {
				Box::pin(self.safe_copy_dir(&entry_src, &entry_dest, description)).await?;
			} else {
				self.safe_copy_file(&entry_src, &entry_dest, description).await?;
			}
		}

		if dest.starts_with(&self.temp_dir) && !self.config.dry_run {
			let _ = tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(meta.mode())).await;
			let _ = nix::unistd::chown(
				dest,
				Some(nix::unistd::Uid::from_raw(meta.uid())),
				Some(nix::unistd::Gid::from_raw(meta.gid())),
			);
			if let Ok(file) = std::fs::File::open(dest) {
				let _ = file.set_modified(meta.modified().unwrap_or(std::time::SystemTime::now()));
			}
		}

		Ok(())
	}

	/// Executes `name args…`, classifying failures per §4.2/§4.3. Returns
	/// `Ok(None)` for "nothing to write" (skip/non-critical swallow),
	/// `Ok(Some(output))` on success.
	async fn execute_classified(
		&self,
		name: &str,
		args: &[&str],
		extra_env: &[(String, String)],
		critical: bool,
	) -> Result<Option<crate::config::CommandOutput>> {
		if name.is_empty() {
			return Err(miette!("empty command"));
		}
		self.check_cancelled()?;

		if self.deps.look_path(name).await.is_none() {
			if critical {
				self.stats.inc_files_failed();
				return Err(kind_error("missing prerequisite", format!("{name}: not found")).into());
			}
			debug!(command = name, "command not found, skipping");
			return Ok(None);
		}

		let output = if extra_env.is_empty() {
			self.deps.run_command(&self.cancel, name, args).await
		} else {
			self.deps
				.run_command_with_env(&self.cancel, extra_env, name, args)
				.await
		};

		let output = match output {
			Ok(o) => o,
			Err(e) => {
				if self.cancel.is_cancelled() {
					return Err(e);
				}
				if critical {
					self.stats.inc_files_failed();
				}
				return if critical { Err(e) } else { Ok(None) };
			}
		};

		if output.success() {
			return Ok(Some(output));
		}

		let combined_text = String::from_utf8_lossy(&output.combined);
		if name.ends_with("systemctl")
			&& (SYSTEMD_UNIT_NOT_FOUND.is_match(&combined_text)
				|| combined_text.contains("System has not been booted with systemd"))
		{
			info!(command = name, "skip: systemd unit not present");
			return Ok(None);
		}

		let reason = privilege::classify(name, output.status, &output.combined);
		let (unprivileged, evidence) = self.deps.detect_unprivileged_container().await;
		if privilege::should_downgrade(&reason, unprivileged) {
			let PrivilegeReason { reason, .. } = reason.unwrap();
			info!(command = name, reason = %reason, evidence = ?evidence, "SKIP: privilege-sensitive");
			return Ok(None);
		}

		let message = format!(
			"{name} exited with {:?}: {}",
			output.status,
			combined_text.lines().next().unwrap_or_default()
		);
		if critical {
			self.stats.inc_files_failed();
			Err(kind_error("command failed", message).into())
		} else {
			warn!(command = name, message = %message, "non-critical command failure");
			Ok(None)
		}
	}

	/// `safeCmdOutput`: runs `cmd`, writes its output to `out_path`.
	/// Returns `Ok(())` on non-critical failure without writing a file.
	#[instrument(level = "debug", skip(self, desc))]
	pub async fn safe_cmd_output(
		&self,
		cmd: &str,
		args: &[&str],
		out_path: &Path,
		desc: &str,
		critical: bool,
	) -> Result<()> {
		self.safe_cmd_output_with_env(cmd, args, &[], out_path, desc, critical)
			.await
	}

	pub async fn safe_cmd_output_with_env(
		&self,
		cmd: &str,
		args: &[&str],
		extra_env: &[(String, String)],
		out_path: &Path,
		_desc: &str,
		critical: bool,
	) -> Result<()> {
		if self.is_excluded(out_path) {
			return Ok(());
		}
		let Some(output) = self.execute_classified(cmd, args, extra_env, critical).await? else {
			return Ok(());
		};
		if self.config.dry_run {
			return Ok(());
		}
		write_report_file(out_path, &output.combined).await
	}

	/// `captureCommandOutput`: like [`Self::safe_cmd_output`] but also
	/// returns the captured bytes for in-process consumption.
	#[instrument(level = "debug", skip(self, desc))]
	pub async fn capture_command_output(
		&self,
		cmd: &str,
		args: &[&str],
		out_path: Option<&Path>,
		desc: &str,
		critical: bool,
	) -> Result<Option<Vec<u8>>> {
		self.capture_command_output_with_env(cmd, args, &[], out_path, desc, critical)
			.await
	}

	pub async fn capture_command_output_with_env(
		&self,
		cmd: &str,
		args: &[&str],
		extra_env: &[(String, String)],
		out_path: Option<&Path>,
		_desc: &str,
		critical: bool,
	) -> Result<Option<Vec<u8>>> {
		let Some(output) = self.execute_classified(cmd, args, extra_env, critical).await? else {
			return Ok(None);
		};
		if let Some(out_path) = out_path {
			if !self.config.dry_run && !self.is_excluded(out_path) {
				write_report_file(out_path, &output.combined).await?;
			}
		}
		Ok(Some(output.combined))
	}

	/// Composes the `PBS_REPOSITORY`/`PBS_PASSWORD`/`PBS_FINGERPRINT`
	/// environment and delegates to [`Self::capture_command_output`].
	pub async fn capture_command_output_with_pbs_auth(
		&self,
		cmd: &str,
		args: &[&str],
		out_path: Option<&Path>,
		desc: &str,
		critical: bool,
	) -> Result<Option<Vec<u8>>> {
		let env = self.pbs_auth_env(None);
		self.capture_command_output_with_env(cmd, args, &env, out_path, desc, critical)
			.await
	}

	/// As above, but rewrites the repository suffix to target `datastore`,
	/// defaulting the user component to `root@pam@localhost` when no
	/// repository is configured. A no-op (`Ok(None)`, not an error) when
	/// neither repository nor password is configured.
	pub async fn capture_command_output_with_pbs_auth_for_datastore(
		&self,
		cmd: &str,
		args: &[&str],
		datastore: &str,
		out_path: Option<&Path>,
		desc: &str,
		critical: bool,
	) -> Result<Option<Vec<u8>>> {
		if self.config.pbs_repository.is_none() && self.config.pbs_password.is_none() {
			return Ok(None);
		}
		let env = self.pbs_auth_env(Some(datastore));
		self.capture_command_output_with_env(cmd, args, &env, out_path, desc, critical)
			.await
	}

	fn pbs_auth_env(&self, datastore_override: Option<&str>) -> Vec<(String, String)> {
		let mut env = Vec::new();
		let repository = match (datastore_override, &self.config.pbs_repository) {
			(Some(ds), Some(repo)) => {
				let user_host = repo.split(':').next().unwrap_or("root@pam@localhost");
				Some(format!("{user_host}:{ds}"))
			}
			(Some(ds), None) => Some(format!("root@pam@localhost:{ds}")),
			(None, Some(repo)) => Some(repo.clone()),
			(None, None) => None,
		};
		if let Some(repository) = repository {
			env.push(("PBS_REPOSITORY".into(), repository));
		}
		if let Some(password) = &self.config.pbs_password {
			env.push(("PBS_PASSWORD".into(), password.clone()));
		}
		if let Some(fingerprint) = &self.config.pbs_fingerprint {
			env.push(("PBS_FINGERPRINT".into(), fingerprint.clone()));
		}
		env
	}
}

/// Atomically writes `contents` to `path` (write to a sibling temp file,
/// then rename over any existing file).
pub async fn write_report_file(path: &Path, contents: &[u8]) -> Result<()> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent)
			.await
			.into_diagnostic()
			.wrap_err("creating report directory")?;
	}
	let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	tmp_name.push(".proxsave-tmp");
	let tmp_path = path.with_file_name(tmp_name);
	tokio::fs::write(&tmp_path, contents)
		.await
		.into_diagnostic()
		.wrap_err("writing report file")?;
	tokio::fs::rename(&tmp_path, path)
		.await
		.into_diagnostic()
		.wrap_err("renaming report file into place")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{CollectorConfig, RealDeps};

	fn new_collector(temp: &Path) -> Collector {
		Collector::new(
			CollectorConfig {
				system_root_prefix: temp.to_path_buf(),
				..Default::default()
			},
			Arc::new(RealDeps),
			temp.to_path_buf(),
			CancellationToken::new(),
		)
	}

	#[tokio::test]
	async fn copy_missing_src_increments_not_found() {
		let dir = tempfile::tempdir().unwrap();
		let c = new_collector(dir.path());
		c.safe_copy_file(&dir.path().join("nope"), &dir.path().join("dest"), "x")
			.await
			.unwrap();
		assert_eq!(c.stats.snapshot().files_not_found, 1);
		assert_eq!(c.stats.snapshot().files_failed, 0);
	}

	#[tokio::test]
	async fn copy_regular_file_preserves_mode_and_bytes() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src.txt");
		tokio::fs::write(&src, b"hello world").await.unwrap();
		tokio::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640))
			.await
			.unwrap();

		let c = new_collector(dir.path());
		let dest = dir.path().join("out").join("dest.txt");
		c.safe_copy_file(&src, &dest, "x").await.unwrap();

		let written = tokio::fs::read(&dest).await.unwrap();
		assert_eq!(written, b"hello world");
		let meta = tokio::fs::metadata(&dest).await.unwrap();
		assert_eq!(meta.permissions().mode() & 0o777, 0o640);
		assert_eq!(c.stats.snapshot().bytes_copied, 11);
		assert_eq!(c.stats.snapshot().files_processed, 1);
	}

	#[tokio::test]
	async fn excluded_paths_are_never_copied() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("secret.cfg");
		tokio::fs::write(&src, b"s3cr3t").await.unwrap();

		let mut config = CollectorConfig {
			system_root_prefix: dir.path().to_path_buf(),
			exclude_patterns: vec!["secret.cfg".into()],
			..Default::default()
		};
		config.system_root_prefix = dir.path().to_path_buf();
		let c = Collector::new(
			config,
			Arc::new(RealDeps),
			dir.path().to_path_buf(),
			CancellationToken::new(),
		);
		let dest = dir.path().join("out").join("secret.cfg");
		c.safe_copy_file(&src, &dest, "x").await.unwrap();
		assert!(!dest.exists());
		assert_eq!(c.stats.snapshot().files_processed, 0);
	}

	#[tokio::test]
	async fn symlink_copy_preserves_target() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("target.txt");
		tokio::fs::write(&target, b"t").await.unwrap();
		let link = dir.path().join("link.txt");
		tokio::fs::symlink("target.txt", &link).await.unwrap();

		let c = new_collector(dir.path());
		let dest = dir.path().join("out").join("link.txt");
		c.safe_copy_file(&link, &dest, "x").await.unwrap();

		let dest_target = tokio::fs::read_link(&dest).await.unwrap();
		assert_eq!(dest_target, Path::new("target.txt"));
	}

	#[tokio::test]
	async fn dry_run_never_mutates_filesystem() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src.txt");
		tokio::fs::write(&src, b"hello").await.unwrap();

		let c = Collector::new(
			CollectorConfig {
				system_root_prefix: dir.path().to_path_buf(),
				dry_run: true,
				..Default::default()
			},
			Arc::new(RealDeps),
			dir.path().to_path_buf(),
			CancellationToken::new(),
		);
		let dest = dir.path().join("out").join("src.txt");
		c.safe_copy_file(&src, &dest, "x").await.unwrap();
		assert!(!dest.exists());
		assert_eq!(c.stats.snapshot().files_processed, 1);
		assert_eq!(c.stats.snapshot().bytes_copied, 5);
	}
}
