//! Subprocess execution raced against cancellation (§5).
//!
//! Built on [`tokio::process::Command`] rather than the teacher's `duct`:
//! `duct` has no native mid-flight cancellation, and every external
//! invocation here must be killable the instant the run's cancellation
//! token fires. Each child is put in its own process group via `setsid`
//! so a cancelled run can `killpg` the whole subtree, not just the direct
//! child (a shell wrapper or pipeline would otherwise survive).

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use miette::{miette, IntoDiagnostic as _, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CommandOutput;

/// Runs `name args…` to completion, with `extra_env` appended to the
/// child's environment (never logged — PBS credentials travel this way).
/// Racing against `cancel`: on cancellation the child's process group is
/// sent `SIGKILL` and this returns `Err`.
pub async fn run(
	cancel: &CancellationToken,
	extra_env: &[(String, String)],
	name: &str,
	args: &[&str],
) -> Result<CommandOutput> {
	if cancel.is_cancelled() {
		return Err(miette!("cancelled"));
	}

	let mut cmd = tokio::process::Command::new(name);
	cmd.args(args);
	for (k, v) in extra_env {
		cmd.env(k, v);
	}
	cmd.stdin(Stdio::null());
	cmd.stdout(Stdio::piped());
	cmd.stderr(Stdio::piped());

	// Each child becomes its own process group leader so cancellation can
	// killpg the whole subtree rather than a single process.
	unsafe {
		cmd.pre_exec(|| {
			nix::unistd::setsid().ok();
			Ok(())
		});
	}

	let mut child = cmd
		.spawn()
		.into_diagnostic()
		.map_err(|e| miette!("failed to spawn {name}: {e}"))?;
	let pid = child.id();

	debug!(command = name, pid, "spawned");

	tokio::select! {
		biased;
		_ = cancel.cancelled() => {
			if let Some(pid) = pid {
				kill_process_group(pid);
			}
			let _ = child.wait().await;
			Err(miette!("cancelled"))
		}
		res = child.wait_with_output() => {
			let output = res.into_diagnostic()?;
			let mut combined = output.stdout;
			combined.extend_from_slice(&output.stderr);
			Ok(CommandOutput {
				status: output.status.code().or_else(|| output.status.signal().map(|s| -s)),
				combined,
			})
		}
	}
}

fn kill_process_group(pid: u32) {
	let pgid = Pid::from_raw(pid as i32);
	if let Err(e) = signal::killpg(pgid, Signal::SIGKILL) {
		warn!(pid, error = %e, "failed to kill process group");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn captures_combined_stdout_and_stderr() {
		let cancel = CancellationToken::new();
		let out = run(&cancel, &[], "sh", &["-c", "echo out; echo err 1>&2"])
			.await
			.unwrap();
		assert!(out.success());
		let text = String::from_utf8_lossy(&out.combined);
		assert!(text.contains("out"));
		assert!(text.contains("err"));
	}

	#[tokio::test]
	async fn nonzero_exit_is_reported_not_errored() {
		let cancel = CancellationToken::new();
		let out = run(&cancel, &[], "sh", &["-c", "exit 3"]).await.unwrap();
		assert_eq!(out.status, Some(3));
		assert!(!out.success());
	}

	#[tokio::test]
	async fn cancellation_aborts_a_long_running_child() {
		let cancel = CancellationToken::new();
		let cancel2 = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
			cancel2.cancel();
		});
		let res = run(&cancel, &[], "sh", &["-c", "sleep 5"]).await;
		assert!(res.is_err());
	}

	#[tokio::test]
	async fn extra_env_reaches_the_child() {
		let cancel = CancellationToken::new();
		let out = run(
			&cancel,
			&[("PBS_REPOSITORY".into(), "root@pam@localhost:store".into())],
			"sh",
			&["-c", "echo $PBS_REPOSITORY"],
		)
		.await
		.unwrap();
		assert!(String::from_utf8_lossy(&out.combined).contains("root@pam@localhost:store"));
	}
}
