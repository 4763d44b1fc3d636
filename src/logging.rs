//! Diagnostic logging setup: verbosity from repeated `-v`, optional
//! JSON file output, `$RUST_LOG` taking precedence over both.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Returned alongside the initialized subscriber so the caller can keep
/// the non-blocking file writer's worker thread alive for the process
/// lifetime (dropping it flushes and stops the writer).
pub struct LoggingGuard(#[allow(dead_code)] Option<WorkerGuard>);

fn level_for_verbosity(verbose: u8) -> &'static str {
	match verbose {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	}
}

fn resolve_log_file_path(requested: &Path) -> PathBuf {
	if requested.as_os_str() == "." || requested.is_dir() {
		let now = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
		requested.join(format!("proxsave.{now}.log"))
	} else {
		requested.to_path_buf()
	}
}

/// Initializes the global subscriber. When `log_file` is set, diagnostics
/// go there as JSON and the effective level floors at `debug` (matching
/// the documented "-vvv" bump when `--log-file` is used without an
/// explicit verbosity); otherwise they go to stderr as compact text.
pub fn init(verbose: u8, log_file: Option<&Path>) -> miette::Result<LoggingGuard> {
	if std::env::var("RUST_LOG").is_ok() {
		let filter = EnvFilter::from_default_env();
		if let Some(path) = log_file {
			let (guard, _) = init_file(path, filter)?;
			return Ok(guard);
		}
		tracing_subscriber::fmt().with_env_filter(filter).with_ansi(atty_stderr()).init();
		return Ok(LoggingGuard(None));
	}

	let effective_verbose = if log_file.is_some() { verbose.max(3) } else { verbose };
	let filter = EnvFilter::new(level_for_verbosity(effective_verbose));

	if let Some(path) = log_file {
		let (guard, _) = init_file(path, filter)?;
		return Ok(guard);
	}

	tracing_subscriber::fmt().with_env_filter(filter).with_ansi(atty_stderr()).init();
	Ok(LoggingGuard(None))
}

fn init_file(requested: &Path, filter: EnvFilter) -> miette::Result<(LoggingGuard, PathBuf)> {
	let resolved = resolve_log_file_path(requested);
	let (dir, file_name) = match (resolved.parent(), resolved.file_name()) {
		(Some(dir), Some(name)) => (dir.to_path_buf(), name.to_owned()),
		_ => (PathBuf::from("."), resolved.as_os_str().to_owned()),
	};
	if !dir.as_os_str().is_empty() {
		std::fs::create_dir_all(&dir).map_err(|e| miette::miette!("creating log directory: {e}"))?;
	}

	let file_appender = tracing_appender::rolling::never(&dir, &file_name);
	let (writer, guard) = tracing_appender::non_blocking(file_appender);

	tracing_subscriber::fmt()
		.json()
		.with_env_filter(filter)
		.with_writer(writer)
		.init();

	Ok((LoggingGuard(Some(guard)), resolved))
}

fn atty_stderr() -> bool {
	use std::io::IsTerminal;
	std::io::stderr().is_terminal()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verbosity_maps_to_expected_levels() {
		assert_eq!(level_for_verbosity(0), "warn");
		assert_eq!(level_for_verbosity(1), "info");
		assert_eq!(level_for_verbosity(2), "debug");
		assert_eq!(level_for_verbosity(5), "trace");
	}

	#[test]
	fn dot_log_file_path_resolves_to_a_dated_file_name() {
		let resolved = resolve_log_file_path(Path::new("."));
		let name = resolved.file_name().unwrap().to_string_lossy();
		assert!(name.starts_with("proxsave."));
		assert!(name.ends_with(".log"));
	}

	#[test]
	fn explicit_file_path_is_used_unchanged() {
		let resolved = resolve_log_file_path(Path::new("/tmp/custom.log"));
		assert_eq!(resolved, Path::new("/tmp/custom.log"));
	}
}
