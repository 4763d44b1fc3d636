//! Safe-FS primitives (§4.1): time-bounded `ReadDir`/`Stat` so a hung
//! NFS/FUSE mount becomes a skipped sample, not a deadlock.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum SafeFsError {
	#[error("timed out after {0:?}")]
	Timeout(Duration),
	#[error(transparent)]
	Io(#[from] io::Error),
}

pub type SafeFsResult<T> = Result<T, SafeFsError>;

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
	pub path: PathBuf,
	pub file_name: std::ffi::OsString,
	pub is_dir: bool,
	pub is_symlink: bool,
}

/// Time-bounded directory listing. A zero `timeout` means "no extra bound
/// beyond the caller's own cancellation" — the read just runs to
/// completion on the blocking pool.
#[instrument(level = "debug", skip(timeout))]
pub async fn read_dir(path: &Path, timeout: Duration) -> SafeFsResult<Vec<DirEntryInfo>> {
	let owned = path.to_path_buf();
	let task = tokio::task::spawn_blocking(move || -> io::Result<Vec<DirEntryInfo>> {
		let mut out = Vec::new();
		for entry in std::fs::read_dir(&owned)? {
			let entry = entry?;
			let file_type = entry.file_type()?;
			out.push(DirEntryInfo {
				path: entry.path(),
				file_name: entry.file_name(),
				is_dir: file_type.is_dir(),
				is_symlink: file_type.is_symlink(),
			});
		}
		Ok(out)
	});

	race(task, timeout).await
}

/// Time-bounded `lstat`.
#[instrument(level = "debug", skip(timeout))]
pub async fn stat(path: &Path, timeout: Duration) -> SafeFsResult<std::fs::Metadata> {
	let owned = path.to_path_buf();
	let task = tokio::task::spawn_blocking(move || std::fs::symlink_metadata(&owned));
	race(task, timeout).await
}

async fn race<T: Send + 'static>(
	task: tokio::task::JoinHandle<io::Result<T>>,
	timeout: Duration,
) -> SafeFsResult<T> {
	if timeout.is_zero() {
		return match task.await {
			Ok(res) => Ok(res?),
			Err(join_err) => Err(SafeFsError::Io(io::Error::other(join_err))),
		};
	}

	tokio::select! {
		res = task => match res {
			Ok(res) => Ok(res?),
			Err(join_err) => Err(SafeFsError::Io(io::Error::other(join_err))),
		},
		_ = tokio::time::sleep(timeout) => {
			// The spawned task is abandoned; its result, if it ever
			// arrives, is simply dropped by tokio's runtime.
			Err(SafeFsError::Timeout(timeout))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn read_dir_lists_entries() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
		let entries = read_dir(dir.path(), Duration::ZERO).await.unwrap();
		assert_eq!(entries.len(), 1);
		assert!(!entries[0].is_dir);
	}

	#[tokio::test]
	async fn stat_not_found_is_io_error() {
		let err = stat(Path::new("/does/not/exist/at/all"), Duration::ZERO)
			.await
			.unwrap_err();
		assert!(matches!(err, SafeFsError::Io(_)));
	}

	#[tokio::test]
	async fn zero_timeout_means_only_the_caller_cancellation_applies() {
		let dir = tempfile::tempdir().unwrap();
		let entries = read_dir(dir.path(), Duration::ZERO).await.unwrap();
		assert!(entries.is_empty());
	}
}
