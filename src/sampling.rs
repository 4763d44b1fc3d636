//! Sampling subsystem (§4.4 C4): bounded directory/file walks, and a
//! worker-pool-backed concurrent variant used by the PBS pxar pipeline.
//!
//! Determinism contract: identical trees yield identical samples across
//! runs. The only place nondeterminism could enter is root selection when
//! there are more candidate roots than the cap — resolved by a weighted
//! reservoir keyed on a stable hash of the path (SHA-256, not
//! [`std::collections::hash_map::RandomState`], which reseeds per process).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::exclude::ExcludeSet;
use crate::safefs::{self, DirEntryInfo};

/// Stable (process-independent) hash of a path, used as the reservoir key.
pub fn hash_path(path: &str) -> u64 {
	let mut hasher = Sha256::new();
	hasher.update(path.as_bytes());
	let digest = hasher.finalize();
	u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

/// Iterative, stack-based depth-first walk collecting directory paths up
/// to `max_depth` and `limit` entries. Zero extra allocation per step
/// beyond the explicit stack.
pub async fn sample_directories_bounded(
	root: &Path,
	max_depth: usize,
	limit: usize,
	exclude: &ExcludeSet,
	temp_dir: &Path,
	system_root: &Path,
	timeout: Duration,
) -> Vec<String> {
	sample_bounded(root, max_depth, limit, exclude, temp_dir, system_root, timeout, true).await
}

pub async fn sample_files_bounded(
	root: &Path,
	max_depth: usize,
	limit: usize,
	exclude: &ExcludeSet,
	temp_dir: &Path,
	system_root: &Path,
	timeout: Duration,
) -> Vec<String> {
	sample_bounded(root, max_depth, limit, exclude, temp_dir, system_root, timeout, false).await
}

#[allow(clippy::too_many_arguments)]
async fn sample_bounded(
	root: &Path,
	max_depth: usize,
	limit: usize,
	exclude: &ExcludeSet,
	temp_dir: &Path,
	system_root: &Path,
	timeout: Duration,
	want_dirs: bool,
) -> Vec<String> {
	let mut out = Vec::new();
	let mut stack: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

	while let Some((path, depth)) = stack.pop() {
		if out.len() >= limit {
			break;
		}
		if exclude.is_excluded(&path, temp_dir, system_root) {
			continue;
		}

		let entries: Vec<DirEntryInfo> = match safefs::read_dir(&path, timeout).await {
			Ok(entries) => entries,
			Err(_) => continue,
		};

		for entry in entries {
			if out.len() >= limit {
				break;
			}
			if exclude.is_excluded(&entry.path, temp_dir, system_root) {
				continue;
			}
			if entry.is_dir {
				let forward = crate::exclude::to_forward_slash(&entry.path);
				if want_dirs {
					out.push(forward.to_string_lossy().into_owned());
				}
				if depth + 1 <= max_depth {
					stack.push((entry.path, depth + 1));
				}
			} else if !want_dirs {
				let forward = crate::exclude::to_forward_slash(&entry.path);
				out.push(forward.to_string_lossy().into_owned());
			}
		}
	}

	out
}

type RootCacheKey = (PathBuf, usize, usize);
static ROOT_CACHE: Lazy<Mutex<HashMap<RootCacheKey, Vec<PathBuf>>>> =
	Lazy::new(|| Mutex::new(HashMap::new()));

/// Chooses starting points for the concurrent sampler. Picks directories
/// at `fanout` depth; if fewer than `max_roots` candidates exist, retries
/// at a shallower depth. Results are cached per `(root, fanout, max_roots)`.
/// `enum_budget` caps total enumeration time; when exceeded, whatever was
/// found so far is returned. `stop_on_cap` controls whether reaching
/// `max_roots` at a given depth ends the search immediately, rather than
/// always descending to depth 0.
#[allow(clippy::too_many_arguments)]
pub async fn compute_pxar_worker_roots(
	root: &Path,
	fanout: usize,
	max_roots: usize,
	stop_on_cap: bool,
	enum_workers: usize,
	enum_budget: Duration,
	exclude: &ExcludeSet,
	temp_dir: &Path,
	system_root: &Path,
	timeout: Duration,
) -> Vec<PathBuf> {
	let key: RootCacheKey = (root.to_path_buf(), fanout, max_roots);
	if let Some(cached) = ROOT_CACHE.lock().expect("root cache poisoned").get(&key) {
		return cached.clone();
	}

	let deadline = Instant::now() + enum_budget;
	let mut depth = fanout;
	let mut candidates = Vec::new();
	loop {
		candidates = collect_at_depth(root, depth, enum_workers, exclude, temp_dir, system_root, timeout).await;
		if Instant::now() >= deadline {
			break;
		}
		if (stop_on_cap && candidates.len() >= max_roots) || depth == 0 {
			break;
		}
		depth -= 1;
	}

	let selected = if candidates.len() > max_roots {
		weighted_reservoir_select(candidates, max_roots)
	} else {
		candidates
	};

	ROOT_CACHE
		.lock()
		.expect("root cache poisoned")
		.insert(key, selected.clone());
	selected
}

fn weighted_reservoir_select(mut candidates: Vec<PathBuf>, max_roots: usize) -> Vec<PathBuf> {
	candidates.sort_by_key(|p| hash_path(&p.to_string_lossy()));
	candidates.truncate(max_roots);
	candidates
}

/// Expands `root` to every directory `depth` levels down, reading each
/// level's directories through a semaphore-bounded worker pool sized
/// `workers` (`PxarEnumWorkers`).
async fn collect_at_depth(
	root: &Path,
	depth: usize,
	workers: usize,
	exclude: &ExcludeSet,
	temp_dir: &Path,
	system_root: &Path,
	timeout: Duration,
) -> Vec<PathBuf> {
	let semaphore = std::sync::Arc::new(Semaphore::new(workers.max(1)));
	let mut frontier = vec![root.to_path_buf()];
	for _ in 0..depth {
		let mut set = tokio::task::JoinSet::new();
		for path in frontier {
			if exclude.is_excluded(&path, temp_dir, system_root) {
				continue;
			}
			let semaphore = semaphore.clone();
			let exclude = exclude.clone();
			let temp_dir = temp_dir.to_path_buf();
			let system_root = system_root.to_path_buf();
			set.spawn(async move {
				let _permit = semaphore.acquire_owned().await.ok();
				let mut found = Vec::new();
				if let Ok(entries) = safefs::read_dir(&path, timeout).await {
					for entry in entries {
						if entry.is_dir && !exclude.is_excluded(&entry.path, &temp_dir, &system_root) {
							found.push(entry.path);
						}
					}
				}
				found
			});
		}

		let mut next = Vec::new();
		while let Some(result) = set.join_next().await {
			if let Ok(found) = result {
				next.extend(found);
			}
		}
		frontier = next;
	}
	frontier
}

/// Concurrent sampler: worker pool draining `roots`, each running the
/// bounded walk, coalescing into a single result vector under a mutex.
/// Cancels siblings once `limit` results have been collected.
#[allow(clippy::too_many_arguments)]
pub async fn sample_directories(
	roots: Vec<PathBuf>,
	max_depth: usize,
	limit: usize,
	concurrency: usize,
	exclude: ExcludeSet,
	temp_dir: PathBuf,
	system_root: PathBuf,
	timeout: Duration,
	budget: Duration,
) -> Vec<String> {
	sample_concurrent(roots, max_depth, limit, concurrency, exclude, temp_dir, system_root, timeout, budget, true).await
}

#[allow(clippy::too_many_arguments)]
pub async fn sample_files(
	roots: Vec<PathBuf>,
	max_depth: usize,
	limit: usize,
	concurrency: usize,
	exclude: ExcludeSet,
	temp_dir: PathBuf,
	system_root: PathBuf,
	timeout: Duration,
	budget: Duration,
) -> Vec<String> {
	sample_concurrent(roots, max_depth, limit, concurrency, exclude, temp_dir, system_root, timeout, budget, false).await
}

#[allow(clippy::too_many_arguments)]
async fn sample_concurrent(
	roots: Vec<PathBuf>,
	max_depth: usize,
	limit: usize,
	concurrency: usize,
	exclude: ExcludeSet,
	temp_dir: PathBuf,
	system_root: PathBuf,
	timeout: Duration,
	budget: Duration,
	want_dirs: bool,
) -> Vec<String> {
	let results = std::sync::Arc::new(Mutex::new(Vec::new()));
	let semaphore = std::sync::Arc::new(Semaphore::new(concurrency.max(1)));
	let cancel = CancellationToken::new();
	let deadline = Instant::now() + budget;

	let mut set = tokio::task::JoinSet::new();
	for root in roots {
		let results = results.clone();
		let semaphore = semaphore.clone();
		let cancel = cancel.clone();
		let exclude = exclude.clone();
		let temp_dir = temp_dir.clone();
		let system_root = system_root.clone();

		set.spawn(async move {
			let _permit = semaphore.acquire_owned().await.ok();
			if cancel.is_cancelled() || Instant::now() >= deadline {
				return;
			}
			let found = sample_bounded(
				&root, max_depth, limit, &exclude, &temp_dir, &system_root, timeout, want_dirs,
			)
			.await;

			let mut guard = results.lock().expect("sample results mutex poisoned");
			guard.extend(found);
			if guard.len() >= limit {
				cancel.cancel();
			}
		});
	}

	while set.join_next().await.is_some() {
		if Instant::now() >= deadline {
			cancel.cancel();
		}
	}

	let mut out = results.lock().expect("sample results mutex poisoned").clone();
	out.sort();
	out.truncate(limit);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_path_is_stable_across_calls() {
		assert_eq!(hash_path("/a/b/c"), hash_path("/a/b/c"));
		assert_ne!(hash_path("/a/b/c"), hash_path("/a/b/d"));
	}

	#[tokio::test]
	async fn bounded_sampler_respects_limit_and_depth() {
		let dir = tempfile::tempdir().unwrap();
		for i in 0..5 {
			let sub = dir.path().join(format!("d{i}"));
			tokio::fs::create_dir_all(&sub).await.unwrap();
			tokio::fs::write(sub.join("f.txt"), b"x").await.unwrap();
		}
		let exclude = ExcludeSet::new(&[]);
		let files = sample_files_bounded(
			dir.path(),
			2,
			3,
			&exclude,
			Path::new(""),
			Path::new(""),
			Duration::ZERO,
		)
		.await;
		assert_eq!(files.len(), 3);
	}

	#[tokio::test]
	async fn worker_roots_are_deterministic_across_runs() {
		let dir = tempfile::tempdir().unwrap();
		for i in 0..10 {
			tokio::fs::create_dir_all(dir.path().join(format!("n{i}")))
				.await
				.unwrap();
		}
		let exclude = ExcludeSet::new(&[]);
		let a = compute_pxar_worker_roots(
			dir.path(),
			1,
			3,
			true,
			4,
			Duration::from_secs(5),
			&exclude,
			Path::new(""),
			Path::new(""),
			Duration::ZERO,
		)
		.await;
		// Cached on the second call; result must be identical either way.
		let b = compute_pxar_worker_roots(
			dir.path(),
			1,
			3,
			true,
			4,
			Duration::from_secs(5),
			&exclude,
			Path::new(""),
			Path::new(""),
			Duration::ZERO,
		)
		.await;
		assert_eq!(a, b);
		assert_eq!(a.len(), 3);
	}
}
