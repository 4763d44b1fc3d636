//! Optimization stage (§4.8 C8): dedup → prefilter → chunking, in that
//! fixed order, applied to `tempDir` immediately before archiving.
//! Failures here are logged as warnings and never abort archive creation
//! (§7 "Propagation policy").

pub mod chunk;
pub mod dedup;
pub mod prefilter;

use std::path::Path;

use tracing::{instrument, warn};

use crate::config::OptimizeConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizeReport {
	pub deduped: u64,
	pub normalized: u64,
	pub chunked: u64,
}

#[instrument(level = "info", skip(config))]
pub async fn run(root: &Path, config: &OptimizeConfig) -> OptimizeReport {
	if !config.enabled {
		return OptimizeReport::default();
	}

	let mut report = OptimizeReport::default();

	match dedup::dedup_tree(root).await {
		Ok(n) => report.deduped = n,
		Err(e) => warn!(error = %e, "dedup stage failed"),
	}

	match prefilter::prefilter_tree(root, config.prefilter_max_file_size_bytes).await {
		Ok(n) => report.normalized = n,
		Err(e) => warn!(error = %e, "prefilter stage failed"),
	}

	let chunked_dir = root.join("chunked_files");
	match chunk_eligible_files(root, &chunked_dir, config.chunk_threshold_bytes, config.chunk_size_bytes).await {
		Ok(n) => report.chunked = n,
		Err(e) => warn!(error = %e, "chunking stage failed"),
	}

	report
}

async fn chunk_eligible_files(
	root: &Path,
	chunked_dir: &Path,
	threshold: u64,
	chunk_size: u64,
) -> miette::Result<u64> {
	let mut count = 0u64;
	let mut stack = vec![root.to_path_buf()];

	while let Some(dir) = stack.pop() {
		if dir.starts_with(chunked_dir) {
			continue;
		}
		let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| miette::miette!("{e}"))?;
		while let Some(entry) = entries.next_entry().await.map_err(|e| miette::miette!("{e}"))? {
			let path = entry.path();
			let file_type = entry.file_type().await.map_err(|e| miette::miette!("{e}"))?;
			if file_type.is_dir() {
				stack.push(path);
				continue;
			}
			if !file_type.is_file() {
				continue;
			}
			let rel = path.strip_prefix(root).unwrap_or(&path);
			if chunk::chunk_file_if_needed(&path, chunked_dir, rel, threshold, chunk_size).await? {
				count += 1;
			}
		}
	}

	Ok(count)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn pipeline_runs_all_three_stages_in_order() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.log"), b"x\r\ny\r\n").await.unwrap();
		tokio::fs::write(dir.path().join("b.log"), b"x\r\ny\r\n").await.unwrap();
		tokio::fs::write(dir.path().join("big.bin"), vec![1u8; 30]).await.unwrap();

		let config = OptimizeConfig {
			enabled: true,
			prefilter_max_file_size_bytes: 1024,
			chunk_threshold_bytes: 20,
			chunk_size_bytes: 10,
		};
		let report = run(dir.path(), &config).await;
		assert_eq!(report.chunked, 1);
	}

	#[tokio::test]
	async fn disabled_config_is_a_no_op() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.bin"), vec![1u8; 100]).await.unwrap();
		let config = OptimizeConfig {
			enabled: false,
			..OptimizeConfig::default()
		};
		let report = run(dir.path(), &config).await;
		assert_eq!(report.chunked, 0);
		assert_eq!(report.deduped, 0);
	}
}
