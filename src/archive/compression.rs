//! Compression selection (§4.9): probes for the requested external
//! compressor, falls back per the documented chain, and builds argv.

use crate::config::{CompressionMode, CompressionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCompression {
	pub kind: CompressionType,
	pub level: u32,
	pub threads: u32,
	pub ultra: bool,
}

/// Probes `LookPath` for the binary backing `requested`; on absence,
/// falls back to gzip (if xz/zstd was requested) then none.
pub fn resolve_compression(
	requested: CompressionType,
	level: Option<u32>,
	mode: CompressionMode,
	threads: u32,
	look_path: impl Fn(&str) -> bool,
) -> ResolvedCompression {
	let ultra = matches!(mode, CompressionMode::Ultra);

	let kind = match requested {
		CompressionType::None => CompressionType::None,
		CompressionType::Gzip if look_path("gzip") => CompressionType::Gzip,
		CompressionType::Xz if look_path("xz") => CompressionType::Xz,
		CompressionType::Zstd if look_path("zstd") => CompressionType::Zstd,
		CompressionType::Xz | CompressionType::Zstd if look_path("gzip") => CompressionType::Gzip,
		_ => CompressionType::None,
	};

	let level = clamp_level(kind, level, ultra);
	ResolvedCompression { kind, level, threads, ultra }
}

fn clamp_level(kind: CompressionType, requested: Option<u32>, ultra: bool) -> u32 {
	match kind {
		CompressionType::None => 0,
		CompressionType::Gzip => requested.unwrap_or(6).clamp(1, 9),
		CompressionType::Xz => requested.unwrap_or(6).clamp(0, 9),
		CompressionType::Zstd => {
			let default = if ultra { 20 } else { 19 };
			let max = if ultra { 22 } else { 19 };
			requested.unwrap_or(default).clamp(1, max)
		}
	}
}

pub fn binary_name(kind: CompressionType) -> Option<&'static str> {
	match kind {
		CompressionType::None => None,
		CompressionType::Gzip => Some("gzip"),
		CompressionType::Xz => Some("xz"),
		CompressionType::Zstd => Some("zstd"),
	}
}

/// Builds the decompressor/compressor argv per §6 "Compressor argv".
pub fn build_argv(resolved: &ResolvedCompression) -> Vec<String> {
	let threads = resolved.threads;
	match resolved.kind {
		CompressionType::None => Vec::new(),
		CompressionType::Xz => {
			let mut argv = vec![format!("-{}", resolved.level), format!("-T{threads}")];
			if resolved.ultra {
				argv.push("--extreme".into());
			}
			argv.push("-c".into());
			argv
		}
		CompressionType::Zstd => {
			let mut argv = Vec::new();
			if resolved.level >= 20 {
				argv.push("--ultra".into());
			}
			argv.push(format!("-{}", resolved.level));
			argv.push(format!("-T{threads}"));
			argv.push("-q".into());
			argv.push("-c".into());
			argv
		}
		CompressionType::Gzip => vec![format!("-{}", resolved.level), "-c".into()],
	}
}

pub fn archive_extension(kind: CompressionType) -> &'static str {
	match kind {
		CompressionType::None => ".tar",
		CompressionType::Gzip => ".tar.gz",
		CompressionType::Xz => ".tar.xz",
		CompressionType::Zstd => ".tar.zst",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn falls_back_to_gzip_when_xz_missing() {
		let resolved = resolve_compression(
			CompressionType::Xz,
			None,
			CompressionMode::Standard,
			0,
			|name| name == "gzip",
		);
		assert_eq!(resolved.kind, CompressionType::Gzip);
	}

	#[test]
	fn falls_back_to_none_when_nothing_available() {
		let resolved = resolve_compression(
			CompressionType::Zstd,
			None,
			CompressionMode::Standard,
			0,
			|_| false,
		);
		assert_eq!(resolved.kind, CompressionType::None);
	}

	#[test]
	fn zstd_ultra_requires_level_20_plus() {
		let resolved = resolve_compression(
			CompressionType::Zstd,
			None,
			CompressionMode::Ultra,
			0,
			|_| true,
		);
		assert_eq!(resolved.level, 20);
		let argv = build_argv(&resolved);
		assert!(argv.contains(&"--ultra".to_string()));
	}

	#[test]
	fn xz_ultra_adds_extreme_flag() {
		let resolved = resolve_compression(CompressionType::Xz, Some(9), CompressionMode::Ultra, 4, |_| true);
		let argv = build_argv(&resolved);
		assert_eq!(argv, vec!["-9", "-T4", "--extreme", "-c"]);
	}

	#[test]
	fn gzip_level_clamped_to_valid_range() {
		let resolved = resolve_compression(CompressionType::Gzip, Some(50), CompressionMode::Standard, 0, |_| true);
		assert_eq!(resolved.level, 9);
	}
}
