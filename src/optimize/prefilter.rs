//! Prefilter stage (§4.8): lossless, extension-specific normalization of
//! small files. Every transform is compared byte-for-byte against its
//! input before writing — if identical, nothing is written (mtime must
//! not change).

use std::path::Path;

use miette::{IntoDiagnostic as _, Result};
use tracing::instrument;

const STRUCTURED_CONFIG_PREFIXES: &[&str] = &[
	"etc/proxmox-backup/",
	"etc/pve/",
	"etc/ssh/",
	"etc/pam.d/",
	"etc/systemd/system/",
];

#[instrument(level = "debug", skip(root))]
pub async fn prefilter_tree(root: &Path, max_file_size: u64) -> Result<u64> {
	let mut normalized = 0u64;
	let mut stack = vec![root.to_path_buf()];

	while let Some(dir) = stack.pop() {
		let mut entries = tokio::fs::read_dir(&dir).await.into_diagnostic()?;
		while let Some(entry) = entries.next_entry().await.into_diagnostic()? {
			let path = entry.path();
			let file_type = entry.file_type().await.into_diagnostic()?;
			if file_type.is_dir() {
				stack.push(path);
				continue;
			}
			if !file_type.is_file() {
				continue;
			}

			let meta = tokio::fs::metadata(&path).await.into_diagnostic()?;
			if meta.len() > max_file_size {
				continue;
			}

			let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
			if is_structured_config(&rel) {
				continue;
			}

			let Some(kind) = classify_extension(&path) else {
				continue;
			};

			let original = tokio::fs::read(&path).await.into_diagnostic()?;
			let proposed = match kind {
				Kind::PlainText => strip_cr(&original),
				Kind::IniLike => normalize_ini(&original),
				Kind::Json => match compact_json(&original) {
					Some(bytes) => bytes,
					None => continue,
				},
			};

			if proposed != original {
				tokio::fs::write(&path, &proposed).await.into_diagnostic()?;
				normalized += 1;
			}
		}
	}

	Ok(normalized)
}

fn is_structured_config(rel: &str) -> bool {
	STRUCTURED_CONFIG_PREFIXES.iter().any(|p| rel.starts_with(p))
}

enum Kind {
	PlainText,
	IniLike,
	Json,
}

fn classify_extension(path: &Path) -> Option<Kind> {
	let ext = path.extension()?.to_str()?.to_lowercase();
	match ext.as_str() {
		"txt" | "log" | "md" => Some(Kind::PlainText),
		"conf" | "cfg" | "ini" => Some(Kind::IniLike),
		"json" => Some(Kind::Json),
		_ => None,
	}
}

fn strip_cr(input: &[u8]) -> Vec<u8> {
	input.iter().copied().filter(|&b| b != b'\r').collect()
}

fn normalize_ini(input: &[u8]) -> Vec<u8> {
	let without_bom = input.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(input);
	let text = String::from_utf8_lossy(without_bom);

	let mut lines: Vec<String> = text
		.replace("\r\n", "\n")
		.replace('\r', "\n")
		.split('\n')
		.map(|line| line.trim_end().to_string())
		.collect();

	while lines.last().is_some_and(|l| l.is_empty()) {
		lines.pop();
	}

	let mut out = lines.join("\n");
	out.push('\n');
	out.into_bytes()
}

/// Byte-level JSON compaction (whitespace removal between tokens,
/// preserving key order and numeric literal text verbatim). Parsing into
/// a generic map and re-serializing would reorder keys and lose integer
/// precision above 2^53 — this walks the token stream directly instead.
fn compact_json(input: &[u8]) -> Option<Vec<u8>> {
	let mut out = Vec::with_capacity(input.len());
	let mut in_string = false;
	let mut escaped = false;
	let mut i = 0;

	while i < input.len() {
		let b = input[i];
		if in_string {
			out.push(b);
			if escaped {
				escaped = false;
			} else if b == b'\\' {
				escaped = true;
			} else if b == b'"' {
				in_string = false;
			}
			i += 1;
			continue;
		}

		match b {
			b'"' => {
				in_string = true;
				out.push(b);
			}
			b' ' | b'\t' | b'\r' | b'\n' => {}
			_ => out.push(b),
		}
		i += 1;
	}

	if in_string {
		return None; // malformed input, leave untouched
	}

	Some(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strip_cr_removes_only_carriage_returns() {
		assert_eq!(strip_cr(b"a\r\nb\r\n"), b"a\nb\n");
	}

	#[test]
	fn normalize_ini_trims_trailing_whitespace_and_collapses_newlines() {
		let input = b"[section]\r\nkey = value   \r\n\r\n\r\n";
		let out = normalize_ini(input);
		assert_eq!(out, b"[section]\nkey = value\n");
	}

	#[test]
	fn compact_json_preserves_key_order_and_big_integers() {
		let input = br#"{ "b": 1, "a": 9007199254740993 }"#;
		let out = compact_json(input).unwrap();
		assert_eq!(out, br#"{"b":1,"a":9007199254740993}"#);
	}

	#[test]
	fn compact_json_leaves_string_whitespace_untouched() {
		let input = br#"{"msg": "hello   world"}"#;
		let out = compact_json(input).unwrap();
		assert_eq!(out, br#"{"msg":"hello   world"}"#);
	}

	#[tokio::test]
	async fn structured_config_paths_are_never_touched() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("etc/pve")).await.unwrap();
		let f = dir.path().join("etc/pve/storage.cfg");
		tokio::fs::write(&f, b"dir: local\r\n  path /var/lib\r\n").await.unwrap();

		prefilter_tree(dir.path(), 8 * 1024 * 1024).await.unwrap();
		let contents = tokio::fs::read(&f).await.unwrap();
		assert_eq!(contents, b"dir: local\r\n  path /var/lib\r\n");
	}
}
