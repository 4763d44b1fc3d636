//! Exclude-pattern matching (§4.3 "Exclude matching").
//!
//! A path is excluded if any pattern matches any of: its basename, its
//! absolute path, its path relative to `tempDir`, or its path relative to
//! `SystemRootPrefix`. Patterns support `**` (path-spanning), `*`
//! (single-segment) and `?`, matched with forward-slash normalization.
//!
//! `glob::Pattern` handles single-segment `*`/`?` matching; the
//! path-spanning `**` recursion is hand-rolled on top of it, since
//! `glob::Pattern::matches` does not treat `**` as spanning path
//! separators the way a gitignore-style matcher does.

use std::path::{Path, PathBuf};

use glob::Pattern as SegmentPattern;

/// A single compiled exclude pattern.
#[derive(Debug, Clone)]
pub struct ExcludePattern {
	segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
	/// `**`: matches zero or more path segments.
	DoubleStar,
	/// A single path segment, possibly containing `*`/`?`.
	Glob(SegmentPattern),
}

impl ExcludePattern {
	pub fn compile(pattern: &str) -> Self {
		let normalized = pattern.replace('\\', "/");
		let segments = normalized
			.split('/')
			.filter(|s| !s.is_empty())
			.map(|seg| {
				if seg == "**" {
					Segment::DoubleStar
				} else {
					Segment::Glob(SegmentPattern::new(seg).unwrap_or_else(|_| {
						// An unparsable pattern matches nothing rather than panicking.
						SegmentPattern::new("\u{0}invalid\u{0}").unwrap()
					}))
				}
			})
			.collect();
		Self { segments }
	}

	/// Match against a forward-slash-normalized, segment-split candidate.
	pub fn matches(&self, candidate: &str) -> bool {
		let candidate = candidate.replace('\\', "/");
		let parts: Vec<&str> = candidate.split('/').filter(|s| !s.is_empty()).collect();
		match_segments(&self.segments, &parts)
	}
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
	match pattern.split_first() {
		None => parts.is_empty(),
		Some((Segment::DoubleStar, rest)) => {
			// ** matches zero or more segments: try every split point.
			if match_segments(rest, parts) {
				return true;
			}
			if let Some((_, tail)) = parts.split_first() {
				return match_segments(pattern, tail);
			}
			false
		}
		Some((Segment::Glob(g), rest)) => match parts.split_first() {
			Some((head, tail)) if g.matches(head) => match_segments(rest, tail),
			_ => false,
		},
	}
}

/// The compiled set of exclude patterns plus the path roots needed to
/// derive the four candidate forms each path is tested against.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
	patterns: Vec<ExcludePattern>,
}

impl ExcludeSet {
	pub fn new(patterns: &[String]) -> Self {
		Self {
			patterns: patterns.iter().map(|p| ExcludePattern::compile(p)).collect(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.patterns.is_empty()
	}

	/// Test `path` against every pattern, using all four candidate forms
	/// (basename, absolute path, path-under-`temp_dir`, path-under-`system_root`).
	pub fn is_excluded(&self, path: &Path, temp_dir: &Path, system_root: &Path) -> bool {
		if self.patterns.is_empty() {
			return false;
		}

		let mut candidates: Vec<String> = Vec::with_capacity(4);
		if let Some(name) = path.file_name() {
			candidates.push(name.to_string_lossy().into_owned());
		}
		candidates.push(path.to_string_lossy().into_owned());
		if let Ok(rel) = path.strip_prefix(temp_dir) {
			candidates.push(rel.to_string_lossy().into_owned());
		}
		if !system_root.as_os_str().is_empty() {
			if let Ok(rel) = path.strip_prefix(system_root) {
				candidates.push(rel.to_string_lossy().into_owned());
			}
		}

		candidates
			.iter()
			.any(|candidate| self.patterns.iter().any(|p| p.matches(candidate)))
	}
}

pub fn to_forward_slash(path: &Path) -> PathBuf {
	PathBuf::from(path.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn double_star_spans_segments() {
		let p = ExcludePattern::compile("**/node_modules/**");
		assert!(p.matches("a/b/node_modules/c/d"));
		assert!(p.matches("node_modules/c"));
		assert!(!p.matches("a/b/c"));
	}

	#[test]
	fn single_star_is_one_segment() {
		let p = ExcludePattern::compile("*.log");
		assert!(p.matches("foo.log"));
		assert!(!p.matches("a/foo.log"));
	}

	#[test]
	fn exclude_set_checks_all_candidate_forms() {
		let set = ExcludeSet::new(&["secrets.cfg".into()]);
		let temp = Path::new("/tmp/stage");
		let root = Path::new("");
		assert!(set.is_excluded(Path::new("/tmp/stage/etc/secrets.cfg"), temp, root));
		assert!(!set.is_excluded(Path::new("/tmp/stage/etc/plain.cfg"), temp, root));
	}

	#[test]
	fn exclusion_is_monotone_over_directories() {
		let set = ExcludeSet::new(&["etc/pve/priv/**".into()]);
		let temp = Path::new("/tmp/stage");
		let root = Path::new("");
		assert!(set.is_excluded(Path::new("/tmp/stage/etc/pve/priv/shadow.cfg"), temp, root));
		assert!(set.is_excluded(
			Path::new("/tmp/stage/etc/pve/priv/lock/nested.key"),
			temp,
			root
		));
	}
}
