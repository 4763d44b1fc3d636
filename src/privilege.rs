//! Privilege classifier (§4.2): maps `(command, exit, combined output)` to
//! a "privilege-sensitive" reason, so callers can downgrade an expected
//! failure in an unprivileged container from `WARNING` to `SKIP` instead of
//! reporting it as a real error.

use crate::config::UnprivilegedEvidence;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeReason {
	pub reason: String,
	pub evidence: Option<String>,
}

/// Pure classification function. Returns `None` for unrecognized commands
/// or output that doesn't match a known privilege-sensitive pattern.
pub fn classify(command: &str, exit_code: Option<i32>, combined_output: &[u8]) -> Option<PrivilegeReason> {
	let command_name = std::path::Path::new(command)
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or(command);
	let output = String::from_utf8_lossy(combined_output).to_lowercase();
	let output_empty = combined_output.iter().all(|b| b.is_ascii_whitespace());
	let non_zero = exit_code.map(|c| c != 0).unwrap_or(true);

	match command_name {
		"dmidecode" => {
			let hit = output.contains("/dev/mem")
				|| output.contains("permission denied")
				|| output.contains("operation not permitted")
				|| (non_zero && output_empty);
			hit.then(|| PrivilegeReason {
				reason: "DMI tables not accessible".into(),
				evidence: None,
			})
		}
		"blkid" => {
			let hit = (exit_code == Some(2) && output_empty)
				|| output.contains("permission denied")
				|| output.contains("operation not permitted");
			hit.then(|| PrivilegeReason {
				reason: "block devices not accessible; restore hint: automated fstab device remap (UUID/PARTUUID/LABEL) may be limited".into(),
				evidence: None,
			})
		}
		"sensors" => {
			if output.contains("no sensors found") {
				Some(PrivilegeReason {
					reason: "no hardware sensors available".into(),
					evidence: None,
				})
			} else if output.contains("permission denied") || output.contains("operation not permitted") {
				Some(PrivilegeReason {
					reason: "hardware sensors not accessible".into(),
					evidence: None,
				})
			} else {
				None
			}
		}
		"smartctl" => {
			let hit = output.contains("permission denied") || output.contains("operation not permitted");
			hit.then(|| PrivilegeReason {
				reason: "SMART devices not accessible".into(),
				evidence: None,
			})
		}
		_ => None,
	}
}

/// Whether the host looks like an unprivileged container. A real
/// implementation inspects `/proc/self/uid_map` for a non-identity
/// mapping; the returned evidence is opaque text handed to the classifier
/// caller, never hardcoded runtime hints (§9).
pub async fn detect_unprivileged_container() -> (bool, Option<UnprivilegedEvidence>) {
	match tokio::fs::read_to_string("/proc/self/uid_map").await {
		Ok(contents) => {
			if let Some(first_line) = contents.lines().next() {
				let fields: Vec<&str> = first_line.split_whitespace().collect();
				if fields.len() == 3 && fields[0] == "0" && fields[1] != "0" {
					return (
						true,
						Some(UnprivilegedEvidence(format!(
							"uid_map=0->{}",
							fields[1]
						))),
					);
				}
			}
			(false, None)
		}
		Err(_) => (false, None),
	}
}

/// Should a privilege-sensitive failure be downgraded from `WARNING` to
/// `SKIP`? True only when the classifier produced a reason *and* the host
/// is confirmed unprivileged (§4.2, §4.3).
pub fn should_downgrade(reason: &Option<PrivilegeReason>, unprivileged: bool) -> bool {
	reason.is_some() && unprivileged
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dmidecode_permission_denied() {
		let r = classify("dmidecode", Some(1), b"/dev/mem: Permission denied");
		assert_eq!(r.unwrap().reason, "DMI tables not accessible");
	}

	#[test]
	fn dmidecode_nonzero_empty_output() {
		let r = classify("dmidecode", Some(1), b"");
		assert!(r.is_some());
	}

	#[test]
	fn blkid_exit_2_empty() {
		let r = classify("blkid", Some(2), b"");
		assert!(r.is_some());
	}

	#[test]
	fn blkid_success_is_none() {
		assert!(classify("blkid", Some(0), b"/dev/sda1: UUID=\"x\"").is_none());
	}

	#[test]
	fn sensors_no_sensors_found() {
		let r = classify("sensors", Some(0), b"No sensors found!");
		assert_eq!(r.unwrap().reason, "no hardware sensors available");
	}

	#[test]
	fn smartctl_permission_denied() {
		let r = classify("smartctl", Some(1), b"Permission denied");
		assert_eq!(r.unwrap().reason, "SMART devices not accessible");
	}

	#[test]
	fn unrecognized_command_is_none() {
		assert!(classify("ls", Some(1), b"permission denied").is_none());
	}

	#[test]
	fn downgrade_requires_both_reason_and_evidence() {
		let reason = classify("dmidecode", Some(1), b"permission denied");
		assert!(should_downgrade(&reason, true));
		assert!(!should_downgrade(&reason, false));
		assert!(!should_downgrade(&None, true));
	}
}
