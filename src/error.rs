//! The error taxonomy of §7: sub-operation failures are logged and swallowed
//! by the engine, only escalating to one of these variants at a pipeline
//! boundary (`CollectAll`, archive creation, integrity checks).

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
	#[error("PVE collection failed: {0}")]
	Pve(#[source] anyhow::Error),

	#[error("PBS collection failed: {0}")]
	Pbs(#[source] anyhow::Error),

	#[error("archive creation failed: {0}")]
	Archive(#[source] anyhow::Error),

	#[error("cancelled")]
	Cancelled,

	#[error("integrity check failed: {0}")]
	Integrity(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

pub type Result<T> = miette::Result<T>;

/// Build the `"<kind> - <message>"` error strings that downstream
/// notification parsing splits on (§4.3, §9). The `" - "` separator is
/// load-bearing; never reformat it.
pub fn kind_error(kind: &str, message: impl std::fmt::Display) -> miette::Report {
	miette::miette!("{kind} - {message}")
}
