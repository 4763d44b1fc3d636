//! Age encryption wrapper (§4.9), grounded on the teacher's `algae-cli`
//! subcrate (`beyondessential-bestool/crates/algae-cli/src/{files,streams}.rs`),
//! adapted from its synchronous `std::io` streams to tokio's
//! `AsyncRead`/`AsyncWrite` via `tokio_util::compat`.

use std::str::FromStr;

use age::x25519::Recipient;
use futures::io::AsyncWriteExt as _;
use miette::{IntoDiagnostic as _, Result};
use tokio_util::compat::FuturesAsyncWriteCompatExt;

/// Parses age recipient strings (`age1...` public keys).
pub fn parse_recipients(raw: &[String]) -> Result<Vec<Recipient>> {
	raw.iter()
		.map(|s| Recipient::from_str(s).map_err(|e| miette::miette!("invalid age recipient {s:?}: {e}")))
		.collect()
}

/// Streams `reader` through age encryption into `writer`, for the
/// configured `recipients`. Used as the last stage of the archive
/// pipeline when `EncryptArchive=true`.
pub async fn encrypt_stream<R, W>(recipients: Vec<Recipient>, mut reader: R, writer: W) -> Result<()>
where
	R: tokio::io::AsyncRead + Unpin,
	W: tokio::io::AsyncWrite + Unpin,
{
	let boxed_recipients: Vec<Box<dyn age::Recipient + Send>> =
		recipients.into_iter().map(|r| Box::new(r) as Box<dyn age::Recipient + Send>).collect();

	let encryptor = age::Encryptor::with_recipients(boxed_recipients)
		.ok_or_else(|| miette::miette!("no age recipients configured"))?;

	let mut compat_writer = writer.compat_write();
	let mut age_writer = encryptor
		.wrap_async_output(&mut compat_writer)
		.await
		.into_diagnostic()?;

	tokio::io::copy(&mut reader, &mut TokioWriteAdapter(&mut age_writer))
		.await
		.into_diagnostic()?;

	age_writer.close().await.into_diagnostic()?;
	Ok(())
}

/// Bridges a `futures::io::AsyncWrite` (age's output type) so
/// `tokio::io::copy` can write into it directly.
struct TokioWriteAdapter<'a, W>(&'a mut W);

impl<W: futures::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for TokioWriteAdapter<'_, W> {
	fn poll_write(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<std::io::Result<usize>> {
		futures::io::AsyncWrite::poll_write(std::pin::Pin::new(&mut self.0), cx, buf)
	}

	fn poll_flush(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		futures::io::AsyncWrite::poll_flush(std::pin::Pin::new(&mut self.0), cx)
	}

	fn poll_shutdown(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		futures::io::AsyncWrite::poll_close(std::pin::Pin::new(&mut self.0), cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_malformed_recipients() {
		let err = parse_recipients(&["not-a-key".to_string()]);
		assert!(err.is_err());
	}

	#[tokio::test]
	async fn encrypts_into_nonempty_ciphertext() {
		let identity = age::x25519::Identity::generate();
		let recipient = identity.to_public();

		let plaintext = b"hello proxmox".to_vec();
		let mut ciphertext = Vec::new();
		encrypt_stream(vec![recipient], plaintext.as_slice(), &mut ciphertext)
			.await
			.unwrap();

		assert!(!ciphertext.is_empty());
		assert_ne!(ciphertext, plaintext);
	}
}
