//! Instrument transport adapters
//!
//! Every vendor driver talks to its instrument through [`InstrumentTransport`], a small
//! line-oriented command capability with a raw-bytes variant for binary acquisitions.
//! Implementations:
//!
//! - [`TcpTransport`]: socket/telnet-style line protocol, connect on demand
//! - [`VisaTransport`]: VISA resources (requires the `instrument_visa` feature)
//! - [`MockTransport`]: scripted replies and failure injection for tests

pub mod mock_adapter;
pub mod tcp_adapter;
pub mod visa_adapter;

pub use mock_adapter::MockTransport;
pub use tcp_adapter::TcpTransport;
pub use visa_adapter::VisaTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::config::{TransportConfig, TransportKind, WireEncoding};

/// Failures raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} during {operation} on {address}")]
    Timeout {
        address: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("I/O error on {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by {0}")]
    Closed(String),

    #[error("Malformed reply from {address}: {detail}")]
    Malformed { address: String, detail: String },

    #[error("VISA error on {address}: {detail}")]
    Visa { address: String, detail: String },

    #[error("Injected failure on {0}")]
    Injected(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(&'static str),
}

/// Generic command transport consumed by every instrument driver.
///
/// Implementations connect on demand: the first `write`/`read` opens the
/// connection, `close` drops it, and a later call opens it again.
#[async_trait]
pub trait InstrumentTransport: Send + Sync {
    /// Send one command; the end-of-line terminator is appended when missing.
    async fn write(&self, command: &str) -> Result<(), TransportError>;

    /// Read one reply with the prompt stripped.
    async fn read(&self) -> Result<String, TransportError>;

    /// Read one definite-length binary block (`#<n><len><payload>`), returning the payload.
    async fn read_raw(&self) -> Result<Bytes, TransportError>;

    /// Close the connection; a closed transport reconnects on next use.
    async fn close(&self) -> Result<(), TransportError>;

    /// Human readable address used in logs and errors.
    fn address(&self) -> &str;

    /// Delay inserted between the write and the read of a query.
    fn query_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    /// Write, wait [`query_delay`](Self::query_delay), then read.
    async fn query(&self, command: &str) -> Result<String, TransportError> {
        self.write(command).await?;
        tokio::time::sleep(self.query_delay()).await;
        self.read().await
    }

    /// Write, wait, then read a binary block.
    async fn query_raw(&self, command: &str) -> Result<Bytes, TransportError> {
        self.write(command).await?;
        tokio::time::sleep(self.query_delay()).await;
        self.read_raw().await
    }
}

/// Build the transport described by `config`.
pub fn transport_from_config(config: &TransportConfig) -> Box<dyn InstrumentTransport> {
    match config.kind {
        TransportKind::Tcp => Box::new(TcpTransport::from_config(config)),
        TransportKind::Visa => Box::new(VisaTransport::from_config(config)),
    }
}

/// Append `eol` unless the command already ends with it.
pub(crate) fn terminate(command: &str, eol: &str) -> String {
    if command.ends_with(eol) {
        command.to_string()
    } else {
        format!("{}{}", command, eol)
    }
}

/// Decode a reply, stripping trailing prompt characters.
///
/// UTF-8 replies that fail to decode are returned as lowercase hex of the raw bytes,
/// the way the instruments' binary status words are usually logged.
pub(crate) fn decode_reply(data: &[u8], prompt: &str, encoding: WireEncoding) -> String {
    let trim_set: Vec<u8> = prompt.bytes().collect();
    let mut end = data.len();
    while end > 0 && trim_set.contains(&data[end - 1]) {
        end -= 1;
    }
    let body = &data[..end];
    match encoding {
        WireEncoding::Utf8 => match std::str::from_utf8(body) {
            Ok(text) => text.to_string(),
            Err(_) => body.iter().map(|b| format!("{:02x}", b)).collect(),
        },
        WireEncoding::Latin1 => body.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Largest binary block accepted from an instrument (16 MiB, over a million spectrum
/// points).
pub const MAX_BLOCK_BYTES: usize = 16 * 1024 * 1024;

/// Parse the header of a definite-length block.
///
/// Returns `(header_len, payload_len)`. Lengths above [`MAX_BLOCK_BYTES`] are rejected
/// before anything is allocated for the payload.
pub(crate) fn parse_block_header(header: &[u8]) -> Result<(usize, usize), String> {
    if header.first() != Some(&b'#') {
        return Err("binary block does not start with '#'".to_string());
    }
    let digits = header
        .get(1)
        .and_then(|d| (*d as char).to_digit(10))
        .ok_or_else(|| "binary block length digit missing".to_string())? as usize;
    if digits == 0 {
        return Err("indefinite-length blocks are not supported".to_string());
    }
    let len_field = header
        .get(2..2 + digits)
        .ok_or_else(|| "binary block length truncated".to_string())?;
    let len_text =
        std::str::from_utf8(len_field).map_err(|_| "binary block length not ASCII".to_string())?;
    let payload_len = len_text
        .parse::<usize>()
        .map_err(|_| format!("binary block length '{}' is not a number", len_text))?;
    if payload_len > MAX_BLOCK_BYTES {
        return Err(format!(
            "binary block length {} exceeds {} bytes",
            payload_len, MAX_BLOCK_BYTES
        ));
    }
    Ok((2 + digits, payload_len))
}
