//! TCP transport for socket and telnet-style instruments
//!
//! Line protocol: commands are terminated with `eol`, replies end with `prompt`.
//! The connection is opened on first use and dropped on any I/O error so that the
//! next call starts from a clean socket.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::{decode_reply, parse_block_header, terminate, InstrumentTransport, TransportError};
use crate::config::{TransportConfig, WireEncoding};

/// TCP transport with connect-on-demand
pub struct TcpTransport {
    /// `host:port`
    pub(crate) address: String,
    pub(crate) timeout: Duration,
    pub(crate) prompt: String,
    pub(crate) eol: String,
    pub(crate) encoding: WireEncoding,
    pub(crate) query_delay: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpTransport {
    /// Create a transport for `host:port` with `\r\n` framing and a 5 s timeout
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            timeout: Duration::from_secs(5),
            prompt: "\r\n".to_string(),
            eol: "\r\n".to_string(),
            encoding: WireEncoding::Utf8,
            query_delay: Duration::from_millis(100),
            stream: Mutex::new(None),
        }
    }

    /// Create a transport from a configuration block
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(&config.address, config.port)
            .with_timeout(config.timeout())
            .with_prompt(&config.prompt)
            .with_eol(&config.eol)
            .with_encoding(config.encoding)
            .with_query_delay(config.query_delay())
    }

    /// Set read/connect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reply terminator
    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    /// Set the command terminator
    pub fn with_eol(mut self, eol: &str) -> Self {
        self.eol = eol.to_string();
        self
    }

    /// Set the wire encoding
    pub fn with_encoding(mut self, encoding: WireEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the write-to-read delay of `query`
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// True while a socket is open
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>, TransportError> {
        let stream = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.timeout_error("connect"))?
            .map_err(|source| TransportError::Connect {
                address: self.address.clone(),
                source,
            })?;
        debug!(address = %self.address, "TCP transport connected");
        Ok(BufReader::new(stream))
    }

    fn timeout_error(&self, operation: &'static str) -> TransportError {
        TransportError::Timeout {
            address: self.address.clone(),
            operation,
            timeout: self.timeout,
        }
    }

    fn io_error(&self, source: std::io::Error) -> TransportError {
        TransportError::Io {
            address: self.address.clone(),
            source,
        }
    }

    async fn read_line(&self, reader: &mut BufReader<TcpStream>) -> Result<Vec<u8>, TransportError> {
        let prompt = self.prompt.as_bytes();
        let delimiter = prompt.last().copied().unwrap_or(b'\n');
        let mut data = Vec::new();
        loop {
            let n = reader
                .read_until(delimiter, &mut data)
                .await
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                if data.is_empty() {
                    return Err(TransportError::Closed(self.address.clone()));
                }
                break;
            }
            if data.ends_with(prompt) {
                break;
            }
        }
        Ok(data)
    }

    async fn read_block(&self, reader: &mut BufReader<TcpStream>) -> Result<Bytes, TransportError> {
        let mut header = vec![0u8; 2];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| self.io_error(e))?;
        let digits = (header[1] as char).to_digit(10).unwrap_or(0) as usize;
        let mut len_field = vec![0u8; digits];
        reader
            .read_exact(&mut len_field)
            .await
            .map_err(|e| self.io_error(e))?;
        header.extend_from_slice(&len_field);
        let (_, payload_len) =
            parse_block_header(&header).map_err(|detail| TransportError::Malformed {
                address: self.address.clone(),
                detail,
            })?;

        let mut payload = vec![0u8; payload_len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| self.io_error(e))?;

        // Swallow the terminator that follows the block, if one arrives promptly.
        let prompt = self.prompt.as_bytes();
        let trailing = match timeout(Duration::from_millis(50), reader.fill_buf()).await {
            Ok(Ok(buffered)) => buffered
                .iter()
                .zip(prompt.iter())
                .take_while(|(a, b)| a == b)
                .count(),
            _ => 0,
        };
        reader.consume(trailing);
        Ok(Bytes::from(payload))
    }
}

#[async_trait]
impl InstrumentTransport for TcpTransport {
    async fn write(&self, command: &str) -> Result<(), TransportError> {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let line = terminate(command, &self.eol);
        let result = match slot.as_mut() {
            Some(reader) => {
                timeout(self.timeout, reader.get_mut().write_all(line.as_bytes()))
                    .await
                    .map_err(|_| self.timeout_error("write"))?
            }
            None => return Err(TransportError::Closed(self.address.clone())),
        };
        if let Err(e) = result {
            *slot = None;
            return Err(self.io_error(e));
        }
        debug!(address = %self.address, command = command.trim_end(), "TCP write");
        Ok(())
    }

    async fn read(&self) -> Result<String, TransportError> {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(reader) = slot.as_mut() else {
            return Err(TransportError::Closed(self.address.clone()));
        };
        let result = match timeout(self.timeout, self.read_line(reader)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error("read")),
        };
        match result {
            Ok(data) => {
                let reply = decode_reply(&data, &self.prompt, self.encoding);
                debug!(address = %self.address, reply = %reply, "TCP read");
                Ok(reply)
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    async fn read_raw(&self) -> Result<Bytes, TransportError> {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(reader) = slot.as_mut() else {
            return Err(TransportError::Closed(self.address.clone()));
        };
        let result = match timeout(self.timeout, self.read_block(reader)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error("read_raw")),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut slot = self.stream.lock().await;
        if let Some(mut reader) = slot.take() {
            // Peer may already be gone; closing is best effort.
            let _ = reader.get_mut().shutdown().await;
            debug!(address = %self.address, "TCP transport disconnected");
        }
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn query_delay(&self) -> Duration {
        self.query_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one connection and answer each received line with the next reply.
    async fn scripted_server(replies: Vec<Vec<u8>>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                reader.get_mut().write_all(&reply).await.unwrap();
            }
            received
        });
        (port, handle)
    }

    #[test]
    fn test_from_config() {
        let config = TransportConfig {
            address: "10.0.0.9".into(),
            port: 5025,
            timeout_ms: 2000,
            eol: "\n".into(),
            ..TransportConfig::default()
        };
        let transport = TcpTransport::from_config(&config);
        assert_eq!(transport.address(), "10.0.0.9:5025");
        assert_eq!(transport.timeout, Duration::from_millis(2000));
        assert_eq!(transport.eol, "\n");
        assert_eq!(transport.prompt, "\r\n");
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let (port, server) = scripted_server(vec![b"BRISTOL WAVELENGTH METER,871A\r\n".to_vec()]).await;
        let transport = TcpTransport::new("127.0.0.1", port).with_query_delay(Duration::ZERO);

        assert!(!transport.is_connected().await);
        let reply = transport.query("*IDN?").await.unwrap();
        assert_eq!(reply, "BRISTOL WAVELENGTH METER,871A");
        assert!(transport.is_connected().await);

        transport.close().await.unwrap();
        assert!(!transport.is_connected().await);
        assert_eq!(server.await.unwrap(), vec!["*IDN?".to_string()]);
    }

    #[tokio::test]
    async fn test_read_raw_block() {
        let mut block = b"#14".to_vec();
        block.extend_from_slice(&[1, 2, 3, 4]);
        block.extend_from_slice(b"\r\n");
        let (port, server) =
            scripted_server(vec![block, b"OK\r\n".to_vec()]).await;
        let transport = TcpTransport::new("127.0.0.1", port).with_query_delay(Duration::ZERO);

        let payload = transport.query_raw(":CALC3:DATA?").await.unwrap();
        assert_eq!(payload.as_ref(), &[1, 2, 3, 4]);
        // Terminator after the block must not leak into the next reply.
        assert_eq!(transport.query("*OPC?").await.unwrap(), "OK");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbled_block_length_is_malformed() {
        let (port, server) = scripted_server(vec![b"#9999999999\r\n".to_vec()]).await;
        let transport = TcpTransport::new("127.0.0.1", port).with_query_delay(Duration::ZERO);

        let err = transport.query_raw(":CALC3:DATA?").await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new("127.0.0.1", port).with_timeout(Duration::from_millis(500));
        let err = transport.write("*IDN?").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        ));
    }
}
