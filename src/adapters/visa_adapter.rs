//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate. VISA calls are synchronous, so every operation runs on
//! Tokio's blocking pool. Without the `instrument_visa` feature the transport can be
//! constructed (configuration stays valid) but every operation fails with
//! [`TransportError::FeatureNotEnabled`].
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use super::{InstrumentTransport, TransportError};
use crate::config::{TransportConfig, WireEncoding};

#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// VISA transport with connect-on-demand
pub struct VisaTransport {
    /// VISA resource string (e.g., "GPIB0::1::INSTR")
    pub(crate) resource: String,
    pub(crate) timeout: Duration,
    pub(crate) prompt: String,
    pub(crate) eol: String,
    pub(crate) encoding: WireEncoding,
    pub(crate) query_delay: Duration,
    #[cfg(feature = "instrument_visa")]
    session: Arc<Mutex<Option<session::VisaSession>>>,
}

impl VisaTransport {
    /// Create a new VISA transport with `\n` framing and a 5 s timeout
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            timeout: Duration::from_secs(5),
            prompt: "\n".to_string(),
            eol: "\n".to_string(),
            encoding: WireEncoding::Utf8,
            query_delay: Duration::from_millis(100),
            #[cfg(feature = "instrument_visa")]
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a transport from a configuration block
    pub fn from_config(config: &TransportConfig) -> Self {
        let mut transport = Self::new(&config.address);
        transport.timeout = config.timeout();
        transport.prompt = config.prompt.clone();
        transport.eol = config.eol.clone();
        transport.encoding = config.encoding;
        transport.query_delay = config.query_delay();
        transport
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_eol(mut self, eol: &str) -> Self {
        self.eol = eol.to_string();
        self
    }
}

#[cfg(feature = "instrument_visa")]
mod session {
    use std::ffi::CString;
    use std::io::{self, BufRead, BufReader, Read, Write};
    use std::time::Duration;
    use visa_rs::prelude::*;

    /// An open VISA session; the resource manager must outlive the instrument.
    pub(super) struct VisaSession {
        instr: Instrument,
        _rm: DefaultRM,
    }

    impl VisaSession {
        pub(super) fn open(resource: &str, timeout: Duration) -> Result<Self, String> {
            let rm = DefaultRM::new().map_err(|e| format!("resource manager: {}", e))?;
            let name = CString::new(resource).map_err(|e| e.to_string())?;
            let instr = rm
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| format!("open: {}", e))?;
            Ok(Self { instr, _rm: rm })
        }

        pub(super) fn write_line(&mut self, line: &str) -> io::Result<()> {
            self.instr.write_all(line.as_bytes())
        }

        pub(super) fn read_line(&mut self, delimiter: u8) -> io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            let mut reader = BufReader::new(&self.instr);
            reader.read_until(delimiter, &mut buf)?;
            Ok(buf)
        }

        pub(super) fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            (&self.instr).read_exact(buf)
        }
    }
}

#[cfg(feature = "instrument_visa")]
impl VisaTransport {
    /// Run `op` against the (lazily opened) session on the blocking pool.
    async fn with_session<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut session::VisaSession) -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::clone(&self.session);
        let resource = self.resource.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().map_err(|_| TransportError::Visa {
                address: resource.clone(),
                detail: "session lock poisoned".to_string(),
            })?;
            if guard.is_none() {
                let opened = session::VisaSession::open(&resource, timeout).map_err(|detail| {
                    TransportError::Visa {
                        address: resource.clone(),
                        detail,
                    }
                })?;
                debug!(resource = %resource, timeout_ms = timeout.as_millis() as u64, "VISA resource opened");
                *guard = Some(opened);
            }
            let result = match guard.as_mut() {
                Some(session) => op(session),
                None => return Err(TransportError::Closed(resource)),
            };
            result.map_err(|source| {
                *guard = None;
                TransportError::Io {
                    address: resource.clone(),
                    source,
                }
            })
        })
        .await
        .map_err(|e| TransportError::Visa {
            address: self.resource.clone(),
            detail: format!("VISA I/O task panicked: {}", e),
        })?
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl InstrumentTransport for VisaTransport {
    async fn write(&self, command: &str) -> Result<(), TransportError> {
        let line = super::terminate(command, &self.eol);
        self.with_session(move |session| session.write_line(&line))
            .await?;
        debug!(resource = %self.resource, command = command.trim_end(), "VISA write");
        Ok(())
    }

    async fn read(&self) -> Result<String, TransportError> {
        let delimiter = self.prompt.as_bytes().last().copied().unwrap_or(b'\n');
        let data = self
            .with_session(move |session| session.read_line(delimiter))
            .await?;
        let reply = super::decode_reply(&data, &self.prompt, self.encoding);
        debug!(resource = %self.resource, reply = %reply, "VISA read");
        Ok(reply)
    }

    async fn read_raw(&self) -> Result<Bytes, TransportError> {
        let address = self.resource.clone();
        let payload = self
            .with_session(move |session| {
                let mut header = vec![0u8; 2];
                session.read_exact(&mut header)?;
                let digits = (header[1] as char).to_digit(10).unwrap_or(0) as usize;
                let mut len_field = vec![0u8; digits];
                session.read_exact(&mut len_field)?;
                header.extend_from_slice(&len_field);
                let (_, payload_len) = super::parse_block_header(&header)
                    .map_err(|detail| std::io::Error::new(std::io::ErrorKind::InvalidData, detail))?;
                let mut payload = vec![0u8; payload_len];
                session.read_exact(&mut payload)?;
                Ok(payload)
            })
            .await
            .map_err(|e| match e {
                TransportError::Io { source, .. }
                    if source.kind() == std::io::ErrorKind::InvalidData =>
                {
                    TransportError::Malformed {
                        address,
                        detail: source.to_string(),
                    }
                }
                other => other,
            })?;
        Ok(Bytes::from(payload))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut guard = self.session.lock().map_err(|_| TransportError::Visa {
            address: self.resource.clone(),
            detail: "session lock poisoned".to_string(),
        })?;
        if guard.take().is_some() {
            debug!(resource = %self.resource, "VISA resource closed");
        }
        Ok(())
    }

    fn address(&self) -> &str {
        &self.resource
    }

    fn query_delay(&self) -> Duration {
        self.query_delay
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl InstrumentTransport for VisaTransport {
    async fn write(&self, _command: &str) -> Result<(), TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_visa"))
    }

    async fn read(&self) -> Result<String, TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_visa"))
    }

    async fn read_raw(&self) -> Result<Bytes, TransportError> {
        Err(TransportError::FeatureNotEnabled("instrument_visa"))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn address(&self) -> &str {
        &self.resource
    }

    fn query_delay(&self) -> Duration {
        self.query_delay
    }
}
