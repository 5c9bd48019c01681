//! Mock transport for testing
//!
//! Provides a simulated command transport for exercising the vendor drivers without
//! hardware:
//! - Scripted replies keyed by command
//! - Controllable failure injection
//! - Call logging for test verification

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{InstrumentTransport, TransportError};

enum Pending {
    Text(String),
    Raw(Bytes),
}

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use pathloss_station::adapters::{InstrumentTransport, MockTransport};
///
/// # tokio_test::block_on(async {
/// let transport = MockTransport::new("mock-opm");
/// transport.respond_to(":READ1:POW?", "-3.25");
/// assert_eq!(transport.query(":READ1:POW?").await.unwrap(), "-3.25");
/// # });
/// ```
#[derive(Clone)]
pub struct MockTransport {
    address: String,
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<HashMap<String, String>>>,
    raw_responses: Arc<Mutex<HashMap<String, Bytes>>>,
    pending: Arc<Mutex<VecDeque<Pending>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            connected: Arc::new(AtomicBool::new(false)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            call_log: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(HashMap::new())),
            raw_responses: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Reply `reply` whenever `command` is written
    pub fn respond_to(&self, command: &str, reply: &str) {
        lock(&self.responses).insert(command.to_string(), reply.to_string());
    }

    /// Reply with a binary block payload whenever `command` is written
    pub fn respond_raw(&self, command: &str, payload: Bytes) {
        lock(&self.raw_responses).insert(command.to_string(), payload);
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Commands written so far, in order
    pub fn written(&self) -> Vec<String> {
        lock(&self.call_log)
            .iter()
            .filter_map(|entry| entry.strip_prefix("write: ").map(str::to_string))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn log_call(&self, call: String) {
        lock(&self.call_log).push(call);
    }

    fn no_reply(&self, operation: &'static str) -> TransportError {
        TransportError::Timeout {
            address: self.address.clone(),
            operation,
            timeout: Duration::ZERO,
        }
    }
}

#[async_trait]
impl InstrumentTransport for MockTransport {
    async fn write(&self, command: &str) -> Result<(), TransportError> {
        let command = command.trim_end();
        self.log_call(format!("write: {}", command));
        if self.check_failure() {
            return Err(TransportError::Injected(self.address.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);

        if let Some(reply) = lock(&self.responses).get(command) {
            lock(&self.pending).push_back(Pending::Text(reply.clone()));
        } else if let Some(payload) = lock(&self.raw_responses).get(command) {
            lock(&self.pending).push_back(Pending::Raw(payload.clone()));
        }
        Ok(())
    }

    async fn read(&self) -> Result<String, TransportError> {
        self.log_call("read".to_string());
        if self.check_failure() {
            return Err(TransportError::Injected(self.address.clone()));
        }
        match lock(&self.pending).pop_front() {
            Some(Pending::Text(reply)) => Ok(reply),
            Some(Pending::Raw(_)) => Err(TransportError::Malformed {
                address: self.address.clone(),
                detail: "binary block pending, expected text".to_string(),
            }),
            None => Err(self.no_reply("read")),
        }
    }

    async fn read_raw(&self) -> Result<Bytes, TransportError> {
        self.log_call("read_raw".to_string());
        if self.check_failure() {
            return Err(TransportError::Injected(self.address.clone()));
        }
        match lock(&self.pending).pop_front() {
            Some(Pending::Raw(payload)) => Ok(payload),
            Some(Pending::Text(reply)) => Err(TransportError::Malformed {
                address: self.address.clone(),
                detail: format!("expected binary block, got '{}'", reply),
            }),
            None => Err(self.no_reply("read_raw")),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.log_call("close".to_string());
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.pending).clear();
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn query_delay(&self) -> Duration {
        Duration::ZERO
    }
}
