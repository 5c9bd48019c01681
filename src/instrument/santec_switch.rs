//! Santec SX1 optical switch driver
//!
//! The switch executes commands asynchronously; completion is signalled by
//! `STAT:OPER:COND?` returning `0`.

use async_trait::async_trait;
use tracing::debug;

use crate::adapters::InstrumentTransport;
use crate::instrument::capabilities::{Instrument, OpticalSwitch};
use crate::{StationError, StationResult};

pub struct SantecSwitch {
    name: String,
    transport: Box<dyn InstrumentTransport>,
}

impl SantecSwitch {
    pub fn new(name: &str, transport: Box<dyn InstrumentTransport>) -> Self {
        Self {
            name: name.to_string(),
            transport,
        }
    }

    fn parse_int(&self, what: &str, reply: &str) -> StationResult<i64> {
        reply.trim().parse::<i64>().map_err(|_| {
            StationError::Instrument(format!(
                "{}: failed to parse {} reply '{}'",
                self.name,
                what,
                reply.trim()
            ))
        })
    }
}

#[async_trait]
impl Instrument for SantecSwitch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self) -> StationResult<String> {
        Ok(self.transport.query("*IDN?").await?)
    }

    async fn close(&self) -> StationResult<()> {
        Ok(self.transport.close().await?)
    }
}

#[async_trait]
impl OpticalSwitch for SantecSwitch {
    async fn set_channel(&self, channel: u16) -> StationResult<()> {
        self.transport.write(&format!("CLOSe {}", channel)).await?;
        debug!(instrument = %self.name, channel, "Switch channel requested");
        Ok(())
    }

    async fn channel(&self) -> StationResult<u16> {
        let reply = self.transport.query("CLOSe?").await?;
        let channel = self.parse_int("channel", &reply)?;
        u16::try_from(channel).map_err(|_| {
            StationError::Instrument(format!("{}: channel {} out of range", self.name, channel))
        })
    }

    async fn operation_complete(&self) -> StationResult<bool> {
        let reply = self.transport.query("STAT:OPER:COND?").await?;
        Ok(self.parse_int("operation status", &reply)? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_and_read_channel() {
        let transport = MockTransport::new("osw");
        transport.respond_to("CLOSe?", "12");
        let osw = SantecSwitch::new("OSW", Box::new(transport.clone()));

        osw.set_channel(12).await.unwrap();
        assert_eq!(osw.channel().await.unwrap(), 12);
        assert_eq!(transport.written(), vec!["CLOSe 12", "CLOSe?"]);
    }

    #[tokio::test]
    async fn test_operation_complete_polls_until_zero() {
        let transport = MockTransport::new("osw");
        transport.respond_to("STAT:OPER:COND?", "0");
        let osw = SantecSwitch::new("OSW", Box::new(transport.clone()));
        assert!(osw
            .wait_operation_complete(Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_busy_switch_reports_incomplete() {
        let transport = MockTransport::new("osw");
        transport.respond_to("STAT:OPER:COND?", "1");
        let osw = SantecSwitch::new("OSW", Box::new(transport.clone()));
        assert!(!osw
            .wait_operation_complete(Duration::from_millis(30), Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_negative_channel_rejected() {
        let transport = MockTransport::new("osw");
        transport.respond_to("CLOSe?", "-1");
        let osw = SantecSwitch::new("OSW", Box::new(transport));
        assert!(osw.channel().await.is_err());
    }
}
