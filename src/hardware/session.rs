//! Leased instrument session
//!
//! A session is the scope in which a step may touch the shared hardware: the lease is
//! taken first, the instruments are brought up, and when a bay is given the optical
//! switch is moved to it and must confirm the channel before the session is handed
//! out. Any failure after the lease was taken closes what was opened and releases the
//! lease before the error is returned.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::SequenceConfig;
use crate::hardware::lease::{InstrumentLease, LeaseGuard, LeaseState};
use crate::instrument::{EquipmentReport, InstrumentFactory, OpticalInstruments, OpticalSwitch};
use crate::{StationError, StationResult};

/// Holder name used by the equipment check
pub const EQUIPMENT_CHECK_HOLDER: &str = "CalStationCheck";

/// Switch timing for channel selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTiming {
    /// Wait for the switch to report operation complete
    pub opc_timeout: Duration,
    /// Maximum wait for the switch to report the requested channel
    pub confirm_timeout: Duration,
    pub confirm_poll: Duration,
    /// Settle after the channel is confirmed
    pub settle: Duration,
}

impl SessionTiming {
    pub fn from_sequence(sequence: &SequenceConfig) -> Self {
        Self {
            opc_timeout: Duration::from_millis(sequence.opc_timeout_ms),
            confirm_timeout: Duration::from_millis(sequence.channel_confirm_timeout_ms),
            confirm_poll: Duration::from_millis(sequence.channel_poll_ms),
            settle: Duration::from_millis(sequence.channel_settle_ms),
        }
    }
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self::from_sequence(&SequenceConfig::default())
    }
}

/// Instruments opened under a held lease
///
/// Call [`close`](Self::close) to tear the instruments down. Dropping the session
/// without closing still releases the lease but leaves the instrument connections to
/// their own drop handling.
pub struct InstrumentSession {
    instruments: OpticalInstruments,
    bay: Option<u16>,
    guard: Option<LeaseGuard>,
}

impl InstrumentSession {
    /// Acquire the lease for `holder`, bring the instruments up and select `bay`.
    pub async fn open(
        lease: &InstrumentLease,
        factory: &dyn InstrumentFactory,
        holder: &str,
        bay: Option<u16>,
        timing: &SessionTiming,
    ) -> StationResult<Self> {
        let guard = lease.acquire(holder, bay).await?;

        let instruments = match factory.bring_up(bay).await {
            Ok(instruments) => instruments,
            Err(e) => {
                warn!(holder, error = %e, "Instrument bring-up failed, releasing lease");
                guard.release();
                return Err(e);
            }
        };

        if let Some(channel) = bay {
            if let Err(e) = select_channel(instruments.osw.as_ref(), channel, timing).await {
                warn!(holder, channel, error = %e, "Channel selection failed, closing session");
                instruments.close_all().await;
                guard.release();
                return Err(e);
            }
        }

        debug!(holder, bay = ?bay, "Instrument session open");
        Ok(Self {
            instruments,
            bay,
            guard: Some(guard),
        })
    }

    pub fn instruments(&self) -> &OpticalInstruments {
        &self.instruments
    }

    pub fn bay(&self) -> Option<u16> {
        self.bay
    }

    pub fn lease_state(&self) -> Option<LeaseState> {
        self.guard.as_ref().and_then(LeaseGuard::state)
    }

    /// Close every instrument, then release the lease.
    pub async fn close(mut self) {
        self.instruments.close_all().await;
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
        debug!(bay = ?self.bay, "Instrument session closed");
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!(bay = ?self.bay, "Instrument session dropped without close");
        }
    }
}

/// Move the switch to `channel` and wait until it reports that channel.
///
/// The operation-complete wait is advisory; the channel confirmation is not. After
/// confirmation the switch is given `timing.settle` before readings are taken.
pub async fn select_channel<S: OpticalSwitch + ?Sized>(
    osw: &S,
    channel: u16,
    timing: &SessionTiming,
) -> StationResult<()> {
    osw.set_channel(channel).await?;
    if !osw
        .wait_operation_complete(timing.opc_timeout, timing.confirm_poll)
        .await?
    {
        warn!(channel, "Switch did not report operation complete");
    }

    let start = Instant::now();
    loop {
        match osw.channel().await {
            Ok(current) if current == channel => break,
            Ok(current) => debug!(requested = channel, current, "Waiting for switch"),
            Err(e) => debug!(requested = channel, error = %e, "Switch position query failed"),
        }
        if start.elapsed() >= timing.confirm_timeout {
            return Err(StationError::ChannelNotConfirmed {
                channel,
                timeout: timing.confirm_timeout,
            });
        }
        sleep(timing.confirm_poll).await;
    }

    sleep(timing.settle).await;
    info!(channel, "Switch set");
    Ok(())
}

/// Open a session on bay 1 as [`EQUIPMENT_CHECK_HOLDER`] and report every instrument.
pub async fn check_equipment(
    lease: &InstrumentLease,
    factory: &dyn InstrumentFactory,
    timing: &SessionTiming,
) -> StationResult<EquipmentReport> {
    let session =
        InstrumentSession::open(lease, factory, EQUIPMENT_CHECK_HOLDER, Some(1), timing).await?;
    let report = session.instruments().check().await;
    session.close().await;
    for status in &report.instruments {
        info!(role = %status.role, present = status.present, idn = %status.idn, "Equipment");
    }
    Ok(report)
}
