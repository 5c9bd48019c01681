//! Calibration steps
//!
//! Each [`CalibrationStep`] is one entry of the procedure. Steps that touch hardware
//! open their own [`InstrumentSession`], so the lease is held only while instruments
//! are in use and is released again when the step ends, whatever its result.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::calibration::context::RunContext;
use crate::calibration::limits::{tolerance_window, verify_limit, verify_window};
use crate::calibration::prompt::OperatorPrompt;
use crate::config::{SequenceConfig, SpectrumConfig, StationConfig};
use crate::data::control_chart::ControlChartExporter;
use crate::data::ledger::CalibrationLedger;
use crate::data::spectrum::SpectrumSummary;
use crate::hardware::{InstrumentLease, InstrumentSession, LeaseSettings, SessionTiming};
use crate::instrument::{read_frequency_with_retry, InstrumentFactory};
use crate::sequencer::{FailFlag, SequencerHandle, StepAction};
use crate::{StationError, StationResult};

/// Limit name used for the end-of-run reference power check
pub const POWER_END_LIMIT: &str = "Calibration reference power";

/// Services shared by every step of a run
pub struct CalibrationStation {
    pub lease: InstrumentLease,
    pub factory: Arc<dyn InstrumentFactory>,
    pub prompt: Arc<dyn OperatorPrompt>,
    pub ledger: CalibrationLedger,
    pub chart: ControlChartExporter,
    pub timing: SessionTiming,
    pub sequence: SequenceConfig,
    pub spectrum: SpectrumConfig,
    pub freq_retries: u32,
}

impl CalibrationStation {
    pub fn new(
        config: &StationConfig,
        factory: Arc<dyn InstrumentFactory>,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Self {
        Self {
            lease: InstrumentLease::new(LeaseSettings::from_config(config)),
            factory,
            prompt,
            ledger: CalibrationLedger::new(&config.station.ledger_path, config.bays.ledger_bays),
            chart: ControlChartExporter::new(&config.station.chart_dir),
            timing: SessionTiming::from_sequence(&config.sequence),
            sequence: config.sequence.clone(),
            spectrum: config.spectrum.clone(),
            freq_retries: config
                .instruments
                .wlm
                .wlm
                .as_ref()
                .map(|w| w.freq_retries)
                .unwrap_or(3),
        }
    }

    async fn session(&self, ctx: &RunContext, bay: Option<u16>) -> StationResult<InstrumentSession> {
        InstrumentSession::open(
            &self.lease,
            self.factory.as_ref(),
            &ctx.operator_id,
            bay,
            &self.timing,
        )
        .await
    }

    fn read_settle(&self) -> Duration {
        Duration::from_millis(self.sequence.read_settle_ms)
    }
}

/// What a step does
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Log the bay map and the limits in force
    InitialStation,
    /// Ask the operator to confirm a manual action
    Prompt(String),
    /// Wait for the laser source to stabilise
    WarmUp(Duration),
    /// Bring the instruments up once and check they all answer
    SetupInstruments,
    /// Read the calibration reference power and check it against the source limits
    ReadCrp,
    /// Move the optical switch to a bay
    SelectBay(u16),
    /// Frequency, SMSR and power from the wavelength meter on a bay.
    ///
    /// The power comes from the wavelength meter itself, so the ledger's `WLM_Bay`
    /// column is the loss seen on the WLM leg. Ledgers written by older stations
    /// filled that column from the power meter and are not comparable with it.
    ReadWlm(u16),
    /// Power meter reading on a bay
    ReadOpm(u16),
    /// Spectrum acquisition and analysis on a bay; failures are logged only
    AnalyzeSpectrum(u16),
    /// Derive the bay's path loss and verify it
    PathLoss(u16),
    /// Re-read the reference power and check the drift
    VerifyPowerEnd,
    /// Append the run to the ledger unless the run failed
    AppendLedger,
    /// Write the control chart unless the run failed
    ExportChart,
}

/// One procedure step bound to the station services
pub struct CalibrationStep {
    kind: StepKind,
    station: Arc<CalibrationStation>,
    abort: SequencerHandle,
}

impl CalibrationStep {
    pub fn new(kind: StepKind, station: Arc<CalibrationStation>, abort: SequencerHandle) -> Self {
        Self {
            kind,
            station,
            abort,
        }
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    async fn initial_station(&self, ctx: &mut RunContext) -> StationResult<()> {
        info!(bays = ?ctx.available_bays(), "Initial bay mapping");
        info!(
            laser_source = %ctx.limits.laser_source.limit_name,
            crp_low = ctx.limits.laser_source.low,
            crp_high = ctx.limits.laser_source.high,
            path_loss = %ctx.limits.path_loss.limit_name,
            loss_low = ctx.limits.path_loss.low,
            loss_high = ctx.limits.path_loss.high,
            "Limits loaded"
        );
        Ok(())
    }

    async fn prompt(&self, message: &str) -> StationResult<()> {
        if self.station.prompt.confirm(message).await? {
            Ok(())
        } else {
            Err(StationError::Prompt(format!("Operator declined: {}", message)))
        }
    }

    async fn warm_up(&self, duration: Duration) -> StationResult<()> {
        info!(secs = duration.as_secs(), "Wait time");
        let start = Instant::now();
        let slice = Duration::from_millis(100);
        while start.elapsed() < duration {
            if self.abort.is_aborted() {
                return Err(StationError::Aborted("laser warm-up".to_string()));
            }
            sleep(slice.min(duration.saturating_sub(start.elapsed()))).await;
        }
        info!("Wait time finish");
        Ok(())
    }

    async fn setup_instruments(&self, ctx: &mut RunContext) -> StationResult<()> {
        let session = self.station.session(ctx, None).await?;
        let report = session.instruments().check().await;
        session.close().await;
        for status in &report.instruments {
            info!(role = %status.role, idn = %status.idn, present = status.present, "Instrument");
        }
        if report.all_present() {
            Ok(())
        } else {
            let missing: Vec<&str> = report
                .instruments
                .iter()
                .filter(|s| !s.present)
                .map(|s| s.role.as_str())
                .collect();
            Err(StationError::Instrument(format!(
                "Instruments not responding: {}",
                missing.join(", ")
            )))
        }
    }

    async fn read_crp(&self, ctx: &mut RunContext) -> StationResult<()> {
        let session = self.station.session(ctx, None).await?;
        let reading = session.instruments().opm.read_power_dbm().await;
        session.close().await;
        let crp = reading?;
        ctx.crp_dbm = Some(crp);
        info!(crp_dbm = crp, "CRP power");
        verify_limit(crp, &ctx.limits.laser_source)
    }

    async fn select_bay(&self, ctx: &mut RunContext, bay: u16) -> StationResult<()> {
        ctx.current_bay = Some(bay);
        let session = self.station.session(ctx, Some(bay)).await?;
        session.close().await;
        info!(channel = bay, "Set Channel Optical Switch");
        Ok(())
    }

    /// Stores the wavelength meter's own power reading as `wlm_raw_dbm`; the power
    /// meter is not consulted here.
    async fn read_wlm(&self, ctx: &mut RunContext, bay: u16) -> StationResult<()> {
        ctx.bay_mut(bay)?;
        sleep(self.station.read_settle()).await;
        let session = self.station.session(ctx, Some(bay)).await?;
        let wlm = session.instruments().wlm.clone();
        let result = async {
            let freq = read_frequency_with_retry(wlm.as_ref(), self.station.freq_retries).await;
            let smsr = wlm.smsr_db().await?;
            let power = wlm.power_dbm().await?;
            Ok::<_, StationError>((freq, smsr, power))
        }
        .await;
        session.close().await;
        let (freq, smsr, power) = result?;

        info!(bay, frequency_thz = freq, "Wavelength Frequency");
        info!(bay, smsr_db = ?smsr, "Wavelength SMSR");
        info!(bay, power_dbm = power, "Wavelength Power");
        ctx.wlm_freq_thz = freq;
        ctx.wlm_smsr_db = smsr.unwrap_or(f64::NAN);
        ctx.bay_mut(bay)?.wlm_raw_dbm = Some(power);
        Ok(())
    }

    async fn read_opm(&self, ctx: &mut RunContext, bay: u16) -> StationResult<()> {
        ctx.bay_mut(bay)?;
        sleep(self.station.read_settle()).await;
        let session = self.station.session(ctx, Some(bay)).await?;
        let reading = session.instruments().opm.read_power_dbm().await;
        session.close().await;
        let power = reading?;
        info!(bay, power_dbm = power, "Reading OPM");
        ctx.bay_mut(bay)?.opm_raw_dbm = Some(power);
        Ok(())
    }

    async fn analyze_spectrum(&self, ctx: &mut RunContext, bay: u16) -> StationResult<()> {
        let session = match self.station.session(ctx, Some(bay)).await {
            Ok(session) => session,
            Err(e) => {
                warn!(bay, error = %e, "Spectrum skipped: no instrument session");
                return Ok(());
            }
        };
        let acquired = match &session.instruments().osa {
            Some(osa) => Some(osa.acquire_spectrum().await),
            None => None,
        };
        session.close().await;

        let sample = match acquired {
            Some(Ok(sample)) => sample,
            Some(Err(e)) => {
                warn!(bay, error = %e, "Spectrum acquisition failed");
                return Ok(());
            }
            None => {
                warn!(bay, "No spectrum analyzer configured");
                return Ok(());
            }
        };
        match SpectrumSummary::analyze(&sample, &self.station.spectrum) {
            Ok(summary) => {
                info!(
                    bay,
                    center_thz = summary.center.frequency_thz,
                    osnr_db = summary.osnr_db,
                    signal_dbm = summary.signal_power_dbm,
                    smsr_db = ?summary.smsr.smsr_db,
                    "Spectrum"
                );
                ctx.bay_mut(bay)?.spectrum = Some(summary);
            }
            Err(e) => warn!(bay, error = %e, "Spectrum analysis failed"),
        }
        Ok(())
    }

    async fn path_loss(&self, ctx: &mut RunContext, bay: u16) -> StationResult<()> {
        let crp = ctx.crp()?;
        let limits = ctx.limits.path_loss.clone();
        let readings = ctx.bay_mut(bay)?;
        let opm_raw = readings.opm_raw_dbm.ok_or_else(|| {
            StationError::Instrument(format!("Bay {}: no power meter reading", bay))
        })?;
        let wlm_raw = readings.wlm_raw_dbm.ok_or_else(|| {
            StationError::Instrument(format!("Bay {}: no wavelength meter reading", bay))
        })?;

        readings.tpl_db = (crp - opm_raw).abs();
        readings.opm_db = readings.tpl_db;
        readings.wlm_db = (crp - wlm_raw).abs();
        info!(bay, crp_dbm = crp, opm_db = readings.opm_db, tpl_db = readings.tpl_db, wlm_db = readings.wlm_db, "Path loss");

        verify_limit(readings.tpl_db, &limits)?;
        verify_limit(readings.opm_db, &limits)?;
        verify_limit(readings.wlm_db, &limits)
    }

    async fn verify_power_end(&self, ctx: &mut RunContext) -> StationResult<()> {
        let crp = ctx.crp()?;
        let session = self.station.session(ctx, None).await?;
        let reading = session.instruments().opm.read_power_dbm().await;
        session.close().await;
        let end = reading?;
        ctx.crp_end_dbm = Some(end);
        info!(crp_end_dbm = end, "CRP power end");
        let (low, high) = tolerance_window(crp, self.station.sequence.power_end_tolerance_pct);
        verify_window(POWER_END_LIMIT, end, low, high)
    }

    async fn append_ledger(&self, ctx: &mut RunContext) -> StationResult<()> {
        if ctx.fail() {
            error!("Skip Collect Data: Fail in sequence");
            return Ok(());
        }
        let written = self.station.ledger.append(ctx.to_record())?;
        info!(
            iteration = written.iteration,
            path = %self.station.ledger.path().display(),
            "Write file"
        );
        ctx.ledger_record = Some(written);
        Ok(())
    }

    async fn export_chart(&self, ctx: &mut RunContext) -> StationResult<()> {
        if ctx.fail() {
            error!("Skip Plot: Fail in sequence");
            return Ok(());
        }
        let records = self.station.ledger.read();
        match self
            .station
            .chart
            .export(&records, &ctx.available_bays(), &ctx.datetime)
        {
            Ok(path) => {
                ctx.chart_path = Some(path);
                Ok(())
            }
            Err(StationError::FeatureNotEnabled(feature)) => {
                warn!(feature = %feature, "Control chart export not built in");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StepAction<RunContext> for CalibrationStep {
    async fn run(&self, ctx: &mut RunContext) -> StationResult<()> {
        match &self.kind {
            StepKind::InitialStation => self.initial_station(ctx).await,
            StepKind::Prompt(message) => self.prompt(message).await,
            StepKind::WarmUp(duration) => self.warm_up(*duration).await,
            StepKind::SetupInstruments => self.setup_instruments(ctx).await,
            StepKind::ReadCrp => self.read_crp(ctx).await,
            StepKind::SelectBay(bay) => self.select_bay(ctx, *bay).await,
            StepKind::ReadWlm(bay) => self.read_wlm(ctx, *bay).await,
            StepKind::ReadOpm(bay) => self.read_opm(ctx, *bay).await,
            StepKind::AnalyzeSpectrum(bay) => self.analyze_spectrum(ctx, *bay).await,
            StepKind::PathLoss(bay) => self.path_loss(ctx, *bay).await,
            StepKind::VerifyPowerEnd => self.verify_power_end(ctx).await,
            StepKind::AppendLedger => self.append_ledger(ctx).await,
            StepKind::ExportChart => self.export_chart(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::prompt::AutoConfirm;
    use crate::config::LimitsConfig;
    use crate::instrument::{MockBench, MockFactory};
    use chrono::Local;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn station(dir: &TempDir, bench: MockBench) -> Arc<CalibrationStation> {
        let mut config = StationConfig::default();
        config.station.lock_dir = dir.path().join("lock");
        config.station.lock_log = dir.path().join("lock").join("lock_log.txt");
        config.station.ledger_path = dir.path().join("Optical_Calibration.txt");
        config.station.chart_dir = dir.path().join("charts");
        config.bays.ledger_bays = 4;
        config.sequence.read_settle_ms = 0;
        config.sequence.channel_poll_ms = 5;
        config.sequence.channel_confirm_timeout_ms = 200;
        config.sequence.channel_settle_ms = 0;
        config.sequence.opc_timeout_ms = 100;
        Arc::new(CalibrationStation::new(
            &config,
            Arc::new(MockFactory::new(bench)),
            Arc::new(AutoConfirm::new()),
        ))
    }

    fn context() -> RunContext {
        RunContext::new(
            "OP1",
            "CAL-01",
            Local::now(),
            LimitsConfig::default(),
            &[1, 2],
            &BTreeSet::new(),
        )
    }

    async fn run(kind: StepKind, station: &Arc<CalibrationStation>, ctx: &mut RunContext) -> StationResult<()> {
        CalibrationStep::new(kind, station.clone(), SequencerHandle::default())
            .run(ctx)
            .await
    }

    #[tokio::test]
    async fn test_bay_path_loss() {
        let dir = TempDir::new().unwrap();
        let bench = MockBench::new();
        bench.set_bay_loss(2, 3.5);
        let station = station(&dir, bench);
        let mut ctx = context();

        run(StepKind::ReadCrp, &station, &mut ctx).await.unwrap();
        assert_eq!(ctx.crp_dbm, Some(3.0));
        run(StepKind::SelectBay(2), &station, &mut ctx).await.unwrap();
        run(StepKind::ReadWlm(2), &station, &mut ctx).await.unwrap();
        run(StepKind::ReadOpm(2), &station, &mut ctx).await.unwrap();
        run(StepKind::PathLoss(2), &station, &mut ctx).await.unwrap();

        let bay = ctx.bay(2).unwrap();
        assert!((bay.tpl_db - 3.5).abs() < 1e-9);
        assert_eq!(bay.opm_db, bay.tpl_db);
        assert!((bay.wlm_db - 3.9).abs() < 1e-9);
        // WLM leg carries its own extra loss, so it never mirrors the power meter
        assert_ne!(bay.wlm_raw_dbm, bay.opm_raw_dbm);
        assert!((ctx.wlm_freq_thz - 193.4145).abs() < 1e-9);
        assert_eq!(ctx.wlm_smsr_db, 45.0);
        assert!(station.lease.state("OP1").is_none());
    }

    #[tokio::test]
    async fn test_path_loss_over_limit() {
        let dir = TempDir::new().unwrap();
        let bench = MockBench::new();
        bench.set_bay_loss(1, 7.0);
        let station = station(&dir, bench);
        let mut ctx = context();

        run(StepKind::ReadCrp, &station, &mut ctx).await.unwrap();
        run(StepKind::ReadWlm(1), &station, &mut ctx).await.unwrap();
        run(StepKind::ReadOpm(1), &station, &mut ctx).await.unwrap();
        let err = run(StepKind::PathLoss(1), &station, &mut ctx).await.unwrap_err();
        assert!(err.is_limit_violation());
    }

    #[tokio::test]
    async fn test_path_loss_needs_readings() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir, MockBench::new());
        let mut ctx = context();
        ctx.crp_dbm = Some(3.0);
        assert!(run(StepKind::PathLoss(1), &station, &mut ctx).await.is_err());
        assert!(run(StepKind::ReadOpm(9), &station, &mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_power_end_drift() {
        let dir = TempDir::new().unwrap();
        let bench = MockBench::new();
        let station = station(&dir, bench.clone());
        let mut ctx = context();

        run(StepKind::ReadCrp, &station, &mut ctx).await.unwrap();
        bench.set_reference_power(3.02);
        run(StepKind::VerifyPowerEnd, &station, &mut ctx).await.unwrap();

        bench.set_reference_power(3.2);
        let err = run(StepKind::VerifyPowerEnd, &station, &mut ctx).await.unwrap_err();
        assert!(err.to_string().contains(POWER_END_LIMIT));
    }

    #[tokio::test]
    async fn test_ledger_and_chart_skip_on_fail() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir, MockBench::new());
        let mut ctx = context();
        ctx.crp_dbm = Some(3.0);
        ctx.set_fail();

        run(StepKind::AppendLedger, &station, &mut ctx).await.unwrap();
        run(StepKind::ExportChart, &station, &mut ctx).await.unwrap();
        assert!(ctx.ledger_record.is_none());
        assert!(ctx.chart_path.is_none());
        assert!(!station.ledger.path().exists());
    }

    #[tokio::test]
    async fn test_spectrum_without_analyzer_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = StationConfig::default();
        config.station.lock_dir = dir.path().join("lock");
        config.station.lock_log = dir.path().join("lock").join("lock_log.txt");
        config.sequence.channel_settle_ms = 0;
        config.sequence.channel_poll_ms = 5;
        let station = Arc::new(CalibrationStation::new(
            &config,
            Arc::new(MockFactory::new(MockBench::new()).without_osa()),
            Arc::new(AutoConfirm::new()),
        ));
        let mut ctx = context();
        run(StepKind::AnalyzeSpectrum(1), &station, &mut ctx).await.unwrap();
        assert!(ctx.bay(1).unwrap().spectrum.is_none());
    }

    #[tokio::test]
    async fn test_warm_up_interrupted_by_abort() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir, MockBench::new());
        let handle = SequencerHandle::default();
        handle.abort();
        let step = CalibrationStep::new(StepKind::WarmUp(Duration::from_secs(60)), station, handle);
        let mut ctx = context();
        let err = step.run(&mut ctx).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.to_string(), "Aborted: laser warm-up");
    }
}
