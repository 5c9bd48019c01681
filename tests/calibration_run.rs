//! End-to-end calibration runs against the simulated bench.

use chrono::Local;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use pathloss_station::calibration::{build_procedure, AutoConfirm, CalibrationStation, RunContext};
use pathloss_station::config::StationConfig;
use pathloss_station::data::ledger::CalibrationLedger;
use pathloss_station::hardware::{InstrumentLease, LeaseSettings};
use pathloss_station::instrument::{MockBench, MockFactory, MockFault};
use pathloss_station::sequencer::{
    FailFlag, Indicator, SequencerState, StatusBoard, StepEvent, StepOutcome,
};

const BAYS: [u16; 3] = [1, 4, 7];

fn test_config(dir: &TempDir) -> StationConfig {
    let mut config = StationConfig::default();
    config.station.station_id = "CAL-TEST".to_string();
    config.station.lock_dir = dir.path().join("lock");
    config.station.lock_log = dir.path().join("lock").join("lock_log.txt");
    config.station.ledger_path = dir.path().join("data").join("Optical_Calibration.txt");
    config.station.chart_dir = dir.path().join("data").join("control_charts");
    config.bays.available = BAYS.to_vec();
    config.bays.ledger_bays = 8;
    config.lease.timeout_ms = 300;
    config.lease.poll_interval_ms = 20;
    config.sequence.warmup_secs = 0;
    config.sequence.read_settle_ms = 0;
    config.sequence.opc_timeout_ms = 100;
    config.sequence.channel_confirm_timeout_ms = 200;
    config.sequence.channel_poll_ms = 5;
    config.sequence.channel_settle_ms = 0;
    config
}

fn context(config: &StationConfig, operator: &str, cord_changes: &[u16]) -> RunContext {
    RunContext::new(
        operator,
        config.station.station_id.clone(),
        Local::now(),
        config.limits.clone(),
        &config.bays.available,
        &cord_changes.iter().copied().collect::<BTreeSet<u16>>(),
    )
}

struct Run {
    state: SequencerState,
    outcomes: Vec<(String, StepOutcome)>,
    context: RunContext,
    board: StatusBoard,
}

async fn run_station(config: &StationConfig, bench: MockBench, ctx: RunContext) -> Run {
    let prompt = Arc::new(AutoConfirm::new());
    let station = Arc::new(CalibrationStation::new(
        config,
        Arc::new(MockFactory::new(bench)),
        prompt,
    ));
    let mut sequencer = build_procedure(station, &config.bays.available).unwrap();
    let mut board = StatusBoard::for_steps(sequencer.steps());
    let mut events = sequencer.subscribe();

    let completed = sequencer.spawn(ctx).await.unwrap().unwrap();
    while let Some(event) = events.progress.recv().await {
        board.apply(&event);
    }
    let report = events.result.await.unwrap();
    board.finish(&report);

    Run {
        state: report.state,
        outcomes: report
            .steps
            .iter()
            .map(|r| (r.name.clone(), r.outcome.clone()))
            .collect(),
        context: completed.context,
        board,
    }
}

#[tokio::test]
async fn test_full_run_writes_ledger() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let bench = MockBench::new();
    bench.set_bay_loss(4, 3.25);

    let run = run_station(&config, bench, context(&config, "OP1", &[4])).await;

    let failures: Vec<_> = run.outcomes.iter().filter(|(_, o)| !o.is_passed()).collect();
    assert!(failures.is_empty(), "unexpected failures: {:?}", failures);
    assert_eq!(run.state, SequencerState::Completed);
    assert!(!run.context.fail());
    assert_eq!(run.context.crp_dbm, Some(3.0));
    assert!((run.context.bay(4).unwrap().tpl_db - 3.25).abs() < 1e-9);
    assert!((run.context.bay(1).unwrap().tpl_db - 2.5).abs() < 1e-9);

    let ledger = CalibrationLedger::new(&config.station.ledger_path, config.bays.ledger_bays);
    let records = ledger.read();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].iteration, 1);
    assert_eq!(records[0].operator_id, "OP1");
    assert_eq!(records[0].station_id, "CAL-TEST");
    assert!(records[0].bay(4).path_cord_change);
    assert!(!records[0].bay(1).path_cord_change);
    assert_eq!(records[0].bay(2).tpl_db, 0.0);
    assert_eq!(run.context.ledger_record.as_ref().map(|r| r.iteration), Some(1));

    for bay in BAYS {
        assert_eq!(run.board.bay(bay), Some(Indicator::Passed));
    }
    assert!(run
        .board
        .steps()
        .iter()
        .all(|s| s.indicator == Indicator::Passed));

    #[cfg(feature = "storage_csv")]
    {
        let chart = run.context.chart_path.clone().unwrap();
        assert!(chart.starts_with(&config.station.chart_dir));
        assert!(chart.exists());
    }

    // lease was released after every step
    let audit = std::fs::read_to_string(&config.station.lock_log).unwrap();
    let asked = audit.matches("Permission asked by OP1").count();
    let exited = audit.matches("Exited by OP1").count();
    assert!(asked > 0);
    assert_eq!(asked, exited);
}

#[tokio::test]
async fn test_second_run_increments_iteration() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    run_station(&config, MockBench::new(), context(&config, "OP1", &[])).await;
    let second = run_station(&config, MockBench::new(), context(&config, "OP2", &[])).await;

    assert_eq!(second.context.ledger_record.map(|r| r.iteration), Some(2));
    let ledger = CalibrationLedger::new(&config.station.ledger_path, config.bays.ledger_bays);
    assert_eq!(ledger.next_iteration(), 3);
}

#[tokio::test]
async fn test_limit_failure_skips_ledger() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let bench = MockBench::new();
    bench.set_bay_loss(7, 8.0);

    let run = run_station(&config, bench, context(&config, "OP1", &[])).await;

    assert_eq!(run.state, SequencerState::Completed);
    assert!(run.context.fail());
    let (_, outcome) = run
        .outcomes
        .iter()
        .find(|(name, _)| name == "Bay 7: Collect Data From Port")
        .unwrap();
    assert!(matches!(outcome, StepOutcome::Failed(reason) if reason.contains("Path_Loss")));
    // later steps still ran
    let (_, verify) = run
        .outcomes
        .iter()
        .find(|(name, _)| name == "Verify Power End")
        .unwrap();
    assert!(verify.is_passed());

    assert!(run.context.ledger_record.is_none());
    assert!(run.context.chart_path.is_none());
    assert!(!config.station.ledger_path.exists());
    assert_eq!(run.board.bay(7), Some(Indicator::Failed));
    assert_eq!(run.board.bay(1), Some(Indicator::Passed));
}

#[tokio::test]
async fn test_transport_failure_is_a_step_failure() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let bench = MockBench::new();
    bench.inject_failure(MockFault::OpmRead);

    let run = run_station(&config, bench, context(&config, "OP1", &[])).await;

    let (_, crp) = run
        .outcomes
        .iter()
        .find(|(name, _)| name == "Read CRP (Calibration reference power)")
        .unwrap();
    assert!(matches!(crp, StepOutcome::Failed(_)));
    assert_eq!(run.state, SequencerState::Completed);
    assert!(run.context.fail());
    assert!(run.context.crp_dbm.is_none());
    assert!(!config.station.ledger_path.exists());
}

#[tokio::test]
async fn test_busy_lease_fails_hardware_steps() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let other_station = InstrumentLease::new(LeaseSettings::from_config(&config));
    let held = other_station.acquire("OTHER", Some(2)).await.unwrap();

    let run = run_station(&config, MockBench::new(), context(&config, "OP1", &[])).await;
    held.release();

    let (_, setup) = run
        .outcomes
        .iter()
        .find(|(name, _)| name == "Setup Instrument")
        .unwrap();
    assert!(matches!(setup, StepOutcome::Failed(reason) if reason.contains("timeout")));
    let (_, prompt) = &run.outcomes[1];
    assert!(prompt.is_passed());
    assert!(run.context.fail());
    assert!(!config.station.ledger_path.exists());
}

#[tokio::test]
async fn test_abort_marks_remaining_not_run() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.sequence.warmup_secs = 30;

    let station = Arc::new(CalibrationStation::new(
        &config,
        Arc::new(MockFactory::new(MockBench::new())),
        Arc::new(AutoConfirm::new()),
    ));
    let mut sequencer = build_procedure(station, &config.bays.available).unwrap();
    let mut events = sequencer.subscribe();
    let handle = sequencer.handle();
    let worker = sequencer.spawn(context(&config, "OP1", &[]));

    // abort while the warm-up wait is in progress
    while let Some(event) = events.progress.recv().await {
        if let StepEvent::Started { name, .. } = &event {
            if name.starts_with("Wait for Laser Source Stable") {
                tokio::time::sleep(Duration::from_millis(50)).await;
                handle.abort();
            }
        }
    }

    let completed = worker.await.unwrap().unwrap();
    let report = completed.report;
    assert_eq!(report.state, SequencerState::Aborted);
    assert!(report.outcome(0).unwrap().is_passed());
    assert!(matches!(report.outcome(3), Some(StepOutcome::Failed(_))));
    assert!(report.steps[4..]
        .iter()
        .all(|r| r.outcome == StepOutcome::NotRun));
    assert!(completed.context.fail());
    assert!(!config.station.ledger_path.exists());
}
