//! Calibration procedure
//!
//! Builds the full step list for one run: reference power on the LC patch, then each
//! available bay through the optical switch, then the closing power check and the
//! data files.

use std::sync::Arc;
use std::time::Duration;

use crate::calibration::context::RunContext;
use crate::calibration::steps::{CalibrationStation, CalibrationStep, StepKind};
use crate::sequencer::{Sequencer, SequencerError, Step};

struct Builder {
    sequencer: Sequencer<RunContext>,
    station: Arc<CalibrationStation>,
}

impl Builder {
    fn step(&self, kind: StepKind) -> CalibrationStep {
        CalibrationStep::new(kind, self.station.clone(), self.sequencer.handle())
    }

    fn add(&mut self, name: impl Into<String>, kind: StepKind) -> Result<(), SequencerError> {
        let step = Step::new(name, self.step(kind));
        self.sequencer.add_step(step)
    }

    fn add_prompt(&mut self, name: &str, question: &str) -> Result<(), SequencerError> {
        self.add(name, StepKind::Prompt(question.to_string()))
    }

    fn add_bay(&mut self, bay: u16, name: &str, kind: StepKind) -> Result<(), SequencerError> {
        let step = Step::new(format!("Bay {}: {}", bay, name), self.step(kind))
            .for_bay(bay)
            .silent();
        self.sequencer.add_step(step)
    }
}

/// Step list for a run over `bays`, in order.
pub fn build_procedure(
    station: Arc<CalibrationStation>,
    bays: &[u16],
) -> Result<Sequencer<RunContext>, SequencerError> {
    let warmup = Duration::from_secs(station.sequence.warmup_secs);
    let analyze_spectrum = station.sequence.analyze_spectrum;
    let mut b = Builder {
        sequencer: Sequencer::new(),
        station,
    };

    // reference power
    b.add("Initial Station", StepKind::InitialStation)?;
    b.add_prompt("Turn On Laser Source Module", "Turn On Laser Source Module")?;
    b.add_prompt(
        "Turn On Laser Source Application",
        "Turn On Laser Source Application",
    )?;
    b.add(
        format!("Wait for Laser Source Stable {} minutes", warmup.as_secs() / 60),
        StepKind::WarmUp(warmup),
    )?;
    b.add_prompt(
        "Connect Power Meter With LC line to Calibration",
        "Connect Power Meter With LC line to Calibration",
    )?;
    b.add("Setup Instrument", StepKind::SetupInstruments)?;
    b.add("Read CRP (Calibration reference power)", StepKind::ReadCrp)?;
    b.add_prompt(
        "Disconnect LC Cable and use for calibration",
        "Disconnect LC Cable and use for calibration",
    )?;
    b.add_prompt(
        "Connect Power Meter FC line back to OPM",
        "Connect Power Meter FC line back to OPM",
    )?;

    // path loss per bay
    for &bay in bays {
        b.add_bay(
            bay,
            "Clean and Inspect Source",
            StepKind::Prompt(format!("Clean and Inspect Optic Cable {}", bay)),
        )?;
        b.add_bay(
            bay,
            "Use LC Calibration fiber connect",
            StepKind::Prompt(format!("Use LC Calibration fiber connect {}", bay)),
        )?;
        b.add_bay(bay, "Set OSW to TOSA Bay number", StepKind::SelectBay(bay))?;
        b.add_bay(bay, "Set WLM measure on Port", StepKind::ReadWlm(bay))?;
        b.add_bay(bay, "Set OPM measure on Port", StepKind::ReadOpm(bay))?;
        if analyze_spectrum {
            b.add_bay(bay, "Analyze Spectrum on Port", StepKind::AnalyzeSpectrum(bay))?;
        }
        b.add_bay(bay, "Collect Data From Port", StepKind::PathLoss(bay))?;
    }

    b.add_prompt(
        "Confirm power End",
        "Connect Power Meter With LC Confirm power End",
    )?;
    b.add("Verify Power End", StepKind::VerifyPowerEnd)?;
    b.add("Collect Data File Patch Loss", StepKind::AppendLedger)?;
    b.add("Plot Control Chart Patch Loss", StepKind::ExportChart)?;

    Ok(b.sequencer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::prompt::AutoConfirm;
    use crate::config::StationConfig;
    use crate::instrument::{MockBench, MockFactory};

    fn station(analyze_spectrum: bool) -> Arc<CalibrationStation> {
        let mut config = StationConfig::default();
        config.sequence.analyze_spectrum = analyze_spectrum;
        Arc::new(CalibrationStation::new(
            &config,
            Arc::new(MockFactory::new(MockBench::new())),
            Arc::new(AutoConfirm::new()),
        ))
    }

    #[test]
    fn test_step_names_in_order() {
        let sequencer = build_procedure(station(false), &[3, 5]).unwrap();
        let names: Vec<&str> = sequencer.steps().iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 9 + 2 * 6 + 4);
        assert_eq!(names[0], "Initial Station");
        assert_eq!(names[3], "Wait for Laser Source Stable 15 minutes");
        assert_eq!(names[6], "Read CRP (Calibration reference power)");
        assert_eq!(names[9], "Bay 3: Clean and Inspect Source");
        assert_eq!(names[11], "Bay 3: Set OSW to TOSA Bay number");
        assert_eq!(names[14], "Bay 3: Collect Data From Port");
        assert_eq!(names[15], "Bay 5: Clean and Inspect Source");
        assert_eq!(names[names.len() - 3], "Verify Power End");
        assert_eq!(names[names.len() - 2], "Collect Data File Patch Loss");
    }

    #[test]
    fn test_bay_steps_drive_bay_indicators() {
        let sequencer = build_procedure(station(false), &[2]).unwrap();
        let bay_steps: Vec<_> = sequencer
            .steps()
            .iter()
            .filter(|s| s.bay() == Some(2))
            .collect();
        assert_eq!(bay_steps.len(), 6);
        assert!(bay_steps.iter().all(|s| !s.trigger()));
        assert!(sequencer.steps()[0].trigger());
    }

    #[test]
    fn test_spectrum_step_optional() {
        let sequencer = build_procedure(station(true), &[2]).unwrap();
        assert!(sequencer
            .steps()
            .iter()
            .any(|s| s.name() == "Bay 2: Analyze Spectrum on Port"));
    }
}
