use crate::conditioner::SignalConditioner;
use crate::config::MeasurementConfig;
use crate::detectors::peak::PeakDetector;
use crate::error::PulseError;
use crate::metrics::confidence::ConfidenceEstimator;
use crate::metrics::quality::{classify, QualityHistory, SignalQuality};
use crate::result::{MeasurementResult, ResultAggregator};
use crate::sampler::FrameSampler;
use crate::signal::RawFrame;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

const TIME_EPS: f64 = 1e-6;

/// Phase timing of a measurement session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Camera/exposure settling before anything is trusted (seconds).
    pub preparing_s: f64,
    /// Detection is live but readings are not recorded yet (seconds).
    pub calibrating_s: f64,
    /// Measured (non-paused) time needed to complete (seconds).
    pub target_s: f64,
    /// Length of the final part of measuring reported as `Completing` (seconds).
    pub completing_s: f64,
    /// One BPM reading is recorded per this much measured time (seconds).
    pub reading_interval_s: f64,
    /// Paused time after which the session completes anyway (seconds).
    pub max_paused_s: f64,
    /// Upper bound on the time credited for a single frame (seconds).
    pub max_frame_gap_s: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preparing_s: 2.0,
            calibrating_s: 3.0,
            target_s: 25.0,
            completing_s: 3.0,
            reading_interval_s: 1.0,
            max_paused_s: 25.0,
            max_frame_gap_s: 0.5,
        }
    }
}

impl SessionConfig {
    pub fn expected_readings(&self) -> usize {
        (self.target_s / self.reading_interval_s + TIME_EPS).floor() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Preparing,
    Calibrating,
    Measuring,
    Completing,
    Completed,
}

impl Phase {
    /// True while frames are being consumed.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Preparing | Phase::Calibrating | Phase::Measuring | Phase::Completing
        )
    }

    fn accumulates(&self) -> bool {
        matches!(self, Phase::Measuring | Phase::Completing)
    }
}

/// Events that move a session between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    WarmupElapsed,
    CalibrationElapsed,
    EnteringFinalWindow,
    TargetReached,
    Stop,
    CaptureFailed,
    ResultConsumed,
}

/// The phase transition table. `None` means the trigger is ignored in `phase`.
pub fn transition(phase: Phase, trigger: Trigger) -> Option<Phase> {
    use Phase::*;
    use Trigger::*;
    match (phase, trigger) {
        (Idle, Start) => Some(Preparing),
        (Preparing, WarmupElapsed) => Some(Calibrating),
        (Calibrating, CalibrationElapsed) => Some(Measuring),
        (Measuring, EnteringFinalWindow) => Some(Completing),
        (Measuring | Completing, TargetReached) => Some(Completed),
        (Completed, ResultConsumed) => Some(Idle),
        (Preparing | Calibrating | Measuring | Completing | Completed, Stop) => Some(Idle),
        (Preparing | Calibrating | Measuring | Completing, CaptureFailed) => Some(Idle),
        _ => None,
    }
}

/// Immutable view of a session handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    /// Measuring with poor signal: time and readings are frozen.
    pub paused: bool,
    /// Measured time over target, in [0, 1].
    pub progress: f64,
    pub elapsed_s: f64,
    pub target_s: f64,
    /// Smoothed BPM; hidden while preparing.
    pub current_bpm: Option<u32>,
    pub quality: Option<SignalQuality>,
    pub readings: usize,
    /// Confidence the session would report if it completed now.
    pub confidence: Option<f64>,
    pub overload: Option<PulseError>,
    /// Why the last session ended without a result.
    pub error: Option<PulseError>,
}

/// One measurement session: owns the pipeline and drives it from frame timestamps.
#[derive(Debug, Clone)]
pub struct MeasurementSession {
    cfg: MeasurementConfig,
    phase: Phase,
    sampler: FrameSampler,
    conditioner: SignalConditioner,
    detector: PeakDetector,
    estimator: ConfidenceEstimator,
    aggregator: ResultAggregator,
    phase_started: Option<f64>,
    last_timestamp: Option<f64>,
    elapsed_s: f64,
    paused_s: f64,
    quality: Option<SignalQuality>,
    history: QualityHistory,
    readings: Vec<u32>,
    result: Option<MeasurementResult>,
    error: Option<PulseError>,
}

impl MeasurementSession {
    pub fn new(cfg: MeasurementConfig) -> Self {
        Self {
            phase: Phase::Idle,
            sampler: FrameSampler::new(cfg.sampler),
            conditioner: SignalConditioner::new(cfg.conditioner, cfg.sampler.nominal_fps),
            detector: PeakDetector::new(cfg.detector),
            estimator: ConfidenceEstimator::new(cfg.confidence),
            aggregator: ResultAggregator::default(),
            phase_started: None,
            last_timestamp: None,
            elapsed_s: 0.0,
            paused_s: 0.0,
            quality: None,
            history: QualityHistory::default(),
            readings: Vec::with_capacity(cfg.session.expected_readings()),
            result: None,
            error: None,
            cfg,
        }
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.cfg
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn readings(&self) -> &[u32] {
        &self.readings
    }

    pub fn elapsed_s(&self) -> f64 {
        self.elapsed_s
    }

    pub fn quality_history(&self) -> &QualityHistory {
        &self.history
    }

    pub fn result(&self) -> Option<&MeasurementResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&PulseError> {
        self.error.as_ref()
    }

    /// Begin a new session. An active or completed session is cancelled first.
    pub fn start(&mut self) {
        if self.phase != Phase::Idle {
            warn!("start requested while {:?}; cancelling current session", self.phase);
            self.fire(Trigger::Stop);
        }
        self.clear();
        self.fire(Trigger::Start);
    }

    /// Cancel without producing a result. Idempotent.
    pub fn stop(&mut self) {
        if self.fire(Trigger::Stop) {
            self.clear();
        }
    }

    /// The capture source failed; the session aborts to idle with `error` set.
    pub fn fail_capture(&mut self, reason: impl Into<String>) {
        let err = PulseError::CameraUnavailable(reason.into());
        if !self.phase.is_active() {
            warn!("{err} while {:?}", self.phase);
            if self.phase == Phase::Idle {
                self.error = Some(err);
            }
            return;
        }
        warn!("aborting session: {err}");
        self.fire(Trigger::CaptureFailed);
        self.clear();
        self.error = Some(err);
    }

    /// Hand the finalized result to the caller and return to idle.
    pub fn take_result(&mut self) -> Result<MeasurementResult, PulseError> {
        let result = self.result.take().ok_or(PulseError::NoResult)?;
        self.fire(Trigger::ResultConsumed);
        self.clear();
        Ok(result)
    }

    /// Fold one frame into the session. Returns false when the frame was ignored.
    pub fn push_frame(&mut self, frame: &RawFrame) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        let sample = match self.sampler.sample(frame) {
            Some(s) => s,
            None => return false,
        };
        let t = sample.timestamp;
        let phase_started = *self.phase_started.get_or_insert(t);
        let dt = self
            .last_timestamp
            .map(|prev| (t - prev).clamp(0.0, self.cfg.session.max_frame_gap_s))
            .unwrap_or(0.0);
        self.last_timestamp = Some(t);

        let conditioned = self.conditioner.push(sample);
        if self.phase >= Phase::Calibrating && conditioned.trusted {
            self.detector.push(&conditioned);
            self.quality = Some(classify(
                conditioned.amplitude_ratio,
                self.detector.interval_cv(),
                &self.cfg.quality,
            ));
        }

        let in_phase = t - phase_started;
        match self.phase {
            Phase::Preparing if in_phase >= self.cfg.session.preparing_s - TIME_EPS => {
                self.enter(Trigger::WarmupElapsed, t);
            }
            Phase::Calibrating if in_phase >= self.cfg.session.calibrating_s - TIME_EPS => {
                self.enter(Trigger::CalibrationElapsed, t);
            }
            phase if phase.accumulates() => self.accumulate(dt),
            _ => {}
        }
        true
    }

    fn accumulate(&mut self, dt: f64) {
        let session = self.cfg.session;
        match self.quality {
            Some(q) if q != SignalQuality::Poor => {
                let before = self.elapsed_s;
                self.elapsed_s = (self.elapsed_s + dt).min(session.target_s);
                if self.elapsed_s >= session.target_s - TIME_EPS {
                    self.elapsed_s = session.target_s;
                }
                self.history.record(q, self.elapsed_s - before);
                let interval = session.reading_interval_s;
                let crossed = ((self.elapsed_s + TIME_EPS) / interval).floor()
                    - ((before + TIME_EPS) / interval).floor();
                for _ in 0..crossed.max(0.0) as usize {
                    self.record_reading();
                }
            }
            _ => {
                if dt > 0.0 {
                    debug!("signal poor, pausing for {:.3}s", dt);
                }
                self.paused_s += dt;
                self.history.record(SignalQuality::Poor, dt);
            }
        }

        if self.elapsed_s >= session.target_s || self.paused_s >= session.max_paused_s - TIME_EPS {
            self.finalize();
        } else if self.phase == Phase::Measuring
            && self.elapsed_s >= session.target_s - session.completing_s
        {
            self.fire(Trigger::EnteringFinalWindow);
        }
    }

    fn record_reading(&mut self) {
        match self.detector.smoothed_bpm() {
            Some(bpm) => self.readings.push(bpm.round() as u32),
            None => debug!("no BPM yet at {:.1}s measured", self.elapsed_s),
        }
    }

    fn finalize(&mut self) {
        let estimate = self.estimator.estimate(
            &self.readings,
            &self.history,
            self.cfg.session.expected_readings(),
        );
        let result =
            self.aggregator
                .finalize(&self.readings, estimate, &self.cfg.user, Utc::now());
        info!(
            "session complete: {:?} BPM, confidence {:.2} ({:?}), {} readings, {:.1}s paused",
            result.final_bpm,
            result.confidence,
            result.confidence_level,
            self.readings.len(),
            self.paused_s
        );
        self.result = Some(result);
        self.fire(Trigger::TargetReached);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let target = self.cfg.session.target_s;
        let show_bpm = self.phase >= Phase::Calibrating;
        let current_bpm = match (&self.result, show_bpm) {
            (Some(result), _) => result.final_bpm,
            (None, true) => self.detector.smoothed_bpm().map(|b| b.round() as u32),
            (None, false) => None,
        };
        let confidence = match &self.result {
            Some(result) => Some(result.confidence),
            None if !self.readings.is_empty() => Some(
                self.estimator
                    .estimate(&self.readings, &self.history, self.readings.len())
                    .confidence,
            ),
            None => None,
        };
        SessionSnapshot {
            phase: self.phase,
            paused: self.phase.accumulates() && self.quality.map_or(true, |q| q == SignalQuality::Poor),
            progress: if target > 0.0 {
                (self.elapsed_s / target).clamp(0.0, 1.0)
            } else {
                0.0
            },
            elapsed_s: self.elapsed_s,
            target_s: target,
            current_bpm,
            quality: if show_bpm { self.quality } else { None },
            readings: self.readings.len(),
            confidence,
            overload: self.sampler.overload(),
            error: self.error.clone(),
        }
    }

    /// Apply `trigger`; returns whether the phase changed.
    fn fire(&mut self, trigger: Trigger) -> bool {
        match transition(self.phase, trigger) {
            Some(next) => {
                info!("{:?} -> {:?} ({:?})", self.phase, next, trigger);
                self.phase = next;
                true
            }
            None => {
                debug!("{:?} ignored in {:?}", trigger, self.phase);
                false
            }
        }
    }

    fn enter(&mut self, trigger: Trigger, t: f64) {
        if self.fire(trigger) {
            self.phase_started = Some(t);
        }
    }

    fn clear(&mut self) {
        self.sampler.reset();
        self.conditioner.reset();
        self.detector.reset();
        self.phase_started = None;
        self.last_timestamp = None;
        self.elapsed_s = 0.0;
        self.paused_s = 0.0;
        self.quality = None;
        self.history = QualityHistory::default();
        self.readings.clear();
        self.result = None;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::confidence::ConfidenceLevel;
    use crate::result::BpmCategory;
    use crate::synth::{SyntheticPpg, SynthMode};

    fn frames(synth: &SyntheticPpg, seconds: f64) -> Vec<RawFrame> {
        synth.frames(seconds).into_iter().map(RawFrame::from).collect()
    }

    fn run(session: &mut MeasurementSession, frames: &[RawFrame]) -> Vec<SessionSnapshot> {
        frames
            .iter()
            .map(|f| {
                session.push_frame(f);
                session.snapshot()
            })
            .collect()
    }

    #[test]
    fn transition_table_rejects_out_of_order_triggers() {
        assert_eq!(transition(Phase::Idle, Trigger::Start), Some(Phase::Preparing));
        assert_eq!(transition(Phase::Idle, Trigger::Stop), None);
        assert_eq!(transition(Phase::Idle, Trigger::TargetReached), None);
        assert_eq!(transition(Phase::Preparing, Trigger::CalibrationElapsed), None);
        assert_eq!(transition(Phase::Completing, Trigger::Stop), Some(Phase::Idle));
        assert_eq!(transition(Phase::Completed, Trigger::ResultConsumed), Some(Phase::Idle));
        assert_eq!(transition(Phase::Completed, Trigger::CaptureFailed), None);
    }

    #[test]
    fn clean_pulse_completes_with_high_confidence() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        let synth = SyntheticPpg::new(75.0, 30.0, 7);
        let snaps = run(&mut session, &frames(&synth, 30.0));

        let phases: Vec<Phase> = snaps.iter().map(|s| s.phase).collect();
        for phase in [Phase::Preparing, Phase::Calibrating, Phase::Measuring, Phase::Completing] {
            assert!(phases.contains(&phase), "never entered {:?}", phase);
        }
        assert_eq!(session.phase(), Phase::Completed);
        assert!(snaps.windows(2).all(|w| w[1].phase >= w[0].phase));

        let result = session.result().expect("result");
        let bpm = result.final_bpm.expect("bpm");
        assert!((74..=76).contains(&bpm), "final bpm {}", bpm);
        assert!(result.confidence_level >= ConfidenceLevel::High);
        assert_eq!(result.category, Some(BpmCategory::Normal));
        assert!(result.error_bound_bpm <= 2);
        assert_eq!(result.bpm_readings.len(), 25);
    }

    #[test]
    fn fast_clean_pulses_rate_well() {
        for bpm in [150.0, 180.0] {
            let mut session = MeasurementSession::new(MeasurementConfig::default());
            session.start();
            let synth = SyntheticPpg::new(bpm, 30.0, 12);
            let snaps = run(&mut session, &frames(&synth, 30.0));

            let measuring: Vec<&SessionSnapshot> =
                snaps.iter().filter(|s| s.phase == Phase::Measuring).collect();
            assert!(!measuring.is_empty());
            assert!(
                measuring.iter().all(|s| s.quality >= Some(SignalQuality::Good)),
                "{} BPM rated below good",
                bpm
            );
            let result = session.result().expect("result");
            let final_bpm = result.final_bpm.expect("bpm") as f64;
            assert!((final_bpm - bpm).abs() <= 3.0, "expected {} got {}", bpm, final_bpm);
            assert!(result.confidence_level >= ConfidenceLevel::High);
        }
    }

    #[test]
    fn noisy_regular_pulse_is_measured_with_less_confidence() {
        let mut clean = MeasurementSession::new(MeasurementConfig::default());
        clean.start();
        run(&mut clean, &frames(&SyntheticPpg::new(75.0, 30.0, 13), 35.0));
        let clean = clean.result().expect("clean result").clone();

        let mut noisy = MeasurementSession::new(MeasurementConfig::default());
        noisy.start();
        let synth = SyntheticPpg::new(75.0, 30.0, 13).with_noise(0.6);
        let snaps = run(&mut noisy, &frames(&synth, 35.0));
        assert!(snaps
            .iter()
            .filter(|s| s.phase == Phase::Measuring)
            .all(|s| s.quality != Some(SignalQuality::Excellent)));
        assert_eq!(noisy.phase(), Phase::Completed);

        let result = noisy.result().expect("noisy result");
        let bpm = result.final_bpm.expect("bpm");
        assert!((73..=77).contains(&bpm), "final bpm {}", bpm);
        assert!(result.confidence < clean.confidence);
    }

    #[test]
    fn flat_signal_completes_without_progress() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        let synth = SyntheticPpg::new(75.0, 30.0, 7).with_mode(SynthMode::Flat);
        let snaps = run(&mut session, &frames(&synth, 30.0));

        assert!(snaps.iter().all(|s| s.progress == 0.0));
        assert!(snaps
            .iter()
            .filter(|s| s.phase.accumulates())
            .all(|s| s.paused && s.quality == Some(SignalQuality::Poor)));
        assert_eq!(session.phase(), Phase::Completed);
        let result = session.result().expect("result");
        assert!(result.confidence_level <= ConfidenceLevel::Low);
        assert!(result.bpm_readings.is_empty());
    }

    #[test]
    fn poor_signal_freezes_elapsed_time() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        let clean = frames(&SyntheticPpg::new(72.0, 30.0, 1), 10.0);
        run(&mut session, &clean);
        let elapsed = session.elapsed_s();
        assert!(elapsed > 4.0);

        // finger lifted: intensity settles at the resting baseline
        let last_t = clean.last().map(|f| f.timestamp).unwrap_or(0.0);
        let flat: Vec<RawFrame> = (1..=300)
            .map(|i| RawFrame::intensity(last_t + i as f64 / 30.0, SyntheticPpg::DEFAULT_BASELINE))
            .collect();
        let snaps = run(&mut session, &flat);
        let settled = &snaps[150..];
        assert!(settled.iter().all(|s| s.paused && s.phase == Phase::Measuring));
        let frozen = settled[0].elapsed_s;
        assert!(settled.iter().all(|s| s.elapsed_s == frozen));
        assert!(settled.iter().all(|s| s.readings == settled[0].readings));
        assert!(frozen < elapsed + 4.0);

        let resumed: Vec<RawFrame> = SyntheticPpg::new(72.0, 30.0, 2)
            .frames(10.0)
            .into_iter()
            .map(|s| RawFrame::intensity(last_t + 10.0 + s.timestamp + 1.0 / 30.0, s.intensity))
            .collect();
        let snaps = run(&mut session, &resumed);
        assert!(snaps.last().unwrap().elapsed_s > frozen);
        assert!(snaps.iter().all(|s| s.elapsed_s <= s.target_s));
    }

    #[test]
    fn elapsed_never_exceeds_target() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        let snaps = run(&mut session, &frames(&SyntheticPpg::new(90.0, 30.0, 3), 40.0));
        assert!(snaps.iter().all(|s| s.elapsed_s <= s.target_s && s.progress <= 1.0));
        assert_eq!(session.phase(), Phase::Completed);
        assert!(!session.push_frame(&RawFrame::intensity(41.0, 1.0)));
    }

    #[test]
    fn stop_is_idempotent_and_discards_result() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.stop();
        session.stop();
        assert_eq!(session.snapshot().phase, Phase::Idle);

        session.start();
        run(&mut session, &frames(&SyntheticPpg::new(75.0, 30.0, 4), 8.0));
        assert_eq!(session.phase(), Phase::Measuring);
        session.stop();
        let first = session.snapshot();
        session.stop();
        assert_eq!(session.snapshot(), first);
        assert_eq!(first.phase, Phase::Idle);
        assert_eq!(first.readings, 0);
        assert!(session.result().is_none());
        assert!(!session.push_frame(&RawFrame::intensity(9.0, 1.0)));
    }

    #[test]
    fn start_while_active_restarts() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        run(&mut session, &frames(&SyntheticPpg::new(75.0, 30.0, 5), 8.0));
        assert!(session.elapsed_s() > 0.0);
        session.start();
        let snap = session.snapshot();
        assert_eq!(snap.phase, Phase::Preparing);
        assert_eq!(snap.elapsed_s, 0.0);
        assert_eq!(snap.readings, 0);
    }

    #[test]
    fn capture_failure_aborts_to_idle() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        run(&mut session, &frames(&SyntheticPpg::new(75.0, 30.0, 6), 3.0));
        session.fail_capture("camera busy");
        let snap = session.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(matches!(snap.error, Some(PulseError::CameraUnavailable(_))));
        assert!(session.result().is_none());
    }

    #[test]
    fn taking_the_result_resets_to_idle() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        assert_eq!(session.take_result().unwrap_err(), PulseError::NoResult);
        session.start();
        run(&mut session, &frames(&SyntheticPpg::new(75.0, 30.0, 8), 30.0));
        let result = session.take_result().expect("result");
        assert!(result.final_bpm.is_some());
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.result().is_none());
    }

    #[test]
    fn preparing_hides_bpm_and_quality() {
        let mut session = MeasurementSession::new(MeasurementConfig::default());
        session.start();
        let snaps = run(&mut session, &frames(&SyntheticPpg::new(75.0, 30.0, 9), 1.5));
        assert!(snaps
            .iter()
            .all(|s| s.phase == Phase::Preparing && s.current_bpm.is_none() && s.quality.is_none()));
    }
}
