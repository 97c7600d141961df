//! Background processing context for measurement sessions.
//!
//! The worker thread is the only owner of the [`MeasurementSession`]. The
//! capture side pushes frames through a bounded queue that drops on
//! overflow, and the consumer receives coalesced snapshots plus at most one
//! terminal outcome per session.

pub mod store;

use anyhow::Context;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use pulse_lib::config::MeasurementConfig;
use pulse_lib::error::PulseError;
use pulse_lib::result::{MeasurementResult, PendingResult, ResultSink};
use pulse_lib::session::{MeasurementSession, Phase, SessionSnapshot};
use pulse_lib::signal::RawFrame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Queue sizes and publication rate of the processing thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames waiting for the worker; further frames are dropped.
    pub frame_queue: usize,
    /// Minimum spacing between published snapshots (milliseconds).
    pub tick_ms: u64,
    pub result_queue: usize,
    /// How long `stop` waits for the worker to acknowledge (milliseconds).
    pub stop_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_queue: 32,
            tick_ms: 100,
            result_queue: 4,
            stop_timeout_ms: 2000,
        }
    }
}

impl EngineConfig {
    fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Ordered with the frames of a session.
enum Inbound {
    Start { session: u64 },
    Frame { session: u64, frame: RawFrame },
    CaptureFailed { session: u64, reason: String },
}

/// Out-of-band control, handled as soon as the worker wakes.
enum Command {
    Stop { session: u64, ack: Sender<()> },
    Shutdown,
}

struct Published {
    session: u64,
    snapshot: SessionSnapshot,
}

struct Finished {
    session: u64,
    snapshot: SessionSnapshot,
    outcome: Result<MeasurementResult, PulseError>,
}

/// Cloneable handle for the capture thread.
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<Inbound>,
    current: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    /// Queue a frame for the active session. Returns false when no session is
    /// active or the queue is full; a full queue never blocks the caller.
    pub fn push(&self, frame: RawFrame) -> bool {
        let session = self.current.load(Ordering::Acquire);
        if session == 0 {
            return false;
        }
        match self.tx.try_send(Inbound::Frame { session, frame }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Frames rejected because the worker was behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer-facing handle: control operations, snapshots and the result.
pub struct PulseEngine {
    cfg: EngineConfig,
    command_tx: Sender<Command>,
    snapshot_rx: Receiver<Published>,
    result_rx: Receiver<Finished>,
    frames: FrameSender,
    worker: Option<JoinHandle<()>>,
    next_session: u64,
    session: Option<u64>,
    latest: Option<SessionSnapshot>,
    pending: PendingResult,
    last_error: Option<PulseError>,
    store: Box<dyn ResultSink + Send>,
}

impl PulseEngine {
    pub fn new(
        measurement: MeasurementConfig,
        cfg: EngineConfig,
        store: Box<dyn ResultSink + Send>,
    ) -> anyhow::Result<Self> {
        measurement.validate()?;
        let (command_tx, command_rx) = bounded(32);
        let (frame_tx, frame_rx) = bounded::<Inbound>(cfg.frame_queue.max(1));
        let (snapshot_tx, snapshot_rx) = bounded(8);
        let (result_tx, result_rx) = bounded(cfg.result_queue.max(1));
        let current = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            session: MeasurementSession::new(measurement),
            active: None,
            cancelled: 0,
            current: current.clone(),
            command_rx,
            frame_rx,
            snapshot_tx,
            result_tx,
            tick: cfg.tick(),
            last_publish: None,
            dirty: false,
        };
        let handle = std::thread::Builder::new()
            .name("pulse-worker".into())
            .spawn(move || worker.run())
            .context("spawning pulse worker")?;
        Ok(Self {
            cfg,
            command_tx,
            snapshot_rx,
            result_rx,
            frames: FrameSender {
                tx: frame_tx,
                current,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            worker: Some(handle),
            next_session: 1,
            session: None,
            latest: None,
            pending: PendingResult::default(),
            last_error: None,
            store,
        })
    }

    pub fn frame_sender(&self) -> FrameSender {
        self.frames.clone()
    }

    pub fn push_frame(&self, frame: RawFrame) -> bool {
        self.frames.push(frame)
    }

    /// Start a new session, cancelling any active one. An unsaved result is discarded.
    pub fn start(&mut self) -> Result<u64, PulseError> {
        if let Some(old) = self.pending.discard() {
            warn!("discarding unsaved result ({:?} BPM)", old.final_bpm);
        }
        let session = self.next_session;
        self.next_session += 1;
        self.frames
            .tx
            .send(Inbound::Start { session })
            .map_err(|_| PulseError::Inactive)?;
        self.frames.current.store(session, Ordering::Release);
        self.session = Some(session);
        self.latest = None;
        self.last_error = None;
        info!("session {session} requested");
        Ok(session)
    }

    /// Cancel the active session, or discard a completed result that was not
    /// saved. When this returns the worker has dropped the session and nothing
    /// queued for it will surface.
    pub fn stop(&mut self) {
        if let Some(old) = self.pending.discard() {
            info!("stop discarded unsaved result ({:?} BPM)", old.final_bpm);
            self.latest = None;
        }
        let Some(session) = self.session.take() else {
            return;
        };
        self.frames.current.store(0, Ordering::Release);
        let (ack_tx, ack_rx) = bounded(1);
        if self
            .command_tx
            .send(Command::Stop { session, ack: ack_tx })
            .is_ok()
            && ack_rx
                .recv_timeout(Duration::from_millis(self.cfg.stop_timeout_ms))
                .is_err()
        {
            warn!("worker did not acknowledge stop of session {session}");
        }
        self.drain_stale();
        self.latest = None;
        info!("session {session} stopped");
    }

    /// The capture collaborator could not deliver frames.
    pub fn report_capture_failure(&self, reason: impl Into<String>) {
        if let Some(session) = self.session {
            let _ = self.frames.tx.send(Inbound::CaptureFailed {
                session,
                reason: reason.into(),
            });
        }
    }

    /// Drain updates and return the newest snapshot for the current session.
    pub fn poll(&mut self) -> Option<&SessionSnapshot> {
        while let Ok(update) = self.snapshot_rx.try_recv() {
            if Some(update.session) == self.session {
                self.latest = Some(update.snapshot);
            }
        }
        while let Ok(done) = self.result_rx.try_recv() {
            if Some(done.session) != self.session {
                debug!("dropping outcome of stale session {}", done.session);
                continue;
            }
            self.latest = Some(done.snapshot);
            self.session = None;
            match done.outcome {
                Ok(result) => self.pending.set(result),
                Err(err) => self.last_error = Some(err),
            }
        }
        self.latest.as_ref()
    }

    /// Poll until the session finishes or `timeout` passes.
    pub fn wait_for_result(&mut self, timeout: Duration) -> Result<&MeasurementResult, PulseError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if let Some(err) = &self.last_error {
                return Err(err.clone());
            }
            if self.pending.is_pending() || self.session.is_none() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.cfg.tick() / 2);
        }
        self.pending.get().ok_or(PulseError::NoResult)
    }

    pub fn phase(&self) -> Phase {
        if self.pending.is_pending() {
            return Phase::Completed;
        }
        match (&self.session, &self.latest) {
            (Some(_), Some(snapshot)) => snapshot.phase,
            (Some(_), None) => Phase::Preparing,
            (None, _) => Phase::Idle,
        }
    }

    pub fn latest(&self) -> Option<&SessionSnapshot> {
        self.latest.as_ref()
    }

    pub fn result(&self) -> Option<&MeasurementResult> {
        self.pending.get()
    }

    pub fn last_error(&self) -> Option<&PulseError> {
        self.last_error.as_ref()
    }

    /// Persist the finalized result. On failure it stays available for retry.
    pub fn save(&mut self) -> Result<MeasurementResult, PulseError> {
        let saved = self.pending.save(self.store.as_mut())?;
        self.latest = None;
        Ok(saved)
    }

    pub fn discard(&mut self) -> Result<MeasurementResult, PulseError> {
        let dropped = self.pending.discard().ok_or(PulseError::NoResult)?;
        self.latest = None;
        Ok(dropped)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }

    fn drain_stale(&mut self) {
        while self.snapshot_rx.try_recv().is_ok() {}
        while self.result_rx.try_recv().is_ok() {}
    }
}

impl Drop for PulseEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    session: MeasurementSession,
    active: Option<u64>,
    /// Highest session id the consumer has stopped.
    cancelled: u64,
    current: Arc<AtomicU64>,
    command_rx: Receiver<Command>,
    frame_rx: Receiver<Inbound>,
    snapshot_tx: Sender<Published>,
    result_tx: Sender<Finished>,
    tick: Duration,
    last_publish: Option<Instant>,
    dirty: bool,
}

impl Worker {
    fn run(mut self) {
        let command_rx = self.command_rx.clone();
        let frame_rx = self.frame_rx.clone();
        loop {
            select! {
                recv(command_rx) -> msg => match msg {
                    Ok(Command::Stop { session, ack }) => {
                        self.stop(session);
                        let _ = ack.send(());
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                recv(frame_rx) -> msg => match msg {
                    Ok(inbound) => self.handle(inbound),
                    Err(_) => break,
                },
                default(self.tick) => {}
            }
            self.publish(false);
        }
        self.session.stop();
        self.current.store(0, Ordering::Release);
    }

    fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Start { session } => {
                if session <= self.cancelled {
                    debug!("session {session} was stopped before it started");
                    return;
                }
                self.session.start();
                self.active = Some(session);
                self.dirty = true;
                self.publish(true);
            }
            Inbound::Frame { session, frame } => {
                if self.active != Some(session) || !self.session.push_frame(&frame) {
                    return;
                }
                self.dirty = true;
                if self.session.phase() == Phase::Completed {
                    let snapshot = self.session.snapshot();
                    let outcome = self.session.take_result();
                    self.finish(snapshot, outcome);
                }
            }
            Inbound::CaptureFailed { session, reason } => {
                if self.active != Some(session) {
                    return;
                }
                self.session.fail_capture(reason);
                let err = self
                    .session
                    .error()
                    .cloned()
                    .unwrap_or(PulseError::Inactive);
                let snapshot = self.session.snapshot();
                self.finish(snapshot, Err(err));
            }
        }
    }

    fn stop(&mut self, session: u64) {
        self.cancelled = self.cancelled.max(session);
        if self.active.is_some_and(|active| active <= session) {
            self.session.stop();
            self.active = None;
            self.dirty = false;
        }
    }

    fn finish(&mut self, snapshot: SessionSnapshot, outcome: Result<MeasurementResult, PulseError>) {
        let Some(session) = self.active.take() else {
            return;
        };
        let _ = self
            .current
            .compare_exchange(session, 0, Ordering::AcqRel, Ordering::Acquire);
        self.dirty = false;
        if let Err(err) = self.result_tx.try_send(Finished {
            session,
            snapshot,
            outcome,
        }) {
            warn!("result queue unavailable, outcome of session {session} lost: {err}");
        }
    }

    /// Send a snapshot if something changed and a tick has passed since the last one.
    fn publish(&mut self, force: bool) {
        let Some(session) = self.active else {
            return;
        };
        if !self.dirty {
            return;
        }
        let due = self
            .last_publish
            .map_or(true, |at| at.elapsed() >= self.tick);
        if !(due || force) {
            return;
        }
        let update = Published {
            session,
            snapshot: self.session.snapshot(),
        };
        match self.snapshot_tx.try_send(update) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => return,
        }
        self.last_publish = Some(Instant::now());
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryResultStore;
    use pulse_lib::session::SessionConfig;
    use pulse_lib::synth::{SynthMode, SyntheticPpg};

    fn short_config() -> MeasurementConfig {
        MeasurementConfig {
            session: SessionConfig {
                target_s: 10.0,
                max_paused_s: 10.0,
                ..SessionConfig::default()
            },
            ..MeasurementConfig::default()
        }
    }

    fn engine(store: MemoryResultStore, tick_ms: u64) -> PulseEngine {
        let cfg = EngineConfig {
            frame_queue: 4096,
            tick_ms,
            ..EngineConfig::default()
        };
        PulseEngine::new(short_config(), cfg, Box::new(store)).unwrap()
    }

    fn feed(engine: &PulseEngine, synth: &SyntheticPpg, seconds: f64) -> usize {
        let sender = engine.frame_sender();
        synth
            .frames(seconds)
            .into_iter()
            .filter(|s| sender.push(RawFrame::from(*s)))
            .count()
    }

    #[test]
    fn completes_in_background_and_saves() {
        let store = MemoryResultStore::default();
        let mut engine = engine(store.clone(), 20);
        engine.start().unwrap();
        let accepted = feed(&engine, &SyntheticPpg::new(72.0, 30.0, 3), 20.0);
        assert!(accepted >= 451);

        let result = engine.wait_for_result(Duration::from_secs(10)).unwrap().clone();
        let bpm = result.final_bpm.unwrap();
        assert!((71..=73).contains(&bpm), "bpm {}", bpm);
        assert_eq!(engine.phase(), Phase::Completed);
        assert_eq!(engine.latest().map(|s| s.phase), Some(Phase::Completed));

        let saved = engine.save().unwrap();
        assert_eq!(saved, result);
        assert_eq!(store.saved().len(), 1);
        assert_eq!(engine.phase(), Phase::Idle);
        assert_eq!(engine.save().unwrap_err(), PulseError::NoResult);
    }

    #[test]
    fn failed_save_is_retryable() {
        let store = MemoryResultStore::default();
        store.set_failing(true);
        let mut engine = engine(store.clone(), 20);
        engine.start().unwrap();
        feed(&engine, &SyntheticPpg::new(80.0, 30.0, 4), 20.0);
        engine.wait_for_result(Duration::from_secs(10)).unwrap();

        assert!(matches!(engine.save(), Err(PulseError::SaveFailure(_))));
        assert!(engine.result().is_some());
        store.set_failing(false);
        engine.save().unwrap();
        assert!(engine.result().is_none());
        assert_eq!(store.saved().len(), 1);
    }

    #[test]
    fn stop_is_synchronous_and_suppresses_the_result() {
        let mut engine = engine(MemoryResultStore::default(), 20);
        engine.start().unwrap();
        feed(&engine, &SyntheticPpg::new(75.0, 30.0, 5), 12.0);
        engine.stop();
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(!engine.push_frame(RawFrame::intensity(100.0, 150.0)));

        std::thread::sleep(Duration::from_millis(100));
        assert!(engine.poll().is_none());
        assert!(engine.result().is_none());
        engine.stop();
        assert_eq!(engine.discard().unwrap_err(), PulseError::NoResult);
    }

    #[test]
    fn stop_after_completion_discards_the_result() {
        let store = MemoryResultStore::default();
        let mut engine = engine(store.clone(), 20);
        engine.start().unwrap();
        feed(&engine, &SyntheticPpg::new(72.0, 30.0, 6), 20.0);
        engine.wait_for_result(Duration::from_secs(10)).unwrap();
        assert_eq!(engine.phase(), Phase::Completed);

        engine.stop();
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(engine.result().is_none());
        assert!(engine.latest().is_none());
        assert_eq!(engine.save().unwrap_err(), PulseError::NoResult);
        assert!(store.saved().is_empty());
    }

    #[test]
    fn snapshots_are_coalesced() {
        let mut engine = engine(MemoryResultStore::default(), 1_000);
        engine.start().unwrap();
        feed(&engine, &SyntheticPpg::new(75.0, 30.0, 6), 3.0);
        std::thread::sleep(Duration::from_millis(200));
        let mut seen = 0;
        while engine.snapshot_rx.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen <= 2, "{} snapshots for 91 frames", seen);
    }

    #[test]
    fn capture_failure_surfaces_error() {
        let mut engine = engine(MemoryResultStore::default(), 20);
        engine.start().unwrap();
        feed(&engine, &SyntheticPpg::new(75.0, 30.0, 7), 1.0);
        engine.report_capture_failure("permission denied");
        let err = engine.wait_for_result(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, PulseError::CameraUnavailable(_)));
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(!engine.push_frame(RawFrame::intensity(2.0, 150.0)));
    }

    #[test]
    fn flat_input_finishes_with_low_confidence() {
        let mut engine = engine(MemoryResultStore::default(), 20);
        engine.start().unwrap();
        let flat = SyntheticPpg::new(75.0, 30.0, 8).with_mode(SynthMode::Flat);
        feed(&engine, &flat, 20.0);
        let result = engine.wait_for_result(Duration::from_secs(10)).unwrap();
        assert!(result.final_bpm.is_none());
        assert_eq!(engine.latest().map(|s| s.progress), Some(0.0));
        engine.discard().unwrap();
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[test]
    fn frames_without_session_are_refused() {
        let engine = engine(MemoryResultStore::default(), 20);
        assert!(!engine.push_frame(RawFrame::intensity(0.0, 1.0)));
    }
}
