use thiserror::Error;

/// Failures surfaced by the measurement engine.
///
/// Poor signal is not an error here: it pauses a session rather than
/// failing it, and shows up as `SessionSnapshot::paused`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PulseError {
    /// Capture could not start or stopped delivering frames. Fatal for the session.
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    /// Frames are being dropped faster than the sustained-drop threshold allows.
    #[error("processing overload: {dropped} frame(s) dropped over {window_s:.1}s")]
    ProcessingOverload { dropped: u64, window_s: f64 },
    /// The persistence collaborator rejected a finalized result.
    #[error("failed to save result: {0}")]
    SaveFailure(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no finalized result is available")]
    NoResult,
    #[error("no measurement session is active")]
    Inactive,
}
