pub mod conditioner;
pub mod config;
pub mod detectors;
pub mod error;
pub mod io;
pub mod metrics;
pub mod plot;
pub mod result;
pub mod sampler;
pub mod session;
pub mod signal;
pub mod synth;

pub use error::PulseError;
pub use metrics::*;
pub use signal::*;
