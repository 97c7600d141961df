pub mod confidence;
pub mod quality;
pub mod spectrum;
