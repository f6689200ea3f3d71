pub mod acknowledgement;
pub mod buffer;
pub mod config;
pub mod errors;
pub mod ingestor;
pub mod invoke;
pub mod record;
pub mod sink;
pub mod source;
pub mod telemetry;
