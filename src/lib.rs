//! Real-time seismic threshold monitor: per-station ingestion, filtering,
//! PGA/threshold classification, and alarm dispatch.

#![deny(clippy::all)]
//#![warn(clippy::pedantic)]

pub mod alarm;
pub mod args;
pub mod calibration;
pub mod config;
pub mod dsp;
pub mod errors;
pub mod filter_buffer;
pub mod history_log;
pub mod history_watch;
pub mod latency;
pub mod metrics;
pub mod notify;
pub mod packet;
pub mod source;
pub mod status_store;
pub mod stream_id;
pub mod supervisor;
pub mod telemetry;
pub mod threshold;
pub mod worker;
