//! Telemetry collector core: streaming aggregation, cluster redistribution
//! and merge-flush persistence.

pub mod alarm;
pub mod cache;
pub mod clock;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod entity;
pub mod error;
pub mod health;
pub mod ingest;
pub mod remote;
pub mod storage;
pub mod stream;
