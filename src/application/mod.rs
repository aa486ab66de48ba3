//! Orchestration on top of the domain ports: ingestion, the job worker and
//! its handlers, event application, consistency detectors and replay.

pub mod consistency;
pub mod detectors;
pub mod engine;
pub mod handlers;
pub mod ingest;
pub mod replay;
pub mod worker;
