//! Pure domain types and the storage ports the application layer depends on.

pub mod anomaly;
pub mod audit;
pub mod canonical;
pub mod context;
pub mod job;
pub mod ledger;
pub mod money;
pub mod ports;
pub mod project;
pub mod raw_event;
