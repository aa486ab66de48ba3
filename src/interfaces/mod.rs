//! Edges of the service: the HTTP API and CSV provisioning input.

pub mod csv;
pub mod http;
