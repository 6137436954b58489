//! Infrastructure layer: job store, external dependency clients, worker pool,
//! and the enrichment façade.

pub mod config;
pub mod embed;
pub mod jobs;
pub mod retry;
pub mod service;
pub mod transform;
pub mod workers;
