//! Asynchronous frame analysis.
//!
//! A bounded worker submits JPEG stills to an external vision endpoint.
//! Everything here is off the media path; analysis can stall or fail
//! without a peer ever noticing.

pub mod client;
pub mod worker;

pub use client::AnalysisClient;
pub use worker::{AnalysisHandle, AnalysisRequest, AnalysisWorker};
