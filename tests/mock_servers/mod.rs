//! Mock servers for integration testing
//!
//! Simulates the parts of the openHAB REST API the client talks to, so the
//! connection and voice paths can be exercised without a real server.

pub mod openhab;

pub use openhab::{MockOpenHabServer, RecordedRequest};
