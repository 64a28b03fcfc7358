//! Treeline server runtime pieces shared by the server and health
//! binaries: configuration, shutdown wiring, and the chain-event bridge.

pub mod bridge;
pub mod config;
pub mod shutdown;
