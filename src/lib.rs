//! Telebus - telemetry messaging core
//!
//! Process-local publish/subscribe, a brokered fan-in/fan-out relay and a
//! request/response channel over message-queue sockets, with coordinated,
//! timeout-bounded shutdown.

pub mod bus;
pub mod config;
pub mod utils;
