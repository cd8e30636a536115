//! Suction monitoring for operating rooms.
//!
//! Edge devices debounce a flow switch, PIR sensor or ultrasonic ranger and
//! publish each room's suction state over MQTT; the backend ingests those
//! messages into a per-room store with an append-only audit log.

pub mod backend;
pub mod config;
pub mod edge;
pub mod messages;
pub mod store;
pub mod transport;
