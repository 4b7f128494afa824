//! Industrial controller gateway: polls S7, Modbus-TCP and inkjet devices
//! into a shared tag registry and routes tag changes into a prioritized
//! trigger dispatcher.

pub mod api;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod tags;
pub mod triggers;
