//! Gateway service library (gwsrv)
//!
//! Bridges Modbus TCP, Modbus RTU and LOGO field devices to a cloud
//! telemetry/command bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   roster    ┌──────────────────┐
//! │   MqttBus    │────────────►│ GatewayRegistry  │
//! │ (bus::mqtt)  │  commands   └────────┬─────────┘
//! └──────▲───────┘                      │ one per device
//!        │                     ┌────────▼─────────┐
//!        │ signals / status    │DeviceOrchestrator│
//!        │                     └────────┬─────────┘
//!        │                              │ tcp | serial | logo
//!        │                     ┌────────▼─────────┐
//!        └─────────────────────│ReconnectSupervisor│──► RegisterPoller
//!                              └──────────────────┘
//! ```
//!
//! - **`core`**: register maps, signal decoding, device config, transports, command tables
//! - **`runtime`**: supervisors, pollers, health, orchestrators, registry
//! - **`bus`**: sink traits, command envelope, MQTT adapter

pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod runtime;

pub use error::{GwSrvError, Result};
