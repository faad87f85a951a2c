//! # CozyLife Control Library
//!
//! `cozylife-control-lib` is a Rust library for controlling CozyLife switches and lights
//! over their local TCP protocol: one JSON object per line on port 5555, with every
//! response matched to its request by a serial number.
//!
//! This library is designed to be used by command-line tools or home automation bridges
//! that need reliable control of these devices without the vendor cloud.
//!
//! ## Features
//!
//! - Persistent device links that reconnect on their own and keep a heartbeat
//! - Register queries and writes with response correlation and bounded retries
//! - Safe control of multi-rocker switches whose rockers share one bitmask register
//! - Product metadata lookup through a cached catalog
//! - Scanning an address range for devices
//!
//! ## Example
//!
//! Here is a simple example of how to read and write the registers of a device:
//!
//! ```no_run
//! use cozylife_control_lib::config::DeviceConfig;
//! use cozylife_control_lib::device_link::DeviceLink;
//! use cozylife_control_lib::util::frame::RegisterMap;
//!
//! #[tokio::main]
//! async fn main() {
//!     let link = DeviceLink::new(DeviceConfig::new("192.168.1.20"));
//!     link.connect().await;
//!
//!     if let Some(registers) = link.query().await {
//!         println!("Registers: {:?}", registers);
//!     }
//!     let on = RegisterMap::from([("1".to_string(), 1)]);
//!     println!("Acknowledged: {}", link.control(&on).await);
//!
//!     link.disconnect().await;
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with CozyLife or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `config` module holds the configuration values for devices and switch setups,
// deserializable from the same entries the scanner prints.
pub mod config;

// The `device_link` module provides the TCP session with one device: connecting,
// request/response exchange, and the heartbeat that keeps the connection alive.
//
// Example usage:
//
// ```
// use cozylife_control_lib::config::DeviceConfig;
// use cozylife_control_lib::device_link::DeviceLink;
//
// #[tokio::main]
// async fn main() {
//     let link = DeviceLink::new(DeviceConfig::new("192.168.1.20"));
//     link.connect().await;
//     link.fetch_identity().await;
//     println!("Device id: {:?}", link.device_id());
// }
// ```
pub mod device_link;

// The `coordinator` module serializes register 1 read-modify-write cycles per physical
// device and exposes each rocker of a switch as its own entity.
//
// Example usage:
//
// ```
// use cozylife_control_lib::config::SwitchConfig;
// use cozylife_control_lib::coordinator::SwitchCoordinator;
//
// #[tokio::main]
// async fn main() {
//     let mut coordinator = SwitchCoordinator::from_config(&SwitchConfig::default());
//     coordinator.setup().await;
//     coordinator.refresh().await;
// }
// ```
pub mod coordinator;

// The `util` module provides the wire protocol (frames, serial numbers, result codes),
// the product catalog cache and the address range scanner.
pub mod util;
