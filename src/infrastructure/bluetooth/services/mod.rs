//! Typed handlers for standard services

pub mod battery;
pub mod device_information;

pub use battery::BatteryService;
pub use device_information::{DeviceInformationEvent, DeviceInformationService};
