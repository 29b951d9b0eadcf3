//! QuadLink
//!
//! Handheld-controller core for a BLE-tethered quadcopter: reads device tilt,
//! maps it onto normalized control axes, and streams them to the aircraft
//! over a flow-controlled GATT link.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     LinkHandle / LinkUpdate              │
//! │        (public API: commands in, updates out)            │
//! └────────────────────────┬─────────────────────────────────┘
//!                          │ one control thread, one queue
//!          ┌───────────────┼──────────────────┐
//!          ▼               ▼                  ▼
//! ┌──────────────┐  ┌────────────┐  ┌──────────────────┐
//! │ MotionTracker│→ │ QuadModel  │→ │     QuadLink     │
//! │ running max  │  │ axes +     │  │ scan / connect / │
//! │ + fan-out    │  │ throttle   │  │ bind / RSSI poll │
//! └──────────────┘  └────────────┘  └────────┬─────────┘
//!                                            │ single write in flight
//!                                   ┌────────▼─────────┐
//!                                   │  CommandChannel  │
//!                                   │  GattTransport   │
//!                                   └──────────────────┘
//! ```
//!
//! The OS BLE stack, the motion sensor, the rendering surface, and the UI
//! shell are all external: they plug in through the [`GattTransport`] trait,
//! [`LinkHandle::motion_sample`], and the [`LinkUpdate`] stream.

pub mod domain;
pub mod infrastructure;

pub use domain::control::QuadModel;
pub use domain::models::{
    LinkStatus, LinkUpdate, MessageSeverity, MotionSample, ScannedDevice, StatusMessage,
};
pub use domain::motion::MotionTracker;
pub use domain::settings::{LogSettings, Settings, SettingsService};
pub use infrastructure::logging::{init_logger, LoggingGuard};
pub use infrastructure::link::service::{
    preflight, spawn, HostCapabilities, LinkHandle, PreflightError,
};
pub use infrastructure::link::state::{LinkConfig, LinkMode, QuadLink};
pub use infrastructure::link::transport::{GattEvent, GattTransport};
