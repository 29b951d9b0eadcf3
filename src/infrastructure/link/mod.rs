//! BLE control link.
//!
//! Everything between the control model and the aircraft: the wire protocol,
//! the single-write flow control, the session state machine, and the control
//! loop that serializes the whole thing onto one thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       service                           │
//! │   (control thread - public API for the application)     │
//! └────────────────────────┬────────────────────────────────┘
//!                          │
//!               ┌──────────▼──────────┐
//!               │        state        │
//!               │  scan / connect /   │
//!               │  bind / RSSI poll   │
//!               └──┬───────┬───────┬──┘
//!                  │       │       │
//!          ┌───────▼──┐ ┌──▼────┐ ┌▼─────────┐
//!          │ channel  │ │ proto │ │ transport│
//!          │ one write│ │ frames│ │ OS seam  │
//!          │ in flight│ │ UUIDs │ │ (trait)  │
//!          └──────────┘ └───────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Command/response framing and UUID constants
//! - [`transport`] - GATT transport trait and event types
//! - [`channel`] - Flow-controlled command submission
//! - [`state`] - The link state machine
//! - [`service`] - Control-thread event loop and public handle

pub mod channel;
pub mod protocol;
pub mod service;
pub mod state;
pub mod transport;

// Re-export the pieces most callers need
pub use service::{spawn, LinkHandle};
pub use state::{LinkMode, QuadLink};
