//! Convenience re-exports for wiring the firmware core into an application:
//!
//! ```
//! # #![allow(unused_imports)]
//! use hid_matrix_keyboard::prelude::*;
//! ```

pub use crate::bus::{BusEvents, EndpointConfig, TransferType, UsbDriver};
pub use crate::engine::{KeyEventEngine, KeyMatrix, Layout, ModeSelector, StatusLeds};
pub use crate::keyboard::UsbKeyboard;
pub use crate::state::LedReport;
pub use crate::TransmitError;
