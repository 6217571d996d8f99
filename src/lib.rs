//! Firmware core for a USB HID matrix keyboard.
//!
//! This crate turns raw key-matrix transitions into USB boot-keyboard and
//! consumer-control reports and implements the device side of the USB control
//! protocol that delivers them: enumeration, standard and HID class requests,
//! and descriptor service, all driven from interrupt context.
//!
//! Hardware is reached exclusively through narrow traits so the protocol and
//! key-handling logic run unmodified on a host with a fake driver:
//!
//! * [`bus::UsbDriver`] — endpoint FIFO access, stall control, address latch
//!   and the bus frame counter of the target's USB peripheral
//! * [`engine::KeyMatrix`] — the electrical matrix scanner
//! * [`engine::Layout`] — the `(mode, row, column) -> key` table
//! * [`engine::StatusLeds`] — the indicator LEDs
//!
//! The application owns a [`keyboard::UsbKeyboard`] in a `static`, forwards
//! the two USB interrupts to [`keyboard::UsbKeyboard::device_interrupt`] and
//! [`keyboard::UsbKeyboard::control_interrupt`], and runs an
//! [`engine::KeyEventEngine`] in its main loop. There is no allocator and no
//! scheduler; the one record shared between the interrupt handlers and the
//! main loop sits behind a `critical-section` mutex.

#![no_std]

//Allow the use of std in tests
#[cfg(test)]
#[macro_use]
extern crate std;

pub mod bus;
pub mod control;
pub mod descriptor;
pub mod engine;
pub mod keyboard;
pub mod prelude;
pub mod state;


/// Failure to hand a report to the host.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// The host has not selected a configuration yet, or dropped it while a
    /// transmission was waiting for endpoint space.
    NotConfigured,
    /// The endpoint did not free a buffer within the frame deadline. The
    /// report is not sent; the next cycle retries with fresh data.
    Timeout,
}
