//! Hardware abstraction for the target's USB device peripheral.
//!
//! [`UsbDriver`] is the only seam between the protocol engines and the
//! hardware: one implementation wraps the real peripheral registers, a fake
//! one drives the same logic in host tests. The trait is deliberately
//! register-shaped — select a FIFO, move bytes, flip a handshake — so a
//! hardware implementation stays a thin veneer.

use fugit::MillisDurationU32;

/// Transfer types used by this device.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    InterruptIn,
}

/// One endpoint's hardware configuration, applied verbatim when the host
/// selects a configuration.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub number: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u8,
    /// Ping-pong banked FIFO; doubles usable buffer space on parts that
    /// support it.
    pub double_buffered: bool,
}

/// Device-level events accumulated since the last interrupt.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusEvents {
    /// The host issued a bus reset; endpoint zero must be reconfigured and
    /// the selected configuration is void.
    pub reset: bool,
    /// A start-of-frame marker passed (1 ms of bus time).
    pub frame_tick: bool,
}

/// Access to the USB device peripheral.
///
/// All methods are called either from an interrupt handler or from inside a
/// critical section, never concurrently.
pub trait UsbDriver {
    /// Reads and clears the pending device-level event flags.
    fn take_bus_events(&mut self) -> BusEvents;

    /// Latches the bus address assigned by `SET_ADDRESS`.
    fn set_address(&mut self, address: u8);

    /// Enables an endpoint with the given type and buffer geometry.
    fn configure_endpoint(&mut self, config: &EndpointConfig);

    /// Resets the DATA0/DATA1 toggles of every non-control endpoint.
    fn reset_data_toggles(&mut self);

    /// Takes a pending SETUP packet from the control endpoint, if any,
    /// acknowledging it and leaving both banks ready for the data stage.
    fn take_setup(&mut self) -> Option<[u8; 8]>;

    /// True when the control IN bank is free for [`Self::control_write`].
    fn control_in_ready(&self) -> bool;

    /// True when the host has raised an OUT packet on the control endpoint.
    fn control_out_pending(&self) -> bool;

    /// Loads bytes into the control IN bank. `data` never exceeds the
    /// control endpoint's max packet size.
    fn control_write(&mut self, data: &[u8]);

    /// Releases the control IN bank to the bus (an empty bank is sent as a
    /// zero-length packet).
    fn control_send(&mut self);

    /// Reads the pending control OUT data, returning the byte count.
    fn control_read(&mut self, buffer: &mut [u8]) -> usize;

    /// Acknowledges the pending control OUT packet.
    fn control_ack_out(&mut self);

    /// Stalls the control endpoint; the stall clears on the next SETUP.
    fn stall_control(&mut self);

    /// True if the given endpoint is currently halted.
    fn endpoint_halted(&self, endpoint: u8) -> bool;

    /// Halts or resumes an endpoint. Resuming also resets that endpoint's
    /// data toggle.
    fn set_endpoint_halt(&mut self, endpoint: u8, halt: bool);

    /// True when the interrupt IN endpoint has a free bank to write into.
    fn endpoint_writable(&self, endpoint: u8) -> bool;

    /// Fills one bank of an interrupt IN endpoint and releases it to the bus.
    fn endpoint_write(&mut self, endpoint: u8, data: &[u8]);

    /// Low byte of the bus frame counter; increments every millisecond and
    /// wraps at 256.
    fn frame_number(&self) -> u8;
}

/// A point on the (wrapping) bus frame counter at which a bounded wait gives
/// up.
///
/// The counter is eight bits wide, so deadlines further than 255 frames out
/// cannot be represented; every timeout in this crate is far shorter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDeadline(u8);

impl FrameDeadline {
    /// Deadline `timeout` after `now`, at one frame per millisecond.
    pub fn after(now: u8, timeout: MillisDurationU32) -> Self {
        Self(now.wrapping_add(timeout.to_millis() as u8))
    }

    /// True exactly when the counter reaches the deadline frame.
    pub fn is_reached(self, now: u8) -> bool {
        now == self.0
    }
}
