//! Control transfer engine for the default endpoint.
//!
//! One [`UsbKeyboard::control_interrupt`] call handles one SETUP packet to
//! completion: decode, dispatch, data and status stages. Waits for host
//! handshakes are bounded; a timeout or an unexpected OUT packet abandons
//! the transfer and the next SETUP starts fresh. Anything unrecognized is
//! answered with a stall, the protocol-level "unsupported".

use fugit::MillisDurationU32;
use log::{info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use packed_struct::prelude::*;

use crate::bus::{FrameDeadline, UsbDriver};
use crate::descriptor::{self, ENDPOINT0_SIZE, ENDPOINT_CONFIGS, KEYBOARD_INTERFACE, MAX_ENDPOINT};
use crate::keyboard::UsbKeyboard;

/// Bound on every wait for a host handshake within a transfer.
const CONTROL_TIMEOUT: MillisDurationU32 = MillisDurationU32::from_ticks(50);

// bmRequestType values this device distinguishes
const HOST_TO_DEVICE: u8 = 0x00;
const DEVICE_TO_HOST: u8 = 0x80;
const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;
const CLASS_INTERFACE_OUT: u8 = 0x21;
const CLASS_INTERFACE_IN: u8 = 0xA1;

const FEATURE_ENDPOINT_HALT: u16 = 0;

/// Decoded SETUP packet. Lives only for the duration of one control
/// transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PackedStruct)]
#[packed_struct(endian = "lsb", size_bytes = "8")]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    fn direction_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    fn is_standard(&self) -> bool {
        self.request_type & 0x60 == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    GetConfiguration = 8,
    SetConfiguration = 9,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum HidRequest {
    GetReport = 0x01,
    GetIdle = 0x02,
    GetProtocol = 0x03,
    SetReport = 0x09,
    SetIdle = 0x0A,
    SetProtocol = 0x0B,
}

/// Outcome of waiting for a host handshake.
enum Wait {
    Ready,
    /// The host moved on (unexpected OUT packet) or stopped polling; the
    /// transfer is abandoned, not failed.
    Abort,
}

impl<D: UsbDriver> UsbKeyboard<D> {
    /// Control-endpoint interrupt entry point. Runs one control transfer to
    /// completion; never re-entered.
    pub fn control_interrupt(&self) {
        let Some(raw) = self.with(|inner| inner.driver.take_setup()) else {
            return;
        };
        let Ok(request) = ControlRequest::unpack(&raw) else {
            self.with(|inner| inner.driver.stall_control());
            return;
        };
        trace!(
            "setup: type {:02X} request {:02X} value {:04X} index {:04X} length {}",
            request.request_type,
            request.request,
            request.value,
            request.index,
            request.length
        );
        self.dispatch(&request);
    }

    fn dispatch(&self, req: &ControlRequest) {
        if let Ok(request) = StandardRequest::try_from(req.request) {
            match request {
                StandardRequest::GetDescriptor if req.direction_in() && req.is_standard() => {
                    self.get_descriptor(req);
                    return;
                }
                StandardRequest::SetAddress if req.request_type == HOST_TO_DEVICE => {
                    self.set_address(req);
                    return;
                }
                StandardRequest::SetConfiguration if req.request_type == HOST_TO_DEVICE => {
                    self.set_configuration(req);
                    return;
                }
                StandardRequest::GetConfiguration if req.request_type == DEVICE_TO_HOST => {
                    self.get_configuration();
                    return;
                }
                StandardRequest::GetStatus if req.direction_in() && req.is_standard() => {
                    self.get_status(req);
                    return;
                }
                StandardRequest::SetFeature
                    if req.request_type == ENDPOINT_OUT && req.value == FEATURE_ENDPOINT_HALT =>
                {
                    if self.endpoint_feature(req, true) {
                        return;
                    }
                }
                StandardRequest::ClearFeature
                    if req.request_type == ENDPOINT_OUT && req.value == FEATURE_ENDPOINT_HALT =>
                {
                    if self.endpoint_feature(req, false) {
                        return;
                    }
                }
                _ => {}
            }
        }
        if req.index == u16::from(KEYBOARD_INTERFACE) && self.hid_request(req) {
            return;
        }
        warn!(
            "unsupported control request, type {:02X} request {:02X} value {:04X}",
            req.request_type, req.request, req.value
        );
        self.with(|inner| inner.driver.stall_control());
    }

    fn frame_deadline(&self) -> FrameDeadline {
        self.with(|inner| FrameDeadline::after(inner.driver.frame_number(), CONTROL_TIMEOUT))
    }

    /// Waits until the control IN bank frees. Interrupt state is restored
    /// between polls; an OUT packet from the host or deadline expiry aborts.
    fn wait_control_in(&self, deadline: FrameDeadline) -> Wait {
        loop {
            let status = self.with(|inner| {
                if inner.driver.control_out_pending() {
                    return Some(Wait::Abort);
                }
                if inner.driver.control_in_ready() {
                    return Some(Wait::Ready);
                }
                if deadline.is_reached(inner.driver.frame_number()) {
                    return Some(Wait::Abort);
                }
                None
            });
            if let Some(status) = status {
                return status;
            }
        }
    }

    /// Waits for the host's OUT data stage, bounded like [`Self::wait_control_in`].
    fn wait_control_out(&self, deadline: FrameDeadline) -> Wait {
        loop {
            let status = self.with(|inner| {
                if inner.driver.control_out_pending() {
                    return Some(Wait::Ready);
                }
                if deadline.is_reached(inner.driver.frame_number()) {
                    return Some(Wait::Abort);
                }
                None
            });
            if let Some(status) = status {
                return status;
            }
        }
    }

    /// Serves a descriptor in max-packet-size chunks, ending with a
    /// zero-length packet when the data ends on a packet boundary.
    fn get_descriptor(&self, req: &ControlRequest) {
        let Some(data) = descriptor::lookup(req.value, req.index) else {
            warn!("no descriptor {:04X}:{:04X}", req.value, req.index);
            self.with(|inner| inner.driver.stall_control());
            return;
        };
        // length arithmetic is 8-bit on this side of the wire; nothing in
        // the table is longer than 255 bytes
        let requested = if req.length < 256 {
            usize::from(req.length)
        } else {
            255
        };
        let mut remaining = requested.min(data.len());
        let mut offset = 0;
        let deadline = self.frame_deadline();
        loop {
            match self.wait_control_in(deadline) {
                Wait::Abort => return,
                Wait::Ready => {}
            }
            let chunk = remaining.min(ENDPOINT0_SIZE);
            self.with(|inner| {
                inner.driver.control_write(&data[offset..offset + chunk]);
                inner.driver.control_send();
            });
            offset += chunk;
            remaining -= chunk;
            if remaining == 0 && chunk < ENDPOINT0_SIZE {
                break;
            }
        }
        trace!("descriptor {:04X}:{:04X}, {} bytes", req.value, req.index, offset);
    }

    fn set_address(&self, req: &ControlRequest) {
        // status stage goes out on the old address, then the new one latches
        self.with(|inner| inner.driver.control_send());
        if let Wait::Ready = self.wait_control_in(self.frame_deadline()) {
            self.with(|inner| inner.driver.set_address(req.value as u8));
            info!("address {}", req.value);
        }
    }

    fn set_configuration(&self, req: &ControlRequest) {
        self.with(|inner| {
            inner.state.configuration = req.value as u8;
            inner.driver.control_send();
            for config in ENDPOINT_CONFIGS {
                inner.driver.configure_endpoint(config);
            }
            inner.driver.reset_data_toggles();
        });
        info!("configuration {}", req.value);
    }

    fn get_configuration(&self) {
        if let Wait::Ready = self.wait_control_in(self.frame_deadline()) {
            self.with(|inner| {
                let configuration = inner.state.configuration;
                inner.driver.control_write(&[configuration]);
                inner.driver.control_send();
            });
        }
    }

    fn get_status(&self, req: &ControlRequest) {
        if let Wait::Ready = self.wait_control_in(self.frame_deadline()) {
            self.with(|inner| {
                let halted = req.request_type == ENDPOINT_IN
                    && inner.driver.endpoint_halted(req.index as u8 & 0x7F);
                inner.driver.control_write(&[u8::from(halted), 0]);
                inner.driver.control_send();
            });
        }
    }

    fn endpoint_feature(&self, req: &ControlRequest, halt: bool) -> bool {
        let endpoint = req.index as u8 & 0x7F;
        if !(1..=MAX_ENDPOINT).contains(&endpoint) {
            return false;
        }
        self.with(|inner| {
            inner.driver.control_send();
            inner.driver.set_endpoint_halt(endpoint, halt);
        });
        info!("endpoint {} halt {}", endpoint, halt);
        true
    }

    /// HID class requests, scoped to the keyboard interface. Returns false
    /// when the request is not one this interface answers.
    fn hid_request(&self, req: &ControlRequest) -> bool {
        let Ok(request) = HidRequest::try_from(req.request) else {
            return false;
        };
        match (req.request_type, request) {
            (CLASS_INTERFACE_IN, HidRequest::GetReport) => {
                if let Wait::Ready = self.wait_control_in(self.frame_deadline()) {
                    self.with(|inner| {
                        let report = inner.state.keyboard_report();
                        inner.driver.control_write(&report);
                        inner.driver.control_send();
                    });
                }
                true
            }
            (CLASS_INTERFACE_IN, HidRequest::GetIdle) => {
                if let Wait::Ready = self.wait_control_in(self.frame_deadline()) {
                    self.with(|inner| {
                        let idle = inner.state.idle_config;
                        inner.driver.control_write(&[idle]);
                        inner.driver.control_send();
                    });
                }
                true
            }
            (CLASS_INTERFACE_IN, HidRequest::GetProtocol) => {
                if let Wait::Ready = self.wait_control_in(self.frame_deadline()) {
                    self.with(|inner| {
                        let protocol = inner.state.protocol;
                        inner.driver.control_write(&[protocol]);
                        inner.driver.control_send();
                    });
                }
                true
            }
            (CLASS_INTERFACE_OUT, HidRequest::SetReport) => {
                if let Wait::Ready = self.wait_control_out(self.frame_deadline()) {
                    let leds = self.with(|inner| {
                        let mut data = [0u8; 8];
                        let count = inner.driver.control_read(&mut data);
                        if count > 0 {
                            inner.state.leds = data[0];
                        }
                        inner.driver.control_ack_out();
                        inner.driver.control_send();
                        inner.state.leds
                    });
                    info!("leds {:05b}", leds);
                }
                true
            }
            (CLASS_INTERFACE_OUT, HidRequest::SetIdle) => {
                self.with(|inner| {
                    inner.state.idle_config = (req.value >> 8) as u8;
                    inner.state.idle_count = 0;
                    inner.driver.control_send();
                });
                info!("idle rate {}", req.value >> 8);
                true
            }
            (CLASS_INTERFACE_OUT, HidRequest::SetProtocol) => {
                self.with(|inner| {
                    inner.state.protocol = req.value as u8;
                    inner.driver.control_send();
                });
                info!("protocol {}", req.value);
                true
            }
            _ => false,
        }
    }
}
