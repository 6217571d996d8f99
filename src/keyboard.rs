//! The shared keyboard device: one guarded record of driver plus report
//! state, the interrupt entry points that feed it, and the report
//! transmission paths that drain it.

use core::cell::RefCell;

use critical_section::Mutex;
use fugit::{ExtU32, MillisDurationU32};
use log::{info, trace};

use crate::bus::{FrameDeadline, UsbDriver};
use crate::descriptor::{CONSUMER_ENDPOINT, CONTROL_ENDPOINT_CONFIG, KEYBOARD_ENDPOINT};
use crate::state::KeyboardState;
use crate::TransmitError;

/// How long a transmission may wait for endpoint buffer space, in bus
/// frames. A host that stops polling for this long is treated as gone.
pub(crate) const REPORT_TIMEOUT: MillisDurationU32 = MillisDurationU32::from_ticks(50);

pub(crate) struct Inner<D> {
    pub(crate) driver: D,
    pub(crate) state: KeyboardState,
    sof_divider: u8,
}

/// The USB keyboard device.
///
/// Owns the [`KeyboardState`] and the [`UsbDriver`] behind a single
/// critical-section mutex — the one gate through which the main loop and
/// both interrupt handlers reach shared state. Methods take `&self`, so an
/// instance can live in a `static` and be shared with the ISR shims.
pub struct UsbKeyboard<D: UsbDriver> {
    inner: Mutex<RefCell<Inner<D>>>,
}

impl<D: UsbDriver> UsbKeyboard<D> {
    pub const fn new(driver: D) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                driver,
                state: KeyboardState::new(),
                sof_divider: 0,
            })),
        }
    }

    /// Runs `f` with exclusive access to the driver and shared state. Kept
    /// short by every caller: one packet's worth of work per section.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Inner<D>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// The configuration number selected by the host; 0 while unconfigured.
    pub fn configuration(&self) -> u8 {
        self.with(|inner| inner.state.configuration)
    }

    pub fn is_configured(&self) -> bool {
        self.configuration() != 0
    }

    /// Indicator bits last written by the host, `LedReport` layout.
    pub fn leds(&self) -> u8 {
        self.with(|inner| inner.state.leds)
    }

    /// The host-requested idle rate as a duration; zero when idle resend is
    /// disabled.
    pub fn idle_duration(&self) -> MillisDurationU32 {
        self.with(|inner| (u32::from(inner.state.idle_config) * 4).millis())
    }

    /// Sets the consumer-control usage code to be reported. The transmission
    /// path deduplicates against the last code actually sent.
    pub fn set_consumer_key(&self, code: u16) {
        self.with(|inner| inner.state.consumer_key = code);
    }

    /// Device-level interrupt entry point: bus reset handling and the 1 ms
    /// frame tick that drives idle retransmission.
    ///
    /// Runs to completion and is never re-entered; the platform's ISR shim
    /// calls it on every device interrupt.
    pub fn device_interrupt(&self) {
        self.with(|inner| {
            let events = inner.driver.take_bus_events();
            if events.reset {
                inner.driver.configure_endpoint(&CONTROL_ENDPOINT_CONFIG);
                inner.state.configuration = 0;
                info!("bus reset, configuration dropped");
            }
            if events.frame_tick && inner.state.is_configured() && inner.state.idle_config != 0 {
                // idle rate is in 4 ms units; act on every fourth frame
                inner.sof_divider = inner.sof_divider.wrapping_add(1);
                if inner.sof_divider & 3 == 0
                    && inner.driver.endpoint_writable(KEYBOARD_ENDPOINT)
                {
                    inner.state.idle_count += 1;
                    if inner.state.idle_count == inner.state.idle_config {
                        inner.state.idle_count = 0;
                        let report = inner.state.keyboard_report();
                        inner.driver.endpoint_write(KEYBOARD_ENDPOINT, &report);
                        trace!("idle resend");
                    }
                }
            }
        });
    }

    /// Sends the current 8-byte keyboard report on the keyboard endpoint.
    ///
    /// Composition and hand-off happen in one critical section, so the idle
    /// tick can never observe a half-written report. The wait for endpoint
    /// space re-enables interrupts between polls and is bounded by
    /// [`REPORT_TIMEOUT`]; losing the configuration mid-wait aborts without
    /// sending.
    pub fn send_keyboard_report(&self) -> Result<(), TransmitError> {
        if !self.is_configured() {
            return Err(TransmitError::NotConfigured);
        }
        let deadline =
            self.with(|inner| FrameDeadline::after(inner.driver.frame_number(), REPORT_TIMEOUT));
        loop {
            let outcome = self.with(|inner| {
                if !inner.state.is_configured() {
                    return Some(Err(TransmitError::NotConfigured));
                }
                if inner.driver.endpoint_writable(KEYBOARD_ENDPOINT) {
                    let report = inner.state.keyboard_report();
                    inner.driver.endpoint_write(KEYBOARD_ENDPOINT, &report);
                    inner.state.idle_count = 0;
                    return Some(Ok(()));
                }
                if deadline.is_reached(inner.driver.frame_number()) {
                    return Some(Err(TransmitError::Timeout));
                }
                None
            });
            if let Some(result) = outcome {
                return result;
            }
        }
    }

    /// Sends the consumer-control report if the usage code changed since the
    /// last successful send. A held key is reported once, not every cycle.
    pub fn send_consumer_report(&self) -> Result<(), TransmitError> {
        if self.with(|inner| inner.state.consumer_key == inner.state.last_consumer_key) {
            return Ok(());
        }
        if !self.is_configured() {
            return Err(TransmitError::NotConfigured);
        }
        let deadline =
            self.with(|inner| FrameDeadline::after(inner.driver.frame_number(), REPORT_TIMEOUT));
        loop {
            let outcome = self.with(|inner| {
                if !inner.state.is_configured() {
                    return Some(Err(TransmitError::NotConfigured));
                }
                if inner.driver.endpoint_writable(CONSUMER_ENDPOINT) {
                    let report = inner.state.consumer_report();
                    inner.driver.endpoint_write(CONSUMER_ENDPOINT, &report);
                    inner.state.last_consumer_key = inner.state.consumer_key;
                    return Some(Ok(()));
                }
                if deadline.is_reached(inner.driver.frame_number()) {
                    return Some(Err(TransmitError::Timeout));
                }
                None
            });
            if let Some(result) = outcome {
                return result;
            }
        }
    }

    /// Types a single key: sends one report carrying `key` and `modifiers`,
    /// then the matching all-released report.
    pub fn press_and_release(&self, key: u8, modifiers: u8) -> Result<(), TransmitError> {
        self.with(|inner| inner.state.load_single(key, modifiers));
        self.send_keyboard_report()?;
        self.with(|inner| inner.state.load_single(0, 0));
        self.send_keyboard_report()
    }
}
