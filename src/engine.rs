//! Main-loop key event engine: matrix snapshots in, report state changes
//! out.
//!
//! The engine owns its collaborators — matrix scanner, layout table, status
//! LEDs and the debounce delay — and shares the [`UsbKeyboard`] with the
//! interrupt layer. One [`KeyEventEngine::poll`] is one scan cycle; the
//! cycle rate is also the report cadence, so a report goes out every cycle
//! whether or not anything changed.

use embedded_hal::delay::DelayNs;
use fugit::MillisDurationU32;
use packed_struct::PackedStruct;

use crate::bus::UsbDriver;
use crate::keyboard::UsbKeyboard;
use crate::state::{KeyboardState, LedReport};

/// Scan-to-scan settling delay. Flat, not adaptive.
pub const DEFAULT_DEBOUNCE: MillisDurationU32 = MillisDurationU32::from_ticks(5);

/// The electrical matrix scanner.
pub trait KeyMatrix<const ROWS: usize, const COLS: usize> {
    /// Overwrites `grid` with the pressed state of every cell.
    fn refresh(&mut self, grid: &mut [[bool; COLS]; ROWS]);
}

/// The `(mode, row, column)` binding table.
pub trait Layout<const ROWS: usize, const COLS: usize> {
    /// Resolves one cell: high byte is the modifier mask applied while the
    /// key is held, low byte is the key code. 0 means no binding.
    fn lookup(&self, mode: u8, row: usize, col: usize) -> u16;
}

/// The indicator LED driver; one entry point per indicator.
pub trait StatusLeds {
    fn num_lock(&mut self, on: bool);
    fn caps_lock(&mut self, on: bool);
    fn scroll_lock(&mut self, on: bool);
    fn compose(&mut self, on: bool);
    fn kana(&mut self, on: bool);
}

/// Matrix cells wired to the mode selector: one cell toggles the sticky
/// mode bit, two momentary cells force mode 1 while held. The momentary
/// override wins for the cycle only; it is not latched.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeSelector {
    pub toggle: (usize, usize),
    pub momentary: [(usize, usize); 2],
}

/// The main-loop state machine.
pub struct KeyEventEngine<'a, D, M, L, S, T, const ROWS: usize, const COLS: usize>
where
    D: UsbDriver,
    M: KeyMatrix<ROWS, COLS>,
    L: Layout<ROWS, COLS>,
    S: StatusLeds,
    T: DelayNs,
{
    keyboard: &'a UsbKeyboard<D>,
    matrix: M,
    layout: L,
    leds: S,
    delay: T,
    selector: ModeSelector,
    debounce: MillisDurationU32,
    // ping-pong snapshot pair; swapping the index replaces a grid copy
    snapshots: [[[bool; COLS]; ROWS]; 2],
    current: usize,
    sticky_mode: u8,
}

impl<'a, D, M, L, S, T, const ROWS: usize, const COLS: usize>
    KeyEventEngine<'a, D, M, L, S, T, ROWS, COLS>
where
    D: UsbDriver,
    M: KeyMatrix<ROWS, COLS>,
    L: Layout<ROWS, COLS>,
    S: StatusLeds,
    T: DelayNs,
{
    pub fn new(
        keyboard: &'a UsbKeyboard<D>,
        matrix: M,
        layout: L,
        leds: S,
        delay: T,
        selector: ModeSelector,
    ) -> Self {
        Self {
            keyboard,
            matrix,
            layout,
            leds,
            delay,
            selector,
            debounce: DEFAULT_DEBOUNCE,
            snapshots: [[[false; COLS]; ROWS]; 2],
            current: 0,
            sticky_mode: 0,
        }
    }

    pub fn set_debounce(&mut self, debounce: MillisDurationU32) {
        self.debounce = debounce;
    }

    /// Runs one scan cycle.
    pub fn poll(&mut self) {
        self.current ^= 1;
        let (first, second) = self.snapshots.split_at_mut(1);
        let (current, previous) = if self.current == 0 {
            (&mut first[0], &second[0])
        } else {
            (&mut second[0], &first[0])
        };
        self.matrix.refresh(current);

        let (toggle_row, toggle_col) = self.selector.toggle;
        if current[toggle_row][toggle_col] && !previous[toggle_row][toggle_col] {
            self.sticky_mode ^= 2;
        }
        let mut mode = self.sticky_mode;
        for &(row, col) in &self.selector.momentary {
            if current[row][col] {
                mode = 1;
            }
        }

        for row in 0..ROWS {
            for col in 0..COLS {
                let is_pressed = current[row][col];
                if is_pressed == previous[row][col] {
                    continue;
                }
                let binding = self.layout.lookup(mode, row, col);
                let code = (binding & 0xFF) as u8;
                if code == 0 {
                    continue;
                }
                let layer_mask = (binding >> 8) as u8;
                if KeyboardState::modifier_bit(code).is_some() {
                    self.keyboard
                        .with(|inner| inner.state.set_direct_modifier(code, is_pressed));
                } else if is_pressed {
                    let was_held = self.keyboard.with(|inner| {
                        inner.state.set_layer_modifiers(layer_mask);
                        inner.state.clear_key(code)
                    });
                    if was_held {
                        // re-press of a held code: the host must observe the
                        // release before the slot refills
                        let _ = self.keyboard.send_keyboard_report();
                    }
                    // on overflow the press is dropped; the earliest six win
                    let _ = self.keyboard.with(|inner| inner.state.insert_key(code));
                } else {
                    self.keyboard.with(|inner| {
                        inner.state.clear_key(code);
                        if !inner.state.any_key_held() {
                            // the last key's modifier context holds until
                            // every key is released
                            inner.state.set_layer_modifiers(0);
                        }
                    });
                }
            }
        }

        // the loop rate is the report cadence; send even when nothing changed
        let _ = self.keyboard.send_keyboard_report();
        let _ = self.keyboard.send_consumer_report();

        self.delay.delay_ms(self.debounce.to_millis());

        if let Ok(report) = LedReport::unpack(&[self.keyboard.leds()]) {
            self.leds.num_lock(report.num_lock);
            self.leds.caps_lock(report.caps_lock);
            self.leds.scroll_lock(report.scroll_lock);
            self.leds.compose(report.compose);
            self.leds.kana(report.kana);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    use super::*;
    use crate::descriptor::KEYBOARD_ENDPOINT;
    use crate::test::FakeDriver;

    const ROWS: usize = 2;
    const COLS: usize = 6;

    // mode 0: plain letters, one layer-modified key, one direct modifier
    // mode 1: momentary figure layer
    // mode 2: sticky alternate layer
    #[rustfmt::skip]
    const LAYOUT: [[[u16; COLS]; ROWS]; 3] = [
        [[0x0004, 0x0005, 0x0206, 0x00E1, 0x0008, 0x0009],
         [0x000A, 0x000B, 0x000C, 0x0000, 0x0000, 0x0000]],
        [[0x001E, 0x001F, 0x0020, 0x00E1, 0x0021, 0x0022],
         [0x0023, 0x0024, 0x0025, 0x0000, 0x0000, 0x0000]],
        [[0x0014, 0x0015, 0x0016, 0x00E1, 0x0017, 0x0018],
         [0x0019, 0x001A, 0x001B, 0x0000, 0x0000, 0x0000]],
    ];

    // selector cells are unbound in every mode
    const SELECTOR: ModeSelector = ModeSelector {
        toggle: (1, 5),
        momentary: [(1, 3), (1, 4)],
    };

    struct TestMatrix {
        grid: Rc<RefCell<[[bool; COLS]; ROWS]>>,
    }

    impl KeyMatrix<ROWS, COLS> for TestMatrix {
        fn refresh(&mut self, grid: &mut [[bool; COLS]; ROWS]) {
            *grid = *self.grid.borrow();
        }
    }

    struct TestLayout;

    impl Layout<ROWS, COLS> for TestLayout {
        fn lookup(&self, mode: u8, row: usize, col: usize) -> u16 {
            LAYOUT[usize::from(mode.min(2))][row][col]
        }
    }

    #[derive(Default)]
    struct TestLeds {
        lit: Rc<RefCell<[bool; 5]>>,
    }

    impl StatusLeds for TestLeds {
        fn num_lock(&mut self, on: bool) {
            self.lit.borrow_mut()[0] = on;
        }
        fn caps_lock(&mut self, on: bool) {
            self.lit.borrow_mut()[1] = on;
        }
        fn scroll_lock(&mut self, on: bool) {
            self.lit.borrow_mut()[2] = on;
        }
        fn compose(&mut self, on: bool) {
            self.lit.borrow_mut()[3] = on;
        }
        fn kana(&mut self, on: bool) {
            self.lit.borrow_mut()[4] = on;
        }
    }

    struct NoopDelay;

    impl DelayNs for NoopDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    struct Fixture<'a> {
        engine: KeyEventEngine<'a, FakeDriver, TestMatrix, TestLayout, TestLeds, NoopDelay, ROWS, COLS>,
        grid: Rc<RefCell<[[bool; COLS]; ROWS]>>,
        lit: Rc<RefCell<[bool; 5]>>,
        keyboard: &'a UsbKeyboard<FakeDriver>,
    }

    impl<'a> Fixture<'a> {
        fn new(keyboard: &'a UsbKeyboard<FakeDriver>) -> Self {
            keyboard.with(|inner| inner.state.configuration = 1);
            let grid = Rc::new(RefCell::new([[false; COLS]; ROWS]));
            let leds = TestLeds::default();
            let lit = leds.lit.clone();
            let engine = KeyEventEngine::new(
                keyboard,
                TestMatrix { grid: grid.clone() },
                TestLayout,
                leds,
                NoopDelay,
                SELECTOR,
            );
            Self {
                engine,
                grid,
                lit,
                keyboard,
            }
        }

        fn set(&self, row: usize, col: usize, pressed: bool) {
            self.grid.borrow_mut()[row][col] = pressed;
        }

        fn last_report(&self) -> [u8; 8] {
            let reports = self.reports();
            *reports.last().expect("no keyboard report sent")
        }

        fn reports(&self) -> Vec<[u8; 8]> {
            self.keyboard.with(|inner| {
                inner
                    .driver
                    .endpoint_tx
                    .iter()
                    .filter(|(endpoint, _)| *endpoint == KEYBOARD_ENDPOINT)
                    .map(|(_, data)| {
                        let mut report = [0u8; 8];
                        report.copy_from_slice(data);
                        report
                    })
                    .collect()
            })
        }
    }

    #[test]
    fn simple_press_and_release() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        fixture.set(0, 0, true);
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0, 0, 0x04, 0, 0, 0, 0, 0]);

        fixture.set(0, 0, false);
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn direct_modifier_survives_key_release() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        fixture.set(0, 3, true); // left shift
        fixture.engine.poll();
        assert_eq!(fixture.last_report()[0], 0x02);

        fixture.set(0, 0, true);
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0x02, 0, 0x04, 0, 0, 0, 0, 0]);

        fixture.set(0, 0, false);
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0x02, 0, 0, 0, 0, 0, 0, 0]);

        fixture.set(0, 3, false);
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn layer_modifier_clears_only_when_all_keys_release() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        fixture.set(0, 2, true); // 0x0206: shift-bearing binding
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0x02, 0, 0x06, 0, 0, 0, 0, 0]);

        fixture.set(0, 2, false);
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), [0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn seventh_key_is_dropped_until_a_slot_frees() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        for (row, col) in [(0, 0), (0, 1), (0, 4), (0, 5), (1, 0), (1, 1)] {
            fixture.set(row, col, true);
        }
        fixture.engine.poll();
        let full = fixture.last_report();
        assert_eq!(&full[2..], &[0x04, 0x05, 0x08, 0x09, 0x0A, 0x0B]);

        fixture.set(1, 2, true); // seventh key
        fixture.engine.poll();
        assert_eq!(fixture.last_report(), full, "overflow press must not change slots");

        fixture.set(0, 1, false);
        fixture.set(1, 2, false);
        fixture.engine.poll();
        fixture.set(1, 2, true);
        fixture.engine.poll();
        assert_eq!(&fixture.last_report()[2..], &[0x04, 0x0C, 0x08, 0x09, 0x0A, 0x0B]);
    }

    #[test]
    fn momentary_cells_force_mode_one_unlatched() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        fixture.set(1, 4, true);
        fixture.set(0, 0, true);
        fixture.engine.poll();
        assert_eq!(fixture.last_report()[2], 0x1E, "mode 1 binding while held");

        fixture.set(0, 0, false);
        fixture.engine.poll();
        fixture.set(1, 4, false);
        fixture.engine.poll();
        fixture.set(0, 0, true);
        fixture.engine.poll();
        assert_eq!(fixture.last_report()[2], 0x04, "override not latched");
    }

    #[test]
    fn toggle_cell_flips_sticky_mode() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        fixture.set(1, 5, true);
        fixture.engine.poll();
        fixture.set(1, 5, false);
        fixture.engine.poll();

        fixture.set(0, 0, true);
        fixture.engine.poll();
        assert_eq!(fixture.last_report()[2], 0x14, "sticky alternate mode");

        fixture.set(0, 0, false);
        fixture.engine.poll();
        fixture.set(1, 5, true);
        fixture.engine.poll();
        fixture.set(1, 5, false);
        fixture.engine.poll();
        fixture.set(0, 0, true);
        fixture.engine.poll();
        assert_eq!(fixture.last_report()[2], 0x04, "toggled back");
    }

    #[test]
    fn host_leds_are_reflected_every_cycle() {
        let keyboard = UsbKeyboard::new(FakeDriver::new());
        let mut fixture = Fixture::new(&keyboard);

        keyboard.with(|inner| inner.state.leds = 0b0000_0101);
        fixture.engine.poll();
        assert_eq!(*fixture.lit.borrow(), [true, false, true, false, false]);

        keyboard.with(|inner| inner.state.leds = 0);
        fixture.engine.poll();
        assert_eq!(*fixture.lit.borrow(), [false; 5]);
    }
}
