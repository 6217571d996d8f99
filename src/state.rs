//! The one record shared between the key engine, the idle timer and the
//! control engine.
//!
//! [`KeyboardState`] is plain data plus the slot and modifier rules; it never
//! touches hardware. [`crate::keyboard::UsbKeyboard`] owns the single
//! instance behind a critical-section mutex, so everything here can assume
//! exclusive access.

use packed_struct::prelude::*;

use crate::descriptor::REPORT_ID_CONSUMER;

/// First of the eight dedicated modifier key codes (HID usage `0xE0`,
/// Left Control). The codes `0xE0..=0xE7` map to modifier bits 0..=7.
pub const MODIFIER_CODE_BASE: u8 = 0xE0;

/// Default idle rate: 125 × 4 ms = 500 ms, per the HID spec recommendation
/// for keyboards.
pub const DEFAULT_IDLE_CONFIG: u8 = 125;

const REPORT_PROTOCOL: u8 = 1;

/// A seventh simultaneous press found all six slots occupied; the new key is
/// dropped and the earliest six win.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverOverflow;

/// Host-controlled indicator state, written by `SET_REPORT` as a single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, PackedStruct)]
#[packed_struct(endian = "lsb", bit_numbering = "lsb0", size_bytes = "1")]
pub struct LedReport {
    #[packed_field(bits = "0")]
    pub num_lock: bool,
    #[packed_field(bits = "1")]
    pub caps_lock: bool,
    #[packed_field(bits = "2")]
    pub scroll_lock: bool,
    #[packed_field(bits = "3")]
    pub compose: bool,
    #[packed_field(bits = "4")]
    pub kana: bool,
}

/// Current report state plus the host-visible protocol settings.
pub struct KeyboardState {
    /// 0 until the host selects a configuration; gates all transmission.
    pub(crate) configuration: u8,
    /// Always `direct_modifiers ^ layer_modifiers`. The XOR makes a modifier
    /// held on the direct channel invertible by a layer binding carrying the
    /// same bit.
    modifier_byte: u8,
    direct_modifiers: u8,
    layer_modifiers: u8,
    keys: [u8; 6],
    pub(crate) leds: u8,
    /// Host-requested resend interval in 4 ms units; 0 disables idle resend.
    pub(crate) idle_config: u8,
    pub(crate) idle_count: u8,
    /// Boot vs report protocol. Stored only to be reported back; both use
    /// the same report layout.
    pub(crate) protocol: u8,
    pub(crate) consumer_key: u16,
    pub(crate) last_consumer_key: u16,
}

impl KeyboardState {
    pub const fn new() -> Self {
        Self {
            configuration: 0,
            modifier_byte: 0,
            direct_modifiers: 0,
            layer_modifiers: 0,
            keys: [0; 6],
            leds: 0,
            idle_config: DEFAULT_IDLE_CONFIG,
            idle_count: 0,
            protocol: REPORT_PROTOCOL,
            consumer_key: 0,
            last_consumer_key: 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configuration != 0
    }

    /// The modifier bit for one of the eight dedicated modifier key codes,
    /// or `None` for ordinary keys.
    pub fn modifier_bit(code: u8) -> Option<u8> {
        if (MODIFIER_CODE_BASE..=MODIFIER_CODE_BASE + 7).contains(&code) {
            Some(1 << (code & 7))
        } else {
            None
        }
    }

    /// Presses or releases one of the dedicated modifier keys.
    pub fn set_direct_modifier(&mut self, code: u8, pressed: bool) {
        let Some(bit) = Self::modifier_bit(code) else {
            return;
        };
        if pressed {
            self.direct_modifiers |= bit;
        } else {
            self.direct_modifiers &= !bit;
        }
        self.recompute_modifier_byte();
    }

    /// Replaces the layer-sourced modifier contribution (the high byte of
    /// the last ordinary key's layout value).
    pub fn set_layer_modifiers(&mut self, mask: u8) {
        self.layer_modifiers = mask;
        self.recompute_modifier_byte();
    }

    fn recompute_modifier_byte(&mut self) {
        self.modifier_byte = self.direct_modifiers ^ self.layer_modifiers;
    }

    pub fn modifier_byte(&self) -> u8 {
        self.modifier_byte
    }

    /// Clears the slot holding `code`, if any. Returns whether a slot was
    /// cleared — a press event uses this to decide whether the host must see
    /// a release before the re-press.
    pub fn clear_key(&mut self, code: u8) -> bool {
        if code == 0 {
            return false;
        }
        for slot in self.keys.iter_mut() {
            if *slot == code {
                *slot = 0;
                return true;
            }
        }
        false
    }

    /// Inserts `code` into the first empty slot. Slot order is significant:
    /// it decides which key the host sees first, and which press is dropped
    /// once all six slots are occupied.
    pub fn insert_key(&mut self, code: u8) -> Result<(), RolloverOverflow> {
        for slot in self.keys.iter_mut() {
            if *slot == 0 {
                *slot = code;
                return Ok(());
            }
        }
        Err(RolloverOverflow)
    }

    pub fn any_key_held(&self) -> bool {
        self.keys.iter().any(|&slot| slot != 0)
    }

    /// One-shot report contents, bypassing the slot rules. Used by
    /// [`crate::keyboard::UsbKeyboard::press_and_release`].
    pub(crate) fn load_single(&mut self, key: u8, modifiers: u8) {
        self.direct_modifiers = modifiers;
        self.layer_modifiers = 0;
        self.keys = [key, 0, 0, 0, 0, 0];
        self.recompute_modifier_byte();
    }

    /// The 8-byte boot keyboard report in wire order.
    pub fn keyboard_report(&self) -> [u8; 8] {
        let [a, b, c, d, e, f] = self.keys;
        [self.modifier_byte, 0, a, b, c, d, e, f]
    }

    /// The 3-byte consumer-control report in wire order.
    pub fn consumer_report(&self) -> [u8; 3] {
        let [lo, hi] = self.consumer_key.to_le_bytes();
        [REPORT_ID_CONSUMER, lo, hi]
    }
}

impl Default for KeyboardState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn held(state: &KeyboardState) -> usize {
        state.keys.iter().filter(|&&slot| slot != 0).count()
    }

    #[test]
    fn no_code_ever_occupies_two_slots() {
        let mut state = KeyboardState::new();
        let presses = [0x04, 0x05, 0x04, 0x06, 0x05, 0x04];
        for code in presses {
            state.clear_key(code);
            state.insert_key(code).unwrap();
            for probe in 1..=0x67u8 {
                let occurrences = state.keys.iter().filter(|&&slot| slot == probe).count();
                assert!(occurrences <= 1, "code {probe:#04X} duplicated");
            }
            assert!(held(&state) <= 6);
        }
    }

    #[test]
    fn seventh_press_is_dropped_until_a_slot_frees() {
        let mut state = KeyboardState::new();
        for code in 0x04..0x0A {
            state.insert_key(code).unwrap();
        }
        assert_eq!(state.insert_key(0x0A), Err(RolloverOverflow));
        assert_eq!(state.keyboard_report()[2..], [0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);

        assert!(state.clear_key(0x06));
        state.insert_key(0x0A).unwrap();
        assert_eq!(state.keyboard_report()[2..], [0x04, 0x05, 0x0A, 0x07, 0x08, 0x09]);
    }

    #[test]
    fn modifier_byte_is_always_the_xor_of_both_sources() {
        let mut state = KeyboardState::new();
        state.set_direct_modifier(0xE1, true); // left shift
        assert_eq!(state.modifier_byte(), 0x02);
        state.set_layer_modifiers(0x02); // same bit from a layer binding
        assert_eq!(state.modifier_byte(), 0x00, "layer bit inverts the held modifier");
        state.set_layer_modifiers(0x40);
        assert_eq!(state.modifier_byte(), 0x42);
        state.set_direct_modifier(0xE1, false);
        assert_eq!(state.modifier_byte(), 0x40);
    }

    #[test]
    fn direct_modifier_press_and_release_round_trip() {
        let mut state = KeyboardState::new();
        state.set_direct_modifier(0xE0, true);
        state.set_direct_modifier(0xE7, true);
        assert_eq!(state.modifier_byte(), 0x81);
        state.set_direct_modifier(0xE0, false);
        state.set_direct_modifier(0xE7, false);
        assert_eq!(state.modifier_byte(), 0x00);
    }

    #[test]
    fn modifier_bit_covers_exactly_the_dedicated_range() {
        assert_eq!(KeyboardState::modifier_bit(0xDF), None);
        assert_eq!(KeyboardState::modifier_bit(0xE0), Some(0x01));
        assert_eq!(KeyboardState::modifier_bit(0xE7), Some(0x80));
        assert_eq!(KeyboardState::modifier_bit(0xE8), None);
        assert_eq!(KeyboardState::modifier_bit(0xF0), None);
    }

    #[test]
    fn keyboard_report_layout_is_modifier_reserved_then_slots() {
        let mut state = KeyboardState::new();
        state.set_direct_modifier(0xE1, true);
        state.insert_key(0x04).unwrap();
        assert_eq!(state.keyboard_report(), [0x02, 0, 0x04, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn consumer_report_is_id_then_little_endian_code() {
        let mut state = KeyboardState::new();
        state.consumer_key = 0x029C;
        assert_eq!(state.consumer_report(), [REPORT_ID_CONSUMER, 0x9C, 0x02]);
    }

    #[test]
    fn led_report_unpacks_host_byte() {
        assert_eq!(
            LedReport::unpack(&[0b0000_0101]),
            Ok(LedReport {
                num_lock: true,
                caps_lock: false,
                scroll_lock: true,
                compose: false,
                kana: false,
            })
        );
    }
}
