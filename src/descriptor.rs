//! USB descriptor blobs and the request-selector table that serves them.
//!
//! Everything here is immutable data: the device descriptor, one
//! configuration descriptor covering the two HID interfaces (boot keyboard
//! and consumer control), their report descriptors and the string
//! descriptors. The control engine serves these verbatim; nothing is built
//! at runtime.

use crate::bus::{EndpointConfig, TransferType};

pub(crate) const VENDOR_ID: u16 = 0x1D50; // Openmoko, Inc.
pub(crate) const PRODUCT_ID: u16 = 0x6028; // community ergonomic keyboard

pub(crate) const ENDPOINT0_SIZE: usize = 32;

pub(crate) const KEYBOARD_INTERFACE: u8 = 0;
pub(crate) const CONSUMER_INTERFACE: u8 = 1;

pub(crate) const KEYBOARD_ENDPOINT: u8 = 1;
pub(crate) const CONSUMER_ENDPOINT: u8 = 2;
/// Highest endpoint number the peripheral supports for halt requests.
pub(crate) const MAX_ENDPOINT: u8 = 4;

/// Report ID carried as the first byte of every consumer-control report.
pub(crate) const REPORT_ID_CONSUMER: u8 = 3;

const DESCRIPTOR_TYPE_STRING: u8 = 3;

/// Control endpoint geometry, restored after every bus reset.
pub(crate) const CONTROL_ENDPOINT_CONFIG: EndpointConfig = EndpointConfig {
    number: 0,
    transfer_type: TransferType::Control,
    max_packet_size: ENDPOINT0_SIZE as u8,
    double_buffered: false,
};

/// Endpoint rows applied verbatim on `SET_CONFIGURATION`.
pub(crate) const ENDPOINT_CONFIGS: &[EndpointConfig] = &[
    EndpointConfig {
        number: KEYBOARD_ENDPOINT,
        transfer_type: TransferType::InterruptIn,
        max_packet_size: 8,
        double_buffered: true,
    },
    EndpointConfig {
        number: CONSUMER_ENDPOINT,
        transfer_type: TransferType::InterruptIn,
        max_packet_size: 8,
        double_buffered: true,
    },
];

/// Boot-protocol keyboard report: one modifier byte, one reserved byte, six
/// key-code slots in, one LED byte out.
///
/// Keyboard Protocol 1, HID 1.11 spec, Appendix B
#[rustfmt::skip]
pub const KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01,       // Usage Page (Generic Desktop),
    0x09, 0x06,       // Usage (Keyboard),
    0xA1, 0x01,       // Collection (Application),
    0x75, 0x01,       //   Report Size (1),
    0x95, 0x08,       //   Report Count (8),
    0x05, 0x07,       //   Usage Page (Key Codes),
    0x19, 0xE0,       //   Usage Minimum (224),
    0x29, 0xE7,       //   Usage Maximum (231),
    0x15, 0x00,       //   Logical Minimum (0),
    0x25, 0x01,       //   Logical Maximum (1),
    0x81, 0x02,       //   Input (Data, Variable, Absolute), ;Modifier byte
    0x95, 0x01,       //   Report Count (1),
    0x75, 0x08,       //   Report Size (8),
    0x81, 0x03,       //   Input (Constant),                 ;Reserved byte
    0x95, 0x05,       //   Report Count (5),
    0x75, 0x01,       //   Report Size (1),
    0x05, 0x08,       //   Usage Page (LEDs),
    0x19, 0x01,       //   Usage Minimum (1),
    0x29, 0x05,       //   Usage Maximum (5),
    0x91, 0x02,       //   Output (Data, Variable, Absolute), ;LED report
    0x95, 0x01,       //   Report Count (1),
    0x75, 0x03,       //   Report Size (3),
    0x91, 0x03,       //   Output (Constant),                 ;LED padding
    0x95, 0x06,       //   Report Count (6),
    0x75, 0x08,       //   Report Size (8),
    0x15, 0x00,       //   Logical Minimum (0),
    0x25, 0x68,       //   Logical Maximum (104),
    0x05, 0x07,       //   Usage Page (Key Codes),
    0x19, 0x00,       //   Usage Minimum (0),
    0x29, 0x68,       //   Usage Maximum (104),
    0x81, 0x00,       //   Input (Data, Array),
    0xC0,             // End Collection
];

/// Consumer-control report: report ID 3 followed by one 16-bit usage code.
#[rustfmt::skip]
pub const CONSUMER_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x0C,              // Usage Page (Consumer Devices)
    0x09, 0x01,              // Usage (Consumer Control)
    0xA1, 0x01,              // Collection (Application)
    0x85, REPORT_ID_CONSUMER, //   Report ID (3)
    0x15, 0x01,              //   Logical Minimum (0x1)
    0x26, 0x9C, 0x02,        //   Logical Maximum (0x29C)
    0x19, 0x01,              //   Usage Minimum (0x1)
    0x2A, 0x9C, 0x02,        //   Usage Maximum (0x29C)
    0x75, 0x10,              //   Report Size (16)
    0x95, 0x01,              //   Report Count (1)
    0x81, 0x00,              //   Input (Data, Array, Absolute)
    0xC0,                    // End Collection
];

#[rustfmt::skip]
const DEVICE_DESCRIPTOR: [u8; 18] = [
    18,                     // bLength
    1,                      // bDescriptorType
    0x00, 0x02,             // bcdUSB
    0,                      // bDeviceClass
    0,                      // bDeviceSubClass
    0,                      // bDeviceProtocol
    ENDPOINT0_SIZE as u8,   // bMaxPacketSize0
    (VENDOR_ID & 0xFF) as u8, (VENDOR_ID >> 8) as u8,   // idVendor
    (PRODUCT_ID & 0xFF) as u8, (PRODUCT_ID >> 8) as u8, // idProduct
    0x00, 0x01,             // bcdDevice
    1,                      // iManufacturer
    2,                      // iProduct
    0,                      // iSerialNumber
    1,                      // bNumConfigurations
];

const CONFIGURATION_DESCRIPTOR_LEN: usize = 9 + (9 + 9 + 7) * 2;
const KEYBOARD_HID_OFFSET: usize = 9 + 9;
const CONSUMER_HID_OFFSET: usize = 9 + (9 + 9 + 7) + 9;

#[rustfmt::skip]
const CONFIGURATION_DESCRIPTOR: [u8; CONFIGURATION_DESCRIPTOR_LEN] = [
    // configuration descriptor, USB spec 9.6.3
    9,                                  // bLength
    2,                                  // bDescriptorType
    CONFIGURATION_DESCRIPTOR_LEN as u8, 0, // wTotalLength
    2,                                  // bNumInterfaces
    1,                                  // bConfigurationValue
    0,                                  // iConfiguration
    0xC0,                               // bmAttributes
    50,                                 // bMaxPower

    // interface descriptor, USB spec 9.6.5
    9,                                  // bLength
    4,                                  // bDescriptorType
    KEYBOARD_INTERFACE,                 // bInterfaceNumber
    0,                                  // bAlternateSetting
    1,                                  // bNumEndpoints
    0x03,                               // bInterfaceClass (HID)
    0x01,                               // bInterfaceSubClass (Boot)
    0x01,                               // bInterfaceProtocol (Keyboard)
    0,                                  // iInterface
    // HID descriptor, HID 1.11 spec, section 6.2.1
    9,                                  // bLength
    0x21,                               // bDescriptorType
    0x11, 0x01,                         // bcdHID
    0,                                  // bCountryCode
    1,                                  // bNumDescriptors
    0x22,                               // bDescriptorType
    KEYBOARD_REPORT_DESCRIPTOR.len() as u8, 0, // wDescriptorLength
    // endpoint descriptor, USB spec 9.6.6
    7,                                  // bLength
    5,                                  // bDescriptorType
    KEYBOARD_ENDPOINT | 0x80,           // bEndpointAddress
    0x03,                               // bmAttributes (interrupt)
    8, 0,                               // wMaxPacketSize
    10,                                 // bInterval

    // interface descriptor, USB spec 9.6.5
    9,                                  // bLength
    4,                                  // bDescriptorType
    CONSUMER_INTERFACE,                 // bInterfaceNumber
    0,                                  // bAlternateSetting
    1,                                  // bNumEndpoints
    0x03,                               // bInterfaceClass (HID)
    0x00,                               // bInterfaceSubClass
    0x00,                               // bInterfaceProtocol
    0,                                  // iInterface
    // HID descriptor, HID 1.11 spec, section 6.2.1
    9,                                  // bLength
    0x21,                               // bDescriptorType
    0x11, 0x01,                         // bcdHID
    0,                                  // bCountryCode
    1,                                  // bNumDescriptors
    0x22,                               // bDescriptorType
    CONSUMER_REPORT_DESCRIPTOR.len() as u8, 0, // wDescriptorLength
    // endpoint descriptor, USB spec 9.6.6
    7,                                  // bLength
    5,                                  // bDescriptorType
    CONSUMER_ENDPOINT | 0x80,           // bEndpointAddress
    0x03,                               // bmAttributes (interrupt)
    8, 0,                               // wMaxPacketSize
    10,                                 // bInterval
];

/// Builds a UTF-16LE string descriptor from an ASCII source at compile time.
const fn string_descriptor<const N: usize>(text: &str) -> [u8; N] {
    let bytes = text.as_bytes();
    let mut out = [0u8; N];
    out[0] = N as u8;
    out[1] = DESCRIPTOR_TYPE_STRING;
    let mut i = 0;
    while i < bytes.len() {
        out[2 + 2 * i] = bytes[i];
        i += 1;
    }
    out
}

const LANGUAGE_US_ENGLISH: u16 = 0x0409;

const STRING_LANGUAGE: [u8; 4] = [4, DESCRIPTOR_TYPE_STRING, 0x09, 0x04];
const STRING_MANUFACTURER: [u8; 2 + 2 * 11] = string_descriptor("unspecified");
const STRING_PRODUCT: [u8; 2 + 2 * 24] = string_descriptor("Ergonomic split keyboard");

const fn slice_of(data: &'static [u8], offset: usize, len: usize) -> &'static [u8] {
    data.split_at(offset).1.split_at(len).0
}

/// One row of the descriptor table: an exact `(wValue, wIndex)` selector and
/// the blob it serves.
pub struct DescriptorEntry {
    value: u16,
    index: u16,
    data: &'static [u8],
}

/// Ordered descriptor table; first exact selector match wins. The HID class
/// descriptors are served out of the configuration blob rather than stored
/// twice.
pub const DESCRIPTOR_TABLE: &[DescriptorEntry] = &[
    DescriptorEntry {
        value: 0x0100,
        index: 0x0000,
        data: &DEVICE_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x0200,
        index: 0x0000,
        data: &CONFIGURATION_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x2100,
        index: KEYBOARD_INTERFACE as u16,
        data: slice_of(&CONFIGURATION_DESCRIPTOR, KEYBOARD_HID_OFFSET, 9),
    },
    DescriptorEntry {
        value: 0x2200,
        index: KEYBOARD_INTERFACE as u16,
        data: KEYBOARD_REPORT_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x2100,
        index: CONSUMER_INTERFACE as u16,
        data: slice_of(&CONFIGURATION_DESCRIPTOR, CONSUMER_HID_OFFSET, 9),
    },
    DescriptorEntry {
        value: 0x2200,
        index: CONSUMER_INTERFACE as u16,
        data: CONSUMER_REPORT_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x0300,
        index: 0x0000,
        data: &STRING_LANGUAGE,
    },
    DescriptorEntry {
        value: 0x0301,
        index: LANGUAGE_US_ENGLISH,
        data: &STRING_MANUFACTURER,
    },
    DescriptorEntry {
        value: 0x0302,
        index: LANGUAGE_US_ENGLISH,
        data: &STRING_PRODUCT,
    },
];

/// Resolves a `GET_DESCRIPTOR` selector to the blob to serve, or `None` when
/// the request must be stalled.
pub fn lookup(value: u16, index: u16) -> Option<&'static [u8]> {
    DESCRIPTOR_TABLE
        .iter()
        .find(|entry| entry.value == value && entry.index == index)
        .map(|entry| entry.data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_deterministic_for_every_entry() {
        for entry in DESCRIPTOR_TABLE {
            let first = lookup(entry.value, entry.index).unwrap();
            let second = lookup(entry.value, entry.index).unwrap();
            assert_eq!(first.as_ptr(), second.as_ptr());
            assert_eq!(first.len(), second.len());
        }
    }

    #[test]
    fn lookup_misses_resolve_to_none() {
        assert!(lookup(0x0400, 0x0000).is_none());
        assert!(lookup(0x2200, 0x0002).is_none());
        assert!(lookup(0x0303, LANGUAGE_US_ENGLISH).is_none());
    }

    #[test]
    fn configuration_total_length_is_self_describing() {
        let total = u16::from_le_bytes([CONFIGURATION_DESCRIPTOR[2], CONFIGURATION_DESCRIPTOR[3]]);
        assert_eq!(usize::from(total), CONFIGURATION_DESCRIPTOR.len());
        assert_eq!(CONFIGURATION_DESCRIPTOR[4], 2, "two interfaces");
    }

    #[test]
    fn hid_descriptors_reference_actual_report_lengths() {
        let keyboard_hid = lookup(0x2100, KEYBOARD_INTERFACE.into()).unwrap();
        assert_eq!(keyboard_hid.len(), 9);
        assert_eq!(keyboard_hid[0], 9);
        assert_eq!(keyboard_hid[1], 0x21);
        let len = u16::from_le_bytes([keyboard_hid[7], keyboard_hid[8]]);
        assert_eq!(usize::from(len), KEYBOARD_REPORT_DESCRIPTOR.len());

        let consumer_hid = lookup(0x2100, CONSUMER_INTERFACE.into()).unwrap();
        assert_eq!(consumer_hid[1], 0x21);
        let len = u16::from_le_bytes([consumer_hid[7], consumer_hid[8]]);
        assert_eq!(usize::from(len), CONSUMER_REPORT_DESCRIPTOR.len());
    }

    #[test]
    fn device_descriptor_advertises_control_packet_size() {
        let device = lookup(0x0100, 0).unwrap();
        assert_eq!(device.len(), 18);
        assert_eq!(usize::from(device[7]), ENDPOINT0_SIZE);
        assert_eq!(device[17], 1, "one configuration");
    }

    #[test]
    fn string_descriptors_are_utf16le() {
        let product = lookup(0x0302, LANGUAGE_US_ENGLISH).unwrap();
        assert_eq!(usize::from(product[0]), product.len());
        assert_eq!(product[1], DESCRIPTOR_TYPE_STRING);
        assert_eq!(&product[2..4], &[b'E', 0]);
    }
}
