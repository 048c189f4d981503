//! Descriptor helpers
//!
//! The engine knows the layout of the device descriptor, the header of the
//! configuration descriptor, and string descriptors. Everything else about
//! descriptors belongs to the class.

use usb_device::{descriptor::descriptor_type, UsbError};

/// The standard device descriptor
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceDescriptor {
    /// USB release, in binary-coded decimal (`0x0200`)
    pub usb_release: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release, in binary-coded decimal
    pub device_release: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub configurations: u8,
}

impl DeviceDescriptor {
    /// The size of this descriptor on the wire
    pub const SIZE: usize = 18;

    /// A USB 2.0 device that describes its classes per interface
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceDescriptor {
            usb_release: 0x0200,
            device_class: 0,
            device_sub_class: 0,
            device_protocol: 0,
            vendor_id,
            product_id,
            device_release: 0x0001,
            manufacturer: 0,
            product: 0,
            serial_number: 0,
            configurations: 1,
        }
    }

    /// Returns the wire representation of this descriptor
    ///
    /// The control endpoint's max packet size is always 64.
    pub fn bytes(&self) -> [u8; Self::SIZE] {
        let [usb0, usb1] = self.usb_release.to_le_bytes();
        let [vid0, vid1] = self.vendor_id.to_le_bytes();
        let [pid0, pid1] = self.product_id.to_le_bytes();
        let [rel0, rel1] = self.device_release.to_le_bytes();
        [
            Self::SIZE as u8,
            descriptor_type::DEVICE,
            usb0,
            usb1,
            self.device_class,
            self.device_sub_class,
            self.device_protocol,
            crate::CONTROL_PACKET_SIZE as u8,
            vid0,
            vid1,
            pid0,
            pid1,
            rel0,
            rel1,
            self.manufacturer,
            self.product,
            self.serial_number,
            self.configurations,
        ]
    }
}

/// Offset of `wTotalLength` within the configuration descriptor header
const TOTAL_LENGTH: usize = 2;
/// Offset of `bNumInterfaces` within the configuration descriptor header
pub(crate) const NUM_INTERFACES: usize = 4;
/// Offset of `bConfigurationValue` within the configuration descriptor header
pub(crate) const CONFIGURATION_VALUE: usize = 5;
/// Offset of `bmAttributes` within the configuration descriptor header
pub(crate) const ATTRIBUTES: usize = 7;
/// `bmAttributes` self-powered bit
pub(crate) const SELF_POWERED: u8 = 1 << 6;

/// Concatenates descriptor `parts` into `buffer`, forming one configuration
/// descriptor
///
/// The first part must be the configuration descriptor header; its
/// `wTotalLength` is set to the combined length. Returns that length.
///
/// Fails with `BufferOverflow` if `buffer` can't hold every part, and with
/// `ParseError` if the first part isn't a configuration descriptor header.
pub fn compose(buffer: &mut [u8], parts: &[&[u8]]) -> Result<usize, UsbError> {
    match parts.first() {
        Some(header)
            if header.len() > ATTRIBUTES
                && header[1] == descriptor_type::CONFIGURATION => {}
        Some(_) => return Err(UsbError::ParseError),
        None => return Ok(0),
    }

    let mut len = 0;
    for part in parts {
        let end = len + part.len();
        buffer
            .get_mut(len..end)
            .ok_or(UsbError::BufferOverflow)?
            .copy_from_slice(part);
        len = end;
    }

    let total = u16::try_from(len).map_err(|_| UsbError::BufferOverflow)?;
    buffer[TOTAL_LENGTH..TOTAL_LENGTH + 2].copy_from_slice(&total.to_le_bytes());
    Ok(len)
}

/// String descriptor zero, listing US English as the only language
pub(crate) const LANGUAGES: [u8; 4] = [4, descriptor_type::STRING, 0x09, 0x04];

/// Writes `text` as a UTF-16 string descriptor into `buffer`
///
/// Characters that don't fit into `buffer`, or beyond the descriptor's
/// 255 byte limit, are dropped. Returns the descriptor length.
pub(crate) fn string(buffer: &mut [u8], text: &str) -> usize {
    let limit = buffer.len().min(255) & !1;
    if limit < 2 {
        return 0;
    }
    let mut len = 2;
    let mut units = [0u16; 2];
    for ch in text.chars() {
        let encoded = ch.encode_utf16(&mut units);
        if len + 2 * encoded.len() > limit {
            break;
        }
        for unit in encoded.iter() {
            buffer[len..len + 2].copy_from_slice(&unit.to_le_bytes());
            len += 2;
        }
    }
    buffer[0] = len as u8;
    buffer[1] = descriptor_type::STRING;
    len
}
