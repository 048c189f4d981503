//! Setup packets

use usb_device::UsbDirection;

/// The request type's kind bits
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// The request type's recipient bits
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// The eight bytes that open a control transfer
///
/// The packet is copied out of packet memory as soon as it arrives, since the
/// same buffer receives the data stage.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const fn parse(raw: &[u8; 8]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.request_type, self.request, v0, v1, i0, i1, l0, l1]
    }

    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// The descriptor type of a `GET_DESCRIPTOR` request
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// The descriptor index of a `GET_DESCRIPTOR` request
    pub fn descriptor_index(&self) -> u8 {
        self.value as u8
    }
}
