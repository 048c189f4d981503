//! Endpoint register writes
//!
//! Each EPnR register mixes three kinds of fields:
//!
//! - read / write fields (`EP_TYPE`, `EP_KIND`, `EA`) take the written value.
//! - the `CTR_RX` and `CTR_TX` completion flags are cleared by writing 0, and
//!   left alone by writing 1.
//! - the `DTOG_*` and `STAT_*` bits flip when written 1, and stay when written 0.
//!
//! A plain read-modify-write would flip every toggle bit that's currently set,
//! and would acknowledge completions that we haven't handled. [`update`] computes
//! the one word to write so that only the masked fields change.

use usb_device::endpoint::EndpointType;

/// Read / write bits of EPnR
pub const READ_WRITE: u32 = 0x070F;
/// Bits of EPnR that are cleared by writing 0
pub const CLEAR_ON_ZERO: u32 = 0x8080;
/// Bits of EPnR that flip when writing 1
pub const TOGGLE: u32 = 0x7070;

/// Computes the EPnR write that sets the `mask`ed fields to `value`
///
/// `current` is the register's present value. Fields outside of `mask`
/// keep their value, and pending completion flags outside of `mask` stay
/// pending. Inside of `mask`, writing 0 to a completion flag clears it; writing
/// 1 leaves it unchanged.
pub const fn update(current: u32, value: u32, mask: u32) -> u32 {
    let value = value & mask;
    let clear = CLEAR_ON_ZERO & (!mask | value);
    let toggle = TOGGLE & mask & (current ^ value);
    let rw = READ_WRITE & ((current & !mask) | value);
    clear | toggle | rw
}

/// Models how the peripheral applies a write to a mixed register
#[cfg(test)]
pub const fn hardware(current: u32, written: u32, rw: u32, clear: u32, toggle: u32) -> u32 {
    let read_only = current & !(rw | clear | toggle);
    read_only | (written & rw) | (current & clear & written) | ((current ^ written) & toggle)
}

/// Endpoint transmit or receive status
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Status {
    /// All requests ignored
    Disabled = 0,
    /// Requests answered with STALL
    Stall = 1,
    /// Requests answered with NAK
    Nak = 2,
    /// Ready for a transaction
    Valid = 3,
}

impl Status {
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => Status::Disabled,
            1 => Status::Stall,
            2 => Status::Nak,
            _ => Status::Valid,
        }
    }
}

/// The `EP_TYPE` encoding of an endpoint type
pub const fn kind(kind: EndpointType) -> u32 {
    match kind {
        EndpointType::Bulk => 0,
        EndpointType::Control => 1,
        EndpointType::Isochronous { .. } => 2,
        EndpointType::Interrupt => 3,
    }
}
