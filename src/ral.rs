//! Register access layer for the USB full-speed peripheral
//!
//! The layout follows the conventions of the `ral-registers` macros: every
//! register is a field of a register block, and every register field is a
//! module exporting `offset`, `mask`, and the `R` / `W` / `RW` value modules.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Defines a RAL field module
///
/// Named values, if any, land in the field's `RW` module.
macro_rules! field {
    ($name:ident, $ty:ty, $offset:expr, $width:expr $(, { $($value:ident = $bits:expr),+ $(,)? })?) => {
        pub mod $name {
            pub const offset: $ty = $offset;
            pub const mask: $ty = (<$ty>::MAX >> (<$ty>::BITS - $width)) << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {
                $($(pub const $value: $ty = $bits;)+)?
            }
        }
    };
}

/// A register whose fields mix read / write, clear-on-zero, and
/// toggle-on-one semantics
///
/// Only EPnR and ISTR behave this way. Use [`crate::register::update`] to
/// compute writes into endpoint registers.
///
/// Under test, writes pass through a model of the hardware, so the register
/// holds what the silicon would hold.
#[repr(transparent)]
pub struct MixedRegister<const RW: u32, const CLEAR: u32, const TOGGLE: u32>(
    crate::vcell::VCell<u32>,
);

impl<const RW: u32, const CLEAR: u32, const TOGGLE: u32> MixedRegister<RW, CLEAR, TOGGLE> {
    pub fn read(&self) -> u32 {
        self.0.read()
    }

    #[cfg(not(test))]
    pub fn write(&self, value: u32) {
        self.0.write(value)
    }

    #[cfg(test)]
    pub fn write(&self, value: u32) {
        let current = self.0.read();
        self.0
            .write(crate::register::hardware(current, value, RW, CLEAR, TOGGLE));
    }

    /// Simulates a hardware-side change of the register
    #[cfg(test)]
    pub fn set(&self, value: u32) {
        self.0.write(value)
    }
}

pub mod usb {
    use super::MixedRegister;
    use crate::register::{CLEAR_ON_ZERO, READ_WRITE, TOGGLE};
    use crate::vcell::VCell;

    /// Endpoint registers EP0R through EP7R
    pub type EndpointRegister = MixedRegister<READ_WRITE, CLEAR_ON_ZERO, TOGGLE>;

    /// Interrupt status register; the event flags are cleared by writing zero
    pub type StatusRegister = MixedRegister<0, 0x7F80, 0>;

    #[repr(C)]
    pub struct RegisterBlock {
        pub EPR: [EndpointRegister; 8],
        _reserved0: [u32; 8],
        pub CNTR: VCell<u32>,
        pub ISTR: StatusRegister,
        pub FNR: VCell<u32>,
        pub DADDR: VCell<u32>,
        pub BTABLE: VCell<u32>,
        pub LPMCSR: VCell<u32>,
        pub BCDR: VCell<u32>,
    }

    pub type Instance = &'static RegisterBlock;

    /// USB register block address on STM32G4 processors
    pub const ADDRESS: usize = 0x4000_5C00;

    pub mod EPR {
        field!(CTR_RX, u32, 15, 1);
        field!(DTOG_RX, u32, 14, 1);
        field!(STAT_RX, u32, 12, 2, { Disabled = 0, Stall = 1, Nak = 2, Valid = 3 });
        field!(SETUP, u32, 11, 1);
        field!(EP_TYPE, u32, 9, 2, { Bulk = 0, Control = 1, Isochronous = 2, Interrupt = 3 });
        field!(EP_KIND, u32, 8, 1);
        field!(CTR_TX, u32, 7, 1);
        field!(DTOG_TX, u32, 6, 1);
        field!(STAT_TX, u32, 4, 2, { Disabled = 0, Stall = 1, Nak = 2, Valid = 3 });
        field!(EA, u32, 0, 4);
    }

    pub mod CNTR {
        field!(CTRM, u32, 15, 1);
        field!(PMAOVRM, u32, 14, 1);
        field!(ERRM, u32, 13, 1);
        field!(WKUPM, u32, 12, 1);
        field!(SUSPM, u32, 11, 1);
        field!(RESETM, u32, 10, 1);
        field!(SOFM, u32, 9, 1);
        field!(ESOFM, u32, 8, 1);
        field!(L1REQM, u32, 7, 1);
        field!(L1RESUME, u32, 5, 1);
        field!(RESUME, u32, 4, 1);
        field!(FSUSP, u32, 3, 1);
        field!(LP_MODE, u32, 2, 1);
        field!(PDWN, u32, 1, 1);
        field!(FRES, u32, 0, 1);
    }

    pub mod ISTR {
        field!(CTR, u32, 15, 1);
        field!(PMAOVR, u32, 14, 1);
        field!(ERR, u32, 13, 1);
        field!(WKUP, u32, 12, 1);
        field!(SUSP, u32, 11, 1);
        field!(RESET, u32, 10, 1);
        field!(SOF, u32, 9, 1);
        field!(ESOF, u32, 8, 1);
        field!(L1REQ, u32, 7, 1);
        field!(DIR, u32, 4, 1);
        field!(EP_ID, u32, 0, 4);
    }

    pub mod FNR {
        field!(RXDP, u32, 15, 1);
        field!(RXDM, u32, 14, 1);
        field!(LCK, u32, 13, 1);
        field!(LSOF, u32, 11, 2);
        field!(FN, u32, 0, 11);
    }

    pub mod DADDR {
        field!(EF, u32, 7, 1);
        field!(ADD, u32, 0, 7);
    }

    pub mod BTABLE {
        field!(BTABLE, u32, 3, 13);
    }

    pub mod BCDR {
        field!(DPPU, u32, 15, 1);
    }
}

pub struct Instances {
    pub usb: usb::Instance,
    pub pma: crate::pma::Instance,
}

/// Converts the addresses from `Peripherals` into register block references
pub fn instances<P: crate::Peripherals>(peripherals: P) -> Instances {
    // Safety: the implementer of Peripherals promises that the addresses
    // point at the USB registers and packet memory, and that it owns them.
    unsafe {
        Instances {
            usb: &*(peripherals.usb() as *const usb::RegisterBlock),
            pma: &*(peripherals.packet_memory() as *const crate::pma::PacketMemory),
        }
    }
}
