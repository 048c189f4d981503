//! A USB full-speed device engine for STM32G4 processors
//!
//! `stm32g4-usbd` drives the STM32G4 USB peripheral as a complete USB
//! device. It enumerates with the host, answers the standard control requests,
//! shares the peripheral's packet memory among endpoints, and streams transfers
//! larger than one packet. You supply a [`Class`] that describes the device,
//! and handles class requests and endpoint data.
//!
//! To interface the library, you must define a safe implementation of [`Peripherals`].
//! See the peripherals documentation for more information.
//!
//! # Usage
//!
//! 1. Enable the USB clock (48 MHz), and configure the USB pins.
//! 2. Create a [`Device`] from your `Peripherals` and your `Class`.
//! 3. Call [`initialize()`](Device::initialize) once. This is where endpoint
//!    declarations that don't fit into packet memory are reported, before the
//!    host can see the device.
//! 4. Call [`interrupt()`](Device::interrupt) from the `USB_LP` interrupt handler.
//!    Call [`data_interrupt()`](Device::data_interrupt) from the `USB_HP` handler,
//!    if you use it.
//!
//! The engine does not enable the interrupts in the NVIC.
//!
//! ```no_run
//! use core::cell::RefCell;
//! use cortex_m::interrupt::Mutex;
//! use stm32g4_usbd::{Class, Device, DeviceDescriptor, Peripherals};
//!
//! struct Instances;
//!
//! unsafe impl Peripherals for Instances {
//!     fn usb(&self) -> *const () {
//!         stm32g4_usbd::USB_ADDRESS as _
//!     }
//!     fn packet_memory(&self) -> *const () {
//!         stm32g4_usbd::PACKET_MEMORY_ADDRESS as _
//!     }
//! }
//!
//! struct Vendor;
//!
//! static CONFIGURATION: [u8; 9] = [9, 2, 9, 0, 0, 1, 0, 0x80, 50];
//!
//! impl Class<'static> for Vendor {
//!     fn device_descriptor(&self) -> DeviceDescriptor {
//!         DeviceDescriptor::new(0x0483, 0x5740)
//!     }
//!     fn configuration_descriptor(&self) -> &'static [u8] {
//!         &CONFIGURATION
//!     }
//! }
//!
//! static DEVICE: Mutex<RefCell<Option<Device<'static, Vendor>>>> = Mutex::new(RefCell::new(None));
//!
//! let mut device = Device::new(Instances, Vendor);
//! device.initialize().unwrap();
//! cortex_m::interrupt::free(|cs| *DEVICE.borrow(cs).borrow_mut() = Some(device));
//!
//! // In the USB_LP interrupt handler:
//! cortex_m::interrupt::free(|cs| {
//!     if let Some(device) = DEVICE.borrow(cs).borrow_mut().as_mut() {
//!         device.interrupt();
//!     }
//! });
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;
#[macro_use]
mod ral;

mod buffer;
mod class;
mod descriptor;
mod device;
mod driver;
mod endpoint;
mod interrupt;
mod pma;
mod register;
mod setup;
mod transfer;
mod vcell;

#[cfg(test)]
mod testing;

pub use class::{Class, EndpointConfig, Response};
pub use descriptor::{compose, DeviceDescriptor};
pub use device::{Device, State};
pub use driver::Bus;
pub use interrupt::Interrupts;
pub use setup::{Recipient, RequestKind, SetupPacket};

/// Eight endpoints, two directions
const ENDPOINT_COUNT: usize = 8;

/// The control endpoint's max packet size
pub const CONTROL_PACKET_SIZE: u16 = 64;

/// USB register block address
pub const USB_ADDRESS: usize = ral::usb::ADDRESS;

/// USB packet memory address
pub const PACKET_MEMORY_ADDRESS: usize = pma::ADDRESS;

/// A type that owns the USB peripheral
///
/// An implementation of `Peripherals` is expected to own
///
/// - the USB registers
/// - the USB packet memory
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the USB registers and packet memory. The pointers returned by
/// the methods are assumed to be valid, and will be cast to a register
/// definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` that works with the
/// `stm32g4` peripheral access crate.
///
/// ```
/// # mod stm32g4 { pub mod stm32g474 {
/// #   pub struct USB; impl USB { pub const PTR: *const () = 0x4000_5C00 as _; }
/// #   pub struct Peripherals { pub USB: USB }
/// #   impl Peripherals { pub fn take() -> Option<Self> { Some(Peripherals { USB: USB }) } }
/// # } }
/// use stm32g4::stm32g474 as pac;
/// use stm32g4_usbd::Peripherals;
///
/// struct Usb(pac::USB);
///
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         pac::USB::PTR as _
///     }
///     fn packet_memory(&self) -> *const () {
///         stm32g4_usbd::PACKET_MEMORY_ADDRESS as _
///     }
/// }
///
/// let usb = Usb(pac::Peripherals::take().unwrap().USB);
/// assert_eq!(usb.usb(), 0x4000_5C00 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB registers
    fn usb(&self) -> *const ();
    /// Returns the address of the USB packet memory
    fn packet_memory(&self) -> *const ();
    /// Waits for the transceiver to start after leaving power down
    ///
    /// The transceiver needs 1us. The default busy-waits 170 cycles, which
    /// covers the fastest STM32G4 core clock.
    fn startup_delay() {
        cortex_m::asm::delay(170);
    }
}
