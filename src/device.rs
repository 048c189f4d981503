//! USB device state, and the control pipe
//!
//! Every control transfer starts with a setup packet on endpoint 0. The
//! device answers the standard requests itself, and forwards class and vendor
//! requests to the [`Class`]. The control pipe moves through
//!
//! ```text
//! setup -> [IN data -> OUT status] | [OUT data -> IN status] | [IN status]
//! ```
//!
//! and any new setup packet abandons the transfer in progress.

use crate::{
    class::{self, Class, Response},
    descriptor,
    driver::Bus,
    ral,
    register::Status,
    setup::{Recipient, RequestKind, SetupPacket},
    Peripherals, CONTROL_PACKET_SIZE,
};
use usb_device::{control::Request, descriptor::descriptor_type, UsbDirection, UsbError};

/// Longest host-to-device data stage that the device buffers
const CONTROL_BUFFER_SIZE: usize = 128;

/// Interfaces that track an alternate setting
const MAX_INTERFACES: usize = 8;

/// USB device state
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    /// After a bus reset; the device answers at address 0
    Default,
    /// The host assigned an address
    Addressed,
    /// The host selected the configuration; data endpoints are live
    Configured,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Control {
    Idle,
    DataIn,
    DataOut,
    StatusIn,
    /// The class asked for a retry
    Busy,
}

/// The request fails with a STALL handshake
struct Stall;

enum Handled {
    /// An IN data stage is underway
    Data,
    /// Send the status stage
    Status,
    /// Answer with NAK until the class decides
    Busy,
}

type Outcome = Result<Handled, Stall>;

fn expect(setup: &SetupPacket, direction: UsbDirection) -> Result<(), Stall> {
    if setup.direction() == direction {
        Ok(())
    } else {
        Err(Stall)
    }
}

/// A USB device
///
/// The device owns the USB peripheral, and your [`Class`]. Once
/// [`initialize`](Device::initialize)d, it's driven entirely from the USB
/// interrupt; see [`interrupt`](Device::interrupt).
pub struct Device<'a, C> {
    pub(crate) usb: ral::usb::Instance,
    pub(crate) bus: Bus<'a>,
    pub(crate) class: C,
    startup: fn(),
    state: State,
    address: u8,
    /// SET_ADDRESS takes effect after its status stage
    pending_address: Option<u8>,
    configuration: u8,
    remote_wakeup: bool,
    suspended: bool,
    alternates: [u8; MAX_INTERFACES],
    control: Control,
    setup: SetupPacket,
    data: [u8; CONTROL_BUFFER_SIZE],
    data_len: usize,
}

impl<'a, C: Class<'a>> Device<'a, C> {
    /// Create a device that drives the USB peripheral for `class`
    ///
    /// Creation only captures the peripheral. Call
    /// [`initialize`](Device::initialize) next.
    pub fn new<P: Peripherals>(peripherals: P, class: C) -> Self {
        let ral::Instances { usb, pma } = ral::instances(peripherals);
        Device {
            usb,
            bus: Bus::new(usb, pma),
            class,
            startup: P::startup_delay,
            state: State::Default,
            address: 0,
            pending_address: None,
            configuration: 0,
            remote_wakeup: false,
            suspended: false,
            alternates: [0; MAX_INTERFACES],
            control: Control::Idle,
            setup: SetupPacket::default(),
            data: [0; CONTROL_BUFFER_SIZE],
            data_len: 0,
        }
    }

    /// Powers the peripheral, and connects to the host
    ///
    /// The class's endpoints are placed in packet memory before the pull-up
    /// turns on. If they don't fit, this returns the error, and the host never
    /// sees the device.
    pub fn initialize(&mut self) -> Result<(), UsbError> {
        // Leave power down, and hold the reset while the transceiver starts
        ral::write_reg!(ral::usb, self.usb, CNTR, FRES: 1);
        (self.startup)();
        ral::write_reg!(ral::usb, self.usb, CNTR, 0);
        ral::write_reg!(ral::usb, self.usb, ISTR, 0);

        self.bus.reset();
        for config in self.class.endpoints() {
            self.bus.configure_endpoint(config)?;
        }

        let interrupts = self.bus.interrupts();
        self.bus.set_interrupts(interrupts);
        ral::modify_reg!(ral::usb, self.usb, BCDR, DPPU: 1);
        debug!("Initialized; interrupts {:?}", interrupts);
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The device address; 0 until the host assigns one
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The selected configuration; 0 when not configured
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Indicates if the host allowed remote wakeup
    pub fn is_remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Indicates if the host halted one direction of an endpoint
    pub fn is_halted(&self, endpoint: u8, direction: UsbDirection) -> bool {
        self.bus.is_halted(usize::from(endpoint & 0x7F), direction)
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    pub fn bus(&self) -> &Bus<'a> {
        &self.bus
    }

    /// Runs `f` with the class and the bus, so that code outside of the
    /// class's callbacks can send data
    ///
    /// Call this with the USB interrupt masked.
    pub fn with_class<R>(&mut self, f: impl FnOnce(&mut C, &mut Bus<'a>) -> R) -> R {
        f(&mut self.class, &mut self.bus)
    }

    /// Returns to the default state after a bus reset
    pub(crate) fn bus_reset(&mut self) {
        self.bus.reset();
        for config in self.class.endpoints() {
            // initialize() already reported declarations that don't fit
            if self.bus.configure_endpoint(config).is_err() {
                warn!("EP{} declaration failed", config.number);
            }
        }
        self.bus.retry_on_sof(false);
        self.state = State::Default;
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.remote_wakeup = false;
        self.suspended = false;
        self.alternates = [0; MAX_INTERFACES];
        self.control = Control::Idle;
        self.data_len = 0;
    }

    pub(crate) fn suspend(&mut self) {
        self.suspended = true;
        self.class.suspend();
    }

    pub(crate) fn resume(&mut self) {
        if self.suspended {
            self.suspended = false;
            self.class.resume();
        }
    }

    /// A setup packet arrived on endpoint 0
    pub(crate) fn on_setup(&mut self) {
        let setup = self.bus.read_setup();
        trace!("SETUP {:?}", setup);
        let direction = setup.direction();
        self.bus.begin_control(if direction == UsbDirection::In {
            setup.length
        } else {
            0
        });
        self.setup = setup;
        self.data_len = 0;
        self.pending_address = None;

        if direction == UsbDirection::Out && setup.length > 0 {
            if usize::from(setup.length) > CONTROL_BUFFER_SIZE {
                warn!("Control data stage of {} bytes is too long", setup.length);
                self.respond(Err(Stall));
            } else {
                self.bus.retry_on_sof(false);
                self.control = Control::DataOut;
                self.bus.control_status(Status::Valid, Status::Nak);
            }
            return;
        }

        let outcome = self.dispatch();
        self.respond(outcome);
    }

    /// An OUT transaction completed on endpoint 0
    pub(crate) fn on_control_out(&mut self) {
        match self.control {
            Control::DataOut => {
                let len = self.bus.receive(0);
                let expected = usize::from(self.setup.length);
                let end = (self.data_len + len).min(expected);
                self.bus.fetch(0, &mut self.data[self.data_len..end]);
                self.data_len = end;
                if end == expected || len < usize::from(CONTROL_PACKET_SIZE) {
                    let outcome = self.dispatch();
                    self.respond(outcome);
                } else {
                    self.bus.rearm(0);
                }
            }
            Control::DataIn => {
                // Status stage; the host may end the data stage early
                self.bus.receive(0);
                self.bus.end_control();
                self.control = Control::Idle;
            }
            _ => {
                self.bus.receive(0);
            }
        }
    }

    /// An IN transaction completed on endpoint 0
    pub(crate) fn on_control_in(&mut self) {
        self.bus.clear_tx_complete(0);
        match self.control {
            Control::DataIn => {
                if self.bus.acknowledge(0).is_some() {
                    self.bus.finish(0);
                }
            }
            Control::StatusIn => {
                self.control = Control::Idle;
                if let Some(address) = self.pending_address.take() {
                    self.bus.set_address(address);
                    self.address = address;
                    self.state = if address == 0 {
                        State::Default
                    } else {
                        State::Addressed
                    };
                    debug!("Address {}", address);
                }
            }
            _ => {}
        }
    }

    /// Asks the class again about a request it was busy for
    pub(crate) fn retry(&mut self) {
        if self.control == Control::Busy {
            let outcome = self.dispatch();
            self.respond(outcome);
        }
    }

    fn respond(&mut self, outcome: Outcome) {
        self.bus
            .retry_on_sof(matches!(outcome, Ok(Handled::Busy)));
        match outcome {
            Ok(Handled::Data) => {
                self.control = Control::DataIn;
                self.bus.control_status(Status::Valid, Status::Valid);
            }
            Ok(Handled::Status) => {
                self.control = Control::StatusIn;
                self.bus.send_status();
            }
            Ok(Handled::Busy) => {
                self.control = Control::Busy;
                self.bus.control_status(Status::Nak, Status::Nak);
            }
            Err(Stall) => {
                debug!("STALL {:?}", self.setup);
                self.control = Control::Idle;
                self.pending_address = None;
                self.bus.control_status(Status::Stall, Status::Stall);
            }
        }
    }

    fn dispatch(&mut self) -> Outcome {
        let setup = self.setup;
        match (setup.kind(), setup.recipient()) {
            (RequestKind::Standard, Recipient::Device) => self.device_request(&setup),
            (RequestKind::Standard, Recipient::Interface) => self.interface_request(&setup),
            (RequestKind::Standard, Recipient::Endpoint) => self.endpoint_request(&setup),
            (RequestKind::Class | RequestKind::Vendor, _) if self.state != State::Default => {
                self.class_request(&setup)
            }
            _ => Err(Stall),
        }
    }

    fn reply(&mut self, data: &[u8]) -> Outcome {
        self.bus.reply(data).map_err(|_| Stall)?;
        Ok(Handled::Data)
    }

    fn device_request(&mut self, setup: &SetupPacket) -> Outcome {
        match (setup.request, self.state) {
            (Request::GET_DESCRIPTOR, _) => {
                expect(setup, UsbDirection::In)?;
                self.get_descriptor(setup)
            }
            (Request::SET_ADDRESS, State::Default | State::Addressed) => {
                expect(setup, UsbDirection::Out)?;
                if setup.value > 127 || setup.index != 0 {
                    return Err(Stall);
                }
                self.pending_address = Some(setup.value as u8);
                Ok(Handled::Status)
            }
            (_, State::Default) => Err(Stall),
            (Request::GET_STATUS, _) => {
                expect(setup, UsbDirection::In)?;
                let mut status: u16 = 0;
                if class::self_powered(self.class.configuration_descriptor()) {
                    status |= 1;
                }
                if self.remote_wakeup {
                    status |= 1 << 1;
                }
                self.reply(&status.to_le_bytes())
            }
            (Request::CLEAR_FEATURE | Request::SET_FEATURE, _) => {
                expect(setup, UsbDirection::Out)?;
                if setup.value != Request::FEATURE_DEVICE_REMOTE_WAKEUP {
                    return Err(Stall);
                }
                self.remote_wakeup = setup.request == Request::SET_FEATURE;
                Ok(Handled::Status)
            }
            (Request::GET_CONFIGURATION, _) => {
                expect(setup, UsbDirection::In)?;
                let configuration = self.configuration;
                self.reply(&[configuration])
            }
            (Request::SET_CONFIGURATION, _) => {
                expect(setup, UsbDirection::Out)?;
                self.set_configuration(setup.value)
            }
            // SET_DESCRIPTOR, and anything unknown
            _ => Err(Stall),
        }
    }

    fn set_configuration(&mut self, value: u16) -> Outcome {
        let configuration =
            class::configuration_value(self.class.configuration_descriptor());
        if value == 0 {
            self.configuration = 0;
            self.state = State::Addressed;
            self.bus.configure(false);
        } else if value == u16::from(configuration) {
            self.configuration = configuration;
            self.state = State::Configured;
            self.alternates = [0; MAX_INTERFACES];
            self.bus.configure(true);
        } else {
            return Err(Stall);
        }
        debug!("Configuration {}", value);
        Ok(Handled::Status)
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> Outcome {
        match setup.descriptor_type() {
            descriptor_type::DEVICE => {
                let bytes = self.class.device_descriptor().bytes();
                self.reply(&bytes)
            }
            descriptor_type::CONFIGURATION if setup.descriptor_index() == 0 => {
                let configuration = self.class.configuration_descriptor();
                self.bus.transmit(0, configuration).map_err(|_| Stall)?;
                Ok(Handled::Data)
            }
            descriptor_type::STRING => match setup.descriptor_index() {
                0 => self.reply(&descriptor::LANGUAGES),
                index => match self.class.string(index, setup.index) {
                    Some(text) => {
                        self.bus.reply_string(text);
                        Ok(Handled::Data)
                    }
                    None => Err(Stall),
                },
            },
            descriptor_type::BOS => match self.class.os_descriptor() {
                Some(os) => {
                    self.bus.transmit(0, os).map_err(|_| Stall)?;
                    Ok(Handled::Data)
                }
                None => Err(Stall),
            },
            // Device qualifier, other speed: full speed only
            _ => Err(Stall),
        }
    }

    fn interface_request(&mut self, setup: &SetupPacket) -> Outcome {
        if self.state != State::Configured
            || setup.index >= u16::from(self.class.interface_count())
        {
            return Err(Stall);
        }
        let interface = setup.index as u8;
        match setup.request {
            Request::GET_STATUS => {
                expect(setup, UsbDirection::In)?;
                self.reply(&[0, 0])
            }
            Request::GET_INTERFACE => {
                expect(setup, UsbDirection::In)?;
                let alternate = self
                    .alternates
                    .get(usize::from(interface))
                    .copied()
                    .unwrap_or(0);
                self.reply(&[alternate])
            }
            Request::SET_INTERFACE => {
                expect(setup, UsbDirection::Out)?;
                let alternate = setup.value as u8;
                if let Some(slot) = self.alternates.get_mut(usize::from(interface)) {
                    *slot = alternate;
                }
                self.class
                    .alternate_setting_changed(&mut self.bus, interface, alternate);
                Ok(Handled::Status)
            }
            _ => self.class_request(setup),
        }
    }

    fn endpoint_request(&mut self, setup: &SetupPacket) -> Outcome {
        let index = usize::from(setup.index as u8 & 0x0F);
        let direction = UsbDirection::from(setup.index as u8);
        match self.state {
            State::Configured => {}
            State::Addressed if index == 0 => {}
            _ => return Err(Stall),
        }
        if index != 0 && !self.bus.has_endpoint(index, direction) {
            return Err(Stall);
        }
        match setup.request {
            Request::GET_STATUS => {
                expect(setup, UsbDirection::In)?;
                let halted = self.bus.is_halted(index, direction) as u8;
                self.reply(&[halted, 0])
            }
            Request::CLEAR_FEATURE | Request::SET_FEATURE => {
                expect(setup, UsbDirection::Out)?;
                if setup.value != Request::FEATURE_ENDPOINT_HALT {
                    return Err(Stall);
                }
                // Endpoint 0 can't halt; the request succeeds anyway
                if index != 0 {
                    self.bus
                        .set_halted(index, direction, setup.request == Request::SET_FEATURE);
                }
                Ok(Handled::Status)
            }
            // SYNCH_FRAME is for isochronous endpoints
            _ => Err(Stall),
        }
    }

    fn class_request(&mut self, setup: &SetupPacket) -> Outcome {
        let data = &self.data[..self.data_len];
        match self.class.control_request(&mut self.bus, setup, data) {
            Response::Accept if setup.direction() == UsbDirection::In => {
                if !self.bus.control_pending() {
                    self.bus.reply(&[]).map_err(|_| Stall)?;
                }
                Ok(Handled::Data)
            }
            Response::Accept => Ok(Handled::Status),
            Response::Busy => Ok(Handled::Busy),
            Response::Reject => Err(Stall),
        }
    }
}
