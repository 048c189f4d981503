//! A simulated peripheral and host for tests
//!
//! The register block and packet memory live in leaked heap memory. Endpoint
//! and interrupt status registers apply writes the way the silicon does, and
//! the [`Harness`] plays the host's side of each transaction.

use std::{boxed::Box, vec::Vec};

use crate::{
    class::{Class, EndpointConfig, Response},
    descriptor::DeviceDescriptor,
    device::Device,
    driver::Bus,
    interrupt::Interrupts,
    pma::{rx_count, PacketMemory},
    ral::usb::RegisterBlock,
    register::Status,
    setup::{RequestKind, SetupPacket},
    Peripherals,
};
use usb_device::endpoint::EndpointType;

#[derive(Clone, Copy)]
pub struct Sim {
    pub usb: &'static RegisterBlock,
    pub pma: &'static PacketMemory,
}

impl Sim {
    pub fn new() -> Self {
        // Safety: all registers and packet memory words are valid when zero.
        unsafe {
            Sim {
                usb: Box::leak(Box::new(core::mem::zeroed::<RegisterBlock>())),
                pma: Box::leak(Box::new(core::mem::zeroed::<PacketMemory>())),
            }
        }
    }
}

unsafe impl Peripherals for Sim {
    fn usb(&self) -> *const () {
        self.usb as *const RegisterBlock as _
    }
    fn packet_memory(&self) -> *const () {
        self.pma as *const PacketMemory as _
    }
    fn startup_delay() {}
}

/// The host's view of a transaction
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
}

/// Builds a setup packet
pub fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
    .to_bytes()
}

const CTR_RX: u32 = 1 << 15;
const DTOG_RX: u32 = 1 << 14;
const STAT_RX: u32 = 0b11 << 12;
const SETUP: u32 = 1 << 11;
const CTR_TX: u32 = 1 << 7;
const DTOG_TX: u32 = 1 << 6;
const STAT_TX: u32 = 0b11 << 4;
const COUNT: u16 = 0x3FF;

pub struct Harness {
    pub sim: Sim,
    pub device: Device<'static, TestClass>,
    /// IN transactions in the data stage of the last control read
    transactions: usize,
}

impl Harness {
    /// Initializes a device, and resets the bus
    pub fn new(class: TestClass) -> Self {
        let sim = Sim::new();
        let mut device = Device::new(sim, class);
        device.initialize().unwrap();
        let mut harness = Harness {
            sim,
            device,
            transactions: 0,
        };
        harness.reset();
        harness
    }

    /// Latches `events` in ISTR, and runs the interrupt handler
    pub fn raise(&mut self, events: Interrupts) {
        let istr = &self.sim.usb.ISTR;
        istr.set(istr.read() | events.bits());
        self.device.interrupt();
        // CTR follows the endpoint flags; nothing is pending after the handler
        istr.set(istr.read() & !Interrupts::CTR.bits());
    }

    pub fn reset(&mut self) {
        self.raise(Interrupts::RESET);
    }

    pub fn sof(&mut self) {
        self.raise(Interrupts::SOF);
    }

    fn rx_status(&self, ep: usize) -> Status {
        Status::from_bits(self.sim.usb.EPR[ep].read() >> 12)
    }

    fn tx_status(&self, ep: usize) -> Status {
        Status::from_bits(self.sim.usb.EPR[ep].read() >> 4)
    }

    /// Sends a setup packet to endpoint 0
    ///
    /// The peripheral accepts setup packets whatever the endpoint status.
    pub fn setup(&mut self, raw: [u8; 8]) {
        let descriptor = &self.sim.pma.descriptors[0];
        self.sim.pma.write(descriptor.ADDR_RX.read(), &raw);
        descriptor
            .COUNT_RX
            .write((descriptor.COUNT_RX.read() & !COUNT) | 8);
        let epr = &self.sim.usb.EPR[0];
        let nak = ((Status::Nak as u32) << 12) | ((Status::Nak as u32) << 4);
        epr.set((epr.read() & !(STAT_RX | STAT_TX)) | nak | CTR_RX | SETUP);
        self.raise(Interrupts::CTR);
    }

    /// Sends an IN token; returns the packet, or the handshake that refused it
    pub fn host_in(&mut self, ep: usize) -> Result<Vec<u8>, Handshake> {
        match self.tx_status(ep) {
            Status::Valid => {}
            Status::Stall => return Err(Handshake::Stall),
            Status::Nak | Status::Disabled => return Err(Handshake::Nak),
        }
        let descriptor = &self.sim.pma.descriptors[ep];
        let mut packet = std::vec![0; usize::from(descriptor.COUNT_TX.read() & COUNT)];
        self.sim.pma.read(descriptor.ADDR_TX.read(), &mut packet);

        let epr = &self.sim.usb.EPR[ep];
        let nak = (Status::Nak as u32) << 4;
        epr.set(((epr.read() & !STAT_TX) ^ DTOG_TX) | nak | CTR_TX);
        self.raise(Interrupts::CTR);
        Ok(packet)
    }

    /// Sends an OUT token and `data`
    pub fn host_out(&mut self, ep: usize, data: &[u8]) -> Handshake {
        match self.rx_status(ep) {
            Status::Valid => {}
            Status::Stall => return Handshake::Stall,
            Status::Nak | Status::Disabled => return Handshake::Nak,
        }
        let descriptor = &self.sim.pma.descriptors[ep];
        let capacity = rx_count::decode(descriptor.COUNT_RX.read());
        assert!(
            data.len() <= usize::from(capacity),
            "EP{ep} buffer overrun: {} > {capacity}",
            data.len()
        );
        self.sim.pma.write(descriptor.ADDR_RX.read(), data);
        descriptor
            .COUNT_RX
            .write((descriptor.COUNT_RX.read() & !COUNT) | data.len() as u16);

        let epr = &self.sim.usb.EPR[ep];
        let nak = (Status::Nak as u32) << 12;
        epr.set(((epr.read() & !(STAT_RX | SETUP)) ^ DTOG_RX) | nak | CTR_RX);
        self.raise(Interrupts::CTR);
        Handshake::Ack
    }

    /// Runs a control read, through its status stage
    pub fn control_read(&mut self, setup: [u8; 8]) -> Result<Vec<u8>, Handshake> {
        let length = usize::from(u16::from_le_bytes([setup[6], setup[7]]));
        self.transactions = 0;
        self.setup(setup);
        let mut data = Vec::new();
        loop {
            let packet = self.host_in(0)?;
            self.transactions += 1;
            let short = packet.len() < 64;
            data.extend_from_slice(&packet);
            if short || data.len() >= length {
                break;
            }
        }
        match self.host_out(0, &[]) {
            Handshake::Ack => Ok(data),
            handshake => Err(handshake),
        }
    }

    /// Runs a control write, through its status stage
    pub fn control_write(&mut self, setup: [u8; 8], data: &[u8]) -> Result<(), Handshake> {
        self.setup(setup);
        for packet in data.chunks(64) {
            match self.host_out(0, packet) {
                Handshake::Ack => {}
                handshake => return Err(handshake),
            }
        }
        let status = self.host_in(0)?;
        assert!(status.is_empty(), "status stage with data {status:?}");
        Ok(())
    }

    /// IN transactions in the data stage of the last control read
    pub fn host_transactions(&self) -> usize {
        self.transactions
    }

    /// Addresses (5) and configures (1) the device
    pub fn enumerate(&mut self) {
        self.control_read(request(0x80, 6, 0x0100, 0, 64)).unwrap();
        self.control_write(request(0x00, 5, 5, 0, 0), &[]).unwrap();
        self.control_read(request(0x80, 6, 0x0200, 0, 255)).unwrap();
        self.control_write(request(0x00, 9, 1, 0, 0), &[]).unwrap();
    }
}

/// What the class saw
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    /// bRequest of a forwarded control request
    Control(u8),
    Alternate(u8, u8),
    Received(u8, usize),
    Transmitted(u8, usize),
    Suspend,
    Resume,
}

/// A serial port, with a vendor interface for odd requests
pub struct TestClass {
    pub events: Vec<Event>,
    /// Answer this many control requests with `Busy`
    pub busy: usize,
    pub line_coding: [u8; 7],
    /// Size of the last vendor write
    pub blob_len: usize,
    /// Send received EP1 data back
    pub echo: bool,
    /// Transmit this from the next completion callback
    pub then: Option<&'static [u8]>,
    pub endpoints: &'static [EndpointConfig],
}

impl Default for TestClass {
    fn default() -> Self {
        TestClass {
            events: Vec::new(),
            busy: 0,
            line_coding: [0; 7],
            blob_len: 0,
            echo: false,
            then: None,
            endpoints: &ENDPOINTS,
        }
    }
}

pub static ENDPOINTS: [EndpointConfig; 2] = [
    EndpointConfig {
        number: 1,
        rx_capacity: 64,
        tx_capacity: 64,
        kind: EndpointType::Bulk,
    },
    EndpointConfig {
        number: 2,
        rx_capacity: 0,
        tx_capacity: 8,
        kind: EndpointType::Interrupt,
    },
];

#[rustfmt::skip]
pub static CONFIGURATION: [u8; 67] = [
    9, 2, 67, 0, 2, 1, 0, 0xC0, 50,
    // Communications interface
    9, 4, 0, 0, 1, 0x02, 0x02, 0x01, 0,
    5, 0x24, 0x00, 0x10, 0x01,
    5, 0x24, 0x01, 0x00, 0x01,
    4, 0x24, 0x02, 0x02,
    5, 0x24, 0x06, 0x00, 0x01,
    7, 5, 0x82, 3, 8, 0, 255,
    // Data interface
    9, 4, 1, 0, 2, 0x0A, 0, 0, 0,
    7, 5, 0x01, 2, 64, 0, 0,
    7, 5, 0x81, 2, 64, 0, 0,
];

static BOS: [u8; 5] = [5, 0x0F, 5, 0, 0];

static VENDOR: [u8; 64] = [0x77; 64];

impl Class<'static> for TestClass {
    fn device_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            device_class: 0x02,
            manufacturer: 1,
            product: 2,
            ..DeviceDescriptor::new(0x1209, 0x0001)
        }
    }

    fn configuration_descriptor(&self) -> &'static [u8] {
        &CONFIGURATION
    }

    fn string(&self, index: u8, _: u16) -> Option<&str> {
        match index {
            1 => Some("asdf"),
            2 => Some("My Controller"),
            _ => None,
        }
    }

    fn os_descriptor(&self) -> Option<&'static [u8]> {
        Some(&BOS)
    }

    fn endpoints(&self) -> &[EndpointConfig] {
        self.endpoints
    }

    fn control_request(
        &mut self,
        bus: &mut Bus<'static>,
        setup: &SetupPacket,
        data: &[u8],
    ) -> Response {
        self.events.push(Event::Control(setup.request));
        if self.busy > 0 {
            self.busy -= 1;
            return Response::Busy;
        }
        match (setup.kind(), setup.request) {
            (RequestKind::Class, 0x20) if data.len() == self.line_coding.len() => {
                self.line_coding.copy_from_slice(data);
                Response::Accept
            }
            (RequestKind::Class, 0x21) => match bus.reply(&self.line_coding) {
                Ok(()) => Response::Accept,
                Err(_) => Response::Reject,
            },
            (RequestKind::Class, 0x22) => Response::Accept,
            (RequestKind::Vendor, 0x40) => match bus.transmit(0, &VENDOR) {
                Ok(()) => Response::Accept,
                Err(_) => Response::Reject,
            },
            (RequestKind::Vendor, 0x50) => {
                self.blob_len = data.len();
                Response::Accept
            }
            _ => Response::Reject,
        }
    }

    fn alternate_setting_changed(&mut self, _: &mut Bus<'static>, interface: u8, alternate: u8) {
        self.events.push(Event::Alternate(interface, alternate));
    }

    fn endpoint_received(&mut self, bus: &mut Bus<'static>, endpoint: u8, len: usize) {
        self.events.push(Event::Received(endpoint, len));
        if self.echo {
            let mut buffer = [0; 64];
            let len = bus.fetch(endpoint, &mut buffer);
            bus.write(endpoint, &buffer[..len]).unwrap();
        }
    }

    fn endpoint_transmitted(&mut self, bus: &mut Bus<'static>, endpoint: u8, len: usize) {
        self.events.push(Event::Transmitted(endpoint, len));
        if let Some(next) = self.then.take() {
            bus.transmit(endpoint, next).unwrap();
        }
    }

    fn suspend(&mut self) {
        self.events.push(Event::Suspend);
    }

    fn resume(&mut self) {
        self.events.push(Event::Resume);
    }
}
