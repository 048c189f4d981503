//! The endpoint API for classes
//!
//! A [`Bus`] owns every endpoint's buffers and transfers. The device hands it
//! to class callbacks, which use it to send and receive data. The device also
//! uses it for the control pipe.

use crate::{
    buffer::{Capacities, Layout},
    class::EndpointConfig,
    descriptor,
    endpoint::Endpoint,
    interrupt::Interrupts,
    pma, ral,
    register::{self, Status},
    setup::SetupPacket,
    transfer::{Source, Step, Termination, Transfer},
    CONTROL_PACKET_SIZE, ENDPOINT_COUNT,
};
use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

/// Size of the buffer behind [`Bus::reply`], and engine-generated descriptors
const STAGING_SIZE: usize = 256;

fn halt_bit(index: usize, direction: UsbDirection) -> u16 {
    1 << (index * 2 + (direction == UsbDirection::In) as usize)
}

/// Endpoint buffers and transfers
///
/// `'a` is the lifetime of data lent to [`transmit`](Bus::transmit).
pub struct Bus<'a> {
    usb: ral::usb::Instance,
    pma: pma::Instance,
    kinds: [Option<EndpointType>; ENDPOINT_COUNT],
    capacities: [Capacities; ENDPOINT_COUNT],
    layout: Layout,
    transfers: [Transfer<'a>; ENDPOINT_COUNT],
    /// Size of each endpoint's last reception, capped at its capacity
    received: [u16; ENDPOINT_COUNT],
    /// Bit `2n` is endpoint n OUT; bit `2n + 1` is endpoint n IN
    halted: u16,
    configured: bool,
    interrupts: Interrupts,
    staging: [u8; STAGING_SIZE],
    /// wLength of the active control read
    control_limit: usize,
}

impl<'a> Bus<'a> {
    pub(crate) fn new(usb: ral::usb::Instance, pma: pma::Instance) -> Self {
        let mut kinds = [None; ENDPOINT_COUNT];
        kinds[0] = Some(EndpointType::Control);
        let mut capacities = [Capacities::default(); ENDPOINT_COUNT];
        capacities[0] = Capacities {
            rx: CONTROL_PACKET_SIZE,
            tx: CONTROL_PACKET_SIZE,
        };
        Bus {
            usb,
            pma,
            kinds,
            capacities,
            layout: Layout::default(),
            transfers: core::array::from_fn(|index| {
                Transfer::new(if index == 0 {
                    Termination::Control { requested: 0 }
                } else {
                    Termination::Always
                })
            }),
            received: [0; ENDPOINT_COUNT],
            halted: 0,
            configured: false,
            interrupts: Interrupts::default(),
            staging: [0; STAGING_SIZE],
            control_limit: 0,
        }
    }

    fn endpoint(&self, index: usize) -> Endpoint {
        Endpoint::new(self.usb, self.pma, index)
    }

    /// The IN packet size of an endpoint
    fn packet_size(&self, index: usize) -> usize {
        usize::from(self.capacities[index].tx)
    }

    /// Validates an IN endpoint number; the direction bit is ignored
    fn tx_endpoint(&self, endpoint: u8) -> Result<usize, UsbError> {
        let index = usize::from(endpoint & 0x7F);
        if !self.has_endpoint(index, UsbDirection::In) {
            return Err(UsbError::InvalidEndpoint);
        }
        if index != 0 && !self.configured {
            return Err(UsbError::InvalidState);
        }
        if self.is_halted(index, UsbDirection::In) {
            return Err(UsbError::InvalidState);
        }
        Ok(index)
    }

    /// Queues `data` for transmission on an IN endpoint
    ///
    /// Data larger than the endpoint's packet size goes out in several
    /// packets. Once the host has acknowledged all of them, the class's
    /// [`endpoint_transmitted`](crate::Class::endpoint_transmitted) runs,
    /// followed by a zero-length packet unless the callback queues more data.
    ///
    /// A transmission that replaces one in flight discards the old one's
    /// progress. On endpoint 0, `data` is truncated to the host's wLength.
    pub fn transmit(&mut self, endpoint: u8, data: &'a [u8]) -> Result<(), UsbError> {
        let index = self.tx_endpoint(endpoint)?;
        let data = if index == 0 {
            &data[..data.len().min(self.control_limit)]
        } else {
            data
        };
        self.begin(index, Source::Borrowed(data), data.len());
        Ok(())
    }

    /// Copies one packet of `data` into the endpoint's buffer, and sends it
    ///
    /// Returns the number of bytes taken from `data`, which is limited by the
    /// packet size. Fails with `WouldBlock` while the endpoint is still sending.
    pub fn write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        let index = self.tx_endpoint(endpoint)?;
        let ep = self.endpoint(index);
        if self.transfers[index].is_pending() || ep.tx_status() == Status::Valid {
            return Err(UsbError::WouldBlock);
        }
        let mut len = data.len().min(self.packet_size(index));
        if index == 0 {
            len = len.min(self.control_limit);
        }
        ep.write(&data[..len]);
        self.begin(index, Source::Loaded, len);
        Ok(len)
    }

    /// Answers the active device-to-host control request with a copy of `data`
    ///
    /// `data` is truncated to the host's wLength.
    pub fn reply(&mut self, data: &[u8]) -> Result<(), UsbError> {
        let len = data.len().min(self.control_limit);
        if len > STAGING_SIZE {
            return Err(UsbError::BufferOverflow);
        }
        self.staging[..len].copy_from_slice(&data[..len]);
        self.begin(0, Source::Staged, len);
        Ok(())
    }

    /// Indicates if a transmission is in progress, or waiting to start
    ///
    /// Don't spin on this from the endpoint's own callbacks; the transfer
    /// only advances in the interrupt handler.
    pub fn is_transmit_pending(&self, endpoint: u8) -> bool {
        let index = usize::from(endpoint & 0x7F);
        index < ENDPOINT_COUNT && self.transfers[index].is_pending()
    }

    /// Copies the endpoint's most recent reception into `buffer`
    ///
    /// Returns the number of bytes copied, which is limited by `buffer`'s size
    /// and the endpoint's receive capacity.
    pub fn fetch(&self, endpoint: u8, buffer: &mut [u8]) -> usize {
        let index = usize::from(endpoint & 0x7F);
        if !self.has_endpoint(index, UsbDirection::Out) {
            return 0;
        }
        let len = usize::from(self.received[index]).min(buffer.len());
        self.endpoint(index).read(&mut buffer[..len])
    }

    /// Declares, or redeclares, a data endpoint
    ///
    /// All endpoint buffers are placed again. Other endpoints whose buffers
    /// move lose their queued transmission and their last reception. If the
    /// buffers don't fit into packet memory, the declaration is undone, and
    /// this returns
    /// `EndpointMemoryOverflow`. Endpoint numbers outside of 1 through 7 are
    /// ignored. Isochronous endpoints are unsupported.
    pub fn configure_endpoint(&mut self, config: &EndpointConfig) -> Result<(), UsbError> {
        let index = usize::from(config.number & 0x7F);
        if index == 0 || index >= ENDPOINT_COUNT {
            warn!("Ignoring declaration of endpoint {}", config.number);
            return Ok(());
        }
        if let EndpointType::Isochronous { .. } = config.kind {
            return Err(UsbError::Unsupported);
        }

        let mut capacities = self.capacities;
        capacities[index] = Capacities {
            rx: config.rx_capacity,
            tx: config.tx_capacity,
        };
        let layout = Layout::plan(&capacities)?;
        let previous = core::mem::replace(&mut self.layout, layout);

        self.capacities = capacities;
        self.kinds[index] = Some(config.kind);
        // Buffers that stay in place keep their loaded packets and receptions
        for idx in 1..ENDPOINT_COUNT {
            let ep = self.endpoint(idx);
            if idx == index || layout.rx[idx] != previous.rx[idx] {
                ep.set_rx_buffer(layout.rx[idx]);
                self.received[idx] = 0;
            }
            if idx == index || layout.tx[idx] != previous.tx[idx] {
                ep.set_tx_buffer(layout.tx[idx]);
                self.transfers[idx].cancel();
                if idx != index && ep.tx_status() == Status::Valid {
                    ep.set_tx_status(Status::Nak);
                }
            }
        }
        self.halted &= !(halt_bit(index, UsbDirection::Out) | halt_bit(index, UsbDirection::In));
        self.enable(index);
        debug!(
            "EP{} declared: RX {:?} TX {:?}",
            index, layout.rx[index], layout.tx[index]
        );
        Ok(())
    }

    /// Selects the interrupts that the peripheral signals
    ///
    /// `CTR` and `RESET` are always enabled.
    pub fn set_interrupts(&mut self, interrupts: Interrupts) {
        self.interrupts = interrupts | Interrupts::CTR | Interrupts::RESET;
        let bits = self.interrupts.bits();
        ral::modify_reg!(ral::usb, self.usb, CNTR, |cntr| {
            (cntr & !Interrupts::all().bits()) | bits
        });
    }

    /// The frame number of the last start-of-frame
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::usb, self.usb, FNR, FN) as u16
    }

    /// Sets the endpoint's registers for the device state, restarting its data
    /// toggles
    fn enable(&self, index: usize) {
        let Some(kind) = self.kinds[index] else {
            return;
        };
        let caps = self.capacities[index];
        let (rx, tx) = if self.configured {
            (
                if caps.rx > 0 { Status::Valid } else { Status::Disabled },
                if caps.tx > 0 { Status::Nak } else { Status::Disabled },
            )
        } else {
            (Status::Disabled, Status::Disabled)
        };
        self.endpoint(index).initialize(register::kind(kind), rx, tx);
    }

    /// Returns to the state after a bus reset
    ///
    /// Only endpoint 0 stays declared, and the device address is 0.
    pub(crate) fn reset(&mut self) {
        for index in 1..ENDPOINT_COUNT {
            self.kinds[index] = None;
            self.capacities[index] = Capacities::default();
        }
        for transfer in self.transfers.iter_mut() {
            transfer.cancel();
        }
        self.received = [0; ENDPOINT_COUNT];
        self.halted = 0;
        self.configured = false;
        self.control_limit = 0;
        self.layout = Layout::plan(&self.capacities).unwrap_or_default();

        ral::write_reg!(ral::usb, self.usb, BTABLE, 0);
        for index in 0..ENDPOINT_COUNT {
            let ep = self.endpoint(index);
            ep.set_buffers(self.layout.rx[index], self.layout.tx[index]);
            ep.initialize(0, Status::Disabled, Status::Disabled);
        }
        self.endpoint(0).initialize(
            register::kind(EndpointType::Control),
            Status::Valid,
            Status::Nak,
        );
        ral::write_reg!(ral::usb, self.usb, DADDR, EF: 1);
    }

    /// The declarations made after the last bus reset
    pub(crate) fn has_endpoint(&self, index: usize, direction: UsbDirection) -> bool {
        index < ENDPOINT_COUNT
            && self.kinds[index].is_some()
            && match direction {
                UsbDirection::Out => self.capacities[index].rx > 0,
                UsbDirection::In => self.capacities[index].tx > 0,
            }
    }

    pub(crate) fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral::usb, self.usb, DADDR, EF: 1, ADD: u32::from(address));
    }

    /// Enables or disables every data endpoint
    ///
    /// Enabling restarts every data toggle, and forgets halts. Disabling leaves
    /// the toggles alone.
    pub(crate) fn configure(&mut self, configured: bool) {
        self.configured = configured;
        for index in 1..ENDPOINT_COUNT {
            if self.kinds[index].is_none() {
                continue;
            }
            self.transfers[index].cancel();
            if configured {
                self.halted &=
                    !(halt_bit(index, UsbDirection::Out) | halt_bit(index, UsbDirection::In));
                self.enable(index);
            } else {
                self.endpoint(index)
                    .set_status(Status::Disabled, Status::Disabled);
            }
        }
    }

    pub(crate) fn is_halted(&self, index: usize, direction: UsbDirection) -> bool {
        index < ENDPOINT_COUNT && self.halted & halt_bit(index, direction) != 0
    }

    /// Halts, or resumes, one direction of a data endpoint
    ///
    /// Resuming restarts the direction's data toggle. Returns `false` if the
    /// endpoint isn't declared.
    pub(crate) fn set_halted(&mut self, index: usize, direction: UsbDirection, halted: bool) -> bool {
        if index == 0 || !self.has_endpoint(index, direction) {
            return false;
        }
        let bit = halt_bit(index, direction);
        let ep = self.endpoint(index);
        if halted {
            self.halted |= bit;
            match direction {
                UsbDirection::Out => ep.set_rx_status(Status::Stall),
                UsbDirection::In => ep.set_tx_status(Status::Stall),
            }
        } else {
            self.halted &= !bit;
            ep.reset_toggle(direction);
            match direction {
                UsbDirection::Out => ep.set_rx_status(Status::Valid),
                UsbDirection::In if self.transfers[index].is_pending() => {
                    ep.set_tx_status(Status::Valid)
                }
                UsbDirection::In => ep.set_tx_status(Status::Nak),
            }
        }
        true
    }

    fn begin(&mut self, index: usize, source: Source<'a>, total: usize) {
        let step = self.transfers[index].begin(source, total, self.packet_size(index));
        self.apply(index, step);
    }

    /// Carries out a transfer step; returns the size of a completed transfer
    fn apply(&mut self, index: usize, step: Step) -> Option<usize> {
        match step {
            Step::Load { offset, len } => {
                self.load(index, offset, len);
                None
            }
            Step::Zlp => {
                trace!("EP{} ZLP", index);
                let ep = self.endpoint(index);
                ep.set_tx_len(0);
                ep.set_tx_status(Status::Valid);
                None
            }
            Step::Complete(total) => Some(total),
            Step::Idle => None,
        }
    }

    fn load(&mut self, index: usize, offset: usize, len: usize) {
        let ep = self.endpoint(index);
        match self.transfers[index].source() {
            Source::Borrowed(data) => ep.write(&data[offset..offset + len]),
            Source::Staged => ep.write(&self.staging[offset..offset + len]),
            Source::Loaded => ep.set_tx_len(len),
        }
        ep.set_tx_status(Status::Valid);
    }

    /// Advances the endpoint's transfer after the host acknowledged a packet
    ///
    /// Returns the transfer size once the whole transfer is acknowledged.
    /// Call [`finish`](Self::finish) after handling the completion.
    pub(crate) fn acknowledge(&mut self, index: usize) -> Option<usize> {
        let step = self.transfers[index].acknowledge(self.packet_size(index));
        self.apply(index, step)
    }

    pub(crate) fn finish(&mut self, index: usize) {
        let step = self.transfers[index].finish(self.packet_size(index));
        self.apply(index, step);
    }

    /// Takes a reception off of the endpoint, and returns its capped size
    ///
    /// The endpoint NAKs until [`rearm`](Self::rearm).
    pub(crate) fn receive(&mut self, index: usize) -> usize {
        let ep = self.endpoint(index);
        ep.clear_rx_complete();
        let len = ep
            .received_len()
            .min(usize::from(self.capacities[index].rx));
        self.received[index] = len as u16;
        len
    }

    pub(crate) fn rearm(&mut self, index: usize) {
        if !self.is_halted(index, UsbDirection::Out) {
            self.endpoint(index).set_rx_status(Status::Valid);
        }
    }

    pub(crate) fn clear_tx_complete(&self, index: usize) {
        self.endpoint(index).clear_tx_complete();
    }

    /// Endpoints with a completed reception or transmission
    pub(crate) fn completions(&self, index: usize) -> (bool, bool) {
        let ep = self.endpoint(index);
        (ep.is_rx_complete(), ep.is_tx_complete())
    }

    /// Copies the setup packet out of endpoint 0's buffer
    pub(crate) fn read_setup(&mut self) -> SetupPacket {
        let mut raw = [0; 8];
        self.receive(0);
        self.endpoint(0).read(&mut raw);
        SetupPacket::parse(&raw)
    }

    pub(crate) fn has_setup(&self) -> bool {
        self.endpoint(0).has_setup()
    }

    /// Starts a new control transfer, forgetting the last one
    pub(crate) fn begin_control(&mut self, requested: u16) {
        self.transfers[0] = Transfer::new(Termination::Control { requested });
        self.control_limit = usize::from(requested);
    }

    pub(crate) fn control_pending(&self) -> bool {
        self.transfers[0].is_pending()
    }

    /// Answers the active control read with a string descriptor
    pub(crate) fn reply_string(&mut self, text: &str) {
        let len = descriptor::string(&mut self.staging, text).min(self.control_limit);
        self.begin(0, Source::Staged, len);
    }

    /// Sends the zero-length status packet that closes a control write
    pub(crate) fn send_status(&mut self) {
        let ep = self.endpoint(0);
        ep.set_tx_len(0);
        ep.set_tx_status(Status::Valid);
    }

    pub(crate) fn control_status(&self, rx: Status, tx: Status) {
        self.endpoint(0).set_status(rx, tx);
    }

    /// Ends the data stage of a control read early
    pub(crate) fn end_control(&mut self) {
        self.transfers[0].cancel();
        self.endpoint(0).set_tx_status(Status::Nak);
    }

    /// Turns the start-of-frame interrupt on, or back to the selected setting
    pub(crate) fn retry_on_sof(&self, retry: bool) {
        let sof = retry || self.interrupts.contains(Interrupts::SOF);
        ral::modify_reg!(ral::usb, self.usb, CNTR, SOFM: sof as u32);
    }

    pub(crate) fn interrupts(&self) -> Interrupts {
        self.interrupts
    }
}

#[cfg(test)]
mod tests {
    use super::Bus;
    use crate::{register::Status, testing::Sim, EndpointConfig};
    use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

    fn bus(sim: &Sim) -> Bus<'static> {
        let mut bus = Bus::new(sim.usb, sim.pma);
        bus.reset();
        bus
    }

    const EP1: EndpointConfig = EndpointConfig {
        number: 1,
        rx_capacity: 34,
        tx_capacity: 34,
        kind: EndpointType::Bulk,
    };

    #[test]
    fn reset_publishes_control_endpoint() {
        let sim = Sim::new();
        let _bus = bus(&sim);
        let descriptor = &sim.pma.descriptors[0];
        assert_eq!(descriptor.ADDR_RX.read(), 64);
        assert_eq!(descriptor.ADDR_TX.read(), 128);
        assert_eq!(descriptor.COUNT_RX.read(), (1 << 15) | (1 << 10));
        assert_eq!(sim.usb.EPR[0].read(), (3 << 12) | (1 << 9) | (2 << 4));
        assert_eq!(sim.usb.DADDR.read(), 1 << 7);
    }

    #[test]
    fn declaration_publishes_even_regions() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        bus.configure_endpoint(&EP1).unwrap();
        let descriptor = &sim.pma.descriptors[1];
        assert_eq!(descriptor.ADDR_RX.read(), 192);
        assert_eq!(descriptor.ADDR_TX.read(), 226);
        // Not configured yet
        assert_eq!(sim.usb.EPR[1].read() & 0x3030, 0);
    }

    #[test]
    fn declaration_errors() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        assert_eq!(
            bus.configure_endpoint(&EndpointConfig { number: 9, ..EP1 }),
            Ok(())
        );
        assert!(!bus.has_endpoint(1, UsbDirection::In));

        let huge = EndpointConfig {
            rx_capacity: 1024,
            ..EP1
        };
        assert_eq!(
            bus.configure_endpoint(&huge),
            Err(UsbError::EndpointMemoryOverflow)
        );
        assert!(!bus.has_endpoint(1, UsbDirection::Out));
        assert_eq!(sim.pma.descriptors[1].ADDR_RX.read(), 0);

        let iso = EndpointConfig {
            kind: EndpointType::Isochronous {
                synchronization: usb_device::endpoint::IsochronousSynchronizationType::NoSynchronization,
                usage: usb_device::endpoint::IsochronousUsageType::Data,
            },
            ..EP1
        };
        assert_eq!(bus.configure_endpoint(&iso), Err(UsbError::Unsupported));
    }

    #[test]
    fn transmit_requires_configuration() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        bus.configure_endpoint(&EP1).unwrap();
        assert_eq!(bus.transmit(1, &[1, 2, 3]), Err(UsbError::InvalidState));
        assert_eq!(bus.transmit(3, &[1, 2, 3]), Err(UsbError::InvalidEndpoint));
        bus.configure(true);
        assert_eq!(bus.transmit(0x81, &[1, 2, 3]), Ok(()));
        assert!(bus.is_transmit_pending(1));
        assert_eq!(sim.pma.descriptors[1].COUNT_TX.read(), 3);
        assert_eq!(bus.write(1, &[4]), Err(UsbError::WouldBlock));
    }

    #[test]
    fn configure_restarts_toggles_and_deconfigure_keeps_them() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        bus.configure_endpoint(&EP1).unwrap();
        bus.configure(true);
        sim.usb.EPR[1].set(sim.usb.EPR[1].read() | (1 << 14) | (1 << 6));

        bus.configure(false);
        assert_eq!(sim.usb.EPR[1].read() & 0x4040, 0x4040);
        assert_eq!(sim.usb.EPR[1].read() & 0x3030, 0);

        bus.configure(true);
        assert_eq!(sim.usb.EPR[1].read() & 0x4040, 0);
        assert_eq!(sim.usb.EPR[1].read() & 0x3030, 0x3020);
    }

    #[test]
    fn halt_and_resume() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        bus.configure_endpoint(&EP1).unwrap();
        bus.configure(true);
        assert!(bus.set_halted(1, UsbDirection::In, true));
        assert!(bus.is_halted(1, UsbDirection::In));
        assert!(!bus.is_halted(1, UsbDirection::Out));
        assert_eq!(bus.transmit(1, &[1]), Err(UsbError::InvalidState));
        assert_eq!(sim.usb.EPR[1].read() & 0x30, 0x10);

        sim.usb.EPR[1].set(sim.usb.EPR[1].read() | (1 << 6));
        assert!(bus.set_halted(1, UsbDirection::In, false));
        assert_eq!(sim.usb.EPR[1].read() & 0x70, 0x20);
        assert!(!bus.set_halted(2, UsbDirection::In, true));
    }

    #[test]
    fn reception_is_capped() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        bus.configure_endpoint(&EndpointConfig {
            rx_capacity: 7,
            ..EP1
        })
        .unwrap();
        bus.configure(true);
        let descriptor = &sim.pma.descriptors[1];
        sim.pma.write(descriptor.ADDR_RX.read(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        descriptor.COUNT_RX.write(descriptor.COUNT_RX.read() | 8);
        sim.usb.EPR[1].set((sim.usb.EPR[1].read() & !0x3000) | (1 << 15) | (2 << 12));

        assert_eq!(bus.receive(1), 7);
        let mut buffer = [0; 16];
        assert_eq!(bus.fetch(1, &mut buffer), 7);
        assert_eq!(&buffer[..7], &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(bus.completions(1), (false, false));
        bus.rearm(1);
        assert_eq!(sim.usb.EPR[1].read() & 0x3000, 0x3000);
    }

    #[test]
    fn reply_truncates_to_request() {
        let sim = Sim::new();
        let mut bus = bus(&sim);
        bus.begin_control(2);
        bus.reply(&[1, 2, 3, 4]).unwrap();
        assert_eq!(sim.pma.descriptors[0].COUNT_TX.read(), 2);
        assert_eq!(sim.usb.EPR[0].read() & 0x30, (Status::Valid as u32) << 4);
    }
}
