use crate::{
    buffer::Slot,
    pma::{self, rx_count},
    ral,
    register::{self, Status},
};
use usb_device::UsbDirection;

/// One endpoint's register and buffer descriptor
///
/// The endpoint holds no state of its own. Everything it knows lives in the
/// EPnR register, and in the endpoint's entry of the buffer descriptor table.
#[derive(Clone, Copy)]
pub struct Endpoint {
    usb: ral::usb::Instance,
    pma: pma::Instance,
    index: usize,
}

impl Endpoint {
    pub fn new(usb: ral::usb::Instance, pma: pma::Instance, index: usize) -> Self {
        Endpoint { usb, pma, index }
    }

    fn descriptor(&self) -> &'static pma::BufferDescriptor {
        &self.pma.descriptors[self.index]
    }

    /// Sets the `mask`ed EPnR fields to `value`, leaving every other field,
    /// and every pending completion, alone
    fn modify(&self, value: u32, mask: u32) {
        ral::modify_reg!(ral::usb, self.usb, EPR[self.index], |current| {
            register::update(current, value, mask)
        });
    }

    /// Sets every EPnR field
    ///
    /// Both data toggles restart at DATA0, and both completion flags are
    /// cleared.
    pub fn initialize(&self, kind: u32, rx: Status, tx: Status) {
        use ral::usb::EPR;
        let value = ((self.index as u32) << EPR::EA::offset)
            | (kind << EPR::EP_TYPE::offset)
            | ((rx as u32) << EPR::STAT_RX::offset)
            | ((tx as u32) << EPR::STAT_TX::offset);
        self.modify(value, 0xFFFF);
    }

    pub fn set_rx_status(&self, status: Status) {
        use ral::usb::EPR::STAT_RX;
        self.modify((status as u32) << STAT_RX::offset, STAT_RX::mask);
    }

    pub fn set_tx_status(&self, status: Status) {
        use ral::usb::EPR::STAT_TX;
        self.modify((status as u32) << STAT_TX::offset, STAT_TX::mask);
    }

    /// Sets both statuses in one write
    pub fn set_status(&self, rx: Status, tx: Status) {
        use ral::usb::EPR::{STAT_RX, STAT_TX};
        self.modify(
            ((rx as u32) << STAT_RX::offset) | ((tx as u32) << STAT_TX::offset),
            STAT_RX::mask | STAT_TX::mask,
        );
    }

    #[cfg(test)]
    pub fn rx_status(&self) -> Status {
        Status::from_bits(ral::read_reg!(ral::usb, self.usb, EPR[self.index], STAT_RX))
    }

    pub fn tx_status(&self) -> Status {
        Status::from_bits(ral::read_reg!(ral::usb, self.usb, EPR[self.index], STAT_TX))
    }

    /// Restarts the data toggle of one direction at DATA0
    pub fn reset_toggle(&self, direction: UsbDirection) {
        use ral::usb::EPR::{DTOG_RX, DTOG_TX};
        match direction {
            UsbDirection::Out => self.modify(0, DTOG_RX::mask),
            UsbDirection::In => self.modify(0, DTOG_TX::mask),
        }
    }

    pub fn is_rx_complete(&self) -> bool {
        ral::read_reg!(ral::usb, self.usb, EPR[self.index], CTR_RX == 1)
    }

    pub fn is_tx_complete(&self) -> bool {
        ral::read_reg!(ral::usb, self.usb, EPR[self.index], CTR_TX == 1)
    }

    /// Indicates if the last reception was a setup packet
    pub fn has_setup(&self) -> bool {
        ral::read_reg!(ral::usb, self.usb, EPR[self.index], SETUP == 1)
    }

    pub fn clear_rx_complete(&self) {
        self.modify(0, ral::usb::EPR::CTR_RX::mask);
    }

    pub fn clear_tx_complete(&self) {
        self.modify(0, ral::usb::EPR::CTR_TX::mask);
    }

    /// Publishes the endpoint's buffers in the descriptor table
    pub fn set_buffers(&self, rx: Option<Slot>, tx: Option<Slot>) {
        self.set_rx_buffer(rx);
        self.set_tx_buffer(tx);
    }

    /// Publishes the receive buffer, forgetting the size of the last reception
    pub fn set_rx_buffer(&self, rx: Option<Slot>) {
        let descriptor = self.descriptor();
        match rx {
            Some(slot) => {
                descriptor.ADDR_RX.write(slot.address);
                descriptor.COUNT_RX.write(rx_count::encode(slot.capacity));
            }
            None => {
                descriptor.ADDR_RX.write(0);
                descriptor.COUNT_RX.write(0);
            }
        }
    }

    /// Publishes the transmit buffer, dropping any loaded packet
    pub fn set_tx_buffer(&self, tx: Option<Slot>) {
        let descriptor = self.descriptor();
        descriptor.ADDR_TX.write(tx.map_or(0, |slot| slot.address));
        descriptor.COUNT_TX.write(0);
    }

    /// The size of the last reception, as reported by the peripheral
    pub fn received_len(&self) -> usize {
        ral::read_reg!(pma, self.descriptor(), COUNT_RX, COUNT) as usize
    }

    /// Copies up to `buffer.len()` bytes of the last reception into `buffer`
    ///
    /// Returns the number of bytes copied.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        let size = self.received_len().min(buffer.len());
        self.pma
            .read(self.descriptor().ADDR_RX.read(), &mut buffer[..size]);
        size
    }

    /// Copies `data` into the transmit buffer, and sets the size of the next
    /// IN packet
    ///
    /// The caller limits `data` to the buffer's capacity.
    pub fn write(&self, data: &[u8]) {
        let descriptor = self.descriptor();
        if !data.is_empty() {
            self.pma.write(descriptor.ADDR_TX.read(), data);
        }
        self.set_tx_len(data.len());
    }

    pub fn set_tx_len(&self, len: usize) {
        ral::write_reg!(pma, self.descriptor(), COUNT_TX, COUNT: len as u16);
    }
}
