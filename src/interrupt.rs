//! Interrupt routing

use crate::{class::Class, device::Device, ral, ENDPOINT_COUNT};

bitflags::bitflags! {
    /// USB interrupts
    ///
    /// Each flag is both the CNTR interrupt mask bit, and the ISTR event bit.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Interrupts: u32 {
        /// Correct transfer on any endpoint
        const CTR = 1 << 15;
        /// Packet memory over / underrun
        const PMAOVR = 1 << 14;
        const ERR = 1 << 13;
        const WKUP = 1 << 12;
        const SUSP = 1 << 11;
        const RESET = 1 << 10;
        const SOF = 1 << 9;
        /// Expected start-of-frame missing
        const ESOF = 1 << 8;
        /// LPM L1 state request
        const L1REQ = 1 << 7;
    }
}

impl Default for Interrupts {
    /// The interrupts that a device needs
    fn default() -> Self {
        Interrupts::CTR | Interrupts::RESET | Interrupts::SUSP | Interrupts::WKUP
    }
}

/// Clears the ISTR events in `interrupts`
fn acknowledge(usb: ral::usb::Instance, interrupts: Interrupts) {
    ral::write_reg!(ral::usb, usb, ISTR, !interrupts.bits());
}

impl<'a, C: Class<'a>> Device<'a, C> {
    /// Handles the USB interrupt
    ///
    /// Call this from the `USB_LP` interrupt handler. It handles bus events,
    /// the control pipe, and then the data endpoints, through
    /// [`data_interrupt`](Device::data_interrupt).
    pub fn interrupt(&mut self) {
        let usb = self.usb;
        let events = Interrupts::from_bits_truncate(ral::read_reg!(ral::usb, usb, ISTR));

        if events.contains(Interrupts::RESET) {
            acknowledge(usb, Interrupts::RESET);
            debug!("RESET");
            self.bus_reset();
            return;
        }

        if events.contains(Interrupts::CTR) {
            self.control_interrupt();
            self.data_interrupt();
        }

        if events.contains(Interrupts::WKUP) {
            acknowledge(usb, Interrupts::WKUP);
            ral::modify_reg!(ral::usb, usb, CNTR, LP_MODE: 0, FSUSP: 0);
            debug!("WKUP");
            self.resume();
        }

        if events.contains(Interrupts::SUSP) {
            acknowledge(usb, Interrupts::SUSP);
            debug!("SUSP");
            self.suspend();
            // FSUSP first; the peripheral only enters low power once suspended
            ral::modify_reg!(ral::usb, usb, CNTR, FSUSP: 1);
            ral::modify_reg!(ral::usb, usb, CNTR, LP_MODE: 1);
        }

        if events.contains(Interrupts::SOF) {
            acknowledge(usb, Interrupts::SOF);
            self.retry();
        }

        let ignored = events
            & (Interrupts::ERR | Interrupts::ESOF | Interrupts::PMAOVR | Interrupts::L1REQ);
        if !ignored.is_empty() {
            trace!("Ignored {:?}", ignored);
            acknowledge(usb, ignored);
        }
    }

    fn control_interrupt(&mut self) {
        let (rx, tx) = self.bus.completions(0);
        // Finish the last IN before a new setup starts another transfer
        if tx {
            self.on_control_in();
        }
        if rx {
            if self.bus.has_setup() {
                self.on_setup();
            } else {
                self.on_control_out();
            }
        }
    }

    /// Handles completions on the data endpoints
    ///
    /// [`interrupt`](Device::interrupt) calls this. If a second interrupt line
    /// serves the data endpoints, call it from that handler, too. It must not
    /// preempt `interrupt`.
    pub fn data_interrupt(&mut self) {
        for index in 1..ENDPOINT_COUNT {
            let (rx, tx) = self.bus.completions(index);
            let endpoint = index as u8;
            if rx {
                let len = self.bus.receive(index);
                trace!("EP{} OUT {}", index, len);
                self.class.endpoint_received(&mut self.bus, endpoint, len);
                self.bus.rearm(index);
            }
            if tx {
                self.bus.clear_tx_complete(index);
                if let Some(len) = self.bus.acknowledge(index) {
                    trace!("EP{} IN {}", index, len);
                    self.class.endpoint_transmitted(&mut self.bus, endpoint, len);
                    self.bus.finish(index);
                }
            }
        }
    }
}
