//! Packet memory buffers

use crate::pma::{self, rx_count};
use crate::ENDPOINT_COUNT;
use usb_device::UsbError;

/// Packet memory buffer allocator
///
/// Hands out even-sized regions in increasing address order.
pub struct Allocator {
    ptr: u16,
    end: u16,
}

impl Allocator {
    /// Allocates from the packet memory that follows the descriptor table
    pub const fn new() -> Self {
        Allocator {
            ptr: pma::DESCRIPTOR_TABLE_SIZE,
            end: pma::SIZE,
        }
    }

    /// Allocates a buffer of `size` bytes, rounded up to an even size
    ///
    /// Returns the buffer's packet memory offset.
    pub fn allocate(&mut self, size: u16) -> Option<u16> {
        let size = size.checked_add(1)? & !1;
        let ptr = self.ptr;
        let new_ptr = ptr.checked_add(size)?;
        if new_ptr > self.end {
            None
        } else {
            self.ptr = new_ptr;
            Some(ptr)
        }
    }
}

/// A buffer's placement in packet memory
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Slot {
    pub address: u16,
    pub capacity: u16,
}

/// The declared receive and transmit capacities of one endpoint
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Capacities {
    pub rx: u16,
    pub tx: u16,
}

/// Placement of every endpoint buffer
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Layout {
    pub rx: [Option<Slot>; ENDPOINT_COUNT],
    pub tx: [Option<Slot>; ENDPOINT_COUNT],
}

impl Layout {
    /// Places every buffer, walking endpoints in order, receive before transmit
    ///
    /// Receive buffers are rounded up to a size that the `COUNT_RX` encoding
    /// can express. Zero-sized buffers get no slot. The same capacities always
    /// produce the same layout.
    pub fn plan(capacities: &[Capacities; ENDPOINT_COUNT]) -> Result<Self, UsbError> {
        let mut alloc = Allocator::new();
        let mut layout = Layout::default();
        for (index, caps) in capacities.iter().enumerate() {
            if caps.rx > rx_count::MAX {
                return Err(UsbError::EndpointMemoryOverflow);
            }
            layout.rx[index] = place(&mut alloc, rx_count::round(caps.rx))?;
            layout.tx[index] = place(&mut alloc, caps.tx)?;
        }
        Ok(layout)
    }
}

fn place(alloc: &mut Allocator, capacity: u16) -> Result<Option<Slot>, UsbError> {
    if capacity == 0 {
        return Ok(None);
    }
    let address = alloc
        .allocate(capacity)
        .ok_or(UsbError::EndpointMemoryOverflow)?;
    Ok(Some(Slot {
        address,
        capacity: (capacity + 1) & !1,
    }))
}
