//! Packet memory
//!
//! The peripheral's 1024 bytes of packet memory hold every endpoint buffer,
//! and the buffer descriptor table that tells the peripheral where those
//! buffers live. The CPU sees the memory as 16-bit words.
//!
//! The module implements a RAL-compatible interface for the descriptor table.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::vcell::VCell;

/// Packet memory address on STM32G4 processors
pub const ADDRESS: usize = 0x4000_6000;

/// Total packet memory, in bytes
pub const SIZE: u16 = 1024;

/// Bytes used by the buffer descriptor table, which sits at offset 0
pub const DESCRIPTOR_TABLE_SIZE: u16 = (crate::ENDPOINT_COUNT * 8) as u16;

#[repr(C)]
pub struct BufferDescriptor {
    pub ADDR_TX: VCell<u16>,
    pub COUNT_TX: VCell<u16>,
    pub ADDR_RX: VCell<u16>,
    pub COUNT_RX: VCell<u16>,
}

pub mod COUNT_TX {
    field!(COUNT, u16, 0, 10);
}

pub mod COUNT_RX {
    field!(BL_SIZE, u16, 15, 1);
    field!(NUM_BLOCK, u16, 10, 5);
    field!(COUNT, u16, 0, 10);
}

const BUFFER_WORDS: usize = ((SIZE - DESCRIPTOR_TABLE_SIZE) / 2) as usize;

#[repr(C)]
pub struct PacketMemory {
    pub descriptors: [BufferDescriptor; crate::ENDPOINT_COUNT],
    buffers: [VCell<u16>; BUFFER_WORDS],
}

pub type Instance = &'static PacketMemory;

impl PacketMemory {
    fn word(&self, offset: u16) -> &VCell<u16> {
        debug_assert!(offset >= DESCRIPTOR_TABLE_SIZE && offset % 2 == 0);
        &self.buffers[usize::from((offset - DESCRIPTOR_TABLE_SIZE) / 2)]
    }

    /// Copy `data` into packet memory, starting at byte `offset`
    ///
    /// `offset` is even, and lies beyond the descriptor table.
    pub fn write(&self, offset: u16, data: &[u8]) {
        for (idx, pair) in data.chunks(2).enumerate() {
            let lo = pair[0];
            let hi = pair.get(1).copied().unwrap_or(0);
            self.word(offset + 2 * idx as u16)
                .write(u16::from_le_bytes([lo, hi]));
        }
    }

    /// Copy packet memory, starting at byte `offset`, into `data`
    pub fn read(&self, offset: u16, data: &mut [u8]) {
        for (idx, pair) in data.chunks_mut(2).enumerate() {
            let word = self.word(offset + 2 * idx as u16).read().to_le_bytes();
            pair.copy_from_slice(&word[..pair.len()]);
        }
    }
}

/// The `COUNT_RX` block encoding of a receive buffer's size
///
/// Buffers smaller than [`COARSE`](rx_count::COARSE) are described in 2-byte
/// blocks. Larger buffers use 32-byte blocks. The peripheral refuses any
/// packet that would overrun the described size.
pub mod rx_count {
    use super::COUNT_RX;

    /// Smallest buffer described with 32-byte blocks
    pub const COARSE: u16 = 64;
    /// Largest describable buffer
    pub const MAX: u16 = 1024;

    /// Rounds `capacity` up to the next size the encoding can express
    pub const fn round(capacity: u16) -> u16 {
        if capacity < COARSE {
            (capacity + 1) & !1
        } else {
            (capacity + 31) & !31
        }
    }

    /// Returns the `BL_SIZE` and `NUM_BLOCK` bits describing `capacity`
    ///
    /// `capacity` must be a value returned by [`round`], no larger than [`MAX`].
    pub const fn encode(capacity: u16) -> u16 {
        if capacity < COARSE {
            (capacity / 2) << COUNT_RX::NUM_BLOCK::offset
        } else {
            COUNT_RX::BL_SIZE::mask | ((capacity / 32 - 1) << COUNT_RX::NUM_BLOCK::offset)
        }
    }

    /// Returns the buffer size described by a `COUNT_RX` word
    pub const fn decode(word: u16) -> u16 {
        let blocks = (word & COUNT_RX::NUM_BLOCK::mask) >> COUNT_RX::NUM_BLOCK::offset;
        if word & COUNT_RX::BL_SIZE::mask != 0 {
            (blocks + 1) * 32
        } else {
            blocks * 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{rx_count, DESCRIPTOR_TABLE_SIZE};
    use crate::ral;
    use crate::testing::Sim;

    #[test]
    fn layout() {
        assert_eq!(core::mem::size_of::<super::PacketMemory>(), 1024);
        assert_eq!(DESCRIPTOR_TABLE_SIZE, 64);
    }

    #[test]
    fn rx_count_round_trip() {
        for capacity in 0..=rx_count::MAX {
            let rounded = rx_count::round(capacity);
            assert!(rounded >= capacity);
            assert_eq!(rx_count::decode(rx_count::encode(rounded)), rounded);
        }
    }

    #[test]
    fn rx_count_encodings() {
        assert_eq!(rx_count::encode(2), 1 << 10);
        assert_eq!(rx_count::encode(34), 17 << 10);
        assert_eq!(rx_count::encode(62), 31 << 10);
        assert_eq!(rx_count::encode(64), (1 << 15) | (1 << 10));
        assert_eq!(rx_count::encode(1024), (1 << 15) | (31 << 10));
        assert_eq!(rx_count::round(33), 34);
        assert_eq!(rx_count::round(65), 96);
    }

    #[test]
    fn received_count_ignores_block_bits() {
        let sim = Sim::new();
        let desc = &sim.pma.descriptors[1];
        desc.COUNT_RX.write(rx_count::encode(64));
        ral::modify_reg!(super, desc, COUNT_RX, COUNT: 17);
        assert_eq!(ral::read_reg!(super, desc, COUNT_RX, COUNT), 17);
        assert_eq!(rx_count::decode(desc.COUNT_RX.read()), 64);
    }

    #[test]
    fn copy_odd_lengths() {
        let sim = Sim::new();
        sim.pma.write(64, &[1, 2, 3, 4, 5]);
        let mut out = [0; 5];
        sim.pma.read(64, &mut out);
        assert_eq!(out, [1, 2, 3, 4, 5]);

        let mut out = [0; 3];
        sim.pma.read(66, &mut out);
        assert_eq!(out, [3, 4, 5]);
    }
}
