//! Wire formats of GPFIFO entries and pushbuffer method headers.

/// Control opcode of a zero-size GPFIFO entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpEntryOpcode {
    Nop,
    Illegal,
    Crc,
    PbCrc,
    Unknown(u8),
}

/// A GPFIFO entry as submitted by the guest: two little-endian words
/// describing the address and word count of one pushbuffer segment.
///
/// Layout (low word / high word):
/// - `entry0[31:2]` — bits `[31:2]` of the segment address (word aligned)
/// - `entry1[7:0]`  — bits `[39:32]` of the address, or the control opcode
///   when the size is zero
/// - `entry1[30:10]` — segment size in words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpEntry {
    pub entry0: u32,
    pub entry1: u32,
}

impl GpEntry {
    /// Builds an entry pointing at `size_words` words of pushbuffer at the
    /// given GPU virtual address.
    pub fn new(address: u64, size_words: u32) -> Self {
        debug_assert_eq!(address & 0b11, 0, "pushbuffer addresses are word aligned");
        debug_assert!(size_words < (1 << 21));
        Self {
            entry0: (address & 0xFFFF_FFFC) as u32,
            entry1: (((address >> 32) as u32) & 0xFF) | (size_words << 10),
        }
    }

    pub fn address(&self) -> u64 {
        (((self.entry1 & 0xFF) as u64) << 32) | ((self.entry0 & 0xFFFF_FFFC) as u64)
    }

    pub fn size_words(&self) -> u32 {
        (self.entry1 >> 10) & 0x1F_FFFF
    }

    /// Only meaningful when `size_words() == 0`.
    pub fn opcode(&self) -> GpEntryOpcode {
        match (self.entry1 & 0xFF) as u8 {
            0 => GpEntryOpcode::Nop,
            1 => GpEntryOpcode::Illegal,
            2 => GpEntryOpcode::Crc,
            3 => GpEntryOpcode::PbCrc,
            other => GpEntryOpcode::Unknown(other),
        }
    }
}

/// Operation kind of a pushbuffer method header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecOp {
    /// Address increments for every data word.
    IncMethod,
    /// Address stays fixed for every data word.
    NonIncMethod,
    /// The data is carried in the header itself.
    ImmdDataMethod,
    /// Address increments once after the first data word, then holds.
    OneInc,
    /// Stop processing the rest of this segment.
    EndPbSegment,
}

impl SecOp {
    pub(crate) fn from_raw(raw: u8) -> Option<SecOp> {
        match raw {
            1 => Some(SecOp::IncMethod),
            3 => Some(SecOp::NonIncMethod),
            4 => Some(SecOp::ImmdDataMethod),
            5 => Some(SecOp::OneInc),
            7 => Some(SecOp::EndPbSegment),
            _ => None,
        }
    }

    fn raw(self) -> u32 {
        match self {
            SecOp::IncMethod => 1,
            SecOp::NonIncMethod => 3,
            SecOp::ImmdDataMethod => 4,
            SecOp::OneInc => 5,
            SecOp::EndPbSegment => 7,
        }
    }
}

/// A pushbuffer method header word.
///
/// Layout: `address[11:0]`, `subchannel[15:13]`, `count/immd[28:16]`,
/// `secOp[31:29]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader(pub u32);

impl MethodHeader {
    /// Builds a header word; `count` doubles as the immediate data for
    /// [`SecOp::ImmdDataMethod`].
    pub fn build(sec_op: SecOp, address: u16, subchannel: u8, count: u16) -> u32 {
        debug_assert!(address < (1 << 12));
        debug_assert!(subchannel < 8);
        debug_assert!(count < (1 << 13));
        (sec_op.raw() << 29) | ((count as u32) << 16) | ((subchannel as u32) << 13) | address as u32
    }

    pub fn address(&self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    pub fn subchannel(&self) -> u8 {
        ((self.0 >> 13) & 0x7) as u8
    }

    pub fn count(&self) -> u16 {
        ((self.0 >> 16) & 0x1FFF) as u16
    }

    pub fn immd_data(&self) -> u32 {
        (self.0 >> 16) & 0x1FFF
    }

    pub fn sec_op_raw(&self) -> u8 {
        (self.0 >> 29) as u8
    }
}
