//! Architecture descriptors for pool compatibility certification
//!
//! A pool records the [`ArchDescriptor`] of the build that created it. Later
//! opens compare that stored record against the descriptor of the running
//! process before trusting any binary structure inside the pool.
//!
//! ## Wire format
//!
//! ```text
//! Offset  Size  Field
//! 0       8     layout descriptor (u64, little-endian)
//! 8       1     word class (1 = 32-bit, 2 = 64-bit)
//! 9       1     byte order (1 = little, 2 = big)
//! 10      4     reserved (must be zero)
//! 14      2     machine (u16, little-endian, ELF e_machine numbering)
//! ```
//!
//! Integers are always written little-endian, so the 16 bytes are identical
//! no matter which host produced them.

pub mod certify;
pub mod layout;
pub mod probe;

use crate::error::{Result, VmemError};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

pub use certify::{ArchCertifier, Mismatch};
pub use layout::layout_descriptor;
pub use probe::{probe, ArchProbe, FileProbe, ImageProbe};

/// Size of the encoded descriptor in bytes
pub const DESCRIPTOR_SIZE: usize = 16;

/// Size of the reserved block in bytes
pub const RESERVED_SIZE: usize = 4;

/// CPU architecture of the code that produced a descriptor
///
/// Numbered after ELF `e_machine`. Values this crate does not name are kept
/// verbatim in [`Machine::Other`] so the raw id survives a round trip.
///
/// Equality and hashing go through the raw id, so `Other(62)` equals
/// `X86_64`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Machine {
    Sparc,
    X86,
    Mips,
    PowerPc,
    PowerPc64,
    S390,
    Arm,
    SparcV9,
    X86_64,
    Aarch64,
    RiscV,
    LoongArch,
    Other(u16),
}

impl Machine {
    /// Parse a machine from its ELF `e_machine` value
    pub fn from_u16(value: u16) -> Self {
        match value {
            2 => Self::Sparc,
            3 => Self::X86,
            8 => Self::Mips,
            20 => Self::PowerPc,
            21 => Self::PowerPc64,
            22 => Self::S390,
            40 => Self::Arm,
            43 => Self::SparcV9,
            62 => Self::X86_64,
            183 => Self::Aarch64,
            243 => Self::RiscV,
            258 => Self::LoongArch,
            other => Self::Other(other),
        }
    }

    /// ELF `e_machine` value
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Sparc => 2,
            Self::X86 => 3,
            Self::Mips => 8,
            Self::PowerPc => 20,
            Self::PowerPc64 => 21,
            Self::S390 => 22,
            Self::Arm => 40,
            Self::SparcV9 => 43,
            Self::X86_64 => 62,
            Self::Aarch64 => 183,
            Self::RiscV => 243,
            Self::LoongArch => 258,
            Self::Other(raw) => raw,
        }
    }
}

impl PartialEq for Machine {
    fn eq(&self, other: &Self) -> bool {
        self.as_u16() == other.as_u16()
    }
}

impl Eq for Machine {}

impl Hash for Machine {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_u16().hash(state);
    }
}

/// Addressing class of the image
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WordClass {
    Bits32 = 1,
    Bits64 = 2,
}

impl WordClass {
    /// Parse from an ELF `EI_CLASS` byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Bits32),
            2 => Some(Self::Bits64),
            _ => None,
        }
    }

    /// Word class this crate was compiled for
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Bits64
        } else {
            Self::Bits32
        }
    }
}

/// Byte order of the image
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    Little = 1,
    Big = 2,
}

impl ByteOrder {
    /// Parse from an ELF `EI_DATA` byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Little),
            2 => Some(Self::Big),
            _ => None,
        }
    }

    /// Byte order this crate was compiled for
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }
}

/// Binary-layout facts about one build of the runtime
///
/// Immutable value data with no pointers, safe to persist and compare
/// bit-for-bit across processes and machines. Two descriptors are identical
/// iff every field is equal; whether they are *compatible* is decided by
/// [`ArchCertifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchDescriptor {
    machine: Machine,
    word_class: WordClass,
    byte_order: ByteOrder,
    layout_descriptor: u64,
    reserved: [u8; RESERVED_SIZE],
}

impl ArchDescriptor {
    /// Create a descriptor with zeroed reserved bytes
    pub fn new(
        machine: Machine,
        word_class: WordClass,
        byte_order: ByteOrder,
        layout_descriptor: u64,
    ) -> Self {
        ArchDescriptor {
            machine,
            word_class,
            byte_order,
            layout_descriptor,
            reserved: [0; RESERVED_SIZE],
        }
    }

    /// Descriptor of the running process, as reported by [`probe`]
    pub fn current() -> Result<Self> {
        probe()
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn word_class(&self) -> WordClass {
        self.word_class
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn layout_descriptor(&self) -> u64 {
        self.layout_descriptor
    }

    pub fn reserved(&self) -> [u8; RESERVED_SIZE] {
        self.reserved
    }

    /// Whether the reserved block is all zero
    pub fn reserved_is_zero(&self) -> bool {
        self.reserved.iter().all(|&b| b == 0)
    }

    /// Copy of this descriptor with a different layout descriptor
    ///
    /// A zero value keeps the current layout descriptor.
    pub fn with_layout_descriptor(mut self, layout_descriptor: u64) -> Self {
        if layout_descriptor != 0 {
            self.layout_descriptor = layout_descriptor;
        }
        self
    }

    /// Copy of this descriptor with the reserved block overwritten
    pub fn with_reserved(mut self, reserved: [u8; RESERVED_SIZE]) -> Self {
        self.reserved = reserved;
        self
    }

    /// Serialize to the 16-byte wire format
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut bytes = [0u8; DESCRIPTOR_SIZE];

        bytes[0..8].copy_from_slice(&self.layout_descriptor.to_le_bytes());
        bytes[8] = self.word_class as u8;
        bytes[9] = self.byte_order as u8;
        bytes[10..14].copy_from_slice(&self.reserved);
        bytes[14..16].copy_from_slice(&self.machine.as_u16().to_le_bytes());

        bytes
    }

    /// Deserialize from the 16-byte wire format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return Err(VmemError::InvalidDescriptor(format!(
                "need {} bytes, got {}",
                DESCRIPTOR_SIZE,
                bytes.len()
            )));
        }

        let mut layout = [0u8; 8];
        layout.copy_from_slice(&bytes[0..8]);

        let word_class = WordClass::from_u8(bytes[8]).ok_or_else(|| {
            VmemError::InvalidDescriptor(format!("unknown word class {}", bytes[8]))
        })?;
        let byte_order = ByteOrder::from_u8(bytes[9]).ok_or_else(|| {
            VmemError::InvalidDescriptor(format!("unknown byte order {}", bytes[9]))
        })?;

        let mut reserved = [0u8; RESERVED_SIZE];
        reserved.copy_from_slice(&bytes[10..14]);

        Ok(ArchDescriptor {
            machine: Machine::from_u16(u16::from_le_bytes([bytes[14], bytes[15]])),
            word_class,
            byte_order,
            layout_descriptor: u64::from_le_bytes(layout),
            reserved,
        })
    }
}
