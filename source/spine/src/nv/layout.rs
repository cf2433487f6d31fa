//! On-flash layout
//!
//! ## Segments
//!
//! Two symmetric segments, A and B, hold the entry log. Each starts with a
//! [SegmentHeader]:
//!
//! ```text
//! offset  0: magic           u32
//! offset  4: format_version  u32
//! offset  8: journal_number  u32
//! ```
//!
//! and entries follow immediately. The segment with a valid header and the
//! highest journal number is the active one.
//!
//! ## Entries
//!
//! ```text
//! offset  0: size       u32   whole record, multiple of 4
//! offset  4: tag        u32
//! offset  8: successor  u32   0xFFFF_FFFF live, 0 deleted, else superseded
//! offset 12: length     u32   exact blob length
//! offset 16: blob, padded with 0xFF to a multiple of 4
//! size - 4:  control    u32   0 once the record is complete
//! ```
//!
//! All fields are little endian. An entry is live when its control word
//! reads back as zero and no completed entry follows it along its
//! successor chain. A successor written by an overwrite that lost power
//! before its control word leads to an incomplete entry, so the older
//! value stays live, and the next overwrite patches the end of that chain.
//! A tag of `0xFFFF_FFFF` (erased flash) ends the log.
//!
//! The factory region uses the same entry format without a segment header.
//! Fixture slots use a fixed stride instead: a `u32` length followed by the
//! data, where an erased length means the slot is empty.

use embassy_time::Duration;

use super::MAX_BLOB_LEN;

/// Segment header magic, "NVst"
pub const SEGMENT_MAGIC: u32 = 0x7473_564E;

/// Current on-flash format
pub const FORMAT_VERSION: u32 = 1;

/// Bytes in a segment header
pub const SEGMENT_HEADER_LEN: u32 = 12;

/// Bytes in an entry header
pub const ENTRY_HEADER_LEN: u32 = 16;

/// Bytes in the trailing control word
pub const CONTROL_LEN: u32 = 4;

/// Bytes of every entry that are not blob
pub const OVERHEAD: u32 = ENTRY_HEADER_LEN + CONTROL_LEN;

/// Largest valid entry size
pub const MAX_ENTRY_SIZE: u32 = entry_size(MAX_BLOB_LEN as u32);

/// Successor of an entry that has not been superseded
pub const NOT_SUPERSEDED: u32 = 0xFFFF_FFFF;

/// Successor of a deleted entry
pub const DELETED: u32 = 0;

/// Control word of a completed entry
pub const CONTROL_COMPLETE: u32 = 0;

/// The tag that ends a log scan
pub const INVALID_TAG: u32 = 0xFFFF_FFFF;

/// Offset of the successor field within an entry
pub const SUCCESSOR_OFFSET: u32 = 8;

/// Round up to a multiple of four
pub const fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

/// Full record size of an entry with a blob of `len` bytes
pub const fn entry_size(len: u32) -> u32 {
    align4(len) + OVERHEAD
}

fn u32_at(b: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
}

/// Header at the start of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Must be [SEGMENT_MAGIC]
    pub magic: u32,
    /// Must be [FORMAT_VERSION]
    pub format_version: u32,
    /// Generation counter, the highest valid one is active
    pub journal_number: u32,
}

impl SegmentHeader {
    /// A current-format header
    pub const fn new(journal_number: u32) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            format_version: FORMAT_VERSION,
            journal_number,
        }
    }

    /// Does this header mark a usable segment?
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == FORMAT_VERSION
    }

    /// On-flash bytes
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN as usize] {
        let mut out = [0u8; SEGMENT_HEADER_LEN as usize];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        out[8..12].copy_from_slice(&self.journal_number.to_le_bytes());
        out
    }

    /// Parse on-flash bytes
    pub fn decode(b: &[u8; SEGMENT_HEADER_LEN as usize]) -> Self {
        Self {
            magic: u32_at(b, 0),
            format_version: u32_at(b, 4),
            journal_number: u32_at(b, 8),
        }
    }
}

/// An entry header whose size field cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptEntry;

/// Header at the start of every entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Whole record size
    pub size: u32,
    /// Entry tag
    pub tag: u32,
    /// Successor address, see [NOT_SUPERSEDED] and [DELETED]
    pub successor: u32,
    /// Exact blob length
    pub length: u32,
}

impl EntryHeader {
    /// Header for a new entry holding `len` bytes
    pub const fn for_blob(tag: u32, len: u32) -> Self {
        Self {
            size: entry_size(len),
            tag,
            successor: NOT_SUPERSEDED,
            length: len,
        }
    }

    /// On-flash bytes
    pub fn encode(&self) -> [u8; ENTRY_HEADER_LEN as usize] {
        let mut out = [0u8; ENTRY_HEADER_LEN as usize];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.successor.to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Parse on-flash bytes
    pub fn decode(b: &[u8; ENTRY_HEADER_LEN as usize]) -> Self {
        Self {
            size: u32_at(b, 0),
            tag: u32_at(b, 4),
            successor: u32_at(b, 8),
            length: u32_at(b, 12),
        }
    }

    /// Does this header mark the end of the log?
    pub fn is_end(&self) -> bool {
        self.tag == INVALID_TAG
    }

    /// Has this entry been deleted?
    pub fn is_deleted(&self) -> bool {
        self.successor == DELETED
    }

    /// Check the size fields of an entry found at `at`, in a region ending
    /// at `end`
    pub fn check(&self, at: u32, end: u32) -> Result<(), CorruptEntry> {
        let fits = at
            .checked_add(self.size)
            .map(|stop| stop <= end)
            .unwrap_or(false);
        if self.size % 4 != 0
            || self.size < OVERHEAD
            || self.size > MAX_ENTRY_SIZE
            || self.length > self.size - OVERHEAD
            || !fits
        {
            return Err(CorruptEntry);
        }
        Ok(())
    }

    /// Address of the blob of an entry at `at`
    pub fn blob_addr(at: u32) -> u32 {
        at + ENTRY_HEADER_LEN
    }

    /// Address of the control word of this entry at `at`
    pub fn control_addr(&self, at: u32) -> u32 {
        at + self.size - CONTROL_LEN
    }
}

/// The address space a storage tag belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSpace {
    /// Stored in the active segment
    Normal,
    /// Stored in the factory region
    Factory,
    /// Stored in a fixed fixture slot
    Fixture {
        /// Slot index
        slot: u16,
    },
    /// The end-of-log sentinel, never a valid tag
    Invalid,
}

/// First tag of the factory space
pub const FACTORY_TAG_START: u32 = 0x8000_0000;

/// First tag of the fixture space
pub const FIXTURE_TAG_START: u32 = 0xC000_0000;

impl TagSpace {
    /// Classify a storage tag
    pub const fn of(tag: u32) -> Self {
        if tag == INVALID_TAG {
            TagSpace::Invalid
        } else if tag >= FIXTURE_TAG_START {
            TagSpace::Fixture {
                slot: (tag & 0xFFFF) as u16,
            }
        } else if tag >= FACTORY_TAG_START {
            TagSpace::Factory
        } else {
            TagSpace::Normal
        }
    }

    /// Are both tags in the same space? Fixture slots all share one space.
    pub fn same(a: u32, b: u32) -> bool {
        core::mem::discriminant(&Self::of(a)) == core::mem::discriminant(&Self::of(b))
    }
}

/// One of the two log segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Segment {
    /// Segment A
    A,
    /// Segment B
    B,
}

impl Segment {
    /// The other segment
    pub fn other(self) -> Self {
        match self {
            Segment::A => Segment::B,
            Segment::B => Segment::A,
        }
    }
}

/// A contiguous range of flash, `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address
    pub start: u32,
    /// One past the last address
    pub end: u32,
}

/// Flash map and tuning of the storage subsystem
///
/// All addresses are absolute flash addresses. Regions must be sector
/// aligned and must not overlap.
pub trait NvCfg {
    /// Erase granularity
    const SECTOR_SIZE: u32;
    /// Base of segment A
    const SEGMENT_A: u32;
    /// Base of segment B
    const SEGMENT_B: u32;
    /// Sectors in each segment
    const SEGMENT_SECTORS: u32;
    /// Base of the factory region
    const FACTORY_BASE: u32;
    /// Sectors in the factory region
    const FACTORY_SECTORS: u32;
    /// Base of the fixture slots
    const FIXTURE_BASE: u32;
    /// Distance between fixture slots
    const FIXTURE_STRIDE: u32;
    /// Number of fixture slots
    const FIXTURE_SLOTS: u16;
    /// Writes and erases below this address are always rejected
    const MIN_WRITE_ADDRESS: u32;
    /// Retries of a single flash primitive before the operation fails
    const FLASH_RETRIES: u8;
    /// Wait between retries of a flash primitive
    const RETRY_DELAY: Duration;
    /// Ticks a command may take before it is abandoned
    const MAX_LOOPS: u32;

    /// Base address of a segment
    fn segment_base(seg: Segment) -> u32 {
        match seg {
            Segment::A => Self::SEGMENT_A,
            Segment::B => Self::SEGMENT_B,
        }
    }

    /// Where the entries of a segment live
    fn segment_entries(seg: Segment) -> Region {
        let base = Self::segment_base(seg);
        Region {
            start: base + SEGMENT_HEADER_LEN,
            end: base + Self::SEGMENT_SECTORS * Self::SECTOR_SIZE,
        }
    }

    /// Where factory entries live
    fn factory_entries() -> Region {
        Region {
            start: Self::FACTORY_BASE,
            end: Self::FACTORY_BASE + Self::FACTORY_SECTORS * Self::SECTOR_SIZE,
        }
    }

    /// Address of a fixture slot
    fn fixture_slot(slot: u16) -> Option<u32> {
        (slot < Self::FIXTURE_SLOTS).then(|| Self::FIXTURE_BASE + u32::from(slot) * Self::FIXTURE_STRIDE)
    }
}

/// The flash map used on the robot
pub struct DefaultLayout;

impl NvCfg for DefaultLayout {
    const SECTOR_SIZE: u32 = 0x1000;
    const SEGMENT_A: u32 = 0x1C_0000;
    const SEGMENT_B: u32 = 0x1D_0000;
    const SEGMENT_SECTORS: u32 = 16;
    const FACTORY_BASE: u32 = 0x1E_0000;
    const FACTORY_SECTORS: u32 = 4;
    const FIXTURE_BASE: u32 = 0x1E_4000;
    const FIXTURE_STRIDE: u32 = 0x400;
    const FIXTURE_SLOTS: u16 = 16;
    const MIN_WRITE_ADDRESS: u32 = 0x0C_0000;
    const FLASH_RETRIES: u8 = 5;
    const RETRY_DELAY: Duration = Duration::from_millis(2);
    const MAX_LOOPS: u32 = 20_000;
}
