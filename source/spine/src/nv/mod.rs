//! Non-volatile storage
//!
//! Tagged blobs are stored in a log-structured layout on raw NOR flash:
//!
//! * [layout] describes the on-flash records and where the regions live
//! * [flash] is the hardware abstraction, and an in-memory flash for tests
//! * [engine] is the flash engine, stepped one flash primitive at a time
//! * [storage] is the single-flight command queue used by the rest of the
//!   system
//!
//! Every operation reports its outcome as a sequence of [NvEvent]s, the
//! last of which is always the final one for that operation.

pub mod engine;
pub mod flash;
pub mod layout;
pub mod storage;

#[cfg(feature = "postcard-helpers")]
use serde::{Deserialize, Serialize};

pub use engine::NvEngine;
pub use flash::{FlashError, FlashHal};
pub use layout::{DefaultLayout, NvCfg};
pub use storage::NvStorage;

/// Largest number of blob bytes carried by a single read event
pub const NV_CHUNK_SIZE: usize = 48;

/// Largest blob that can be stored under a single tag
pub const MAX_BLOB_LEN: usize = 1024;

/// Result codes of storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "postcard-helpers", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(i8)]
pub enum NvResult {
    /// Success
    Okay = 0,
    /// Success, more results follow
    More = 1,
    /// The command was accepted and will complete later
    Scheduled = 2,
    /// Another operation is already in flight
    Busy = -1,
    /// Address, length or tag validation failed
    BadArgs = -2,
    /// No matching entry
    NotFound = -3,
    /// No memory to hold the command
    NoMem = -4,
    /// The segment is full, garbage collection is needed
    NoRoom = -5,
    /// The runaway operation guard tripped
    Loop = -6,
    /// A flash primitive failed
    Error = -7,
    /// A flash primitive timed out
    Timeout = -8,
}

impl NvResult {
    /// Is this a success code?
    pub fn is_ok(self) -> bool {
        (self as i8) >= 0
    }
}

/// The kind of operation an [NvEvent] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "postcard-helpers", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum NvOp {
    /// Read one tag or a range of tags
    Read,
    /// Write one tag
    Write,
    /// Erase one tag or a range of tags
    Erase,
    /// Erase everything
    WipeAll,
    /// Compact the active segment
    GarbageCollect,
}

/// A request for the storage subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvCommand {
    /// Read `tag`, or every tag in `tag..=end`
    Read {
        /// First tag
        tag: u32,
        /// Last tag of a range read
        end: Option<u32>,
    },
    /// Store `data` under `tag`, replacing any previous value
    Write {
        /// Tag to write
        tag: u32,
        /// New value
        data: heapless::Vec<u8, MAX_BLOB_LEN>,
        /// Permit writes into the factory tag space
        allow_factory: bool,
    },
    /// Delete `tag`, or every tag in `tag..=end`
    Erase {
        /// First tag
        tag: u32,
        /// Last tag of a range erase
        end: Option<u32>,
    },
    /// Erase both segments, and the factory region if asked
    WipeAll {
        /// Also erase the factory region
        include_factory: bool,
    },
}

impl NvCommand {
    /// The kind of operation
    pub fn op(&self) -> NvOp {
        match self {
            NvCommand::Read { .. } => NvOp::Read,
            NvCommand::Write { .. } => NvOp::Write,
            NvCommand::Erase { .. } => NvOp::Erase,
            NvCommand::WipeAll { .. } => NvOp::WipeAll,
        }
    }

    /// The tag reported in events for this command
    pub fn tag(&self) -> u32 {
        match self {
            NvCommand::Read { tag, .. }
            | NvCommand::Write { tag, .. }
            | NvCommand::Erase { tag, .. } => *tag,
            NvCommand::WipeAll { .. } => 0,
        }
    }
}

/// Progress reported by a storage operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvEvent {
    /// A chunk of a stored blob
    Data {
        /// Tag of the entry
        tag: u32,
        /// Offset of this chunk within the blob
        offset: u16,
        /// Total blob length
        total_len: u16,
        /// The chunk
        data: heapless::Vec<u8, NV_CHUNK_SIZE>,
        /// [NvResult::More] unless this is the final event of a single read
        result: NvResult,
    },
    /// One entry of a range erase was deleted
    Erased {
        /// Tag of the entry
        tag: u32,
    },
    /// The operation finished
    Complete {
        /// Kind of operation
        op: NvOp,
        /// Tag the operation was started with
        tag: u32,
        /// Outcome
        result: NvResult,
    },
}

impl NvEvent {
    /// The result carried by this event
    pub fn result(&self) -> NvResult {
        match self {
            NvEvent::Data { result, .. } | NvEvent::Complete { result, .. } => *result,
            NvEvent::Erased { .. } => NvResult::More,
        }
    }
}

/// Well-known tags
pub mod tags {
    /// Factory birth certificate: model, serial, manufacturing date
    pub const BIRTH_CERTIFICATE: u32 = 0x8000_0000;
    /// Factory IMU calibration averages
    pub const IMU_AVERAGES: u32 = 0x8000_0001;
    /// Factory playpen test results
    pub const PLAYPEN_RESULTS: u32 = 0x8000_0010;
    /// Camera intrinsic calibration
    pub const CAMERA_CALIBRATION: u32 = 0x0000_0004;
    /// Onboarding progress
    pub const ONBOARDING_DATA: u32 = 0x0000_0008;
    /// Game skill levels
    pub const GAME_SKILL_LEVELS: u32 = 0x0000_000C;
    /// First face album record
    pub const FACE_ALBUM_START: u32 = 0x0001_0000;
    /// Last face album record
    pub const FACE_ALBUM_END: u32 = 0x0001_00FF;
    /// First face enrollment record
    pub const FACE_ENROLL_START: u32 = 0x0002_0000;
    /// Last face enrollment record
    pub const FACE_ENROLL_END: u32 = 0x0002_00FF;
}

/// The largest blob accepted for `tag`
pub fn max_size_for_tag(tag: u32) -> usize {
    match tag {
        tags::BIRTH_CERTIFICATE => 32,
        tags::IMU_AVERAGES => 24,
        tags::PLAYPEN_RESULTS => 128,
        tags::CAMERA_CALIBRATION => 64,
        tags::ONBOARDING_DATA | tags::GAME_SKILL_LEVELS => 256,
        tags::FACE_ALBUM_START..=tags::FACE_ALBUM_END => MAX_BLOB_LEN,
        tags::FACE_ENROLL_START..=tags::FACE_ENROLL_END => 512,
        _ => MAX_BLOB_LEN,
    }
}
