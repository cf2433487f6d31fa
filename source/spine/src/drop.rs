//! Drop frames
//!
//! A drop is the fixed-size record exchanged in each direction once per
//! hardware tick. Its size matches the DMA granularity of the link, so the
//! layout is byte exact:
//!
//! ```text
//! [ payload region (SIZE - 2 bytes) ][ payload_len: u8 ][ droplet: u8 ]
//! ```
//!
//! The payload region holds a stream of framed messages,
//! `[len][tag][body...]`, back to back. `payload_len` is the number of
//! stream bytes in use; everything after it is zero filled, so a stale
//! drop never leaks bytes from an earlier tick.
//!
//! Both directions share this trailer and differ only in size. Every
//! message carries its own tag in the stream, so the byte before the
//! droplet always holds the stream length.

use bitflags::bitflags;

use crate::ring::MSG_HEADER;

/// Trailer bytes at the end of every drop
pub const DROP_TRAILER: usize = 2;

/// Size of a drop sent from the WiFi processor to the RTIP
pub const TO_RTIP_FRAME_SIZE: usize = 100;

/// Size of a drop sent from the RTIP to the WiFi processor
pub const TO_WIFI_FRAME_SIZE: usize = 80;

/// A drop sent from the WiFi processor to the RTIP
pub type ToRtipFrame = DropFrame<TO_RTIP_FRAME_SIZE>;

/// A drop sent from the RTIP to the WiFi processor
pub type ToWifiFrame = DropFrame<TO_WIFI_FRAME_SIZE>;

/// Largest message body that fits in a single drop of `frame_size` bytes
pub const fn max_body(frame_size: usize) -> usize {
    frame_size - DROP_TRAILER - MSG_HEADER
}

bitflags! {
    /// Flag bits of the droplet byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DropletFlags: u8 {
        /// The payload region carries at least one message
        const MESSAGES     = 0b0001_0000;
        /// The sender still had queued messages that did not fit
        const MORE_PENDING = 0b0010_0000;
    }
}

/// Droplet byte
///
/// [Droplet] is a combined sequence and flags byte. It consists of:
///
/// * 4 sequence-bits (`0..=15`)
/// * 2 flag-bits, see [DropletFlags]
/// * 2 reserved bits, which must be zero
///
/// The reserved bits are most significant, e.g. `0bRRFF_SSSS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Droplet {
    /// Sequence counter, wraps at 16
    pub seq: u8,
    /// Flags
    pub flags: DropletFlags,
}

/// Droplet decoding error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum DropletError {
    /// A reserved bit pattern was found
    Reserved,
}

impl Droplet {
    pub(crate) const SEQ_MASK: u8 = 0b0000_1111;
    const RESERVED_MASK: u8 = 0b1100_0000;
}

impl TryFrom<u8> for Droplet {
    type Error = DropletError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value & Self::RESERVED_MASK != 0 {
            return Err(DropletError::Reserved);
        }
        Ok(Droplet {
            seq: value & Self::SEQ_MASK,
            flags: DropletFlags::from_bits_truncate(value),
        })
    }
}

impl From<Droplet> for u8 {
    fn from(val: Droplet) -> Self {
        (val.seq & Droplet::SEQ_MASK) | val.flags.bits()
    }
}

/// A fixed-size drop of `SIZE` bytes
#[derive(Clone, PartialEq, Eq)]
pub struct DropFrame<const SIZE: usize> {
    bytes: [u8; SIZE],
}

impl<const SIZE: usize> DropFrame<SIZE> {
    /// Size of the payload region
    pub const PAYLOAD: usize = {
        assert!(SIZE > DROP_TRAILER + MSG_HEADER, "drop too small");
        assert!(SIZE - DROP_TRAILER <= u8::MAX as usize, "drop too large");
        SIZE - DROP_TRAILER
    };

    /// An all-zero drop: empty payload, sequence zero, no flags
    pub const fn zeroed() -> Self {
        let _ = Self::PAYLOAD;
        Self { bytes: [0u8; SIZE] }
    }

    /// Wrap a received buffer. The length must be exactly `SIZE`.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; SIZE] = raw.try_into().ok()?;
        Some(Self { bytes })
    }

    /// The on-wire bytes
    pub fn as_bytes(&self) -> &[u8; SIZE] {
        &self.bytes
    }

    /// Mutable on-wire bytes, for receiving directly into a drop
    pub fn as_bytes_mut(&mut self) -> &mut [u8; SIZE] {
        &mut self.bytes
    }

    /// The used portion of the payload stream
    ///
    /// A corrupt `payload_len` larger than the region is clamped.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.payload_len()]
    }

    /// The whole payload region, for filling
    pub fn payload_region_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..Self::PAYLOAD]
    }

    /// Number of stream bytes in use
    pub fn payload_len(&self) -> usize {
        (self.bytes[Self::PAYLOAD] as usize).min(Self::PAYLOAD)
    }

    /// Set the number of stream bytes in use
    pub fn set_payload_len(&mut self, len: usize) {
        self.bytes[Self::PAYLOAD] = len.min(Self::PAYLOAD) as u8;
    }

    /// Decode the droplet byte
    pub fn droplet(&self) -> Result<Droplet, DropletError> {
        Droplet::try_from(self.bytes[SIZE - 1])
    }

    /// Encode the droplet byte
    pub fn set_droplet(&mut self, droplet: Droplet) {
        self.bytes[SIZE - 1] = droplet.into();
    }

    /// Iterate over the framed messages in the payload stream
    pub fn messages(&self) -> Messages<'_> {
        Messages {
            remain: self.payload(),
        }
    }
}

impl<const SIZE: usize> Default for DropFrame<SIZE> {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A message found in a drop's payload stream
#[derive(Debug, PartialEq, Eq)]
pub struct RawMessage<'a> {
    /// Message tag
    pub tag: u8,
    /// Message body, excluding the length and tag bytes
    pub body: &'a [u8],
}

/// The payload stream ended in the middle of a message
#[derive(Debug, PartialEq, Eq)]
pub struct Truncated;

/// Iterator over a drop's message stream, see [DropFrame::messages]
///
/// A zero length byte ends the stream. A message that claims more bytes
/// than remain yields one [Truncated] error and ends the stream.
pub struct Messages<'a> {
    remain: &'a [u8],
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<RawMessage<'a>, Truncated>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.remain.split_first()?;
        if len == 0 {
            self.remain = &[];
            return None;
        }
        let len = len as usize;
        if rest.len() < len {
            self.remain = &[];
            return Some(Err(Truncated));
        }
        let (msg, rest) = rest.split_at(len);
        self.remain = rest;
        let (&tag, body) = msg.split_first()?;
        Some(Ok(RawMessage { tag, body }))
    }
}

/// Tracks the sequence nibble of incoming drops
#[derive(Debug, Default)]
pub struct SeqTracker {
    expected: Option<u8>,
    missed: u32,
}

impl SeqTracker {
    /// Create a tracker that has not seen any drop yet
    pub const fn new() -> Self {
        Self {
            expected: None,
            missed: 0,
        }
    }

    /// Record a received sequence number, returning how many drops were
    /// skipped since the previous one
    pub fn observe(&mut self, seq: u8) -> u8 {
        let seq = seq & Droplet::SEQ_MASK;
        let skipped = match self.expected {
            Some(exp) => seq.wrapping_sub(exp) & Droplet::SEQ_MASK,
            None => 0,
        };
        self.missed += u32::from(skipped);
        self.expected = Some((seq + 1) & Droplet::SEQ_MASK);
        skipped
    }

    /// Total skipped drops observed
    pub fn missed(&self) -> u32 {
        self.missed
    }
}
