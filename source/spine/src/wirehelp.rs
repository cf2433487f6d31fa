//! Wire data format helper functions
//!
//! Storage requests and replies travel as postcard encoded bodies of
//! [NV_REQUEST][crate::protocol::tag::NV_REQUEST] and
//! [NV_REPLY][crate::protocol::tag::NV_REPLY] messages. A blob larger than
//! one message is sent as numbered parts, and put back together by a
//! [WriteAssembler] before it becomes a single write command.

use serde::{Deserialize, Serialize};

use crate::nv::{NvCommand, NvEvent, NvOp, NvResult, MAX_BLOB_LEN};

/// Largest chunk of blob data carried by one [NvRequest::WritePart]
///
/// Sized so the encoded request fits the body of one drop frame message
/// towards the body processor.
pub const WRITE_PART_DATA: usize = 64;

/// A storage request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NvRequest<'a> {
    /// Read one tag, or a range of tags
    Read {
        /// First tag
        tag: u32,
        /// Last tag of a range read
        end: Option<u32>,
    },
    /// One part of a blob to be written
    WritePart {
        /// Tag to write
        tag: u32,
        /// Position of this part in the blob
        offset: u16,
        /// Length of the whole blob
        total_len: u16,
        /// Permit writes into the factory tag space
        allow_factory: bool,
        /// The part
        data: &'a [u8],
    },
    /// Erase one tag, or a range of tags
    Erase {
        /// First tag
        tag: u32,
        /// Last tag of a range erase
        end: Option<u32>,
    },
    /// Erase everything
    WipeAll {
        /// Also erase the factory region
        include_factory: bool,
    },
    /// Compact the active segment
    GarbageCollect,
}

/// A storage reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NvReply<'a> {
    /// The request was scheduled, or rejected outright
    ///
    /// Write parts that do not yet complete a blob are acknowledged with
    /// [NvResult::More].
    Ack {
        /// Requested operation
        op: NvOp,
        /// Requested tag
        tag: u32,
        /// [NvResult::Scheduled], or why the request was refused
        result: NvResult,
    },
    /// A chunk of a blob
    Data {
        /// Tag of the entry
        tag: u32,
        /// Offset of this chunk within the blob
        offset: u16,
        /// Length of the whole blob
        total_len: u16,
        /// See [NvEvent::Data]
        result: NvResult,
        /// The chunk
        data: &'a [u8],
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

impl<'a> From<&'a NvEvent> for NvReply<'a> {
    fn from(ev: &'a NvEvent) -> Self {
        match ev {
            NvEvent::Data {
                tag,
                offset,
                total_len,
                data,
                result,
            } => NvReply::Data {
                tag: *tag,
                offset: *offset,
                total_len: *total_len,
                result: *result,
                data,
            },
            NvEvent::Erased { tag } => NvReply::Erased { tag: *tag },
            NvEvent::Complete { op, tag, result } => NvReply::Complete {
                op: *op,
                tag: *tag,
                result: *result,
            },
        }
    }
}

impl NvRequest<'_> {
    /// The kind of operation requested
    pub fn op(&self) -> NvOp {
        match self {
            NvRequest::Read { .. } => NvOp::Read,
            NvRequest::WritePart { .. } => NvOp::Write,
            NvRequest::Erase { .. } => NvOp::Erase,
            NvRequest::WipeAll { .. } => NvOp::WipeAll,
            NvRequest::GarbageCollect => NvOp::GarbageCollect,
        }
    }

    /// The tag the request refers to, zero if none
    pub fn tag(&self) -> u32 {
        match self {
            NvRequest::Read { tag, .. }
            | NvRequest::WritePart { tag, .. }
            | NvRequest::Erase { tag, .. } => *tag,
            NvRequest::WipeAll { .. } | NvRequest::GarbageCollect => 0,
        }
    }
}

/// Encode a request into `buf`, returning the used portion
pub fn encode_request<'b>(req: &NvRequest<'_>, buf: &'b mut [u8]) -> Option<&'b mut [u8]> {
    postcard::to_slice(req, buf).ok()
}

/// Decode a request body
pub fn decode_request(body: &[u8]) -> Option<NvRequest<'_>> {
    postcard::from_bytes(body).ok()
}

/// Encode a reply into `buf`, returning the used portion
pub fn encode_reply<'b>(reply: &NvReply<'_>, buf: &'b mut [u8]) -> Option<&'b mut [u8]> {
    postcard::to_slice(reply, buf).ok()
}

/// Decode a reply body
pub fn decode_reply(body: &[u8]) -> Option<NvReply<'_>> {
    postcard::from_bytes(body).ok()
}

/// Split `data` into the write parts that carry it
pub fn write_parts(
    tag: u32,
    data: &[u8],
    allow_factory: bool,
) -> impl Iterator<Item = NvRequest<'_>> + '_ {
    let total_len = data.len() as u16;
    // An empty blob is still one part
    let parts = data.len().div_ceil(WRITE_PART_DATA).max(1);
    (0..parts).map(move |i| {
        let start = i * WRITE_PART_DATA;
        let end = (start + WRITE_PART_DATA).min(data.len());
        NvRequest::WritePart {
            tag,
            offset: start as u16,
            total_len,
            allow_factory,
            data: &data[start..end],
        }
    })
}

/// Puts multi-part writes back together
///
/// Parts must arrive in order. A part with offset zero always starts a new
/// blob, discarding anything partially assembled.
#[derive(Debug, Default)]
pub struct WriteAssembler {
    tag: u32,
    total_len: u16,
    allow_factory: bool,
    data: heapless::Vec<u8, MAX_BLOB_LEN>,
    active: bool,
}

impl WriteAssembler {
    /// An idle assembler
    pub const fn new() -> Self {
        Self {
            tag: 0,
            total_len: 0,
            allow_factory: false,
            data: heapless::Vec::new(),
            active: false,
        }
    }

    /// Is a blob partially assembled?
    pub fn in_progress(&self) -> bool {
        self.active
    }

    /// Discard any partial blob
    pub fn reset(&mut self) {
        self.active = false;
        self.data.clear();
    }

    /// Add one part
    ///
    /// Returns the write command once the last part has arrived.
    /// [NvResult::NoMem] is returned for blobs that could never be held,
    /// and [NvResult::BadArgs] for parts that do not continue the blob.
    pub fn push(
        &mut self,
        tag: u32,
        offset: u16,
        total_len: u16,
        allow_factory: bool,
        part: &[u8],
    ) -> Result<Option<NvCommand>, NvResult> {
        if usize::from(total_len) > MAX_BLOB_LEN {
            self.reset();
            return Err(NvResult::NoMem);
        }
        if offset == 0 {
            self.reset();
            self.tag = tag;
            self.total_len = total_len;
            self.allow_factory = allow_factory;
            self.active = true;
        }
        let continues = self.active
            && tag == self.tag
            && total_len == self.total_len
            && usize::from(offset) == self.data.len()
            && usize::from(offset) + part.len() <= usize::from(total_len);
        if !continues {
            spine_warn!("write part for tag {} at {} rejected", tag, offset);
            self.reset();
            return Err(NvResult::BadArgs);
        }
        if self.data.extend_from_slice(part).is_err() {
            self.reset();
            return Err(NvResult::NoMem);
        }
        if self.data.len() < usize::from(self.total_len) {
            return Ok(None);
        }
        self.active = false;
        Ok(Some(NvCommand::Write {
            tag: self.tag,
            data: core::mem::take(&mut self.data),
            allow_factory: self.allow_factory,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        drop::{max_body, TO_RTIP_FRAME_SIZE, TO_WIFI_FRAME_SIZE},
        nv::NV_CHUNK_SIZE,
    };

    #[test]
    fn largest_messages_fit_a_frame() {
        let data = [0xAAu8; WRITE_PART_DATA];
        let req = NvRequest::WritePart {
            tag: u32::MAX,
            offset: u16::MAX,
            total_len: u16::MAX,
            allow_factory: true,
            data: &data,
        };
        let mut buf = [0u8; 256];
        let used = encode_request(&req, &mut buf).unwrap().len();
        assert!(used <= max_body(TO_RTIP_FRAME_SIZE));

        let chunk = [0x55u8; NV_CHUNK_SIZE];
        let reply = NvReply::Data {
            tag: u32::MAX,
            offset: u16::MAX,
            total_len: u16::MAX,
            result: NvResult::Timeout,
            data: &chunk,
        };
        let used = encode_reply(&reply, &mut buf).unwrap().len();
        assert!(used <= max_body(TO_WIFI_FRAME_SIZE));
    }

    #[test]
    fn request_decodes_borrowed() {
        let req = NvRequest::Erase {
            tag: 0x1_0000,
            end: Some(0x1_00FF),
        };
        let mut buf = [0u8; 32];
        let used = encode_request(&req, &mut buf).unwrap();
        assert_eq!(decode_request(used), Some(req));
        assert_eq!(decode_request(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn event_becomes_reply() {
        let ev = NvEvent::Data {
            tag: 4,
            offset: 0,
            total_len: 3,
            data: heapless::Vec::from_slice(&[1, 2, 3]).unwrap(),
            result: NvResult::Okay,
        };
        let mut buf = [0u8; 80];
        let used = encode_reply(&NvReply::from(&ev), &mut buf).unwrap();
        match decode_reply(used) {
            Some(NvReply::Data { tag, data, result, .. }) => {
                assert_eq!(tag, 4);
                assert_eq!(data, &[1, 2, 3]);
                assert_eq!(result, NvResult::Okay);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parts_reassemble_into_one_write() {
        let blob: Vec<u8> = (0..150u8).collect();
        let mut asm = WriteAssembler::new();
        let mut out = None;
        let parts: Vec<_> = write_parts(0x20, &blob, false).collect();
        assert_eq!(parts.len(), 3);
        for p in parts {
            let NvRequest::WritePart {
                tag,
                offset,
                total_len,
                allow_factory,
                data,
            } = p
            else {
                unreachable!()
            };
            assert!(out.is_none());
            out = asm
                .push(tag, offset, total_len, allow_factory, data)
                .unwrap();
        }
        match out {
            Some(NvCommand::Write { tag, data, .. }) => {
                assert_eq!(tag, 0x20);
                assert_eq!(data.as_slice(), blob.as_slice());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!asm.in_progress());
    }

    #[test]
    fn gaps_and_oversize_are_rejected() {
        let mut asm = WriteAssembler::new();
        assert_eq!(asm.push(1, 0, 100, false, &[0; 40]), Ok(None));
        assert_eq!(asm.push(1, 50, 100, false, &[0; 40]), Err(NvResult::BadArgs));
        assert!(!asm.in_progress());
        assert_eq!(asm.push(1, 40, 100, false, &[0; 40]), Err(NvResult::BadArgs));
        assert_eq!(asm.push(1, 0, 2000, false, &[0; 40]), Err(NvResult::NoMem));

        let empty: Vec<_> = write_parts(3, &[], false).collect();
        assert_eq!(empty.len(), 1);
        assert_eq!(
            asm.push(3, 0, 0, false, &[]),
            Ok(Some(NvCommand::Write {
                tag: 3,
                data: heapless::Vec::new(),
                allow_factory: false
            }))
        );
    }
}
