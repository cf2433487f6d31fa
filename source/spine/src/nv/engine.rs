//! Flash engine
//!
//! The engine owns the log-structured layout described in
//! [layout](super::layout). Operations are started with one of the
//! `start_*` methods and then driven by calling [NvEngine::step] once per
//! tick. Every step performs at most one write or sector erase. Deciding
//! whether an entry is live may take a few reads in the same step.
//!
//! A failed primitive is retried on a later step, after the configured
//! back-off, with the operation's state left untouched. Once the retry
//! budget is spent the operation ends with the primitive's error.

use core::marker::PhantomData;

use embassy_time::Instant;

use super::{
    flash::{guarded_erase, guarded_write, read_u32, FlashError, FlashHal, Retrier},
    layout::{
        entry_size, EntryHeader, NvCfg, Region, Segment, SegmentHeader, TagSpace,
        CONTROL_COMPLETE, DELETED, ENTRY_HEADER_LEN, NOT_SUPERSEDED, SEGMENT_HEADER_LEN,
        SUCCESSOR_OFFSET,
    },
    NvEvent, NvOp, NvResult, MAX_BLOB_LEN, NV_CHUNK_SIZE,
};

/// Bytes programmed per step when writing a blob
const WRITE_CHUNK: u32 = 256;

/// Bytes moved per read or write step when garbage collecting
const COPY_CHUNK: u32 = 256;

/// What a call to [NvEngine::step] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Nothing to report, call again
    Working,
    /// An intermediate event, the operation continues
    Event(NvEvent),
    /// The final event of the operation. The engine is idle again.
    Finished(NvEvent),
}

enum Found {
    End,
    Corrupt,
    Entry(EntryHeader),
}

fn read_header<F: FlashHal>(flash: &mut F, at: u32, region: Region) -> Result<Found, FlashError> {
    if at + ENTRY_HEADER_LEN > region.end {
        return Ok(Found::End);
    }
    let mut b = [0u8; ENTRY_HEADER_LEN as usize];
    flash.read(at, &mut b)?;
    let h = EntryHeader::decode(&b);
    if h.is_end() {
        return Ok(Found::End);
    }
    Ok(match h.check(at, region.end) {
        Ok(()) => Found::Entry(h),
        Err(_) => Found::Corrupt,
    })
}

/// Find where the successor chain of the entry at `at` ends
///
/// Returns the address of the last entry in the chain, whose successor is
/// still erased and is the one to patch when superseding. Returns None if
/// the entry is deleted, incomplete, or was superseded by a completed
/// entry. A successor pointing at an entry whose control word was never
/// written does not retire the entry.
fn live_tail<F: FlashHal>(
    flash: &mut F,
    region: Region,
    at: u32,
    h: &EntryHeader,
) -> Result<Option<u32>, FlashError> {
    if h.is_deleted() || read_u32(flash, h.control_addr(at))? != CONTROL_COMPLETE {
        return Ok(None);
    }
    let mut tail = at;
    let mut next = h.successor;
    loop {
        if next == NOT_SUPERSEDED {
            return Ok(Some(tail));
        }
        if next == DELETED || next <= tail || next % 4 != 0 {
            return Ok(None);
        }
        let n = match read_header(flash, next, region)? {
            Found::Entry(n) if n.tag == h.tag => n,
            _ => return Ok(None),
        };
        if read_u32(flash, n.control_addr(next))? == CONTROL_COMPLETE {
            return Ok(None);
        }
        tail = next;
        next = n.successor;
    }
}

/// Call a primitive until it succeeds or the retry budget is spent, for
/// use outside of stepped operations
fn blocking<C: NvCfg, T>(
    mut f: impl FnMut() -> Result<T, FlashError>,
) -> Result<T, NvResult> {
    let mut tries = 0;
    loop {
        match f() {
            Ok(t) => return Ok(t),
            Err(FlashError::BadAddress) => return Err(NvResult::BadArgs),
            Err(e) if tries >= C::FLASH_RETRIES => return Err(e.into()),
            Err(_) => tries += 1,
        }
    }
}

/// Visit every entry of `region` in log order
///
/// The callback receives the entry address, its header, and whether the
/// entry is live. Stops at the end of the log or a corrupt entry.
pub fn walk<F: FlashHal>(
    flash: &mut F,
    region: Region,
    mut f: impl FnMut(u32, &EntryHeader, bool),
) -> Result<(), FlashError> {
    let mut at = region.start;
    while let Found::Entry(h) = read_header(flash, at, region)? {
        let live = live_tail(flash, region, at, &h)?.is_some();
        f(at, &h, live);
        at += h.size;
    }
    Ok(())
}

struct ReadOp {
    start: u32,
    end: u32,
    single: bool,
    region: Region,
    at: u32,
    found: u32,
    phase: ReadPhase,
}

#[derive(Clone, Copy)]
enum ReadPhase {
    Seek,
    Verify { header: EntryHeader },
    Deliver { header: EntryHeader, offset: u32 },
}

impl ReadOp {
    fn complete(&self) -> NvEvent {
        NvEvent::Complete {
            op: NvOp::Read,
            tag: self.start,
            result: if self.found > 0 {
                NvResult::Okay
            } else {
                NvResult::NotFound
            },
        }
    }

    fn step<F: FlashHal>(&mut self, flash: &mut F) -> Result<Progress, FlashError> {
        match self.phase {
            ReadPhase::Seek => {
                let h = match read_header(flash, self.at, self.region)? {
                    Found::End => return Ok(Progress::Finished(self.complete())),
                    Found::Corrupt => {
                        spine_warn!("corrupt entry at {}, ending read", self.at);
                        return Ok(Progress::Finished(self.complete()));
                    }
                    Found::Entry(h) => h,
                };
                if (self.start..=self.end).contains(&h.tag) && !h.is_deleted() {
                    self.phase = ReadPhase::Verify { header: h };
                } else {
                    self.at += h.size;
                }
                Ok(Progress::Working)
            }
            ReadPhase::Verify { header } => {
                if live_tail(flash, self.region, self.at, &header)?.is_some() {
                    self.phase = ReadPhase::Deliver { header, offset: 0 };
                } else {
                    self.at += header.size;
                    self.phase = ReadPhase::Seek;
                }
                Ok(Progress::Working)
            }
            ReadPhase::Deliver { header, offset } => {
                let n = (header.length - offset).min(NV_CHUNK_SIZE as u32);
                let mut buf = [0u8; NV_CHUNK_SIZE];
                let chunk = &mut buf[..n as usize];
                flash.read(EntryHeader::blob_addr(self.at) + offset, chunk)?;

                let last = offset + n >= header.length;
                let ev = NvEvent::Data {
                    tag: header.tag,
                    offset: offset as u16,
                    total_len: header.length as u16,
                    data: heapless::Vec::from_slice(chunk).unwrap_or_default(),
                    result: if last && self.single {
                        NvResult::Okay
                    } else {
                        NvResult::More
                    },
                };
                if !last {
                    self.phase = ReadPhase::Deliver {
                        header,
                        offset: offset + n,
                    };
                    return Ok(Progress::Event(ev));
                }
                if self.single {
                    return Ok(Progress::Finished(ev));
                }
                self.found += 1;
                self.at += header.size;
                self.phase = ReadPhase::Seek;
                Ok(Progress::Event(ev))
            }
        }
    }
}

struct WriteOp {
    tag: u32,
    data: heapless::Vec<u8, MAX_BLOB_LEN>,
    region: Region,
    at: u32,
    /// Where the successor chain of the superseded entry ends
    old: Option<u32>,
    phase: WritePhase,
}

#[derive(Clone, Copy)]
enum WritePhase {
    Scan,
    Verify { header: EntryHeader },
    Header,
    Blob { offset: u32 },
    Patch,
    Control,
}

impl WriteOp {
    fn complete(&self, result: NvResult) -> Progress {
        Progress::Finished(NvEvent::Complete {
            op: NvOp::Write,
            tag: self.tag,
            result,
        })
    }

    fn header(&self) -> EntryHeader {
        EntryHeader::for_blob(self.tag, self.data.len() as u32)
    }

    fn after_blob(&self) -> WritePhase {
        match self.old {
            Some(_) => WritePhase::Patch,
            None => WritePhase::Control,
        }
    }

    fn step<C: NvCfg, F: FlashHal>(&mut self, flash: &mut F) -> Result<Progress, FlashError> {
        match self.phase {
            WritePhase::Scan => match read_header(flash, self.at, self.region)? {
                Found::End => {
                    let size = entry_size(self.data.len() as u32);
                    if self.at + size > self.region.end {
                        return Ok(self.complete(NvResult::NoRoom));
                    }
                    self.phase = WritePhase::Header;
                    Ok(Progress::Working)
                }
                Found::Corrupt => {
                    spine_error!("corrupt entry at {}, refusing to append", self.at);
                    Ok(self.complete(NvResult::Error))
                }
                Found::Entry(h) => {
                    if h.tag == self.tag && !h.is_deleted() {
                        self.phase = WritePhase::Verify { header: h };
                    } else {
                        self.at += h.size;
                    }
                    Ok(Progress::Working)
                }
            },
            WritePhase::Verify { header } => {
                if let Some(tail) = live_tail(flash, self.region, self.at, &header)? {
                    self.old = Some(tail);
                }
                self.at += header.size;
                self.phase = WritePhase::Scan;
                Ok(Progress::Working)
            }
            WritePhase::Header => {
                guarded_write::<C, F>(flash, self.at, &self.header().encode())?;
                self.phase = if self.data.is_empty() {
                    self.after_blob()
                } else {
                    WritePhase::Blob { offset: 0 }
                };
                Ok(Progress::Working)
            }
            WritePhase::Blob { offset } => {
                let len = self.data.len() as u32;
                let n = (len - offset).min(WRITE_CHUNK);
                let chunk = &self.data[offset as usize..(offset + n) as usize];
                guarded_write::<C, F>(flash, EntryHeader::blob_addr(self.at) + offset, chunk)?;
                self.phase = if offset + n == len {
                    self.after_blob()
                } else {
                    WritePhase::Blob { offset: offset + n }
                };
                Ok(Progress::Working)
            }
            WritePhase::Patch => {
                if let Some(old) = self.old {
                    guarded_write::<C, F>(flash, old + SUCCESSOR_OFFSET, &self.at.to_le_bytes())?;
                }
                self.phase = WritePhase::Control;
                Ok(Progress::Working)
            }
            WritePhase::Control => {
                let addr = self.header().control_addr(self.at);
                guarded_write::<C, F>(flash, addr, &CONTROL_COMPLETE.to_le_bytes())?;
                Ok(self.complete(NvResult::Okay))
            }
        }
    }
}

struct EraseOp {
    start: u32,
    end: u32,
    single: bool,
    region: Region,
    at: u32,
    erased: u32,
    /// Tag and chain tail of a live entry to delete
    pending: Option<(u32, u32)>,
}

impl EraseOp {
    fn complete(&self) -> Progress {
        Progress::Finished(NvEvent::Complete {
            op: NvOp::Erase,
            tag: self.start,
            result: if self.erased > 0 {
                NvResult::Okay
            } else {
                NvResult::NotFound
            },
        })
    }

    fn step<C: NvCfg, F: FlashHal>(&mut self, flash: &mut F) -> Result<Progress, FlashError> {
        if let Some((tag, tail)) = self.pending {
            guarded_write::<C, F>(flash, tail + SUCCESSOR_OFFSET, &DELETED.to_le_bytes())?;
            self.pending = None;
            self.erased += 1;
            if self.single {
                return Ok(self.complete());
            }
            return Ok(Progress::Event(NvEvent::Erased { tag }));
        }

        match read_header(flash, self.at, self.region)? {
            Found::End => Ok(self.complete()),
            Found::Corrupt => {
                spine_warn!("corrupt entry at {}, ending erase", self.at);
                Ok(self.complete())
            }
            Found::Entry(h) => {
                if (self.start..=self.end).contains(&h.tag) {
                    self.pending = live_tail(flash, self.region, self.at, &h)?.map(|t| (h.tag, t));
                }
                self.at += h.size;
                Ok(Progress::Working)
            }
        }
    }
}

struct WipeOp {
    include_factory: bool,
    sector: u32,
    journal: u32,
}

impl WipeOp {
    fn sector_addr<C: NvCfg>(&self) -> Option<u32> {
        let seg = C::SEGMENT_SECTORS;
        let i = self.sector;
        if i < seg {
            Some(C::SEGMENT_A + i * C::SECTOR_SIZE)
        } else if i < 2 * seg {
            Some(C::SEGMENT_B + (i - seg) * C::SECTOR_SIZE)
        } else if self.include_factory && i < 2 * seg + C::FACTORY_SECTORS {
            Some(C::FACTORY_BASE + (i - 2 * seg) * C::SECTOR_SIZE)
        } else {
            None
        }
    }

    fn step<C: NvCfg, F: FlashHal>(&mut self, flash: &mut F) -> Result<Progress, FlashError> {
        match self.sector_addr::<C>() {
            Some(addr) => {
                guarded_erase::<C, F>(flash, addr)?;
                self.sector += 1;
                Ok(Progress::Working)
            }
            None => {
                let hdr = SegmentHeader::new(self.journal).encode();
                guarded_write::<C, F>(flash, C::SEGMENT_A, &hdr)?;
                Ok(Progress::Finished(NvEvent::Complete {
                    op: NvOp::WipeAll,
                    tag: 0,
                    result: NvResult::Okay,
                }))
            }
        }
    }
}

struct GcOp {
    source: Region,
    target: Segment,
    journal: u32,
    src: u32,
    dst: u32,
    factory_end: Option<u32>,
    buf: [u8; COPY_CHUNK as usize],
    phase: GcPhase,
}

#[derive(Clone, Copy)]
enum GcPhase {
    Erase {
        sector: u32,
    },
    FactoryEnd {
        at: u32,
    },
    Scan,
    Verify {
        header: EntryHeader,
    },
    Copy {
        size: u32,
        to: u32,
        offset: u32,
        loaded: u32,
    },
    Header,
}

impl GcOp {
    fn step<C: NvCfg, F: FlashHal>(&mut self, flash: &mut F) -> Result<Progress, FlashError> {
        match self.phase {
            GcPhase::Erase { sector } => {
                if sector < C::SEGMENT_SECTORS {
                    let base = C::segment_base(self.target);
                    guarded_erase::<C, F>(flash, base + sector * C::SECTOR_SIZE)?;
                    self.phase = GcPhase::Erase { sector: sector + 1 };
                } else {
                    self.phase = GcPhase::FactoryEnd {
                        at: C::factory_entries().start,
                    };
                }
                Ok(Progress::Working)
            }
            GcPhase::FactoryEnd { at } => {
                match read_header(flash, at, C::factory_entries())? {
                    Found::End => {
                        self.factory_end = Some(at);
                        self.phase = GcPhase::Scan;
                    }
                    Found::Corrupt => {
                        self.factory_end = None;
                        self.phase = GcPhase::Scan;
                    }
                    Found::Entry(h) => {
                        self.phase = GcPhase::FactoryEnd { at: at + h.size };
                    }
                }
                Ok(Progress::Working)
            }
            GcPhase::Scan => {
                match read_header(flash, self.src, self.source)? {
                    Found::End => self.phase = GcPhase::Header,
                    Found::Corrupt => {
                        // Nothing past this point is reachable by any scan
                        spine_warn!("corrupt entry at {}, compacting up to it", self.src);
                        self.phase = GcPhase::Header;
                    }
                    Found::Entry(h) if !h.is_deleted() => {
                        self.phase = GcPhase::Verify { header: h };
                    }
                    Found::Entry(h) => self.src += h.size,
                }
                Ok(Progress::Working)
            }
            GcPhase::Verify { header } => {
                if live_tail(flash, self.source, self.src, &header)?.is_none() {
                    self.src += header.size;
                    self.phase = GcPhase::Scan;
                    return Ok(Progress::Working);
                }
                let size = header.size;
                let factory = C::factory_entries();
                let redirect = match (TagSpace::of(header.tag), self.factory_end) {
                    (TagSpace::Factory, Some(fe)) if fe + size <= factory.end => Some(fe),
                    _ => None,
                };
                let to = match redirect {
                    Some(fe) => {
                        self.factory_end = Some(fe + size);
                        fe
                    }
                    None => {
                        let to = self.dst;
                        if to + size > C::segment_entries(self.target).end {
                            return Ok(Progress::Finished(gc_complete(NvResult::NoRoom)));
                        }
                        self.dst += size;
                        to
                    }
                };
                self.phase = GcPhase::Copy {
                    size,
                    to,
                    offset: 0,
                    loaded: 0,
                };
                Ok(Progress::Working)
            }
            GcPhase::Copy {
                size,
                to,
                offset,
                loaded: 0,
            } => {
                let n = (size - offset).min(COPY_CHUNK);
                flash.read(self.src + offset, &mut self.buf[..n as usize])?;
                if offset == 0 {
                    // The copy starts a fresh chain
                    let succ = SUCCESSOR_OFFSET as usize;
                    self.buf[succ..succ + 4].copy_from_slice(&NOT_SUPERSEDED.to_le_bytes());
                }
                self.phase = GcPhase::Copy {
                    size,
                    to,
                    offset,
                    loaded: n,
                };
                Ok(Progress::Working)
            }
            GcPhase::Copy {
                size,
                to,
                offset,
                loaded,
            } => {
                guarded_write::<C, F>(flash, to + offset, &self.buf[..loaded as usize])?;
                let offset = offset + loaded;
                self.phase = if offset == size {
                    self.src += size;
                    GcPhase::Scan
                } else {
                    GcPhase::Copy {
                        size,
                        to,
                        offset,
                        loaded: 0,
                    }
                };
                Ok(Progress::Working)
            }
            GcPhase::Header => {
                let hdr = SegmentHeader::new(self.journal).encode();
                guarded_write::<C, F>(flash, C::segment_base(self.target), &hdr)?;
                spine_info!("garbage collection done, journal {}", self.journal);
                Ok(Progress::Finished(gc_complete(NvResult::Okay)))
            }
        }
    }
}

fn gc_complete(result: NvResult) -> NvEvent {
    NvEvent::Complete {
        op: NvOp::GarbageCollect,
        tag: 0,
        result,
    }
}

enum Op {
    Idle,
    Read(ReadOp),
    Write(WriteOp),
    Erase(EraseOp),
    Wipe(WipeOp),
    Gc(GcOp),
}

/// The flash engine
///
/// `C` is the flash map, see [NvCfg].
pub struct NvEngine<C: NvCfg> {
    active: Segment,
    journal: u32,
    formatted: bool,
    op: Op,
    retry: Retrier,
    _cfg: PhantomData<C>,
}

/// Setup and inspection
impl<C: NvCfg> NvEngine<C> {
    /// Find the active segment
    ///
    /// The segment with a valid header and the highest journal number wins.
    /// If neither segment is valid, segment A is formatted with journal
    /// number 1. This runs once at boot and blocks on the flash.
    pub fn mount<F: FlashHal>(flash: &mut F) -> Result<Self, NvResult> {
        let a = Self::segment_header(flash, Segment::A)?;
        let b = Self::segment_header(flash, Segment::B)?;
        let (active, journal) = match (a, b) {
            (Some(a), Some(b)) if b.journal_number > a.journal_number => {
                (Segment::B, b.journal_number)
            }
            (Some(a), _) => (Segment::A, a.journal_number),
            (None, Some(b)) => (Segment::B, b.journal_number),
            (None, None) => {
                spine_info!("no valid segment, formatting");
                for i in 0..C::SEGMENT_SECTORS {
                    let addr = C::SEGMENT_A + i * C::SECTOR_SIZE;
                    blocking::<C, _>(|| guarded_erase::<C, F>(flash, addr))?;
                }
                let hdr = SegmentHeader::new(1).encode();
                blocking::<C, _>(|| guarded_write::<C, F>(flash, C::SEGMENT_A, &hdr))?;
                (Segment::A, 1)
            }
        };
        spine_info!(
            "mounted segment {}, journal {}",
            if active == Segment::A { "A" } else { "B" },
            journal
        );
        Ok(Self {
            active,
            journal,
            formatted: true,
            op: Op::Idle,
            retry: Retrier::new(),
            _cfg: PhantomData,
        })
    }

    fn segment_header<F: FlashHal>(
        flash: &mut F,
        seg: Segment,
    ) -> Result<Option<SegmentHeader>, NvResult> {
        let mut b = [0u8; SEGMENT_HEADER_LEN as usize];
        blocking::<C, _>(|| flash.read(C::segment_base(seg), &mut b))?;
        let hdr = SegmentHeader::decode(&b);
        Ok(hdr.is_valid().then_some(hdr))
    }

    /// The segment currently written to
    pub fn active_segment(&self) -> Segment {
        self.active
    }

    /// The journal number of the active segment
    pub fn journal(&self) -> u32 {
        self.journal
    }

    /// Where the entries of the active segment live
    pub fn active_entries(&self) -> Region {
        C::segment_entries(self.active)
    }

    /// Does the active segment still carry a valid header?
    ///
    /// This turns false when a wipe fails part way. Segment operations are
    /// refused with [NvResult::Error] until a wipe succeeds or the flash is
    /// mounted again.
    pub fn is_formatted(&self) -> bool {
        self.formatted
    }

    /// Is no operation in progress?
    pub fn is_idle(&self) -> bool {
        matches!(self.op, Op::Idle)
    }

    /// Does the factory region hold no entries?
    pub fn is_factory_clear<F: FlashHal>(&self, flash: &mut F) -> Result<bool, NvResult> {
        let region = C::factory_entries();
        let found = blocking::<C, _>(|| read_header(flash, region.start, region))?;
        Ok(matches!(found, Found::End))
    }
}

/// Starting operations
///
/// Each of these fails with [NvResult::Busy] if an operation is already in
/// progress, and with [NvResult::BadArgs] if the tags are unusable.
impl<C: NvCfg> NvEngine<C> {
    fn ensure_idle(&self) -> Result<(), NvResult> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(NvResult::Busy)
        }
    }

    fn region_for(&self, start: u32, end: u32) -> Result<Region, NvResult> {
        if end < start || !TagSpace::same(start, end) {
            return Err(NvResult::BadArgs);
        }
        match TagSpace::of(start) {
            TagSpace::Normal if !self.formatted => Err(NvResult::Error),
            TagSpace::Normal => Ok(C::segment_entries(self.active)),
            TagSpace::Factory => Ok(C::factory_entries()),
            TagSpace::Fixture { .. } | TagSpace::Invalid => Err(NvResult::BadArgs),
        }
    }

    /// Read one tag, or every tag in `start..=end`
    pub fn start_read(&mut self, start: u32, end: u32, single: bool) -> Result<(), NvResult> {
        self.ensure_idle()?;
        let region = self.region_for(start, end)?;
        self.op = Op::Read(ReadOp {
            start,
            end,
            single,
            region,
            at: region.start,
            found: 0,
            phase: ReadPhase::Seek,
        });
        Ok(())
    }

    /// Append `data` under `tag`, superseding the current entry
    pub fn start_write(
        &mut self,
        tag: u32,
        data: heapless::Vec<u8, MAX_BLOB_LEN>,
    ) -> Result<(), NvResult> {
        self.ensure_idle()?;
        let region = self.region_for(tag, tag)?;
        self.op = Op::Write(WriteOp {
            tag,
            data,
            region,
            at: region.start,
            old: None,
            phase: WritePhase::Scan,
        });
        Ok(())
    }

    /// Delete one tag, or every tag in `start..=end`
    pub fn start_erase(&mut self, start: u32, end: u32, single: bool) -> Result<(), NvResult> {
        self.ensure_idle()?;
        let region = self.region_for(start, end)?;
        self.op = Op::Erase(EraseOp {
            start,
            end,
            single,
            region,
            at: region.start,
            erased: 0,
            pending: None,
        });
        Ok(())
    }

    /// Erase both segments, and optionally the factory region
    pub fn start_wipe_all(&mut self, include_factory: bool) -> Result<(), NvResult> {
        self.ensure_idle()?;
        self.op = Op::Wipe(WipeOp {
            include_factory,
            sector: 0,
            journal: self.journal.wrapping_add(1),
        });
        Ok(())
    }

    /// Compact the active segment into the other one
    pub fn start_gc(&mut self) -> Result<(), NvResult> {
        self.ensure_idle()?;
        if !self.formatted {
            return Err(NvResult::Error);
        }
        spine_info!("garbage collection started, journal {}", self.journal);
        let target = self.active.other();
        self.op = Op::Gc(GcOp {
            source: C::segment_entries(self.active),
            target,
            journal: self.journal.wrapping_add(1),
            src: C::segment_entries(self.active).start,
            dst: C::segment_entries(target).start,
            factory_end: None,
            buf: [0u8; COPY_CHUNK as usize],
            phase: GcPhase::Erase { sector: 0 },
        });
        Ok(())
    }

    /// Abandon the current operation without reporting anything
    pub fn abort(&mut self) {
        self.op = Op::Idle;
        self.retry.reset();
    }
}

/// Driving operations
impl<C: NvCfg> NvEngine<C> {
    /// Advance the current operation by at most one flash primitive
    pub fn step<F: FlashHal>(&mut self, flash: &mut F, now: Instant) -> Progress {
        if !self.retry.ready(now) {
            return Progress::Working;
        }
        let res = match &mut self.op {
            Op::Idle => return Progress::Working,
            Op::Read(op) => op.step(flash),
            Op::Write(op) => op.step::<C, F>(flash),
            Op::Erase(op) => op.step::<C, F>(flash),
            Op::Wipe(op) => op.step::<C, F>(flash),
            Op::Gc(op) => op.step::<C, F>(flash),
        };
        match res {
            Ok(Progress::Finished(ev)) => {
                self.finish(ev.result() == NvResult::Okay);
                Progress::Finished(ev)
            }
            Ok(p) => {
                self.retry.reset();
                p
            }
            Err(e) => match self.retry.failed::<C>(e, now) {
                None => Progress::Working,
                Some(result) => {
                    let (op, tag) = self.describe();
                    self.finish(false);
                    Progress::Finished(NvEvent::Complete { op, tag, result })
                }
            },
        }
    }

    fn describe(&self) -> (NvOp, u32) {
        match &self.op {
            Op::Idle | Op::Gc(_) => (NvOp::GarbageCollect, 0),
            Op::Read(op) => (NvOp::Read, op.start),
            Op::Write(op) => (NvOp::Write, op.tag),
            Op::Erase(op) => (NvOp::Erase, op.start),
            Op::Wipe(_) => (NvOp::WipeAll, 0),
        }
    }

    fn finish(&mut self, success: bool) {
        let op = core::mem::replace(&mut self.op, Op::Idle);
        self.retry.reset();
        match op {
            Op::Wipe(w) if success => {
                self.active = Segment::A;
                self.journal = w.journal;
                self.formatted = true;
            }
            Op::Wipe(_) => {
                spine_error!("wipe failed, segment operations refused until remount");
                self.formatted = false;
            }
            Op::Gc(g) if success => {
                self.active = g.target;
                self.journal = g.journal;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::nv::{
        flash::RamFlash,
        layout::{FACTORY_TAG_START, SEGMENT_MAGIC},
        testing::{flash, TestLayout},
    };

    type Engine = NvEngine<TestLayout>;

    fn blob(b: &[u8]) -> heapless::Vec<u8, MAX_BLOB_LEN> {
        heapless::Vec::from_slice(b).unwrap()
    }

    fn run<F: FlashHal>(e: &mut Engine, f: &mut F) -> Vec<NvEvent> {
        let mut out = Vec::new();
        for t in 1..100_000u64 {
            match e.step(f, Instant::from_millis(t)) {
                Progress::Working => {}
                Progress::Event(ev) => out.push(ev),
                Progress::Finished(ev) => {
                    out.push(ev);
                    assert!(e.is_idle());
                    return out;
                }
            }
        }
        panic!("operation never finished");
    }

    fn write(e: &mut Engine, f: &mut RamFlash, tag: u32, data: &[u8]) -> NvResult {
        e.start_write(tag, blob(data)).unwrap();
        run(e, f).last().unwrap().result()
    }

    fn read(e: &mut Engine, f: &mut RamFlash, tag: u32) -> Result<Vec<u8>, NvResult> {
        e.start_read(tag, tag, true).unwrap();
        let mut out = Vec::new();
        for ev in run(e, f) {
            match ev {
                NvEvent::Data { offset, data, .. } => {
                    assert_eq!(offset as usize, out.len());
                    out.extend_from_slice(&data);
                }
                NvEvent::Complete { result, .. } => return Err(result),
                NvEvent::Erased { .. } => unreachable!(),
            }
        }
        Ok(out)
    }

    fn live_count(e: &Engine, f: &mut RamFlash, tag: u32) -> usize {
        let mut n = 0;
        walk(f, e.active_entries(), |_, h, live| {
            if live && h.tag == tag {
                n += 1;
            }
        })
        .unwrap();
        n
    }

    /// Fails every write to one address
    struct FailAt {
        inner: RamFlash,
        addr: u32,
    }

    impl FlashHal for FailAt {
        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            self.inner.read(addr, buf)
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
            if addr == self.addr {
                return Err(FlashError::Hardware);
            }
            self.inner.write(addr, data)
        }

        fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
            self.inner.erase_sector(addr)
        }
    }

    #[test]
    fn blank_flash_formats_segment_a() {
        let mut f = flash();
        let e = Engine::mount(&mut f).unwrap();
        assert_eq!(e.active_segment(), Segment::A);
        assert_eq!(e.journal(), 1);
        assert_eq!(f.slice(0x1000, 4), &SEGMENT_MAGIC.to_le_bytes());

        let e = Engine::mount(&mut f).unwrap();
        assert_eq!(e.journal(), 1);
    }

    #[test]
    fn overwrite_leaves_one_live_entry() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        assert_eq!(write(&mut e, &mut f, 5, &[1, 2, 3]), NvResult::Okay);
        assert_eq!(write(&mut e, &mut f, 6, &[6]), NvResult::Okay);
        assert_eq!(write(&mut e, &mut f, 5, &[9, 9]), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 5), Ok(vec![9, 9]));
        assert_eq!(read(&mut e, &mut f, 6), Ok(vec![6]));
        assert_eq!(live_count(&e, &mut f, 5), 1);
        assert_eq!(read(&mut e, &mut f, 7), Err(NvResult::NotFound));
    }

    #[test]
    fn long_blobs_are_chunked() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(write(&mut e, &mut f, 3, &data), NvResult::Okay);

        e.start_read(3, 3, true).unwrap();
        let evs = run(&mut e, &mut f);
        assert_eq!(evs.len(), 3);
        let offsets: Vec<u16> = evs
            .iter()
            .map(|ev| match ev {
                NvEvent::Data {
                    offset, total_len, ..
                } => {
                    assert_eq!(*total_len, 100);
                    *offset
                }
                _ => panic!("unexpected event"),
            })
            .collect();
        assert_eq!(offsets, [0, 48, 96]);
        assert_eq!(evs[1].result(), NvResult::More);
        assert_eq!(evs[2].result(), NvResult::Okay);
    }

    #[test]
    fn range_read_ends_with_complete() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        for t in [10u32, 11, 12] {
            assert_eq!(write(&mut e, &mut f, t, &[t as u8]), NvResult::Okay);
        }
        e.start_read(10, 11, false).unwrap();
        let evs = run(&mut e, &mut f);
        assert_eq!(evs.len(), 3);
        assert_eq!(evs[0].result(), NvResult::More);
        assert_eq!(evs[1].result(), NvResult::More);
        assert_eq!(
            evs[2],
            NvEvent::Complete {
                op: NvOp::Read,
                tag: 10,
                result: NvResult::Okay
            }
        );

        e.start_read(20, 30, false).unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::NotFound);
    }

    #[test]
    fn erase_single_and_range() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        for t in 1u32..=4 {
            write(&mut e, &mut f, t, &[0xAA]);
        }
        e.start_erase(2, 2, true).unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 2), Err(NvResult::NotFound));

        e.start_erase(1, 4, false).unwrap();
        let evs = run(&mut e, &mut f);
        assert_eq!(
            evs,
            [
                NvEvent::Erased { tag: 1 },
                NvEvent::Erased { tag: 3 },
                NvEvent::Erased { tag: 4 },
                NvEvent::Complete {
                    op: NvOp::Erase,
                    tag: 1,
                    result: NvResult::Okay
                },
            ]
        );
        e.start_erase(1, 4, false).unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::NotFound);
    }

    #[test]
    fn busy_while_an_operation_runs() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        e.start_write(1, blob(&[1])).unwrap();
        assert_eq!(e.start_read(1, 1, true), Err(NvResult::Busy));
        assert_eq!(e.start_gc(), Err(NvResult::Busy));
        run(&mut e, &mut f);
        assert_eq!(read(&mut e, &mut f, 1), Ok(vec![1]));
    }

    #[test]
    fn full_segment_needs_gc() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        for t in 1u32..=16 {
            assert_eq!(write(&mut e, &mut f, t, &[t as u8; 40]), NvResult::Okay);
        }
        e.start_erase(1, 4, false).unwrap();
        run(&mut e, &mut f);
        assert_eq!(write(&mut e, &mut f, 17, &[17; 40]), NvResult::NoRoom);

        e.start_gc().unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::Okay);
        assert_eq!(e.active_segment(), Segment::B);
        assert_eq!(e.journal(), 2);

        assert_eq!(write(&mut e, &mut f, 17, &[17; 40]), NvResult::Okay);
        for t in 5u32..=17 {
            assert_eq!(read(&mut e, &mut f, t), Ok(vec![t as u8; 40]));
        }
        assert_eq!(read(&mut e, &mut f, 1), Err(NvResult::NotFound));

        let e = Engine::mount(&mut f).unwrap();
        assert_eq!(e.active_segment(), Segment::B);
    }

    #[test]
    fn failed_gc_keeps_the_old_segment() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        write(&mut e, &mut f, 1, &[1, 1]);
        write(&mut e, &mut f, 1, &[2, 2]);
        write(&mut e, &mut f, 2, &[3]);

        let mut failing = FailAt {
            inner: f,
            addr: TestLayout::SEGMENT_B,
        };
        e.start_gc().unwrap();
        assert_eq!(run(&mut e, &mut failing).last().unwrap().result(), NvResult::Error);
        assert_eq!(e.active_segment(), Segment::A);

        let mut f = failing.inner;
        let mut e = Engine::mount(&mut f).unwrap();
        assert_eq!(e.active_segment(), Segment::A);
        assert_eq!(read(&mut e, &mut f, 1), Ok(vec![2, 2]));
        assert_eq!(read(&mut e, &mut f, 2), Ok(vec![3]));
    }

    #[test]
    fn interrupted_write_is_not_live() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        let start = e.active_entries().start;
        // The second entry starts after a 24 byte entry, and is 28 bytes
        let control = start + 24 + 28 - 4;
        let mut failing = FailAt {
            inner: f,
            addr: control,
        };
        e.start_write(8, blob(&[1, 2, 3])).unwrap();
        run(&mut e, &mut failing.inner);
        e.start_write(9, blob(&[1, 2, 3, 4, 5])).unwrap();
        assert_eq!(run(&mut e, &mut failing).last().unwrap().result(), NvResult::Error);

        let mut f = failing.inner;
        let mut e = Engine::mount(&mut f).unwrap();
        assert_eq!(read(&mut e, &mut f, 9), Err(NvResult::NotFound));
        assert_eq!(write(&mut e, &mut f, 9, &[7, 7]), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 9), Ok(vec![7, 7]));
        assert_eq!(live_count(&e, &mut f, 9), 1);
        assert_eq!(read(&mut e, &mut f, 8), Ok(vec![1, 2, 3]));
    }

    /// Overwrite tag 5 and fail the new entry's control word, after the old
    /// entry was already patched to point at it
    fn half_overwritten() -> (Engine, RamFlash) {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        assert_eq!(write(&mut e, &mut f, 5, &[1, 2, 3]), NvResult::Okay);
        // The overwrite follows the 24 byte entry, and is 28 bytes
        let start = e.active_entries().start;
        let mut failing = FailAt {
            inner: f,
            addr: start + 24 + 28 - 4,
        };
        e.start_write(5, blob(&[9; 5])).unwrap();
        assert_eq!(run(&mut e, &mut failing).last().unwrap().result(), NvResult::Error);
        let f = failing.inner;
        assert_eq!(f.slice(start + SUCCESSOR_OFFSET, 4), &(start + 24).to_le_bytes());
        (e, f)
    }

    #[test]
    fn unfinished_overwrite_keeps_the_old_value() {
        let (mut e, mut f) = half_overwritten();
        assert_eq!(read(&mut e, &mut f, 5), Ok(vec![1, 2, 3]));
        assert_eq!(live_count(&e, &mut f, 5), 1);

        let mut e = Engine::mount(&mut f).unwrap();
        assert_eq!(read(&mut e, &mut f, 5), Ok(vec![1, 2, 3]));
        assert_eq!(write(&mut e, &mut f, 5, &[7, 7]), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 5), Ok(vec![7, 7]));
        assert_eq!(live_count(&e, &mut f, 5), 1);

        e.start_erase(5, 5, true).unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 5), Err(NvResult::NotFound));
        assert_eq!(live_count(&e, &mut f, 5), 0);
    }

    #[test]
    fn gc_copies_the_value_an_overwrite_left_behind() {
        let (mut e, mut f) = half_overwritten();
        e.start_gc().unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 5), Ok(vec![1, 2, 3]));
        let start = e.active_entries().start;
        assert_eq!(f.slice(start + SUCCESSOR_OFFSET, 4), &[0xFF; 4]);

        assert_eq!(write(&mut e, &mut f, 5, &[4]), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, 5), Ok(vec![4]));
        assert_eq!(live_count(&e, &mut f, 5), 1);
    }

    #[test]
    fn corrupt_size_refuses_write() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        write(&mut e, &mut f, 1, &[1]);
        let second = e.active_entries().start + 24;
        // size 6 is not aligned
        f.write(second, &6u32.to_le_bytes()).unwrap();
        f.write(second + 4, &2u32.to_le_bytes()).unwrap();
        assert_eq!(write(&mut e, &mut f, 3, &[3]), NvResult::Error);
        assert_eq!(read(&mut e, &mut f, 1), Ok(vec![1]));
    }

    #[test]
    fn wipe_all_bumps_journal() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        write(&mut e, &mut f, 1, &[1]);
        write(&mut e, &mut f, FACTORY_TAG_START, &[0xBC]);
        assert!(!e.is_factory_clear(&mut f).unwrap());

        e.start_wipe_all(false).unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::Okay);
        assert_eq!(e.journal(), 2);
        assert_eq!(read(&mut e, &mut f, 1), Err(NvResult::NotFound));
        assert_eq!(read(&mut e, &mut f, FACTORY_TAG_START), Ok(vec![0xBC]));

        e.start_wipe_all(true).unwrap();
        run(&mut e, &mut f);
        assert!(e.is_factory_clear(&mut f).unwrap());
        assert_eq!(Engine::mount(&mut f).unwrap().journal(), 3);
    }

    #[test]
    fn gc_moves_factory_entries_out_of_the_segment() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        // A factory record left in the segment by an older layout
        let at = e.active_entries().start;
        let h = EntryHeader::for_blob(FACTORY_TAG_START + 1, 4);
        f.write(at, &h.encode()).unwrap();
        f.write(EntryHeader::blob_addr(at), &[1, 2, 3, 4]).unwrap();
        f.write(h.control_addr(at), &[0; 4]).unwrap();
        write(&mut e, &mut f, 2, &[2]);

        e.start_gc().unwrap();
        assert_eq!(run(&mut e, &mut f).last().unwrap().result(), NvResult::Okay);
        assert_eq!(read(&mut e, &mut f, FACTORY_TAG_START + 1), Ok(vec![1, 2, 3, 4]));
        assert_eq!(read(&mut e, &mut f, 2), Ok(vec![2]));
        let mut in_segment = 0;
        walk(&mut f, e.active_entries(), |_, _, _| in_segment += 1).unwrap();
        assert_eq!(in_segment, 1);
    }

    #[test]
    fn fixture_tags_are_not_engine_tags() {
        let mut f = flash();
        let mut e = Engine::mount(&mut f).unwrap();
        assert_eq!(e.start_read(0xC000_0000, 0xC000_0000, true), Err(NvResult::BadArgs));
        assert_eq!(e.start_read(5, 4, false), Err(NvResult::BadArgs));
        assert_eq!(e.start_erase(1, 0x8000_0000, false), Err(NvResult::BadArgs));
    }
}
