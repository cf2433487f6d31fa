//! Storage command queue
//!
//! [NvStorage] accepts one [NvCommand] at a time and drives it to
//! completion, one flash primitive per [NvStorage::tick]. On top of the
//! flash engine it adds:
//!
//! * Single-flight: a command issued while another is pending is rejected
//!   with [NvResult::Busy], and the pending one is left untouched
//! * A runaway guard: a command still pending after `MAX_LOOPS` ticks is
//!   abandoned with [NvResult::Loop]
//! * Backpressure: ticks are skipped, without counting towards the runaway
//!   guard, while the outbound link has no room for the next event
//! * Fixture slots, which are read with their own fixed-stride layout
//! * Tag policy: factory writes must be explicitly allowed, fixture slots
//!   are read-only

use embassy_time::Instant;

use super::{
    engine::{NvEngine, Progress},
    flash::{read_u32, FlashError, FlashHal, Retrier},
    layout::{NvCfg, TagSpace},
    max_size_for_tag, NvCommand, NvEvent, NvOp, NvResult, NV_CHUNK_SIZE,
};

/// Length word of an empty fixture slot
const FIXTURE_EMPTY: u32 = 0xFFFF_FFFF;

struct Pending {
    op: NvOp,
    tag: u32,
    loops: u32,
}

struct FixtureRead {
    tag: u32,
    addr: u32,
    len: Option<u32>,
    offset: u32,
}

impl FixtureRead {
    fn complete(&self, result: NvResult) -> Progress {
        Progress::Finished(NvEvent::Complete {
            op: NvOp::Read,
            tag: self.tag,
            result,
        })
    }

    fn step<C: NvCfg, F: FlashHal>(&mut self, flash: &mut F) -> Result<Progress, FlashError> {
        let Some(len) = self.len else {
            let len = read_u32(flash, self.addr)?;
            if len == FIXTURE_EMPTY {
                return Ok(self.complete(NvResult::NotFound));
            }
            if len > C::FIXTURE_STRIDE - 4 || len > u32::from(u16::MAX) {
                spine_warn!("fixture slot length {} out of range", len);
                return Ok(self.complete(NvResult::Error));
            }
            self.len = Some(len);
            return Ok(Progress::Working);
        };

        let n = (len - self.offset).min(NV_CHUNK_SIZE as u32);
        let mut buf = [0u8; NV_CHUNK_SIZE];
        let chunk = &mut buf[..n as usize];
        flash.read(self.addr + 4 + self.offset, chunk)?;
        let last = self.offset + n >= len;
        let ev = NvEvent::Data {
            tag: self.tag,
            offset: self.offset as u16,
            total_len: len as u16,
            data: heapless::Vec::from_slice(chunk).unwrap_or_default(),
            result: if last {
                NvResult::Okay
            } else {
                NvResult::More
            },
        };
        self.offset += n;
        Ok(if last {
            Progress::Finished(ev)
        } else {
            Progress::Event(ev)
        })
    }
}

/// The storage subsystem
pub struct NvStorage<C: NvCfg> {
    engine: NvEngine<C>,
    pending: Option<Pending>,
    fixture: Option<FixtureRead>,
    fixture_retry: Retrier,
}

impl<C: NvCfg> NvStorage<C> {
    /// Wrap a mounted engine
    pub fn new(engine: NvEngine<C>) -> Self {
        Self {
            engine,
            pending: None,
            fixture: None,
            fixture_retry: Retrier::new(),
        }
    }

    /// Mount the flash and wrap the engine
    pub fn mount<F: FlashHal>(flash: &mut F) -> Result<Self, NvResult> {
        NvEngine::mount(flash).map(Self::new)
    }

    /// The underlying engine
    pub fn engine(&self) -> &NvEngine<C> {
        &self.engine
    }

    /// Is a command in flight?
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Accept a command
    ///
    /// Returns [NvResult::Busy] if another operation is pending, or a
    /// validation error. Nothing touches the flash until the next tick.
    pub fn command(&mut self, cmd: NvCommand) -> Result<(), NvResult> {
        if self.pending.is_some() {
            return Err(NvResult::Busy);
        }
        let op = cmd.op();
        let tag = cmd.tag();
        match cmd {
            NvCommand::Read { tag, end } => match TagSpace::of(tag) {
                TagSpace::Fixture { slot } => {
                    if end.is_some_and(|e| e != tag) {
                        return Err(NvResult::BadArgs);
                    }
                    let addr = C::fixture_slot(slot).ok_or(NvResult::BadArgs)?;
                    self.fixture_retry.reset();
                    self.fixture = Some(FixtureRead {
                        tag,
                        addr,
                        len: None,
                        offset: 0,
                    });
                }
                _ => self
                    .engine
                    .start_read(tag, end.unwrap_or(tag), end.is_none())?,
            },
            NvCommand::Write {
                tag,
                data,
                allow_factory,
            } => {
                match TagSpace::of(tag) {
                    TagSpace::Normal => {}
                    TagSpace::Factory if allow_factory => {}
                    _ => return Err(NvResult::BadArgs),
                }
                if data.len() > max_size_for_tag(tag) {
                    return Err(NvResult::BadArgs);
                }
                self.engine.start_write(tag, data)?;
            }
            NvCommand::Erase { tag, end } => {
                let last = end.unwrap_or(tag);
                if TagSpace::of(tag) != TagSpace::Normal || TagSpace::of(last) != TagSpace::Normal {
                    return Err(NvResult::BadArgs);
                }
                self.engine.start_erase(tag, last, end.is_none())?;
            }
            NvCommand::WipeAll { include_factory } => {
                self.engine.start_wipe_all(include_factory)?;
            }
        }
        self.pending = Some(Pending { op, tag, loops: 0 });
        Ok(())
    }

    /// Start compacting the active segment
    ///
    /// This is never started automatically. Call it after a write reports
    /// [NvResult::NoRoom].
    pub fn garbage_collect(&mut self) -> Result<(), NvResult> {
        if self.pending.is_some() {
            return Err(NvResult::Busy);
        }
        self.engine.start_gc()?;
        self.pending = Some(Pending {
            op: NvOp::GarbageCollect,
            tag: 0,
            loops: 0,
        });
        Ok(())
    }

    /// Does the factory region hold no entries?
    pub fn is_factory_clear<F: FlashHal>(&self, flash: &mut F) -> Result<bool, NvResult> {
        self.engine.is_factory_clear(flash)
    }

    /// Drive the pending command by at most one flash primitive
    ///
    /// `link_blocked` reports that the outbound channel has too little room
    /// for an event, which defers the command until it drains. An event is
    /// only produced when the caller has room to deliver it.
    pub fn tick<F: FlashHal>(
        &mut self,
        flash: &mut F,
        now: Instant,
        link_blocked: bool,
    ) -> Option<NvEvent> {
        let pending = self.pending.as_mut()?;
        if link_blocked {
            return None;
        }
        pending.loops += 1;
        if pending.op != NvOp::GarbageCollect && pending.loops > C::MAX_LOOPS {
            spine_error!("storage operation exceeded {} ticks", C::MAX_LOOPS);
            let ev = NvEvent::Complete {
                op: pending.op,
                tag: pending.tag,
                result: NvResult::Loop,
            };
            self.engine.abort();
            self.fixture = None;
            self.pending = None;
            return Some(ev);
        }

        let progress = match self.fixture.as_mut() {
            Some(fx) => {
                if !self.fixture_retry.ready(now) {
                    return None;
                }
                match fx.step::<C, F>(flash) {
                    Ok(p) => {
                        self.fixture_retry.reset();
                        p
                    }
                    Err(e) => match self.fixture_retry.failed::<C>(e, now) {
                        None => Progress::Working,
                        Some(result) => fx.complete(result),
                    },
                }
            }
            None => self.engine.step(flash, now),
        };

        match progress {
            Progress::Working => None,
            Progress::Event(ev) => Some(ev),
            Progress::Finished(ev) => {
                self.pending = None;
                self.fixture = None;
                Some(ev)
            }
        }
    }
}
