//! Host platform for the robot spine
//!
//! Everything the portable crate expects from a board, implemented in
//! memory so that both processors can be run against each other in a
//! single test:
//!
//! * [SimWire], a full-duplex drop link
//! * [FlakyFlash], a flash wrapper that injects faults and power loss
//! * [RecordingActuators], which remembers every command
//! * [ManualClock], time that only moves when told to
//! * [WifiSide], the WiFi processor's end of the link

use core::{
    cell::{Cell, RefCell},
    future::{poll_fn, Future},
    task::{Poll, Waker},
};
use std::rc::Rc;

use embassy_futures::{block_on, join::join};
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{Duration, Instant};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use robot_spine::{
    anim::{Actuators, AnimationState, TrackMask},
    drop::{max_body, ToRtipFrame, ToWifiFrame, TO_RTIP_FRAME_SIZE},
    nv::{
        flash::RamFlash, FlashError, FlashHal, NvCfg, NvCommand, NvEvent, NvResult, NvStorage,
        MAX_BLOB_LEN,
    },
    protocol::{
        tag, BackpackLights, Blink, BodyMotion, FaceImage, FacePosition, HeadAngle, KeyFrame,
        LiftHeight,
    },
    ring::{Consumer, Producer},
    transport::{
        DropLink, EnqueueError, LinkStats, MessageSink, QueueEstimate, Receiver, Sender, TxPump,
    },
    wirehelp::{decode_reply, encode_request, write_parts, NvReply, NvRequest},
    Clock, Error,
};

/// A deterministic RNG seeded from one number
pub fn get_rand(seed: u64) -> ChaCha8Rng {
    let mut bytes = [0u8; 32];
    let s = seed.to_le_bytes();
    bytes.chunks_exact_mut(8).for_each(|c| {
        c.copy_from_slice(&s);
    });
    ChaCha8Rng::from_seed(bytes)
}

/// Run both ends of the link for one tick
pub fn run_pair<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
    block_on(join(a, b))
}

/// Errors of the simulated wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The peer sent a drop of a different size than expected
    SizeMismatch { sent: usize, expected: usize },
}

#[derive(Default)]
struct Lane {
    /// The frame on its way to this side
    frame: Option<Vec<u8>>,
    /// This side, waiting on the wire
    waker: Option<Waker>,
}

#[derive(Default)]
struct WireState {
    lanes: [Lane; 2],
    exchanges: u64,
}

/// One end of a simulated full-duplex link
///
/// An exchange completes once both ends have offered their drop, the same
/// way a clocked serial link moves both directions at once.
pub struct SimWire {
    side: usize,
    state: Rc<RefCell<WireState>>,
}

/// Create the two ends of a link
pub fn wire() -> (SimWire, SimWire) {
    let state = Rc::new(RefCell::new(WireState::default()));
    (
        SimWire {
            side: 0,
            state: state.clone(),
        },
        SimWire { side: 1, state },
    )
}

impl SimWire {
    /// Drops delivered so far, in either direction
    pub fn exchanges(&self) -> u64 {
        self.state.borrow().exchanges
    }

    fn peer(&self) -> usize {
        self.side ^ 1
    }
}

impl DropLink for SimWire {
    type LinkError = WireError;

    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error<WireError>> {
        let (me, peer) = (self.side, self.peer());

        // Our previous drop must have been picked up first
        poll_fn(|cx| {
            let mut st = self.state.borrow_mut();
            if st.lanes[peer].frame.is_some() {
                st.lanes[me].waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            st.lanes[peer].frame = Some(tx.to_vec());
            if let Some(w) = st.lanes[peer].waker.take() {
                w.wake();
            }
            Poll::Ready(())
        })
        .await;

        let frame = poll_fn(|cx| {
            let mut st = self.state.borrow_mut();
            match st.lanes[me].frame.take() {
                Some(f) => {
                    st.exchanges += 1;
                    if let Some(w) = st.lanes[peer].waker.take() {
                        w.wake();
                    }
                    Poll::Ready(f)
                }
                None => {
                    st.lanes[me].waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await;

        if frame.len() != rx.len() {
            log::error!("drop of {} bytes, expected {}", frame.len(), rx.len());
            return Err(Error::Link(WireError::SizeMismatch {
                sent: frame.len(),
                expected: rx.len(),
            }));
        }
        rx.copy_from_slice(&frame);
        Ok(())
    }
}

/// A flash map sized for simulation
///
/// Small enough that segments fill up in a handful of writes, large enough
/// for the biggest blobs.
pub struct SimLayout;

impl NvCfg for SimLayout {
    const SECTOR_SIZE: u32 = 256;
    const SEGMENT_A: u32 = 0x1000;
    const SEGMENT_B: u32 = 0x1800;
    const SEGMENT_SECTORS: u32 = 8;
    const FACTORY_BASE: u32 = 0x2000;
    const FACTORY_SECTORS: u32 = 2;
    const FIXTURE_BASE: u32 = 0x2200;
    const FIXTURE_STRIDE: u32 = 128;
    const FIXTURE_SLOTS: u16 = 4;
    const MIN_WRITE_ADDRESS: u32 = 0x1000;
    const FLASH_RETRIES: u8 = 5;
    const RETRY_DELAY: Duration = Duration::from_millis(1);
    const MAX_LOOPS: u32 = 20_000;
}

/// Blank flash covering every [SimLayout] region
pub fn sim_flash() -> RamFlash {
    RamFlash::new(0, 0x2400, SimLayout::SECTOR_SIZE)
}

/// Flash that fails
///
/// Two kinds of faults are injected:
///
/// * transient timeouts, on a random one in `one_in` primitives, which
///   leave the device untouched
/// * power loss, after which every write and erase fails. The wrapped
///   flash keeps exactly what had been programmed, and can be taken back
///   out with [FlakyFlash::into_inner] to "reboot".
pub struct FlakyFlash<F: FlashHal, R: RngCore> {
    inner: F,
    rng: R,
    one_in: u32,
    mutations_left: Option<usize>,
    mutations: usize,
    faults: usize,
}

impl<F: FlashHal, R: RngCore> FlakyFlash<F, R> {
    /// A wrapper that injects nothing until configured
    pub fn new(inner: F, rng: R) -> Self {
        Self {
            inner,
            rng,
            one_in: 0,
            mutations_left: None,
            mutations: 0,
            faults: 0,
        }
    }

    /// Time out a random one in `one_in` primitives. Zero disables this.
    pub fn with_timeouts(mut self, one_in: u32) -> Self {
        self.one_in = one_in;
        self
    }

    /// Lose power after `n` more successful writes or erases
    pub fn cut_power_after(mut self, n: usize) -> Self {
        self.mutations_left = Some(n);
        self
    }

    /// Successful writes and erases so far
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Faults injected so far
    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Has power been lost?
    pub fn powered_off(&self) -> bool {
        self.mutations_left == Some(0)
    }

    /// The wrapped flash
    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// The wrapped flash, bypassing fault injection
    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.inner
    }

    /// Unwrap into the underlying flash, as when rebooting
    pub fn into_inner(self) -> F {
        self.inner
    }

    fn timeout(&mut self) -> bool {
        if self.one_in != 0 && self.rng.next_u32() % self.one_in == 0 {
            self.faults += 1;
            log::trace!("injected flash timeout");
            return true;
        }
        false
    }

    fn mutate(
        &mut self,
        f: impl FnOnce(&mut F) -> Result<(), FlashError>,
    ) -> Result<(), FlashError> {
        if self.powered_off() {
            self.faults += 1;
            return Err(FlashError::Hardware);
        }
        if self.timeout() {
            return Err(FlashError::Timeout);
        }
        f(&mut self.inner)?;
        self.mutations += 1;
        if let Some(left) = self.mutations_left.as_mut() {
            *left -= 1;
            if *left == 0 {
                log::debug!("power lost after {} mutations", self.mutations);
            }
        }
        Ok(())
    }
}

impl<F: FlashHal, R: RngCore> FlashHal for FlakyFlash<F, R> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if self.timeout() {
            return Err(FlashError::Timeout);
        }
        self.inner.read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.mutate(|f| f.write(addr, data))
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        self.mutate(|f| f.erase_sector(addr))
    }
}

/// Tick `storage` until its command is done, one millisecond per tick
pub fn settle<C: NvCfg, F: FlashHal>(
    storage: &mut NvStorage<C>,
    flash: &mut F,
    clock: &ManualClock,
) -> Vec<NvEvent> {
    let mut events = Vec::new();
    while storage.is_busy() {
        clock.advance(Duration::from_millis(1));
        events.extend(storage.tick(flash, clock.now(), false));
    }
    events
}

/// Store a blob and wait for the outcome
pub fn write_blob<C: NvCfg, F: FlashHal>(
    storage: &mut NvStorage<C>,
    flash: &mut F,
    clock: &ManualClock,
    tag: u32,
    data: &[u8],
) -> NvResult {
    let Ok(data) = heapless::Vec::<u8, MAX_BLOB_LEN>::from_slice(data) else {
        return NvResult::NoMem;
    };
    let cmd = NvCommand::Write {
        tag,
        data,
        allow_factory: false,
    };
    if let Err(e) = storage.command(cmd) {
        return e;
    }
    settle(storage, flash, clock)
        .last()
        .map(NvEvent::result)
        .unwrap_or(NvResult::Error)
}

/// Read a whole blob back
pub fn read_blob<C: NvCfg, F: FlashHal>(
    storage: &mut NvStorage<C>,
    flash: &mut F,
    clock: &ManualClock,
    tag: u32,
) -> Result<Vec<u8>, NvResult> {
    storage.command(NvCommand::Read { tag, end: None })?;
    let mut out = Vec::new();
    for ev in settle(storage, flash, clock) {
        match ev {
            NvEvent::Data { data, result, .. } => {
                out.extend_from_slice(&data);
                if result == NvResult::Okay {
                    return Ok(out);
                }
            }
            NvEvent::Complete { result, .. } => return Err(result),
            NvEvent::Erased { .. } => {}
        }
    }
    Err(NvResult::Error)
}

/// One command given to an actuator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Head(HeadAngle),
    Lift(LiftHeight),
    Body(BodyMotion),
    Face(FaceImage),
    FacePosition(FacePosition),
    Blink(Blink),
    Lights(BackpackLights),
}

/// Actuators that only remember what they were told
#[derive(Debug, Default)]
pub struct RecordingActuators {
    pub applied: Vec<Applied>,
    pub stopped: Vec<TrackMask>,
}

impl RecordingActuators {
    pub const fn new() -> Self {
        Self {
            applied: Vec::new(),
            stopped: Vec::new(),
        }
    }
}

impl Actuators for RecordingActuators {
    fn head_angle(&mut self, kf: &HeadAngle) {
        self.applied.push(Applied::Head(*kf));
    }

    fn lift_height(&mut self, kf: &LiftHeight) {
        self.applied.push(Applied::Lift(*kf));
    }

    fn body_motion(&mut self, kf: &BodyMotion) {
        self.applied.push(Applied::Body(*kf));
    }

    fn face_image(&mut self, kf: &FaceImage) {
        self.applied.push(Applied::Face(*kf));
    }

    fn face_position(&mut self, kf: &FacePosition) {
        self.applied.push(Applied::FacePosition(*kf));
    }

    fn blink(&mut self, kf: &Blink) {
        self.applied.push(Applied::Blink(*kf));
    }

    fn backpack_lights(&mut self, kf: &BackpackLights) {
        self.applied.push(Applied::Lights(*kf));
    }

    fn stop(&mut self, track: TrackMask) {
        log::debug!("stop {:?}", track);
        self.stopped.push(track);
    }
}

/// A clock that starts at zero and only moves when advanced
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: Cell<u64>,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            ticks: Cell::new(0),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.ticks.set(self.ticks.get() + by.as_ticks());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.ticks.get())
    }
}

/// Everything the WiFi side received
#[derive(Debug, Default)]
pub struct Inbox {
    nv: Vec<Vec<u8>>,
    /// Animation progress reports, oldest first
    pub states: Vec<AnimationState>,
    /// Messages for the engine
    pub relayed: Vec<(u8, Vec<u8>)>,
    /// Real-time messages
    pub realtime: Vec<(u8, Vec<u8>)>,
}

impl Inbox {
    /// Every storage reply received so far
    pub fn replies(&self) -> Vec<NvReply<'_>> {
        self.nv.iter().filter_map(|b| decode_reply(b)).collect()
    }

    /// Forget the storage replies received so far
    pub fn clear_replies(&mut self) {
        self.nv.clear();
    }

    /// Has an operation finished?
    pub fn completed(&self) -> Option<NvResult> {
        self.replies().iter().find_map(|r| match r {
            NvReply::Complete { result, .. } => Some(*result),
            NvReply::Data {
                result: NvResult::Okay,
                ..
            } => Some(NvResult::Okay),
            NvReply::Ack { result, .. } if !matches!(result, NvResult::Scheduled | NvResult::More) => {
                Some(*result)
            }
            _ => None,
        })
    }

    /// The blob carried by the received data replies
    pub fn blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for r in self.replies() {
            if let NvReply::Data { data, .. } = r {
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// The most recent animation progress report
    pub fn last_state(&self) -> Option<AnimationState> {
        self.states.last().copied()
    }
}

impl MessageSink for Inbox {
    fn relay(&mut self, tag: u8, body: &[u8]) -> bool {
        self.relayed.push((tag, body.to_vec()));
        true
    }

    fn local(&mut self, t: u8, body: &[u8]) {
        match t {
            tag::NV_REPLY => self.nv.push(body.to_vec()),
            tag::ANIM_STATE => match AnimationState::from_bytes(body) {
                Some(s) => self.states.push(s),
                None => log::warn!("bad animation state of {} bytes", body.len()),
            },
            _ => log::warn!("tag {} is not handled on this side", t),
        }
    }

    fn realtime(&mut self, tag: u8, body: &[u8]) {
        self.realtime.push((tag, body.to_vec()));
    }
}

/// The WiFi processor's end of the drop link
///
/// `N` is the size of the ring towards the RTIP.
pub struct WifiSide<'a, const N: usize> {
    to_rtip: Sender<'a, N, TO_RTIP_FRAME_SIZE>,
    pump: TxPump<'a, N, TO_RTIP_FRAME_SIZE>,
    rx: Receiver,
    tx_frame: ToRtipFrame,
    rx_frame: ToWifiFrame,
    inbox: Inbox,
}

impl<'a, const N: usize> WifiSide<'a, N> {
    /// Create the endpoint, optionally pacing releases with `estimate`
    pub fn new(
        ring: (Producer<'a, N>, Consumer<'a, N>),
        space: &'a AtomicWaker,
        estimate: Option<QueueEstimate>,
    ) -> Self {
        let (prod, cons) = ring;
        let pump = TxPump::new(cons, space);
        Self {
            to_rtip: Sender::new(prod, space),
            pump: match estimate {
                Some(e) => pump.with_estimate(e),
                None => pump,
            },
            rx: Receiver::new(),
            tx_frame: ToRtipFrame::zeroed(),
            rx_frame: ToWifiFrame::zeroed(),
            inbox: Inbox::default(),
        }
    }

    /// The outbound queue towards the RTIP
    pub fn sender(&mut self) -> &mut Sender<'a, N, TO_RTIP_FRAME_SIZE> {
        &mut self.to_rtip
    }

    /// What has arrived so far
    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Mutable access, for clearing replies between phases
    pub fn inbox_mut(&mut self) -> &mut Inbox {
        &mut self.inbox
    }

    /// Link counters for the WiFi end
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            tx_overflow: self.to_rtip.overflow_count(),
            ..self.rx.stats()
        }
    }

    /// Estimated fill of the RTIP's queue
    pub fn estimated_level(&mut self) -> Option<usize> {
        self.pump.estimate_mut().map(|e| e.level())
    }

    /// Queue one keyframe
    pub fn send_keyframe(&mut self, kf: &KeyFrame) -> Result<(), EnqueueError> {
        let mut body = [0u8; KeyFrame::MAX_BODY];
        let n = kf.encode(&mut body);
        self.to_rtip.try_enqueue(kf.tag(), &body[..n])
    }

    /// Queue one storage request
    pub fn send_request(&mut self, req: &NvRequest<'_>) -> Result<(), EnqueueError> {
        let mut buf = [0u8; max_body(TO_RTIP_FRAME_SIZE)];
        let body = encode_request(req, &mut buf).ok_or(EnqueueError::TooLarge)?;
        self.to_rtip.try_enqueue(tag::NV_REQUEST, body)
    }

    /// Queue every part of a blob write
    pub fn write_blob(&mut self, tag: u32, data: &[u8]) -> Result<(), EnqueueError> {
        for part in write_parts(tag, data, false) {
            self.send_request(&part)?;
        }
        Ok(())
    }

    /// Exchange one drop, then handle what arrived
    pub async fn step<L: DropLink>(
        &mut self,
        link: &mut L,
        now: Instant,
    ) -> Result<(), Error<L::LinkError>> {
        self.pump.fill(&mut self.tx_frame, now);
        link.exchange(self.tx_frame.as_bytes(), self.rx_frame.as_bytes_mut())
            .await?;
        self.rx.dispatch(&self.rx_frame, &mut self.inbox);
        Ok(())
    }
}
