//! Drop Transport
//!
//! Each direction of the inter-processor link is made of:
//!
//! * A [Sender], held by whoever produces messages. It writes framed
//!   messages into the outbound [ByteRing](crate::ring::ByteRing) and never
//!   blocks, unless the caller explicitly asks to wait for room with
//!   [Sender::enqueue_reliable].
//! * A [TxPump], held by the hardware tick. Once per tick it drains as many
//!   complete messages as fit into one [DropFrame], and zero fills the rest.
//! * A [Receiver] on the far side, which walks the received frame's message
//!   stream and routes every message by tag range into a [MessageSink].
//!
//! The link itself is abstracted by [DropLink], which exchanges one drop in
//! each direction per call.

use core::{future::poll_fn, task::Poll};

use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{Duration, Instant};

use crate::{
    drop::{max_body, DropFrame, Droplet, DropletFlags, RawMessage, SeqTracker, Truncated},
    protocol::{classify, local_body_size, tag, TagClass},
    ring::{Consumer, Producer, MSG_HEADER},
    Error,
};

/// A full-duplex link that exchanges one drop in each direction per call
pub trait DropLink {
    /// The error type of the underlying link
    type LinkError;

    /// Send `tx` and receive exactly `rx.len()` bytes
    ///
    /// Both directions are clocked together, so this completes once the
    /// whole exchange is done. This function MUST be cancellation safe.
    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error<Self::LinkError>>;
}

/// An error when queueing a message for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The body can never fit in a single drop
    TooLarge,
    /// The outbound ring has no room right now
    Full,
}

/// Link health counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    /// Messages rejected by a full outbound ring
    pub tx_overflow: u32,
    /// Messages lost because a receive or relay ring was full
    pub rx_overflow: u32,
    /// Received messages discarded as malformed or unexpected
    pub dropped: u32,
    /// Drops skipped according to the sequence nibble
    pub missed: u32,
}

/// The producing half of one direction of the link
///
/// `FRAME` is the drop size of this direction, which bounds the largest
/// message that may be queued.
pub struct Sender<'a, const N: usize, const FRAME: usize> {
    prod: Producer<'a, N>,
    space: &'a AtomicWaker,
    overflow: u32,
}

impl<'a, const N: usize, const FRAME: usize> Sender<'a, N, FRAME> {
    /// Largest body that may be queued
    pub const MAX_BODY: usize = max_body(FRAME);

    /// Create a sender. `space` must be the same waker given to the
    /// matching [TxPump].
    pub fn new(prod: Producer<'a, N>, space: &'a AtomicWaker) -> Self {
        Self {
            prod,
            space,
            overflow: 0,
        }
    }

    /// Queue a message without waiting
    ///
    /// The reserved [tag::HANDLED] tag is accepted without writing anything.
    pub fn try_enqueue(&mut self, tag: u8, body: &[u8]) -> Result<(), EnqueueError> {
        if tag == tag::HANDLED {
            return Ok(());
        }
        Self::check_len(body)?;
        if self.prod.push_message(tag, body) {
            Ok(())
        } else {
            self.overflow = self.overflow.wrapping_add(1);
            Err(EnqueueError::Full)
        }
    }

    /// Queue a message, waiting for room if necessary
    ///
    /// The wait is woken by the [TxPump] each time it drains messages.
    pub async fn enqueue_reliable(&mut self, tag: u8, body: &[u8]) -> Result<(), EnqueueError> {
        if tag == tag::HANDLED {
            return Ok(());
        }
        Self::check_len(body)?;
        let space = self.space;
        poll_fn(|cx| {
            space.register(cx.waker());
            if self.prod.push_message(tag, body) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Bytes currently free in the outbound ring
    pub fn free(&self) -> usize {
        self.prod.free()
    }

    /// Could a message of `body_len` bytes be queued right now?
    pub fn has_room_for(&self, body_len: usize) -> bool {
        self.free() >= MSG_HEADER + body_len
    }

    /// Number of messages rejected by [Sender::try_enqueue]
    pub fn overflow_count(&self) -> u32 {
        self.overflow
    }

    fn check_len(body: &[u8]) -> Result<(), EnqueueError> {
        if body.len() > Self::MAX_BODY {
            Err(EnqueueError::TooLarge)
        } else {
            Ok(())
        }
    }
}

/// Estimate of how full the peer's receive queue is
///
/// Every message released onto the link adds to the estimate, and the
/// estimate drains by `drain_bytes` every `per` of elapsed time, which is
/// the rate the peer is known to consume at.
#[derive(Debug, Clone)]
pub struct QueueEstimate {
    capacity: usize,
    level: usize,
    drain_bytes: usize,
    per: Duration,
    last: Option<Instant>,
}

impl QueueEstimate {
    /// Create an empty estimate for a peer queue of `capacity` bytes
    pub const fn new(capacity: usize, drain_bytes: usize, per: Duration) -> Self {
        Self {
            capacity,
            level: 0,
            drain_bytes,
            per,
            last: None,
        }
    }

    /// Apply the drain for time elapsed up to `now`
    pub fn drain(&mut self, now: Instant) {
        let Some(last) = self.last else {
            self.last = Some(now);
            return;
        };
        let elapsed = now.saturating_duration_since(last);
        let per = self.per.as_ticks();
        if per == 0 {
            self.level = 0;
            self.last = Some(now);
            return;
        }
        let periods = elapsed.as_ticks() / per;
        if periods == 0 {
            return;
        }
        let drained = (periods as usize).saturating_mul(self.drain_bytes);
        self.level = self.level.saturating_sub(drained);
        self.last = Some(last + Duration::from_ticks(periods * per));
    }

    /// Would `len` more bytes fit in the peer's queue?
    pub fn fits(&self, len: usize) -> bool {
        self.level + len <= self.capacity
    }

    /// Account for `len` bytes released to the peer
    pub fn add(&mut self, len: usize) {
        self.level = self.level.saturating_add(len);
    }

    /// Estimated bytes queued at the peer
    pub fn level(&self) -> usize {
        self.level
    }

    /// Forget everything, e.g. after the peer restarted
    pub fn reset(&mut self) {
        self.level = 0;
        self.last = None;
    }
}

/// The consuming half of one direction of the link
pub struct TxPump<'a, const N: usize, const FRAME: usize> {
    cons: Consumer<'a, N>,
    space: &'a AtomicWaker,
    seq: u8,
    estimate: Option<QueueEstimate>,
    discarded: u32,
}

impl<'a, const N: usize, const FRAME: usize> TxPump<'a, N, FRAME> {
    /// Create a pump. `space` must be the same waker given to the
    /// matching [Sender].
    pub fn new(cons: Consumer<'a, N>, space: &'a AtomicWaker) -> Self {
        Self {
            cons,
            space,
            seq: 0,
            estimate: None,
            discarded: 0,
        }
    }

    /// Only release messages when `estimate` says the peer has room
    pub fn with_estimate(mut self, estimate: QueueEstimate) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// The remote queue estimate, if one is used
    pub fn estimate_mut(&mut self) -> Option<&mut QueueEstimate> {
        self.estimate.as_mut()
    }

    /// Fill `frame` for this tick
    ///
    /// Drains complete messages in FIFO order while they fit, zero fills
    /// the rest of the payload region, and stamps the droplet byte.
    /// Returns the number of stream bytes used.
    pub fn fill(&mut self, frame: &mut DropFrame<FRAME>, now: Instant) -> usize {
        if let Some(est) = self.estimate.as_mut() {
            est.drain(now);
        }

        let mut used = 0;
        {
            let region = frame.payload_region_mut();
            while let Some((_tag, len)) = self.cons.peek_message() {
                let n = MSG_HEADER + len;
                if n > region.len() {
                    // Can never be sent, don't wedge the ring on it
                    spine_warn!("discarding oversize message of {} bytes", n);
                    self.cons.skip_message();
                    self.discarded = self.discarded.wrapping_add(1);
                    continue;
                }
                if used + n > region.len() {
                    break;
                }
                if let Some(est) = self.estimate.as_mut() {
                    if !est.fits(n) {
                        break;
                    }
                    est.add(n);
                }
                self.cons.peek_into(0, &mut region[used..used + n]);
                self.cons.consume(n);
                used += n;
            }
            region[used..].fill(0);
        }
        frame.set_payload_len(used);

        let mut flags = DropletFlags::empty();
        flags.set(DropletFlags::MESSAGES, used != 0);
        flags.set(DropletFlags::MORE_PENDING, !self.cons.is_empty());
        frame.set_droplet(Droplet {
            seq: self.seq,
            flags,
        });
        self.seq = (self.seq + 1) & Droplet::SEQ_MASK;

        if used != 0 {
            self.space.wake();
        }
        used
    }

    /// Messages discarded because they could never fit a drop
    pub fn discarded(&self) -> u32 {
        self.discarded
    }
}

/// Handlers for received messages, one per tag range
pub trait MessageSink {
    /// Forward a message to the next hop unmodified
    ///
    /// Returns false if the relay queue had no room.
    fn relay(&mut self, tag: u8, body: &[u8]) -> bool;

    /// Process a local message. The body size was already validated.
    fn local(&mut self, tag: u8, body: &[u8]);

    /// Handle a real-time pass-through message
    fn realtime(&mut self, tag: u8, body: &[u8]);
}

/// What happened to a single received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Reserved tag, nothing to do
    Handled,
    /// Passed to [MessageSink::relay]
    Relayed,
    /// Passed to [MessageSink::local]
    Local,
    /// Passed to [MessageSink::realtime]
    RealTime,
    /// Discarded
    Dropped(DropReason),
}

/// Why a received message was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The tag is outside every known range
    UnexpectedTag,
    /// The body size did not match the tag
    SizeMismatch,
    /// The relay queue was full
    Overrun,
    /// The message ran past the end of the payload stream
    Truncated,
}

/// The receiving side of one direction of the link
#[derive(Debug, Default)]
pub struct Receiver {
    seq: SeqTracker,
    stats: LinkStats,
}

impl Receiver {
    /// Create a receiver with zeroed counters
    pub const fn new() -> Self {
        Self {
            seq: SeqTracker::new(),
            stats: LinkStats {
                tx_overflow: 0,
                rx_overflow: 0,
                dropped: 0,
                missed: 0,
            },
        }
    }

    /// Route every message of a received drop
    ///
    /// A malformed message only costs itself: processing continues with
    /// the next one. Returns the number of messages delivered to `sink`.
    pub fn dispatch<const SIZE: usize, S: MessageSink>(
        &mut self,
        frame: &DropFrame<SIZE>,
        sink: &mut S,
    ) -> usize {
        let droplet = match frame.droplet() {
            Ok(d) => d,
            Err(_) => {
                spine_warn!("reserved droplet bits, discarding drop");
                self.stats.dropped = self.stats.dropped.wrapping_add(1);
                return 0;
            }
        };
        let skipped = self.seq.observe(droplet.seq);
        if skipped != 0 {
            spine_debug!("missed {} drops", skipped);
        }
        self.stats.missed = self.seq.missed();

        let mut delivered = 0;
        for msg in frame.messages() {
            let outcome = match msg {
                Ok(msg) => self.dispatch_message(msg, sink),
                Err(Truncated) => {
                    spine_warn!("truncated message in drop");
                    self.stats.dropped = self.stats.dropped.wrapping_add(1);
                    DispatchOutcome::Dropped(DropReason::Truncated)
                }
            };
            if matches!(
                outcome,
                DispatchOutcome::Relayed | DispatchOutcome::Local | DispatchOutcome::RealTime
            ) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Route a single message by tag range
    pub fn dispatch_message<S: MessageSink>(
        &mut self,
        msg: RawMessage<'_>,
        sink: &mut S,
    ) -> DispatchOutcome {
        let RawMessage { tag, body } = msg;
        match classify(tag) {
            TagClass::Handled => DispatchOutcome::Handled,
            TagClass::Relay => {
                if sink.relay(tag, body) {
                    DispatchOutcome::Relayed
                } else {
                    spine_warn!("relay overrun, dropping tag {}", tag);
                    self.stats.rx_overflow = self.stats.rx_overflow.wrapping_add(1);
                    DispatchOutcome::Dropped(DropReason::Overrun)
                }
            }
            TagClass::Local => match local_body_size(tag) {
                Some(sz) if sz.accepts(body.len()) => {
                    sink.local(tag, body);
                    DispatchOutcome::Local
                }
                Some(_) => {
                    spine_warn!("size mismatch for tag {}: {} bytes", tag, body.len());
                    self.stats.dropped = self.stats.dropped.wrapping_add(1);
                    DispatchOutcome::Dropped(DropReason::SizeMismatch)
                }
                None => {
                    spine_warn!("unexpected local tag {}", tag);
                    self.stats.dropped = self.stats.dropped.wrapping_add(1);
                    DispatchOutcome::Dropped(DropReason::UnexpectedTag)
                }
            },
            TagClass::RealTime => {
                sink.realtime(tag, body);
                DispatchOutcome::RealTime
            }
            TagClass::Unexpected => {
                spine_warn!("unexpected tag {}", tag);
                self.stats.dropped = self.stats.dropped.wrapping_add(1);
                DispatchOutcome::Dropped(DropReason::UnexpectedTag)
            }
        }
    }

    /// Count a message lost to a full local receive queue
    pub fn note_rx_overflow(&mut self) {
        self.stats.rx_overflow = self.stats.rx_overflow.wrapping_add(1);
    }

    /// Counters observed by this receiver
    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use core::{
        pin::pin,
        task::{Context, Poll},
    };
    use std::vec::Vec;

    use futures::{task::noop_waker_ref, Future};

    use super::*;
    use crate::{
        drop::{ToRtipFrame, ToWifiFrame, TO_RTIP_FRAME_SIZE, TO_WIFI_FRAME_SIZE},
        ring::ByteRing,
    };

    #[derive(Default)]
    struct Collect {
        relayed: Vec<(u8, Vec<u8>)>,
        local: Vec<(u8, Vec<u8>)>,
        realtime: Vec<u8>,
        relay_full: bool,
    }

    impl MessageSink for Collect {
        fn relay(&mut self, tag: u8, body: &[u8]) -> bool {
            if self.relay_full {
                return false;
            }
            self.relayed.push((tag, body.to_vec()));
            true
        }

        fn local(&mut self, tag: u8, body: &[u8]) {
            self.local.push((tag, body.to_vec()));
        }

        fn realtime(&mut self, tag: u8, _body: &[u8]) {
            self.realtime.push(tag);
        }
    }

    fn t0() -> Instant {
        Instant::from_ticks(0)
    }

    #[test]
    fn fifo_split_at_frame_boundary() {
        let waker = AtomicWaker::new();
        let mut ring = ByteRing::<512>::new();
        let (p, c) = ring.split();
        let mut tx = Sender::<512, TO_WIFI_FRAME_SIZE>::new(p, &waker);
        let mut pump = TxPump::<512, TO_WIFI_FRAME_SIZE>::new(c, &waker);
        let mut rx = Receiver::new();

        for i in 0..6u8 {
            tx.try_enqueue(0x10 + i, &[i; 30]).unwrap();
        }

        let mut sink = Collect::default();
        let mut frame = ToWifiFrame::zeroed();
        let mut ticks = 0;
        while sink.relayed.len() < 6 {
            pump.fill(&mut frame, t0());
            rx.dispatch(&frame, &mut sink);
            ticks += 1;
            assert!(ticks < 10);
        }
        // Two 32 byte messages fit in a 78 byte payload region
        assert_eq!(ticks, 3);
        for (i, (tag, body)) in sink.relayed.iter().enumerate() {
            assert_eq!(*tag, 0x10 + i as u8);
            assert_eq!(body, &[i as u8; 30]);
        }
        assert_eq!(rx.stats().missed, 0);
    }

    #[test]
    fn stale_bytes_are_zeroed() {
        let waker = AtomicWaker::new();
        let mut ring = ByteRing::<256>::new();
        let (p, c) = ring.split();
        let mut tx = Sender::<256, TO_RTIP_FRAME_SIZE>::new(p, &waker);
        let mut pump = TxPump::<256, TO_RTIP_FRAME_SIZE>::new(c, &waker);

        let mut frame = ToRtipFrame::zeroed();
        frame.payload_region_mut().fill(0xAA);
        tx.try_enqueue(0x42, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pump.fill(&mut frame, t0()), 6);
        assert_eq!(frame.payload(), &[5, 0x42, 1, 2, 3, 4]);
        assert!(frame.payload_region_mut()[6..].iter().all(|b| *b == 0));
        let d = frame.droplet().unwrap();
        assert_eq!(d.flags, DropletFlags::MESSAGES);
    }

    #[test]
    fn handled_tag_and_oversize() {
        let waker = AtomicWaker::new();
        let mut ring = ByteRing::<256>::new();
        let (p, c) = ring.split();
        let mut tx = Sender::<256, TO_WIFI_FRAME_SIZE>::new(p, &waker);

        assert_eq!(tx.try_enqueue(tag::HANDLED, &[1, 2, 3]), Ok(()));
        assert!(c.is_empty());
        let big = [0u8; TO_WIFI_FRAME_SIZE];
        assert_eq!(tx.try_enqueue(0x01, &big), Err(EnqueueError::TooLarge));
    }

    #[test]
    fn full_ring_rejects_and_counts() {
        let waker = AtomicWaker::new();
        let mut ring = ByteRing::<16>::new();
        let (p, _c) = ring.split();
        let mut tx = Sender::<16, TO_WIFI_FRAME_SIZE>::new(p, &waker);
        assert_eq!(tx.try_enqueue(0x01, &[0; 10]), Ok(()));
        assert_eq!(tx.try_enqueue(0x01, &[0; 10]), Err(EnqueueError::Full));
        assert_eq!(tx.overflow_count(), 1);
    }

    #[test]
    fn reliable_enqueue_waits_for_room() {
        let waker = AtomicWaker::new();
        let mut ring = ByteRing::<32>::new();
        let (p, c) = ring.split();
        let mut tx = Sender::<32, TO_WIFI_FRAME_SIZE>::new(p, &waker);
        let mut pump = TxPump::<32, TO_WIFI_FRAME_SIZE>::new(c, &waker);

        tx.try_enqueue(0x01, &[7; 20]).unwrap();
        let mut cx = Context::from_waker(noop_waker_ref());
        {
            let mut fut = pin!(tx.enqueue_reliable(0x02, &[8; 20]));
            assert!(fut.as_mut().poll(&mut cx).is_pending());

            let mut frame = ToWifiFrame::zeroed();
            pump.fill(&mut frame, t0());
            assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(())));
        }
        let mut frame = ToWifiFrame::zeroed();
        pump.fill(&mut frame, t0());
        let msgs: Vec<_> = frame.messages().collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0],
            Ok(RawMessage {
                tag: 0x02,
                body: &[8; 20]
            })
        );
    }

    #[test]
    fn dispatch_routes_by_range() {
        let mut f = ToRtipFrame::zeroed();
        let stream: &[u8] = &[
            3, 0x05, 1, 2, // relay
            5, 0x42, 0, 1, 2, 3, // head angle, correct size
            3, 0x42, 0, 1, // head angle, wrong size
            1, 0x81, // real-time
            2, 0x95, 0, // unexpected
            1, 0x4A, // end of animation
        ];
        f.payload_region_mut()[..stream.len()].copy_from_slice(stream);
        f.set_payload_len(stream.len());

        let mut rx = Receiver::new();
        let mut sink = Collect::default();
        assert_eq!(rx.dispatch(&f, &mut sink), 4);
        assert_eq!(sink.relayed, [(0x05, vec![1, 2])]);
        assert_eq!(sink.local.len(), 2);
        assert_eq!(sink.local[0].0, 0x42);
        assert_eq!(sink.local[1].0, 0x4A);
        assert_eq!(sink.realtime, [0x81]);
        assert_eq!(rx.stats().dropped, 2);
    }

    #[test]
    fn relay_overrun_is_counted() {
        let mut rx = Receiver::new();
        let mut sink = Collect {
            relay_full: true,
            ..Default::default()
        };
        let out = rx.dispatch_message(RawMessage { tag: 0x07, body: &[1] }, &mut sink);
        assert_eq!(out, DispatchOutcome::Dropped(DropReason::Overrun));
        assert_eq!(rx.stats().rx_overflow, 1);
    }

    #[test]
    fn estimate_limits_release() {
        let waker = AtomicWaker::new();
        let mut ring = ByteRing::<256>::new();
        let (p, c) = ring.split();
        let mut tx = Sender::<256, TO_WIFI_FRAME_SIZE>::new(p, &waker);
        let mut pump = TxPump::<256, TO_WIFI_FRAME_SIZE>::new(c, &waker).with_estimate(
            QueueEstimate::new(24, 12, Duration::from_millis(1)),
        );

        for _ in 0..3 {
            tx.try_enqueue(0x01, &[0; 10]).unwrap();
        }
        let mut frame = ToWifiFrame::zeroed();
        assert_eq!(pump.fill(&mut frame, Instant::from_millis(0)), 24);
        assert!(frame.droplet().unwrap().flags.contains(DropletFlags::MORE_PENDING));
        // No time passed, so nothing drained
        assert_eq!(pump.fill(&mut frame, Instant::from_millis(0)), 0);
        assert_eq!(pump.fill(&mut frame, Instant::from_millis(1)), 12);
    }
}
