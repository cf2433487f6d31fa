//! RTIP Node
//!
//! The node is the body-side end of the drop link. It owns:
//!
//! * the sending half of the link towards the WiFi processor, which
//!   carries storage replies and animation progress
//! * the receive dispatch for drops coming from the WiFi processor
//! * the storage command queue, and the reassembly of multi-part writes
//! * a producer into the relay ring towards the body board
//!
//! Keyframes are handed to a [SharedAnimation], which is also accessed
//! from the audio tick.
//!
//! The node is intended to be used in one place, where [RtipNode::step()]
//! is called once per hardware tick, while the audio tick independently
//! calls [SharedAnimation::pump_audio_data].

use embassy_sync::{blocking_mutex::raw::RawMutex, waitqueue::AtomicWaker};
use embassy_time::Instant;
use heapless::Deque;

use crate::{
    anim::{Actuators, AnimationState, SharedAnimation, TrackMask},
    drop::{max_body, ToRtipFrame, ToWifiFrame, TO_WIFI_FRAME_SIZE},
    nv::{FlashHal, NvCfg, NvCommand, NvEvent, NvOp, NvResult, NvStorage},
    protocol::{tag, KeyFrame},
    ring::{Consumer, Producer},
    transport::{DropLink, LinkStats, MessageSink, Receiver, Sender, TxPump},
    wirehelp::{decode_request, encode_reply, NvReply, NvRequest, WriteAssembler},
    Error,
};

/// Largest reply the node sends towards the WiFi processor
const MAX_REPLY: usize = max_body(TO_WIFI_FRAME_SIZE);

/// Storage replies held back while the outbound ring is full
const HELD_REPLIES: usize = 8;

/// The body-side endpoint
///
/// * `OUT` is the size of the ring towards the WiFi processor
/// * `RELAY` is the size of the ring towards the body board
/// * `ANIM` is the size of the keyframe buffer
pub struct RtipNode<
    'a,
    R: RawMutex + 'static,
    A: Actuators,
    C: NvCfg,
    const OUT: usize,
    const RELAY: usize,
    const ANIM: usize,
> {
    anim: &'a SharedAnimation<R, A, ANIM>,
    storage: NvStorage<C>,
    assembler: WriteAssembler,
    outbox: Outbox,
    to_wifi: Sender<'a, OUT, TO_WIFI_FRAME_SIZE>,
    pump: TxPump<'a, OUT, TO_WIFI_FRAME_SIZE>,
    rx: Receiver,
    relay: Producer<'a, RELAY>,
    realtime: u32,
    last_state: Option<AnimationState>,
    tx_frame: ToWifiFrame,
    rx_frame: ToRtipFrame,
}

/// Instantiation and accessors
impl<'a, R, A, C, const OUT: usize, const RELAY: usize, const ANIM: usize>
    RtipNode<'a, R, A, C, OUT, RELAY, ANIM>
where
    R: RawMutex + 'static,
    A: Actuators,
    C: NvCfg,
{
    /// Create a node
    ///
    /// `outbound` are both halves of the ring towards the WiFi processor,
    /// and `space` wakes senders waiting for room in it.
    pub fn new(
        anim: &'a SharedAnimation<R, A, ANIM>,
        storage: NvStorage<C>,
        outbound: (Producer<'a, OUT>, Consumer<'a, OUT>),
        space: &'a AtomicWaker,
        relay: Producer<'a, RELAY>,
    ) -> Self {
        let (prod, cons) = outbound;
        Self {
            anim,
            storage,
            assembler: WriteAssembler::new(),
            outbox: Outbox::new(),
            to_wifi: Sender::new(prod, space),
            pump: TxPump::new(cons, space),
            rx: Receiver::new(),
            relay,
            realtime: 0,
            last_state: None,
            tx_frame: ToWifiFrame::zeroed(),
            rx_frame: ToRtipFrame::zeroed(),
        }
    }

    /// The storage subsystem
    pub fn storage(&self) -> &NvStorage<C> {
        &self.storage
    }

    /// Receive counters, with the outbound overflow count filled in
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            tx_overflow: self.to_wifi.overflow_count(),
            ..self.rx.stats()
        }
    }

    /// Real-time messages passed through so far
    pub fn realtime_count(&self) -> u32 {
        self.realtime
    }

    /// Queue an application message towards the WiFi processor
    pub fn sender(&mut self) -> &mut Sender<'a, OUT, TO_WIFI_FRAME_SIZE> {
        &mut self.to_wifi
    }
}

/// Operation
impl<'a, R, A, C, const OUT: usize, const RELAY: usize, const ANIM: usize>
    RtipNode<'a, R, A, C, OUT, RELAY, ANIM>
where
    R: RawMutex + 'static,
    A: Actuators,
    C: NvCfg,
{
    /// Perform one tick of the node
    ///
    /// One call to `step` will:
    ///
    /// 1. Queue held storage replies, then advance the pending storage
    ///    operation by at most one flash primitive if its result would fit
    /// 2. Queue an animation progress report if it changed
    /// 3. Exchange one drop in each direction over `link`
    /// 4. Dispatch every message of the received drop
    pub async fn step<L, F>(
        &mut self,
        link: &mut L,
        flash: &mut F,
        now: Instant,
    ) -> Result<(), Error<L::LinkError>>
    where
        L: DropLink,
        F: FlashHal,
    {
        self.service(flash, now);
        self.pump.fill(&mut self.tx_frame, now);
        link.exchange(self.tx_frame.as_bytes(), self.rx_frame.as_bytes_mut())
            .await?;
        let (rx, frame, mut sink) = self.parts();
        rx.dispatch(frame, &mut sink);
        Ok(())
    }

    /// Drive storage and report animation progress, without touching the
    /// link
    pub fn service<F: FlashHal>(&mut self, flash: &mut F, now: Instant) {
        let flushed = self.outbox.flush(&mut self.to_wifi);
        let blocked = !flushed || !self.to_wifi.has_room_for(MAX_REPLY);
        if let Some(ev) = self.storage.tick(flash, now, blocked) {
            self.outbox.send(&mut self.to_wifi, &NvReply::from(&ev));
            if let NvEvent::Complete {
                op: NvOp::Write,
                result: NvResult::NoRoom,
                ..
            } = ev
            {
                spine_info!("segment full, garbage collection needed");
            }
        }

        let state = self.anim.animation_state();
        if self.last_state != Some(state)
            && self.to_wifi.try_enqueue(tag::ANIM_STATE, &state.to_bytes()).is_ok()
        {
            self.last_state = Some(state);
        }
    }

    /// Dispatch every message of a drop received from the WiFi processor
    pub fn receive(&mut self, frame: &ToRtipFrame) -> usize {
        let (rx, _, mut sink) = self.parts();
        rx.dispatch(frame, &mut sink)
    }

    #[allow(clippy::type_complexity)]
    fn parts(
        &mut self,
    ) -> (
        &mut Receiver,
        &ToRtipFrame,
        Inbound<'_, 'a, R, A, C, OUT, RELAY, ANIM>,
    ) {
        let sink = Inbound {
            anim: self.anim,
            storage: &mut self.storage,
            assembler: &mut self.assembler,
            outbox: &mut self.outbox,
            to_wifi: &mut self.to_wifi,
            relay: &mut self.relay,
            realtime: &mut self.realtime,
        };
        (&mut self.rx, &self.rx_frame, sink)
    }
}

/// Storage replies that did not fit the outbound ring yet
///
/// Replies leave in the order they were produced. While any are held, new
/// ones queue up behind them.
struct Outbox {
    held: Deque<heapless::Vec<u8, MAX_REPLY>, HELD_REPLIES>,
}

impl Outbox {
    const fn new() -> Self {
        Self { held: Deque::new() }
    }

    fn send<const OUT: usize>(
        &mut self,
        to_wifi: &mut Sender<'_, OUT, TO_WIFI_FRAME_SIZE>,
        reply: &NvReply<'_>,
    ) {
        let mut buf = [0u8; MAX_REPLY];
        let Some(used) = encode_reply(reply, &mut buf) else {
            spine_error!("storage reply does not fit a drop");
            return;
        };
        if self.held.is_empty()
            && to_wifi.has_room_for(used.len())
            && to_wifi.try_enqueue(tag::NV_REPLY, used).is_ok()
        {
            return;
        }
        let Ok(msg) = heapless::Vec::from_slice(used) else {
            return;
        };
        if self.held.push_back(msg).is_err() {
            spine_error!("storage reply lost, {} already held", HELD_REPLIES);
        }
    }

    /// Queue held replies, returning true once none are left
    fn flush<const OUT: usize>(
        &mut self,
        to_wifi: &mut Sender<'_, OUT, TO_WIFI_FRAME_SIZE>,
    ) -> bool {
        while let Some(msg) = self.held.front() {
            if !to_wifi.has_room_for(msg.len())
                || to_wifi.try_enqueue(tag::NV_REPLY, msg).is_err()
            {
                return false;
            }
            self.held.pop_front();
        }
        true
    }
}

/// Borrowed view of the node used while dispatching one drop
struct Inbound<
    'n,
    'a,
    R: RawMutex + 'static,
    A: Actuators,
    C: NvCfg,
    const OUT: usize,
    const RELAY: usize,
    const ANIM: usize,
> {
    anim: &'a SharedAnimation<R, A, ANIM>,
    storage: &'n mut NvStorage<C>,
    assembler: &'n mut WriteAssembler,
    outbox: &'n mut Outbox,
    to_wifi: &'n mut Sender<'a, OUT, TO_WIFI_FRAME_SIZE>,
    relay: &'n mut Producer<'a, RELAY>,
    realtime: &'n mut u32,
}

impl<R, A, C, const OUT: usize, const RELAY: usize, const ANIM: usize>
    Inbound<'_, '_, R, A, C, OUT, RELAY, ANIM>
where
    R: RawMutex + 'static,
    A: Actuators,
    C: NvCfg,
{
    fn ack(&mut self, op: NvOp, tag: u32, res: Result<(), NvResult>) {
        let result = match res {
            Ok(()) => NvResult::Scheduled,
            Err(e) => e,
        };
        self.outbox
            .send(&mut *self.to_wifi, &NvReply::Ack { op, tag, result });
    }

    fn nv_request(&mut self, body: &[u8]) {
        let Some(req) = decode_request(body) else {
            spine_warn!("undecodable storage request");
            return;
        };
        let op = req.op();
        let tag = req.tag();
        let res = match req {
            NvRequest::WritePart {
                tag,
                offset,
                total_len,
                allow_factory,
                data,
            } => match self
                .assembler
                .push(tag, offset, total_len, allow_factory, data)
            {
                Ok(Some(cmd)) => self.storage.command(cmd),
                Ok(None) => {
                    self.ack_part(tag);
                    return;
                }
                Err(e) => Err(e),
            },
            NvRequest::Read { tag, end } => self.storage.command(NvCommand::Read { tag, end }),
            NvRequest::Erase { tag, end } => self.storage.command(NvCommand::Erase { tag, end }),
            NvRequest::WipeAll { include_factory } => {
                self.storage.command(NvCommand::WipeAll { include_factory })
            }
            NvRequest::GarbageCollect => self.storage.garbage_collect(),
        };
        self.ack(op, tag, res);
    }

    fn ack_part(&mut self, tag: u32) {
        self.outbox.send(
            &mut *self.to_wifi,
            &NvReply::Ack {
                op: NvOp::Write,
                tag,
                result: NvResult::More,
            },
        );
    }
}

impl<R, A, C, const OUT: usize, const RELAY: usize, const ANIM: usize> MessageSink
    for Inbound<'_, '_, R, A, C, OUT, RELAY, ANIM>
where
    R: RawMutex + 'static,
    A: Actuators,
    C: NvCfg,
{
    fn relay(&mut self, tag: u8, body: &[u8]) -> bool {
        self.relay.push_message(tag, body)
    }

    fn local(&mut self, t: u8, body: &[u8]) {
        match t {
            _ if KeyFrame::is_keyframe(t) => match KeyFrame::decode(t, body) {
                Ok(kf) => {
                    if self.anim.buffer_key_frame(&kf).is_err() {
                        spine_warn!("keyframe buffer overflow, aborting animation");
                        self.anim.abort();
                    }
                }
                Err(_) => spine_warn!("bad keyframe {}", t),
            },
            tag::ABORT_ANIMATION => self.anim.abort(),
            tag::SET_TRACKS => {
                if let Some(bits) = body.first() {
                    self.anim.set_tracks(TrackMask::from_bits_truncate(*bits));
                }
            }
            tag::NV_REQUEST => self.nv_request(body),
            _ => spine_warn!("tag {} is not handled on this side", t),
        }
    }

    fn realtime(&mut self, tag: u8, body: &[u8]) {
        *self.realtime = self.realtime.wrapping_add(1);
        if !self.relay.push_message(tag, body) {
            spine_warn!("real-time message {} lost", tag);
        }
    }
}
