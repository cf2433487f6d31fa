//! Animation playback
//!
//! Keyframes arrive over the transport well ahead of when they are played,
//! and are buffered in a [ByteRing] using the same `[len][tag][body]`
//! framing as the transport itself. Playback is paced by the audio output:
//! every audio-class keyframe (sample, silence or end of animation) lasts
//! for a fixed number of audio ticks, and every other keyframe between two
//! audio frames is applied when the earlier one finishes.
//!
//! Playback only starts once [PREROLL_FRAMES] audio frames are buffered,
//! or the end marker has already arrived. While playing, it pauses (but
//! never aborts) whenever the buffer runs dry.

use core::cell::RefCell;

use bitflags::bitflags;
use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};

use crate::{
    protocol::{
        tag, BackpackLights, Blink, BodyMotion, FaceImage, FacePosition, HeadAngle, KeyFrame,
        LiftHeight, AUDIO_BYTES_PER_TICK, AUDIO_FRAME_BYTES,
    },
    ring::{ByteRing, MSG_HEADER},
};

/// Audio-class frames that must be buffered before playback starts
pub const PREROLL_FRAMES: u16 = 7;

/// Free space always left in the buffer
const FRAME_SLACK: usize = MSG_HEADER + AUDIO_FRAME_BYTES;

bitflags! {
    /// Independently enabled outputs driven by animations
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrackMask: u8 {
        /// Head angle
        const HEAD = 0x01;
        /// Lift height
        const LIFT = 0x02;
        /// Wheels
        const BODY = 0x04;
        /// Backpack lights
        const LIGHTS = 0x08;
        /// Face image
        const FACE_IMAGE = 0x10;
        /// Face position
        const FACE_POS = 0x20;
        /// Blinking
        const BLINK = 0x40;
        /// Audio output
        const AUDIO = 0x80;
    }
}

impl TrackMask {
    fn for_keyframe(kf: &KeyFrame) -> Self {
        match kf {
            KeyFrame::AudioSample(_) | KeyFrame::AudioSilence => TrackMask::AUDIO,
            KeyFrame::HeadAngle(_) => TrackMask::HEAD,
            KeyFrame::LiftHeight(_) => TrackMask::LIFT,
            KeyFrame::BodyMotion(_) => TrackMask::BODY,
            KeyFrame::FaceImage(_) => TrackMask::FACE_IMAGE,
            KeyFrame::FacePosition(_) => TrackMask::FACE_POS,
            KeyFrame::Blink(_) => TrackMask::BLINK,
            KeyFrame::BackpackLights(_) => TrackMask::LIGHTS,
            KeyFrame::StartOfAnimation(_) | KeyFrame::EndOfAnimation => TrackMask::empty(),
        }
    }
}

/// The outputs keyframes are applied to
///
/// Every call is fire-and-forget and must return promptly, as it is made
/// from the audio tick.
pub trait Actuators {
    /// Command the head
    fn head_angle(&mut self, kf: &HeadAngle);
    /// Command the lift
    fn lift_height(&mut self, kf: &LiftHeight);
    /// Command the wheels
    fn body_motion(&mut self, kf: &BodyMotion);
    /// Draw on the face display
    fn face_image(&mut self, kf: &FaceImage);
    /// Shift the face on the display
    fn face_position(&mut self, kf: &FacePosition);
    /// Blink
    fn blink(&mut self, kf: &Blink);
    /// Set the backpack lights
    fn backpack_lights(&mut self, kf: &BackpackLights);

    /// Bring a single track to rest, e.g. zero the wheel speed
    ///
    /// Called with exactly one flag set.
    fn stop(&mut self, track: TrackMask);
}

/// The keyframe buffer has no room for the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

/// Coarse playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum PlaybackState {
    /// Nothing buffered, nothing playing
    Idle,
    /// Frames are accumulating, playback has not started
    PreRolling,
    /// Playing
    Playing,
    /// Playing, but paused until more frames arrive
    Starved,
}

/// Playback progress reported back to the sender of the animation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "postcard-helpers",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct AnimationState {
    /// Buffer bytes consumed since boot, including discarded ones
    pub total_bytes_played: u32,
    /// Tag of the animation being played, zero if none
    pub tag: u8,
    /// Audio-class frames currently buffered
    pub buffered_audio_frames: u16,
    /// Tracks driven by the current animation
    pub tracks_in_use: u8,
}

impl AnimationState {
    /// Encoded size
    pub const SIZE: usize = 8;

    /// Fixed little endian encoding
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.total_bytes_played.to_le_bytes());
        out[4] = self.tag;
        out[5..7].copy_from_slice(&self.buffered_audio_frames.to_le_bytes());
        out[7] = self.tracks_in_use;
        out
    }

    /// Decode a fixed encoding
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let b: &[u8; Self::SIZE] = b.try_into().ok()?;
        Some(Self {
            total_bytes_played: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            tag: b[4],
            buffered_audio_frames: u16::from_le_bytes([b[5], b[6]]),
            tracks_in_use: b[7],
        })
    }
}

/// Keyframe buffer and playback state machine
///
/// `N` is the buffer size in bytes.
pub struct AnimationController<const N: usize> {
    ring: ByteRing<N>,
    audio_frames: u16,
    termination_received: bool,
    playing: bool,
    starting: bool,
    starved_logged: bool,
    play_silence: bool,
    sub_position: usize,
    total_bytes_played: u32,
    current_tag: u8,
    tracks_to_play: TrackMask,
    tracks_in_use: TrackMask,
}

impl<const N: usize> AnimationController<N> {
    const ROOMY: () = assert!(
        N > 2 * FRAME_SLACK,
        "animation buffer must hold more than two audio frames"
    );

    /// An empty controller with every track enabled
    pub const fn new() -> Self {
        let () = Self::ROOMY;
        Self {
            ring: ByteRing::new(),
            audio_frames: 0,
            termination_received: false,
            playing: false,
            starting: false,
            starved_logged: false,
            play_silence: false,
            sub_position: 0,
            total_bytes_played: 0,
            current_tag: 0,
            tracks_to_play: TrackMask::all(),
            tracks_in_use: TrackMask::empty(),
        }
    }

    /// Append a keyframe
    ///
    /// Nothing is written unless the whole message fits while leaving one
    /// audio frame of slack. At most `u16::MAX` audio frames are buffered.
    pub fn buffer_key_frame(&mut self, kf: &KeyFrame) -> Result<(), BufferFull> {
        let mut body = [0u8; KeyFrame::MAX_BODY];
        let len = kf.encode(&mut body);
        let audio = KeyFrame::is_audio_class(kf.tag());
        if audio && self.audio_frames == u16::MAX {
            return Err(BufferFull);
        }
        let (mut prod, _) = self.ring.split();
        if prod.free() < MSG_HEADER + len + FRAME_SLACK {
            return Err(BufferFull);
        }
        if !prod.push_message(kf.tag(), &body[..len]) {
            return Err(BufferFull);
        }
        if audio {
            self.audio_frames += 1;
        }
        if matches!(kf, KeyFrame::EndOfAnimation) {
            self.termination_received = true;
        }
        Ok(())
    }

    /// Bytes that may be buffered right now
    pub fn free(&mut self) -> usize {
        let (prod, _) = self.ring.split();
        prod.free().saturating_sub(FRAME_SLACK)
    }

    /// Decide whether audio may be produced this tick
    ///
    /// Before playback starts this requires more than [PREROLL_FRAMES]
    /// audio frames, or a buffered end marker. Once playing, it requires
    /// the frame being played plus at least one more.
    pub fn is_ready_to_play(&mut self) -> bool {
        if !self.playing {
            if self.audio_frames > PREROLL_FRAMES || self.termination_received {
                spine_debug!("playback starting with {} frames", self.audio_frames);
                self.playing = true;
                self.starting = true;
                self.starved_logged = false;
            }
            return self.playing;
        }
        if self.audio_frames > 1 {
            self.starved_logged = false;
            return true;
        }
        if !self.starved_logged {
            spine_warn!("animation buffer starved");
            self.starved_logged = true;
        }
        false
    }

    /// Produce one audio tick of output into `dest`
    ///
    /// Returns true if `dest` holds samples, false for silence.
    pub fn pump_audio_data<A: Actuators>(
        &mut self,
        dest: &mut [u8; AUDIO_BYTES_PER_TICK],
        act: &mut A,
    ) -> bool {
        if !self.is_ready_to_play() {
            return false;
        }
        if self.starting {
            // Apply whatever precedes the first audio frame
            self.starting = false;
            self.update(act);
            if !self.playing {
                return false;
            }
        }

        if self.sub_position == 0 && !self.begin_audio_frame(act) {
            return false;
        }

        let audible = !self.play_silence && self.tracks_to_play.contains(TrackMask::AUDIO);
        if audible {
            let (_, cons) = self.ring.split();
            cons.peek_into(MSG_HEADER + self.sub_position, dest);
            self.tracks_in_use |= TrackMask::AUDIO;
        }
        self.sub_position += AUDIO_BYTES_PER_TICK;

        if self.sub_position >= AUDIO_FRAME_BYTES {
            let len = if self.play_silence { 0 } else { AUDIO_FRAME_BYTES };
            self.consume(MSG_HEADER + len);
            self.audio_frames = self.audio_frames.saturating_sub(1);
            self.sub_position = 0;
            self.play_silence = false;
            self.update(act);
        }
        audible
    }

    /// Position on the next sample or silence frame
    ///
    /// Anything else found here is discarded. Returns false if playback
    /// ended or nothing playable is buffered.
    fn begin_audio_frame<A: Actuators>(&mut self, act: &mut A) -> bool {
        loop {
            let (_, cons) = self.ring.split();
            let Some((t, len)) = cons.peek_message() else {
                return false;
            };
            match t {
                tag::AUDIO_SAMPLE if len == AUDIO_FRAME_BYTES => {
                    self.play_silence = false;
                    return true;
                }
                tag::AUDIO_SILENCE => {
                    self.play_silence = true;
                    return true;
                }
                tag::END_OF_ANIMATION => {
                    self.update(act);
                    return false;
                }
                _ => {
                    spine_warn!("stray message {} at audio frame boundary", t);
                    self.consume(MSG_HEADER + len);
                    if KeyFrame::is_audio_class(t) {
                        self.audio_frames = self.audio_frames.saturating_sub(1);
                    }
                }
            }
        }
    }

    /// Apply every non-audio keyframe up to the next audio frame
    ///
    /// Stops at the next sample or silence frame, leaving it buffered, or
    /// after consuming an end marker, which ends playback.
    pub fn update<A: Actuators>(&mut self, act: &mut A) {
        let mut body = [0u8; KeyFrame::MAX_BODY];
        loop {
            let (_, mut cons) = self.ring.split();
            let Some((t, len)) = cons.peek_message() else {
                return;
            };
            if matches!(t, tag::AUDIO_SAMPLE | tag::AUDIO_SILENCE) {
                return;
            }
            let Some((t, len)) = cons.pop_message(&mut body) else {
                cons.skip_message();
                self.count_played(MSG_HEADER + len);
                continue;
            };
            self.count_played(MSG_HEADER + len);

            if t == tag::END_OF_ANIMATION {
                self.end_animation();
                return;
            }
            match KeyFrame::decode(t, &body[..len]) {
                Ok(kf) => self.apply(&kf, act),
                Err(_) => spine_warn!("undecodable keyframe {}", t),
            }
        }
    }

    fn apply<A: Actuators>(&mut self, kf: &KeyFrame, act: &mut A) {
        let track = TrackMask::for_keyframe(kf);
        if let KeyFrame::StartOfAnimation(t) = kf {
            self.current_tag = *t;
            return;
        }
        if !self.tracks_to_play.contains(track) {
            return;
        }
        match kf {
            KeyFrame::HeadAngle(k) => act.head_angle(k),
            KeyFrame::LiftHeight(k) => act.lift_height(k),
            KeyFrame::BodyMotion(k) => act.body_motion(k),
            KeyFrame::FaceImage(k) => act.face_image(k),
            KeyFrame::FacePosition(k) => act.face_position(k),
            KeyFrame::Blink(k) => act.blink(k),
            KeyFrame::BackpackLights(k) => act.backpack_lights(k),
            _ => return,
        }
        self.tracks_in_use |= track;
    }

    fn end_animation(&mut self) {
        spine_debug!("animation {} finished", self.current_tag);
        self.playing = false;
        self.starting = false;
        self.termination_received = false;
        self.audio_frames = self.audio_frames.saturating_sub(1);
        self.current_tag = 0;
        self.sub_position = 0;
        self.tracks_in_use = TrackMask::empty();
    }

    fn consume(&mut self, n: usize) {
        let (_, mut cons) = self.ring.split();
        cons.consume(n);
        self.count_played(n);
    }

    fn count_played(&mut self, n: usize) {
        self.total_bytes_played = self.total_bytes_played.wrapping_add(n as u32);
    }

    /// Abort the current animation
    ///
    /// Everything buffered is discarded but still counted as played, and
    /// every track the animation was driving is stopped once.
    pub fn clear<A: Actuators>(&mut self, act: &mut A) {
        let unplayed = self.ring.used();
        self.count_played(unplayed);
        self.ring.reset();
        self.audio_frames = 0;
        self.termination_received = false;
        self.playing = false;
        self.starting = false;
        self.starved_logged = false;
        self.play_silence = false;
        self.sub_position = 0;
        self.current_tag = 0;
        for track in self.tracks_in_use.iter() {
            act.stop(track);
        }
        self.tracks_in_use = TrackMask::empty();
    }

    /// Choose which tracks animations may drive
    pub fn set_tracks(&mut self, tracks: TrackMask) {
        self.tracks_to_play = tracks;
    }

    /// Tracks animations may drive
    pub fn tracks_to_play(&self) -> TrackMask {
        self.tracks_to_play
    }

    /// Tracks driven by the current animation
    pub fn tracks_in_use(&self) -> TrackMask {
        self.tracks_in_use
    }

    /// Audio-class frames in the buffer
    pub fn buffered_audio_frames(&self) -> u16 {
        self.audio_frames
    }

    /// Has playback started, even if currently starved?
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Coarse state, without side effects
    pub fn state(&self) -> PlaybackState {
        match (self.playing, self.audio_frames > 1) {
            (true, true) => PlaybackState::Playing,
            (true, false) => PlaybackState::Starved,
            (false, _) if self.ring.used() == 0 => PlaybackState::Idle,
            (false, _) => PlaybackState::PreRolling,
        }
    }

    /// Progress report for the sender
    pub fn animation_state(&self) -> AnimationState {
        AnimationState {
            total_bytes_played: self.total_bytes_played,
            tag: self.current_tag,
            buffered_audio_frames: self.audio_frames,
            tracks_in_use: self.tracks_in_use.bits(),
        }
    }
}

impl<const N: usize> Default for AnimationController<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// An [AnimationController] and its [Actuators], shared between the
/// message handler and the audio tick
///
/// With a `CriticalSectionRawMutex` the audio interrupt is held off for the
/// duration of every access.
pub struct SharedAnimation<R: RawMutex, A: Actuators, const N: usize> {
    inner: Mutex<R, RefCell<(AnimationController<N>, A)>>,
}

impl<R: RawMutex, A: Actuators, const N: usize> SharedAnimation<R, A, N> {
    /// Create a shared controller
    ///
    /// Intended for static usage.
    pub const fn new(act: A) -> Self {
        Self {
            inner: Mutex::new(RefCell::new((AnimationController::new(), act))),
        }
    }

    /// Run `f` with exclusive access to the controller and actuators
    pub fn with<T>(&self, f: impl FnOnce(&mut AnimationController<N>, &mut A) -> T) -> T {
        self.inner.lock(|c| {
            let (ctrl, act) = &mut *c.borrow_mut();
            f(ctrl, act)
        })
    }

    /// See [AnimationController::buffer_key_frame]
    pub fn buffer_key_frame(&self, kf: &KeyFrame) -> Result<(), BufferFull> {
        self.with(|ctrl, _| ctrl.buffer_key_frame(kf))
    }

    /// See [AnimationController::pump_audio_data]
    pub fn pump_audio_data(&self, dest: &mut [u8; AUDIO_BYTES_PER_TICK]) -> bool {
        self.with(|ctrl, act| ctrl.pump_audio_data(dest, act))
    }

    /// See [AnimationController::clear]
    pub fn abort(&self) {
        self.with(|ctrl, act| ctrl.clear(act))
    }

    /// See [AnimationController::set_tracks]
    pub fn set_tracks(&self, tracks: TrackMask) {
        self.with(|ctrl, _| ctrl.set_tracks(tracks))
    }

    /// See [AnimationController::animation_state]
    pub fn animation_state(&self) -> AnimationState {
        self.with(|ctrl, _| ctrl.animation_state())
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    use super::*;

    const BUF: usize = 1024;
    type Anim = AnimationController<BUF>;

    #[derive(Debug, PartialEq)]
    enum Call {
        Head(i16),
        Lift(u8),
        Body(i16),
        Face,
        FacePos(i8, i8),
        Blink,
        Lights,
        Stop(TrackMask),
    }

    #[derive(Default)]
    struct Rec(Vec<Call>);

    impl Actuators for Rec {
        fn head_angle(&mut self, kf: &HeadAngle) {
            self.0.push(Call::Head(kf.angle_cdeg));
        }
        fn lift_height(&mut self, kf: &LiftHeight) {
            self.0.push(Call::Lift(kf.height_mm));
        }
        fn body_motion(&mut self, kf: &BodyMotion) {
            self.0.push(Call::Body(kf.speed_mmps));
        }
        fn face_image(&mut self, _kf: &FaceImage) {
            self.0.push(Call::Face);
        }
        fn face_position(&mut self, kf: &FacePosition) {
            self.0.push(Call::FacePos(kf.x, kf.y));
        }
        fn blink(&mut self, _kf: &Blink) {
            self.0.push(Call::Blink);
        }
        fn backpack_lights(&mut self, _kf: &BackpackLights) {
            self.0.push(Call::Lights);
        }
        fn stop(&mut self, track: TrackMask) {
            self.0.push(Call::Stop(track));
        }
    }

    fn head(angle: i16) -> KeyFrame {
        KeyFrame::HeadAngle(HeadAngle {
            angle_cdeg: angle,
            duration_ms: 100,
        })
    }

    fn body(speed: i16) -> KeyFrame {
        KeyFrame::BodyMotion(BodyMotion {
            speed_mmps: speed,
            curvature_mm: 0,
            duration_ms: 100,
        })
    }

    fn sample(v: u8) -> KeyFrame {
        let mut s = [0u8; AUDIO_FRAME_BYTES];
        s.iter_mut().enumerate().for_each(|(i, b)| *b = v.wrapping_add(i as u8));
        KeyFrame::AudioSample(s)
    }

    const TICKS_PER_FRAME: usize = AUDIO_FRAME_BYTES / AUDIO_BYTES_PER_TICK;

    #[test]
    fn eight_silence_frames_start_playback() {
        let mut a = Anim::new();
        let mut rec = Rec::default();
        for i in 0..8 {
            assert!(!a.is_ready_to_play(), "ready after {} frames", i);
            a.buffer_key_frame(&KeyFrame::AudioSilence).unwrap();
        }
        assert_eq!(a.state(), PlaybackState::PreRolling);
        assert!(a.is_ready_to_play());

        let mut dest = [0u8; AUDIO_BYTES_PER_TICK];
        for _ in 0..TICKS_PER_FRAME * 6 {
            assert!(!a.pump_audio_data(&mut dest, &mut rec));
        }
        assert_eq!(a.buffered_audio_frames(), 2);
        assert!(a.is_playing());
        assert!(rec.0.is_empty());
    }

    #[test]
    fn end_marker_short_circuits_preroll() {
        let mut a = Anim::new();
        let mut rec = Rec::default();
        a.buffer_key_frame(&head(1200)).unwrap();
        a.buffer_key_frame(&sample(3)).unwrap();
        a.buffer_key_frame(&KeyFrame::EndOfAnimation).unwrap();
        assert_eq!(a.buffered_audio_frames(), 2);
        assert!(a.is_ready_to_play());

        let mut dest = [0u8; AUDIO_BYTES_PER_TICK];
        let mut played = Vec::new();
        for _ in 0..TICKS_PER_FRAME {
            assert!(a.pump_audio_data(&mut dest, &mut rec));
            played.extend_from_slice(&dest);
        }
        let KeyFrame::AudioSample(expected) = sample(3) else {
            unreachable!()
        };
        assert_eq!(played, expected);
        assert_eq!(rec.0, [Call::Head(1200)]);
        assert!(!a.is_playing());
        assert_eq!(a.state(), PlaybackState::Idle);
        assert_eq!(a.buffered_audio_frames(), 0);
    }

    #[test]
    fn readiness_is_monotonic_until_the_end_marker() {
        let mut a = Anim::new();
        let mut rec = Rec::default();
        let mut dest = [0u8; AUDIO_BYTES_PER_TICK];
        for _ in 0..=PREROLL_FRAMES {
            a.buffer_key_frame(&sample(0)).unwrap();
        }
        while a.buffered_audio_frames() > 1 {
            assert!(a.pump_audio_data(&mut dest, &mut rec));
        }
        // Starved, but still playing
        assert!(!a.pump_audio_data(&mut dest, &mut rec));
        assert_eq!(a.state(), PlaybackState::Starved);
        assert!(a.is_playing());

        // One more frame resumes without another pre-roll
        a.buffer_key_frame(&sample(0)).unwrap();
        assert!(a.pump_audio_data(&mut dest, &mut rec));
        assert_eq!(a.state(), PlaybackState::Playing);

        a.buffer_key_frame(&KeyFrame::EndOfAnimation).unwrap();
        for _ in 0..TICKS_PER_FRAME * 2 {
            a.pump_audio_data(&mut dest, &mut rec);
        }
        assert!(!a.is_playing());
        assert_eq!(a.state(), PlaybackState::Idle);
    }

    #[test]
    fn disabled_tracks_are_consumed_but_not_applied() {
        let mut a = Anim::new();
        let mut rec = Rec::default();
        a.set_tracks(TrackMask::all() - TrackMask::HEAD);
        a.buffer_key_frame(&KeyFrame::StartOfAnimation(9)).unwrap();
        a.buffer_key_frame(&head(10)).unwrap();
        a.buffer_key_frame(&body(50)).unwrap();
        a.buffer_key_frame(&KeyFrame::AudioSilence).unwrap();
        a.buffer_key_frame(&KeyFrame::EndOfAnimation).unwrap();

        let mut dest = [0u8; AUDIO_BYTES_PER_TICK];
        assert!(!a.pump_audio_data(&mut dest, &mut rec));
        assert_eq!(rec.0, [Call::Body(50)]);
        assert_eq!(a.tracks_in_use(), TrackMask::BODY);
        assert_eq!(a.animation_state().tag, 9);
    }

    #[test]
    fn clear_stops_each_track_in_use_once() {
        let mut a = Anim::new();
        let mut rec = Rec::default();
        a.buffer_key_frame(&head(10)).unwrap();
        a.buffer_key_frame(&body(50)).unwrap();
        a.buffer_key_frame(&head(20)).unwrap();
        for _ in 0..PREROLL_FRAMES + 1 {
            a.buffer_key_frame(&sample(1)).unwrap();
        }
        let mut dest = [0u8; AUDIO_BYTES_PER_TICK];
        assert!(a.pump_audio_data(&mut dest, &mut rec));
        assert_eq!(a.tracks_in_use(), TrackMask::HEAD | TrackMask::BODY | TrackMask::AUDIO);

        let played_before = a.animation_state().total_bytes_played;
        let buffered = a.ring.used() as u32;
        rec.0.clear();
        a.clear(&mut rec);

        assert_eq!(
            rec.0,
            [
                Call::Stop(TrackMask::HEAD),
                Call::Stop(TrackMask::BODY),
                Call::Stop(TrackMask::AUDIO)
            ]
        );
        assert_eq!(a.tracks_in_use(), TrackMask::empty());
        assert_eq!(a.state(), PlaybackState::Idle);
        assert_eq!(
            a.animation_state().total_bytes_played,
            played_before + buffered
        );

        rec.0.clear();
        a.clear(&mut rec);
        assert!(rec.0.is_empty());
    }

    #[test]
    fn malformed_audio_frame_is_dropped_at_the_boundary() {
        let mut a = Anim::new();
        let mut rec = Rec::default();
        for _ in 0..4 {
            a.buffer_key_frame(&KeyFrame::AudioSilence).unwrap();
        }
        let (mut p, _) = a.ring.split();
        assert!(p.push_message(tag::AUDIO_SAMPLE, &[1, 2]));
        a.audio_frames += 1;
        for _ in 0..4 {
            a.buffer_key_frame(&KeyFrame::AudioSilence).unwrap();
        }

        let mut dest = [0u8; AUDIO_BYTES_PER_TICK];
        for _ in 0..100 {
            assert!(!a.pump_audio_data(&mut dest, &mut rec));
        }
        assert_eq!(a.buffered_audio_frames(), 1);
        assert_eq!(a.ring.used(), MSG_HEADER);
        assert_eq!(a.state(), PlaybackState::Starved);
        assert!(rec.0.is_empty());
    }

    #[test]
    fn audio_frame_count_never_wraps() {
        let mut a = AnimationController::<{ 1 << 18 }>::new();
        let mut n = 0u32;
        while a.buffer_key_frame(&KeyFrame::AudioSilence).is_ok() {
            n += 1;
        }
        assert_eq!(n, u32::from(u16::MAX));
        assert_eq!(a.buffered_audio_frames(), u16::MAX);
        assert!(a.ring.used() < 1 << 17);
    }

    #[test]
    fn full_buffer_rejects_without_partial_writes() {
        let mut a = AnimationController::<256>::new();
        let mut n = 0;
        while a.buffer_key_frame(&sample(0)).is_ok() {
            n += 1;
        }
        assert_eq!(n, 2);
        let used = a.ring.used();
        assert_eq!(a.buffer_key_frame(&sample(0)), Err(BufferFull));
        assert_eq!(a.ring.used(), used);
        assert_eq!(a.buffered_audio_frames(), 2);
        assert!(a.buffer_key_frame(&head(1)).is_ok());
    }

    #[test]
    fn state_report_roundtrips() {
        let st = AnimationState {
            total_bytes_played: 0x0102_0304,
            tag: 7,
            buffered_audio_frames: 300,
            tracks_in_use: 0x81,
        };
        assert_eq!(AnimationState::from_bytes(&st.to_bytes()), Some(st));
        assert_eq!(AnimationState::from_bytes(&[0; 3]), None);
    }

    #[test]
    fn shared_controller() {
        static SHARED: SharedAnimation<CriticalSectionRawMutex, NoActuators, BUF> =
            SharedAnimation::new(NoActuators);
        SHARED.buffer_key_frame(&KeyFrame::AudioSilence).unwrap();
        assert_eq!(SHARED.animation_state().buffered_audio_frames, 1);
        SHARED.abort();
        assert_eq!(SHARED.with(|a, _| a.state()), PlaybackState::Idle);
    }

    struct NoActuators;

    impl Actuators for NoActuators {
        fn head_angle(&mut self, _kf: &HeadAngle) {}
        fn lift_height(&mut self, _kf: &LiftHeight) {}
        fn body_motion(&mut self, _kf: &BodyMotion) {}
        fn face_image(&mut self, _kf: &FaceImage) {}
        fn face_position(&mut self, _kf: &FacePosition) {}
        fn blink(&mut self, _kf: &Blink) {}
        fn backpack_lights(&mut self, _kf: &BackpackLights) {}
        fn stop(&mut self, _track: TrackMask) {}
    }
}
