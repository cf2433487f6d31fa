//! Message tags and keyframe encodings
//!
//! Every message carried by the drop transport starts with a one byte tag.
//! The tag space is split into ranges, which decide where a message goes
//! once it arrives:
//!
//! | Range          | Meaning                                          |
//! | -------------- | ------------------------------------------------ |
//! | `0x00`         | Already handled, never written to a ring          |
//! | `0x01..0x40`   | Relayed unmodified to the next hop (body board)  |
//! | `0x40..=0x7F`  | Local: parsed and processed on this processor    |
//! | `0x80..=0x8F`  | Real-time pass-through                           |
//! | anything else  | Unexpected, logged and dropped                   |
//!
//! Local messages with a fixed encoding must arrive with exactly their
//! expected size. All multi-byte fields are little endian.

/// Tag values
pub mod tag {
    /// Reserved: the message was already handled, nothing is queued
    pub const HANDLED: u8 = 0x00;
    /// First tag processed locally, everything below is relayed
    pub const LOCAL_START: u8 = 0x40;
    /// Last tag processed locally
    pub const LOCAL_END: u8 = 0x7F;
    /// First real-time pass-through tag
    pub const REALTIME_START: u8 = 0x80;
    /// Last real-time pass-through tag
    pub const REALTIME_END: u8 = 0x8F;

    /// Keyframe: one audio frame of samples
    pub const AUDIO_SAMPLE: u8 = 0x40;
    /// Keyframe: one audio frame of silence
    pub const AUDIO_SILENCE: u8 = 0x41;
    /// Keyframe: head angle
    pub const HEAD_ANGLE: u8 = 0x42;
    /// Keyframe: lift height
    pub const LIFT_HEIGHT: u8 = 0x43;
    /// Keyframe: body motion
    pub const BODY_MOTION: u8 = 0x44;
    /// Keyframe: face image
    pub const FACE_IMAGE: u8 = 0x45;
    /// Keyframe: face position
    pub const FACE_POSITION: u8 = 0x46;
    /// Keyframe: blink
    pub const BLINK: u8 = 0x47;
    /// Keyframe: backpack lights
    pub const BACKPACK_LIGHTS: u8 = 0x48;
    /// Keyframe: start of animation marker
    pub const START_OF_ANIMATION: u8 = 0x49;
    /// Keyframe: end of animation marker
    pub const END_OF_ANIMATION: u8 = 0x4A;
    /// Abort and clear the current animation
    pub const ABORT_ANIMATION: u8 = 0x4B;
    /// Set the mask of tracks animations may drive
    pub const SET_TRACKS: u8 = 0x4C;
    /// NV storage request, engine to robot
    pub const NV_REQUEST: u8 = 0x50;
    /// NV storage reply, robot to engine
    pub const NV_REPLY: u8 = 0x51;
    /// Animation state report, robot to engine
    pub const ANIM_STATE: u8 = 0x52;
}

/// Bytes of audio carried by one audio sample keyframe
pub const AUDIO_FRAME_BYTES: usize = 80;

/// Bytes of audio handed to the audio output per audio tick
pub const AUDIO_BYTES_PER_TICK: usize = 20;

/// Bytes of face image data carried by one face image keyframe
pub const FACE_IMAGE_BYTES: usize = 64;

/// Number of backpack lights
pub const BACKPACK_LIGHT_COUNT: usize = 5;

/// Where a tag is routed on arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// The reserved "already handled" tag
    Handled,
    /// Relay to the next hop
    Relay,
    /// Process locally
    Local,
    /// Real-time pass-through
    RealTime,
    /// Not a known tag range
    Unexpected,
}

/// Classify a tag by range
pub const fn classify(tag: u8) -> TagClass {
    match tag {
        tag::HANDLED => TagClass::Handled,
        t if t < tag::LOCAL_START => TagClass::Relay,
        t if t <= tag::LOCAL_END => TagClass::Local,
        t if t >= tag::REALTIME_START && t <= tag::REALTIME_END => TagClass::RealTime,
        _ => TagClass::Unexpected,
    }
}

/// Expected body size of a local message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    /// The body must be exactly this many bytes
    Fixed(usize),
    /// The body may be up to this many bytes
    Variable(usize),
}

impl BodySize {
    /// Does a body of `len` bytes satisfy this size?
    pub const fn accepts(self, len: usize) -> bool {
        match self {
            BodySize::Fixed(n) => len == n,
            BodySize::Variable(max) => len <= max,
        }
    }
}

/// Expected body size of each known local tag, None for unknown tags
pub const fn local_body_size(t: u8) -> Option<BodySize> {
    use BodySize::*;
    Some(match t {
        tag::AUDIO_SAMPLE => Fixed(AUDIO_FRAME_BYTES),
        tag::AUDIO_SILENCE => Fixed(0),
        tag::HEAD_ANGLE => Fixed(HeadAngle::SIZE),
        tag::LIFT_HEIGHT => Fixed(LiftHeight::SIZE),
        tag::BODY_MOTION => Fixed(BodyMotion::SIZE),
        tag::FACE_IMAGE => Fixed(FACE_IMAGE_BYTES),
        tag::FACE_POSITION => Fixed(FacePosition::SIZE),
        tag::BLINK => Fixed(Blink::SIZE),
        tag::BACKPACK_LIGHTS => Fixed(BackpackLights::SIZE),
        tag::START_OF_ANIMATION => Fixed(1),
        tag::END_OF_ANIMATION => Fixed(0),
        tag::ABORT_ANIMATION => Fixed(0),
        tag::SET_TRACKS => Fixed(1),
        tag::NV_REQUEST | tag::NV_REPLY | tag::ANIM_STATE => Variable(crate::ring::MAX_MSG_BODY),
        _ => return None,
    })
}

/// A keyframe body could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The tag is not a keyframe
    NotKeyFrame(u8),
    /// The body size does not match the tag's fixed size
    SizeMismatch {
        /// Size required by the tag
        expected: usize,
        /// Size received
        got: usize,
    },
}

/// Head angle keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadAngle {
    /// Target angle in hundredths of a degree
    pub angle_cdeg: i16,
    /// Time to reach the target
    pub duration_ms: u16,
}

/// Lift height keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiftHeight {
    /// Target height in millimeters
    pub height_mm: u8,
    /// Time to reach the target
    pub duration_ms: u16,
}

/// Body motion keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyMotion {
    /// Wheel speed in mm/s
    pub speed_mmps: i16,
    /// Turn radius in mm, zero for straight
    pub curvature_mm: i16,
    /// How long to drive
    pub duration_ms: u16,
}

/// Face image keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceImage {
    /// Run-length encoded face image
    pub data: [u8; FACE_IMAGE_BYTES],
}

/// Face position keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacePosition {
    /// Horizontal offset in pixels
    pub x: i8,
    /// Vertical offset in pixels
    pub y: i8,
}

/// Blink keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blink {
    /// Blink immediately
    pub blink_now: bool,
    /// Allow procedural blinking afterwards
    pub enable: bool,
}

/// Backpack lights keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpackLights {
    /// RGB565 color of each light
    pub colors: [u16; BACKPACK_LIGHT_COUNT],
}

impl HeadAngle {
    const SIZE: usize = 4;
}

impl LiftHeight {
    const SIZE: usize = 3;
}

impl BodyMotion {
    const SIZE: usize = 6;
}

impl FacePosition {
    const SIZE: usize = 2;
}

impl Blink {
    const SIZE: usize = 2;
}

impl BackpackLights {
    const SIZE: usize = 2 * BACKPACK_LIGHT_COUNT;
}

/// One animation keyframe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFrame {
    /// One audio frame worth of samples
    AudioSample([u8; AUDIO_FRAME_BYTES]),
    /// One audio frame worth of silence
    AudioSilence,
    /// Move the head
    HeadAngle(HeadAngle),
    /// Move the lift
    LiftHeight(LiftHeight),
    /// Drive the wheels
    BodyMotion(BodyMotion),
    /// Draw a face image
    FaceImage(FaceImage),
    /// Shift the face
    FacePosition(FacePosition),
    /// Blink
    Blink(Blink),
    /// Set the backpack lights
    BackpackLights(BackpackLights),
    /// Start of an animation, with its identifying tag
    StartOfAnimation(u8),
    /// End of the current animation
    EndOfAnimation,
}

fn i16_at(b: &[u8], i: usize) -> i16 {
    i16::from_le_bytes([b[i], b[i + 1]])
}

fn u16_at(b: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([b[i], b[i + 1]])
}

impl KeyFrame {
    /// Largest encoded keyframe body
    pub const MAX_BODY: usize = AUDIO_FRAME_BYTES;

    /// The wire tag of this keyframe
    pub fn tag(&self) -> u8 {
        match self {
            KeyFrame::AudioSample(_) => tag::AUDIO_SAMPLE,
            KeyFrame::AudioSilence => tag::AUDIO_SILENCE,
            KeyFrame::HeadAngle(_) => tag::HEAD_ANGLE,
            KeyFrame::LiftHeight(_) => tag::LIFT_HEIGHT,
            KeyFrame::BodyMotion(_) => tag::BODY_MOTION,
            KeyFrame::FaceImage(_) => tag::FACE_IMAGE,
            KeyFrame::FacePosition(_) => tag::FACE_POSITION,
            KeyFrame::Blink(_) => tag::BLINK,
            KeyFrame::BackpackLights(_) => tag::BACKPACK_LIGHTS,
            KeyFrame::StartOfAnimation(_) => tag::START_OF_ANIMATION,
            KeyFrame::EndOfAnimation => tag::END_OF_ANIMATION,
        }
    }

    /// Is `tag` one of the keyframes that paces a playback tick?
    pub const fn is_audio_class(tag: u8) -> bool {
        matches!(
            tag,
            tag::AUDIO_SAMPLE | tag::AUDIO_SILENCE | tag::END_OF_ANIMATION
        )
    }

    /// Is `tag` any keyframe?
    pub const fn is_keyframe(tag: u8) -> bool {
        tag >= tag::AUDIO_SAMPLE && tag <= tag::END_OF_ANIMATION
    }

    /// Encode the body into `out`, returning the encoded length
    ///
    /// `out` must hold at least [KeyFrame::MAX_BODY] bytes.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        match self {
            KeyFrame::AudioSample(s) => {
                out[..AUDIO_FRAME_BYTES].copy_from_slice(s);
                AUDIO_FRAME_BYTES
            }
            KeyFrame::AudioSilence | KeyFrame::EndOfAnimation => 0,
            KeyFrame::HeadAngle(h) => {
                out[0..2].copy_from_slice(&h.angle_cdeg.to_le_bytes());
                out[2..4].copy_from_slice(&h.duration_ms.to_le_bytes());
                HeadAngle::SIZE
            }
            KeyFrame::LiftHeight(l) => {
                out[0] = l.height_mm;
                out[1..3].copy_from_slice(&l.duration_ms.to_le_bytes());
                LiftHeight::SIZE
            }
            KeyFrame::BodyMotion(m) => {
                out[0..2].copy_from_slice(&m.speed_mmps.to_le_bytes());
                out[2..4].copy_from_slice(&m.curvature_mm.to_le_bytes());
                out[4..6].copy_from_slice(&m.duration_ms.to_le_bytes());
                BodyMotion::SIZE
            }
            KeyFrame::FaceImage(f) => {
                out[..FACE_IMAGE_BYTES].copy_from_slice(&f.data);
                FACE_IMAGE_BYTES
            }
            KeyFrame::FacePosition(p) => {
                out[0] = p.x as u8;
                out[1] = p.y as u8;
                FacePosition::SIZE
            }
            KeyFrame::Blink(b) => {
                out[0] = b.blink_now as u8;
                out[1] = b.enable as u8;
                Blink::SIZE
            }
            KeyFrame::BackpackLights(l) => {
                out.chunks_exact_mut(2)
                    .zip(l.colors.iter())
                    .for_each(|(o, c)| o.copy_from_slice(&c.to_le_bytes()));
                BackpackLights::SIZE
            }
            KeyFrame::StartOfAnimation(t) => {
                out[0] = *t;
                1
            }
        }
    }

    /// Decode a keyframe body received with `tag`
    pub fn decode(t: u8, body: &[u8]) -> Result<Self, DecodeError> {
        if !Self::is_keyframe(t) {
            return Err(DecodeError::NotKeyFrame(t));
        }
        if let Some(BodySize::Fixed(expected)) = local_body_size(t) {
            if body.len() != expected {
                return Err(DecodeError::SizeMismatch {
                    expected,
                    got: body.len(),
                });
            }
        }
        let b = body;
        Ok(match t {
            tag::AUDIO_SAMPLE => {
                let mut s = [0u8; AUDIO_FRAME_BYTES];
                s.copy_from_slice(b);
                KeyFrame::AudioSample(s)
            }
            tag::AUDIO_SILENCE => KeyFrame::AudioSilence,
            tag::HEAD_ANGLE => KeyFrame::HeadAngle(HeadAngle {
                angle_cdeg: i16_at(b, 0),
                duration_ms: u16_at(b, 2),
            }),
            tag::LIFT_HEIGHT => KeyFrame::LiftHeight(LiftHeight {
                height_mm: b[0],
                duration_ms: u16_at(b, 1),
            }),
            tag::BODY_MOTION => KeyFrame::BodyMotion(BodyMotion {
                speed_mmps: i16_at(b, 0),
                curvature_mm: i16_at(b, 2),
                duration_ms: u16_at(b, 4),
            }),
            tag::FACE_IMAGE => {
                let mut data = [0u8; FACE_IMAGE_BYTES];
                data.copy_from_slice(b);
                KeyFrame::FaceImage(FaceImage { data })
            }
            tag::FACE_POSITION => KeyFrame::FacePosition(FacePosition {
                x: b[0] as i8,
                y: b[1] as i8,
            }),
            tag::BLINK => KeyFrame::Blink(Blink {
                blink_now: b[0] != 0,
                enable: b[1] != 0,
            }),
            tag::BACKPACK_LIGHTS => {
                let mut colors = [0u16; BACKPACK_LIGHT_COUNT];
                colors
                    .iter_mut()
                    .enumerate()
                    .for_each(|(i, c)| *c = u16_at(b, 2 * i));
                KeyFrame::BackpackLights(BackpackLights { colors })
            }
            tag::START_OF_ANIMATION => KeyFrame::StartOfAnimation(b[0]),
            _ => KeyFrame::EndOfAnimation,
        })
    }
}
