//! # Robot Spine
//!
//! This is the inter-processor "spine" of a small robot with three
//! processors: a WiFi co-processor talking to the engine that runs the
//! behaviors, a real-time processor (the RTIP) and a body board driving the
//! motors. It contains the three parts of the firmware that have to be
//! exactly right:
//!
//! * the drop transport between processors
//! * log-structured, non-volatile storage on raw NOR flash
//! * buffered, audio-paced animation playback
//!
//! Everything is `no_std`, allocation free, and never blocks: all work is
//! driven by a fixed-rate hardware tick with a budget of a few
//! microseconds.
//!
//! ## Drops
//!
//! The WiFi processor and the RTIP exchange one fixed-size frame, a "drop",
//! in each direction per hardware tick, over a synchronous full duplex
//! link. The two directions use different sizes, see [drop].
//!
//! Drops carry a stream of length-prefixed, tagged messages:
//!
//! ```text
//! [len][tag][body...][len][tag][body...][0 padding...][trailer]
//! ```
//!
//! Messages are queued by senders into single-producer, single-consumer
//! byte rings ([ring]) and drained into drops by the tick ([transport]).
//! On the receiving side every message is routed by its tag:
//!
//! 1. Tags below the local range are relayed to the next hop unmodified
//! 2. Tags in the local range are checked against their expected size and
//!    handled locally
//! 3. Tags in the small real-time range are passed through
//! 4. Anything else is logged and dropped
//!
//! A malformed message only ever costs itself, never the rest of the drop.
//!
//! ## Storage
//!
//! Tagged blobs are appended to a log in one of two flash segments. An
//! entry is superseded by patching its successor pointer, and reclaimed
//! only when garbage collection compacts the live entries into the other
//! segment and bumps the journal number. See [nv].
//!
//! Every storage operation is a state machine advanced by one flash
//! primitive per tick. The [NvStorage](nv::NvStorage) queue accepts one
//! command at a time and bounds how long any command may run.
//!
//! ## Animation
//!
//! Keyframes stream in ahead of time and are buffered until enough audio
//! is queued to play without gaps. The audio output tick then paces
//! playback, applying the motion keyframes between audio frames. See
//! [anim].
//!
//! ## Roles
//!
//! The [node] module ties the transport, storage and animation together
//! for the RTIP. The WiFi side uses the same [transport] building blocks
//! with a [QueueEstimate](transport::QueueEstimate) to avoid overrunning
//! the RTIP.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod anim;
pub mod drop;
#[cfg(feature = "postcard-helpers")]
pub mod node;
pub mod nv;
pub mod protocol;
pub mod ring;
pub mod transport;
#[cfg(feature = "postcard-helpers")]
pub mod wirehelp;

use embassy_time::Instant;

#[cfg(feature = "postcard-helpers")]
pub use crate::node::RtipNode;

/// An error type for the [`DropLink`](transport::DropLink) trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying link hardware
    Link(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Link(value)
    }
}

/// A source of the current time
///
/// Time is always passed into the state machines explicitly. Platforms
/// read their timer here, tests advance a manual clock.
pub trait Clock {
    /// The current time
    fn now(&self) -> Instant;
}
