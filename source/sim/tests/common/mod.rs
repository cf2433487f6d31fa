#![allow(dead_code)]

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use robot_spine::{anim::SharedAnimation, nv::FlashHal, Clock, RtipNode};
use robot_spine_sim::{run_pair, ManualClock, RecordingActuators, SimLayout, SimWire, WifiSide};

pub const OUT: usize = 512;
pub const RELAY: usize = 256;
pub const ANIM: usize = 2048;

pub type Anim = SharedAnimation<CriticalSectionRawMutex, RecordingActuators, ANIM>;
pub type Node<'a> =
    RtipNode<'a, CriticalSectionRawMutex, RecordingActuators, SimLayout, OUT, RELAY, ANIM>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Advance time by one millisecond and exchange one drop each way
pub fn tick<F: FlashHal, const N: usize>(
    rtip: &mut Node<'_>,
    wifi: &mut WifiSide<'_, N>,
    wires: &mut (SimWire, SimWire),
    flash: &mut F,
    clock: &ManualClock,
) {
    clock.advance(Duration::from_millis(1));
    let now = clock.now();
    let (a, b) = run_pair(
        rtip.step(&mut wires.0, flash, now),
        wifi.step(&mut wires.1, now),
    );
    a.unwrap();
    b.unwrap();
}

/// Tick until `done` holds
pub fn tick_until<F: FlashHal, const N: usize>(
    rtip: &mut Node<'_>,
    wifi: &mut WifiSide<'_, N>,
    wires: &mut (SimWire, SimWire),
    flash: &mut F,
    clock: &ManualClock,
    mut done: impl FnMut(&mut Node<'_>, &mut WifiSide<'_, N>) -> bool,
) {
    for _ in 0..10_000 {
        if done(rtip, wifi) {
            return;
        }
        tick(rtip, wifi, wires, flash, clock);
    }
    panic!("condition never reached");
}
