use embassy_sync::waitqueue::AtomicWaker;
use rand_core::RngCore;
use robot_spine::{
    nv::NvStorage,
    protocol::tag,
    ring::{ByteRing, Consumer},
};
use robot_spine_sim::{
    get_rand, sim_flash, wire, ManualClock, RecordingActuators, SimLayout, WifiSide,
};

mod common;
use common::{init_logging, tick, tick_until, Anim, Node, RELAY};

fn drain(relay: &mut Consumer<'_, RELAY>, into: &mut Vec<(u8, Vec<u8>)>) {
    let mut buf = [0u8; 128];
    while let Some((t, len)) = relay.pop_message(&mut buf) {
        into.push((t, buf[..len].to_vec()));
    }
}

#[test]
fn relayed_messages_arrive_in_order() {
    init_logging();
    let clock = ManualClock::new();
    let anim = Anim::new(RecordingActuators::new());
    let mut flash = sim_flash();
    let storage = NvStorage::<SimLayout>::mount(&mut flash).unwrap();
    let mut up = ByteRing::<512>::new();
    let mut down = ByteRing::<512>::new();
    let mut relay = ByteRing::<RELAY>::new();
    let (up_space, down_space) = (AtomicWaker::new(), AtomicWaker::new());
    let (rp, mut rc) = relay.split();
    let mut rtip = Node::new(&anim, storage, up.split(), &up_space, rp);
    let mut wifi = WifiSide::new(down.split(), &down_space, None);
    let mut wires = wire();
    let mut rng = get_rand(11);

    const COUNT: usize = 300;
    let mut sent = Vec::new();
    let mut received = Vec::new();
    let mut ticks = 0;
    while received.len() < COUNT {
        while sent.len() < COUNT {
            let t = (rng.next_u32() % 0x3F) as u8 + 1;
            let len = (rng.next_u32() % 61) as usize;
            if !wifi.sender().has_room_for(len) {
                break;
            }
            let body: Vec<u8> = (0..len).map(|_| rng.next_u32() as u8).collect();
            wifi.sender().try_enqueue(t, &body).unwrap();
            sent.push((t, body));
        }
        tick(&mut rtip, &mut wifi, &mut wires, &mut flash, &clock);
        drain(&mut rc, &mut received);
        ticks += 1;
        assert!(ticks < 5_000, "relay stalled");
    }

    assert_eq!(received, sent);
    let stats = rtip.stats();
    assert_eq!(stats.missed, 0);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.rx_overflow, 0);
    assert_eq!(wifi.stats().missed, 0);
    assert_eq!(wifi.sender().overflow_count(), 0);
}

#[test]
fn rtip_messages_reach_the_wifi_side() {
    init_logging();
    let clock = ManualClock::new();
    let anim = Anim::new(RecordingActuators::new());
    let mut flash = sim_flash();
    let storage = NvStorage::<SimLayout>::mount(&mut flash).unwrap();
    let mut up = ByteRing::<512>::new();
    let mut down = ByteRing::<512>::new();
    let mut relay = ByteRing::<RELAY>::new();
    let (up_space, down_space) = (AtomicWaker::new(), AtomicWaker::new());
    let (rp, _rc) = relay.split();
    let mut rtip = Node::new(&anim, storage, up.split(), &up_space, rp);
    let mut wifi = WifiSide::new(down.split(), &down_space, None);
    let mut wires = wire();

    let sent: Vec<(u8, Vec<u8>)> = (0..12u8)
        .map(|i| (0x10 + i, vec![i; 5 * i as usize]))
        .collect();
    for (t, body) in &sent {
        rtip.sender().try_enqueue(*t, body).unwrap();
    }
    tick_until(&mut rtip, &mut wifi, &mut wires, &mut flash, &clock, |_, w| {
        w.inbox().relayed.len() == sent.len()
    });
    // The idle progress report was queued behind them
    for _ in 0..3 {
        tick(&mut rtip, &mut wifi, &mut wires, &mut flash, &clock);
    }

    assert_eq!(wifi.inbox().relayed, sent);
    assert_eq!(wifi.inbox().states.len(), 1);
    assert_eq!(wifi.stats().dropped, 0);
}

#[test]
fn realtime_messages_pass_through() {
    init_logging();
    let clock = ManualClock::new();
    let anim = Anim::new(RecordingActuators::new());
    let mut flash = sim_flash();
    let storage = NvStorage::<SimLayout>::mount(&mut flash).unwrap();
    let mut up = ByteRing::<512>::new();
    let mut down = ByteRing::<512>::new();
    let mut relay = ByteRing::<RELAY>::new();
    let (up_space, down_space) = (AtomicWaker::new(), AtomicWaker::new());
    let (rp, mut rc) = relay.split();
    let mut rtip = Node::new(&anim, storage, up.split(), &up_space, rp);
    let mut wifi = WifiSide::new(down.split(), &down_space, None);
    let mut wires = wire();

    wifi.sender().try_enqueue(0x81, &[1, 2, 3, 4]).unwrap();
    rtip.sender().try_enqueue(0x8F, &[7]).unwrap();
    tick_until(&mut rtip, &mut wifi, &mut wires, &mut flash, &clock, |r, w| {
        r.realtime_count() == 1 && !w.inbox().realtime.is_empty()
    });

    let mut got = Vec::new();
    drain(&mut rc, &mut got);
    assert_eq!(got, [(0x81, vec![1, 2, 3, 4])]);
    assert_eq!(wifi.inbox().realtime, [(0x8F, vec![7])]);
    assert!(anim.with(|_, act| act.applied.is_empty()));
}

#[test]
fn malformed_message_costs_only_itself() {
    init_logging();
    let clock = ManualClock::new();
    let anim = Anim::new(RecordingActuators::new());
    let mut flash = sim_flash();
    let storage = NvStorage::<SimLayout>::mount(&mut flash).unwrap();
    let mut up = ByteRing::<512>::new();
    let mut down = ByteRing::<512>::new();
    let mut relay = ByteRing::<RELAY>::new();
    let (up_space, down_space) = (AtomicWaker::new(), AtomicWaker::new());
    let (rp, mut rc) = relay.split();
    let mut rtip = Node::new(&anim, storage, up.split(), &up_space, rp);
    let mut wifi = WifiSide::new(down.split(), &down_space, None);
    let mut wires = wire();

    // Wrong size for a head angle, then an unknown local tag, both in the
    // same drop as a good relay message
    wifi.sender().try_enqueue(tag::HEAD_ANGLE, &[1, 2, 3]).unwrap();
    wifi.sender().try_enqueue(0x7E, &[]).unwrap();
    wifi.sender().try_enqueue(0x20, &[5, 6]).unwrap();
    tick(&mut rtip, &mut wifi, &mut wires, &mut flash, &clock);

    let mut got = Vec::new();
    drain(&mut rc, &mut got);
    assert_eq!(got, [(0x20, vec![5, 6])]);
    assert_eq!(rtip.stats().dropped, 2);
    assert!(anim.with(|_, act| act.applied.is_empty()));
}
