//! Two engines wired back to back through an in-memory line

use pktlink::timer::Granularity;
use pktlink::{ChannelId, LinkConfig, LinkEngine, LinkEvent, Role};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ROUNDS: usize = 5000;

fn config(role: Role) -> LinkConfig {
    LinkConfig {
        role,
        rotation_ticks: 3,
        retransmit_retries: 50,
        ..LinkConfig::default()
    }
}

fn is_data(frame: &[u8]) -> bool {
    frame.len() > 2 && frame[2] & 0x10 == 0
}

struct Pair {
    dte: LinkEngine,
    dce: LinkEngine,
    /// Payloads delivered on each side, tagged with their channel
    at_dte: Vec<(u8, Vec<u8>)>,
    at_dce: Vec<(u8, Vec<u8>)>,
}

impl Pair {
    fn new() -> Self {
        let mut pair = Pair {
            dte: LinkEngine::new(config(Role::Dte)).unwrap(),
            dce: LinkEngine::new(config(Role::Dce)).unwrap(),
            at_dte: Vec::new(),
            at_dce: Vec::new(),
        };
        pair.dte.start();
        pair.dce.start();
        pair.settle(|_| false);
        assert!(pair.dte.is_ready());
        assert!(pair.dce.is_ready());
        pair
    }

    /// Moves every staged frame from one engine to the other
    fn pump(from: &mut LinkEngine, to: &mut LinkEngine, lose: &mut impl FnMut(&[u8]) -> bool) -> usize {
        from.poll_output().unwrap();
        let mut moved = 0;
        while let Some((slot, bytes)) = from.take_transmit() {
            if !lose(&bytes) {
                to.receive_bytes(&bytes);
            }
            from.transmit_complete(slot).unwrap();
            moved += 1;
        }
        moved
    }

    fn drain(engine: &mut LinkEngine, into: &mut Vec<(u8, Vec<u8>)>) {
        while engine.poll_event().is_some() {}
        for id in ChannelId::sessions() {
            while let Some(frame) = engine.deliver(id) {
                into.push((id.number(), frame.data.to_vec()));
            }
        }
    }

    fn busy(&self) -> bool {
        [&self.dte, &self.dce].iter().any(|engine| {
            ChannelId::all().any(|id| {
                let ch = engine.channel(id);
                ch.unacked_len() > 0 || ch.pending_len() > 0 || ch.control_len() > 0
            })
        })
    }

    /// Runs the line until both sides are idle, ticking every timer list
    /// whenever a round moves nothing
    fn settle(&mut self, mut lose: impl FnMut(&[u8]) -> bool) {
        for _ in 0..MAX_ROUNDS {
            let moved = Self::pump(&mut self.dte, &mut self.dce, &mut lose)
                + Self::pump(&mut self.dce, &mut self.dte, &mut lose);
            Self::drain(&mut self.dte, &mut self.at_dte);
            Self::drain(&mut self.dce, &mut self.at_dce);

            for engine in [&self.dte, &self.dce] {
                for id in ChannelId::all() {
                    assert!(engine.channel(id).unacked_len() <= engine.config().window_size as usize);
                }
            }

            if moved == 0 {
                if !self.busy() {
                    return;
                }
                for granularity in Granularity::ALL {
                    self.dte.tick(granularity);
                    self.dce.tick(granularity);
                }
            }
        }
        panic!("link did not settle");
    }
}

fn payloads(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| format!("{}-{}", prefix, i).into_bytes()).collect()
}

#[test]
fn test_handshake_reports_restart_on_both_sides() {
    let mut dte = LinkEngine::new(config(Role::Dte)).unwrap();
    let mut dce = LinkEngine::new(config(Role::Dce)).unwrap();
    dte.start();
    dce.start();
    assert!(!dte.is_ready());

    let mut keep = |_: &[u8]| false;
    Pair::pump(&mut dte, &mut dce, &mut keep);
    assert!(dce.is_ready());
    Pair::pump(&mut dce, &mut dte, &mut keep);
    assert!(dte.is_ready());

    assert!(matches!(dte.poll_event(), Some(LinkEvent::Restarted { .. })));
    assert!(matches!(dce.poll_event(), Some(LinkEvent::Restarted { .. })));
}

#[test]
fn test_restart_retry_queued_at_confirm_never_reaches_peer() {
    let mut dte = LinkEngine::new(LinkConfig { restart_ticks: 1, ..config(Role::Dte) }).unwrap();
    let mut dce = LinkEngine::new(config(Role::Dce)).unwrap();
    dte.start();
    dce.start();

    let mut keep = |_: &[u8]| false;
    Pair::pump(&mut dte, &mut dce, &mut keep);
    dte.tick(Granularity::Coarse);
    Pair::pump(&mut dce, &mut dte, &mut keep);
    assert!(dte.is_ready());
    assert_eq!(Pair::pump(&mut dte, &mut dce, &mut keep), 0);

    let events: Vec<_> = std::iter::from_fn(|| dce.poll_event()).collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], LinkEvent::Restarted { .. }));
    assert!(dte.poll_event().is_some());
    assert!(dte.poll_event().is_none());
    dce.submit(ChannelId::new(1).unwrap(), false, 0x00, b"after").unwrap();
}

#[test]
fn test_reset_retry_queued_at_confirm_never_reaches_peer() {
    let mut pair = Pair::new();
    let one = ChannelId::new(1).unwrap();
    pair.dte.reset_channel(one, pktlink::Cause::DteOriginated).unwrap();

    let mut keep = |_: &[u8]| false;
    Pair::pump(&mut pair.dte, &mut pair.dce, &mut keep);
    for _ in 0..pair.dte.config().reset_ticks {
        pair.dte.tick(Granularity::Coarse);
    }
    assert_eq!(pair.dte.channel(one).control_len(), 1);

    pair.dce.submit(one, false, 0x00, b"reply").unwrap();
    Pair::pump(&mut pair.dce, &mut pair.dte, &mut keep);
    Pair::pump(&mut pair.dte, &mut pair.dce, &mut keep);

    let resets = std::iter::from_fn(|| pair.dce.poll_event())
        .filter(|e| matches!(e, LinkEvent::ChannelReset { .. }))
        .count();
    assert_eq!(resets, 1);
    assert_eq!(pair.dce.channel(one).unacked_len() + pair.dce.channel(one).pending_len(), 0);

    pair.settle(|_| false);
    assert_eq!(pair.at_dte, vec![(1, b"reply".to_vec())]);
}

#[test]
fn test_bidirectional_traffic_arrives_in_order() {
    let mut pair = Pair::new();
    let one = ChannelId::new(1).unwrap();
    let two = ChannelId::new(2).unwrap();

    let outbound = payloads("dte", 7);
    let inbound = payloads("dce", 5);
    for data in &outbound {
        pair.dte.submit(one, false, 0x00, data).unwrap();
    }
    for data in &inbound {
        pair.dce.submit(two, false, 0x00, data).unwrap();
    }
    pair.settle(|_| false);

    let got: Vec<_> = pair.at_dce.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(got, outbound);
    assert!(pair.at_dce.iter().all(|(ch, _)| *ch == 1));
    let got: Vec<_> = pair.at_dte.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(got, inbound);

    assert_eq!(pair.dte.stats().retransmissions, 0);
    assert_eq!(pair.dte.free_buffers(), pair.dte.config().pool_size);
    assert_eq!(pair.dce.free_buffers(), pair.dce.config().pool_size);
}

#[test]
fn test_lost_first_frame_recovered_by_reject() {
    let mut pair = Pair::new();
    let one = ChannelId::new(1).unwrap();
    let sent = payloads("x", 2);
    for data in &sent {
        pair.dte.submit(one, false, 0x00, data).unwrap();
    }

    let mut lost = false;
    pair.settle(|frame| {
        if !lost && is_data(frame) {
            lost = true;
            return true;
        }
        false
    });

    let got: Vec<_> = pair.at_dce.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(got, sent);
    assert_eq!(pair.dce.stats().rejects_sent, 1);
    assert_eq!(pair.dte.stats().rejects_received, 1);
}

#[test]
fn test_lost_last_frame_recovered_by_rotation_timer() {
    let mut pair = Pair::new();
    let one = ChannelId::new(1).unwrap();
    let sent = payloads("y", 2);
    for data in &sent {
        pair.dte.submit(one, false, 0x00, data).unwrap();
    }

    let mut seen = 0;
    pair.settle(|frame| {
        if is_data(frame) {
            seen += 1;
            return seen == 2;
        }
        false
    });

    let got: Vec<_> = pair.at_dce.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(got, sent);
    assert!(pair.dte.stats().retransmissions >= 1);
    assert_eq!(pair.dce.stats().rejects_sent, 0);
}

#[test]
fn test_random_loss_keeps_order_and_window() {
    let mut rng = StdRng::seed_from_u64(0x7E7E);
    let mut pair = Pair::new();
    let one = ChannelId::new(1).unwrap();
    let nine = ChannelId::new(9).unwrap();

    let outbound = payloads("up", 20);
    let inbound = payloads("down", 12);
    for data in &outbound {
        pair.dte.submit(one, false, 0x00, data).unwrap();
    }
    for data in &inbound {
        pair.dce.submit(nine, true, 0x05, data).unwrap();
    }
    pair.settle(|_| rng.gen_bool(0.15));

    let got: Vec<_> = pair.at_dce.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(got, outbound);
    let got: Vec<_> = pair.at_dte.iter().map(|(_, d)| d.clone()).collect();
    assert_eq!(got, inbound);

    assert_eq!(pair.dte.free_buffers(), pair.dte.config().pool_size);
    assert_eq!(pair.dce.free_buffers(), pair.dce.config().pool_size);
}
