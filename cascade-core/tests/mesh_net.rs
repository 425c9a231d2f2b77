//! Multi-node scenarios driven entirely through the public event API, with a
//! small in-memory relay standing in for the transport.

use std::collections::HashMap;

use cascade_core::{Action, ConnId, MeshNode, PeerAddr, Protocol, Registry};

const BASE_PORT: u16 = 6000;

/// In-memory network: applies every action a node emits, delivering sent
/// bytes to the linked peer until the overlay goes quiet.
struct Net {
    nodes: Vec<MeshNode>,
    links: HashMap<(usize, ConnId), (usize, ConnId)>,
    now: u64,
}

impl Net {
    fn new(subnets: &[&str]) -> Self {
        let nodes = subnets
            .iter()
            .enumerate()
            .map(|(i, subnet)| {
                MeshNode::new(
                    Protocol::new(*subnet, "Plaintext"),
                    addr_of(i),
                    Registry::with_defaults(),
                )
            })
            .collect();
        Self {
            nodes,
            links: HashMap::new(),
            now: 1_000_000,
        }
    }

    fn connect(&mut self, from: usize, to: usize) {
        let now = self.now;
        // Gossip may have linked the pair already; that is not a failure.
        if let Ok((_, actions)) = self.nodes[from].connect(addr_of(to), None, now) {
            self.run(from, actions);
        }
    }

    /// Apply actions breadth-first until nothing more is produced.
    fn run(&mut self, from: usize, actions: Vec<Action>) {
        let mut queue: Vec<(usize, Action)> =
            actions.into_iter().map(|a| (from, a)).collect();
        while !queue.is_empty() {
            let mut next = Vec::new();
            for (at, action) in queue {
                match action {
                    Action::Open(token, addr) => {
                        let target = index_of(&addr);
                        let now = self.now;
                        let (peer_token, peer_actions) = self.nodes[target].on_accepted(now);
                        self.links.insert((at, token), (target, peer_token));
                        self.links.insert((target, peer_token), (at, token));
                        next.extend(peer_actions.into_iter().map(|a| (target, a)));
                    }
                    Action::Send(token, bytes) => {
                        if let Some(&(peer, peer_token)) = self.links.get(&(at, token)) {
                            let now = self.now;
                            let produced = self.nodes[peer].on_data(peer_token, &bytes, now);
                            next.extend(produced.into_iter().map(|a| (peer, a)));
                        }
                    }
                    Action::Close(token) => {
                        if let Some((peer, peer_token)) = self.links.remove(&(at, token)) {
                            self.links.remove(&(peer, peer_token));
                            let now = self.now;
                            let produced = self.nodes[peer].on_disconnected(peer_token, now);
                            next.extend(produced.into_iter().map(|a| (peer, a)));
                        }
                    }
                }
            }
            queue = next;
        }
    }

    fn broadcast(&mut self, from: usize, body: &[u8]) {
        let now = self.now;
        let actions = self.nodes[from].send(&[body], now);
        self.run(from, actions);
    }

    fn drain_inbox(&mut self, at: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(delivery) = self.nodes[at].recv() {
            out.push(delivery.payload()[1].clone());
        }
        out
    }
}

fn addr_of(index: usize) -> PeerAddr {
    PeerAddr::new("127.0.0.1", BASE_PORT + index as u16)
}

fn index_of(addr: &PeerAddr) -> usize {
    (addr.port - BASE_PORT) as usize
}

#[test]
fn handshake_populates_both_routing_tables() {
    let mut net = Net::new(&["mesh", "mesh"]);
    net.connect(0, 1);
    let id0 = *net.nodes[0].id();
    let id1 = *net.nodes[1].id();
    assert!(net.nodes[0].is_routed(&id1));
    assert!(net.nodes[1].is_routed(&id0));
}

#[test]
fn different_subnets_never_peer() {
    let mut net = Net::new(&["mesh1", "mesh2"]);
    net.connect(0, 1);
    assert!(net.nodes[0].peers().is_empty());
    assert!(net.nodes[1].peers().is_empty());
}

#[test]
fn chain_propagates_exactly_one_copy() {
    let mut net = Net::new(&["mesh", "mesh", "mesh"]);
    net.connect(0, 1);
    net.connect(1, 2);
    net.broadcast(0, b"hello overlay");

    let at_end = net.drain_inbox(2);
    assert_eq!(at_end, vec![b"hello overlay".to_vec()]);
    let in_middle = net.drain_inbox(1);
    assert_eq!(in_middle, vec![b"hello overlay".to_vec()]);
    // The origin never sees its own message come back.
    assert!(net.drain_inbox(0).is_empty());
}

#[test]
fn broadcast_reaches_all_nodes_in_star() {
    let mut net = Net::new(&["mesh"; 5]);
    for spoke in 1..5 {
        net.connect(spoke, 0);
    }
    net.broadcast(1, b"from a spoke");
    for other in [0usize, 2, 3, 4] {
        assert_eq!(
            net.drain_inbox(other),
            vec![b"from a spoke".to_vec()],
            "node {other}"
        );
    }
    assert!(net.drain_inbox(1).is_empty());
}

#[test]
fn gossip_respects_outgoing_bound() {
    // Eight spokes already hang off the hub; a latecomer handshakes with the
    // hub, receives its full peer list, and must stop dialing at the bound.
    let mut net = Net::new(&["mesh"; 10]);
    for spoke in 1..9 {
        net.connect(spoke, 0);
    }
    net.connect(9, 0);
    assert!(net.nodes[9].outgoing_count() <= cascade_core::MAX_OUTGOING);
}

#[test]
fn whisper_reply_uses_direct_route() {
    let mut net = Net::new(&["mesh", "mesh"]);
    net.connect(0, 1);
    net.broadcast(0, b"question");
    let delivery = net.nodes[1].recv().expect("delivered");
    let now = net.now;
    let actions = net.nodes[1].reply(&delivery, &[b"answer"], now);
    net.run(1, actions);
    let got = net.drain_inbox(0);
    assert_eq!(got, vec![b"answer".to_vec()]);
}

#[test]
fn expired_broadcast_is_dropped_without_relay() {
    let mut net = Net::new(&["mesh", "mesh", "mesh"]);
    net.connect(0, 1);
    net.connect(1, 2);
    // Stamp the message 61 seconds in the past by rolling the clock forward
    // after sending: the frame sits "in flight" while the window passes.
    let stale_time = net.now;
    let actions = net.nodes[0].send(&[b"too old"], stale_time);
    net.now = stale_time + 61;
    net.run(0, actions);
    assert!(net.drain_inbox(1).is_empty());
    assert!(net.drain_inbox(2).is_empty());
}

#[test]
fn duplicate_flood_suppressed_in_cycle() {
    // Triangle: every node has two routes to each message, but each inbox
    // sees exactly one copy.
    let mut net = Net::new(&["mesh", "mesh", "mesh"]);
    net.connect(0, 1);
    net.connect(1, 2);
    net.connect(2, 0);
    net.broadcast(0, b"once only");
    assert_eq!(net.drain_inbox(1).len(), 1);
    assert_eq!(net.drain_inbox(2).len(), 1);
    assert!(net.drain_inbox(0).is_empty());
}

#[test]
fn disconnect_removes_route_both_sides() {
    let mut net = Net::new(&["mesh", "mesh"]);
    net.connect(0, 1);
    let id1 = *net.nodes[1].id();
    let peer_conn = {
        let node = &net.nodes[0];
        let peers = node.peers();
        assert_eq!(peers, vec![id1]);
        // Token of the single live connection.
        net.links
            .keys()
            .find(|(at, _)| *at == 0)
            .map(|(_, token)| *token)
            .expect("link exists")
    };
    let actions = net.nodes[0].disconnect(peer_conn);
    net.run(0, actions);
    assert!(net.nodes[0].peers().is_empty());
    assert!(net.nodes[1].peers().is_empty());
}

#[test]
fn corrupted_frame_triggers_resend_recovery() {
    let mut net = Net::new(&["mesh", "mesh"]);
    net.connect(0, 1);

    // Node 0 broadcasts; we corrupt one payload byte in flight, then let the
    // renegotiate/resend exchange replay it.
    let now = net.now;
    let actions = net.nodes[0].send(&[b"fragile payload"], now);
    let mut fixed = Vec::new();
    for action in actions {
        match action {
            Action::Send(token, mut bytes) => {
                let last = bytes.len() - 1;
                bytes[last] ^= 0xFF;
                fixed.push(Action::Send(token, bytes));
            }
            other => fixed.push(other),
        }
    }
    net.run(0, fixed);
    assert_eq!(net.drain_inbox(1), vec![b"fragile payload".to_vec()]);
}
