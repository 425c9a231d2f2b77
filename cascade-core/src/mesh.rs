//! The routing node: handshake, peer-list gossip, indirect lookup, and the
//! flood relay with its time-windowed seen-cache.
//!
//! Host-driven like the rest of the crate: the host reports transport events
//! (`on_accepted`, `on_data`, `on_disconnected`, `tick`) and carries out the
//! returned [`Action`]s. All routing-table and cache mutation happens on that
//! single event path, so one owner needs no locking.

use std::collections::{HashMap, VecDeque};

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::base58;
use crate::compression::{Method, Registry};
use crate::connection::{Action, ConnId, Connection};
use crate::envelope::{Envelope, EnvelopeError};
use crate::handler::MessageHandler;
use crate::identity::{random_salt, MessageId, NodeId};
use crate::protocol::{flag, subflag, PeerAddr, Protocol};

/// Cap on dials made while processing peer gossip.
pub const MAX_OUTGOING: usize = 4;
/// Seen-cache window; messages older than this are never relayed.
pub const CACHE_WINDOW_SECS: u64 = 60;
/// A connection mid-frame with no bytes for this long is dropped.
pub const STALL_TIMEOUT_SECS: u64 = 60;
/// A connection that never completes a handshake is dropped after this.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// A message handed to the application: an unclaimed whisper or broadcast.
#[derive(Debug, Clone)]
pub struct Delivery {
    envelope: Envelope,
}

impl Delivery {
    pub fn kind(&self) -> u8 {
        self.envelope.kind()
    }

    pub fn sender(&self) -> &NodeId {
        self.envelope.sender()
    }

    pub fn id(&self) -> &MessageId {
        self.envelope.id()
    }

    pub fn time(&self) -> u64 {
        self.envelope.time()
    }

    /// Payload packets; packet 0 is the sub-flag.
    pub fn payload(&self) -> &[Vec<u8>] {
        self.envelope.payload()
    }
}

/// A payload parked until the indirect-lookup protocol finds its target.
struct Deferred {
    kind: u8,
    payload: Vec<Vec<u8>>,
}

/// One mesh overlay node.
pub struct MeshNode {
    protocol: Protocol,
    registry: Registry,
    out_addr: PeerAddr,
    id: NodeId,
    max_outgoing: usize,
    conns: HashMap<ConnId, Connection>,
    routing: HashMap<NodeId, ConnId>,
    awaiting: Vec<ConnId>,
    requests: HashMap<String, Deferred>,
    seen: VecDeque<(MessageId, u64)>,
    inbox: VecDeque<Delivery>,
    handlers: Vec<Box<dyn MessageHandler>>,
    next_token: u64,
}

impl MeshNode {
    pub fn new(protocol: Protocol, out_addr: PeerAddr, registry: Registry) -> Self {
        let id = NodeId::derive(&out_addr, &protocol.id(), &random_salt());
        Self {
            protocol,
            registry,
            out_addr,
            id,
            max_outgoing: MAX_OUTGOING,
            conns: HashMap::new(),
            routing: HashMap::new(),
            awaiting: Vec::new(),
            requests: HashMap::new(),
            seen: VecDeque::new(),
            inbox: VecDeque::new(),
            handlers: Vec::new(),
            next_token: 0,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn out_addr(&self) -> &PeerAddr {
        &self.out_addr
    }

    /// Ids currently in the routing table.
    pub fn peers(&self) -> Vec<NodeId> {
        self.routing.keys().copied().collect()
    }

    pub fn is_routed(&self, id: &NodeId) -> bool {
        self.routing.contains_key(id)
    }

    /// Open connections this node initiated.
    pub fn outgoing_count(&self) -> usize {
        self.conns.values().filter(|c| c.outgoing).count()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Whether a connection token is still live.
    pub fn has_connection(&self, token: ConnId) -> bool {
        self.conns.contains_key(&token)
    }

    /// Register a dispatch-chain handler for a layered protocol.
    pub fn register_handler(&mut self, handler: Box<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    /// Dial a peer. Refuses self-connects, duplicate addresses, and ids
    /// already in the routing table. With `expected` set the connection is
    /// routed immediately; otherwise it waits for the handshake.
    pub fn connect(
        &mut self,
        addr: PeerAddr,
        expected: Option<NodeId>,
        now: u64,
    ) -> Result<(ConnId, Vec<Action>), ConnectError> {
        if addr == self.out_addr || expected == Some(self.id) {
            return Err(ConnectError::SelfConnect);
        }
        if let Some(id) = &expected {
            if self.routing.contains_key(id) {
                return Err(ConnectError::AlreadyConnected);
            }
        }
        if self.conns.values().any(|c| c.addr.as_ref() == Some(&addr)) {
            return Err(ConnectError::AlreadyConnected);
        }
        debug!(%addr, ?expected, "dialing peer");
        let token = self.alloc_conn(true, now);
        let mut actions = vec![Action::Open(token, addr.clone())];
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.addr = Some(addr);
            conn.id = expected;
        }
        match expected {
            Some(id) => {
                self.routing.insert(id, token);
            }
            None => self.awaiting.push(token),
        }
        actions.extend(self.send_handshake(token, now));
        Ok((token, actions))
    }

    /// An inbound transport connection was accepted. The handshake goes out
    /// immediately; the peer stays in awaiting-ids until it answers.
    pub fn on_accepted(&mut self, now: u64) -> (ConnId, Vec<Action>) {
        let token = self.alloc_conn(false, now);
        self.awaiting.push(token);
        debug!(conn = %token, "incoming connection");
        let actions = self.send_handshake(token, now);
        (token, actions)
    }

    /// Transport bytes arrived on a connection.
    pub fn on_data(&mut self, token: ConnId, data: &[u8], now: u64) -> Vec<Action> {
        let frames = {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) => conn,
                None => return Vec::new(),
            };
            match conn.push_bytes(data, now) {
                Ok(frames) => frames,
                Err(err) => {
                    debug!(%err, "dropping connection");
                    return self.teardown(token);
                }
            }
        };
        let mut out = Vec::new();
        for frame in frames {
            if !self.conns.contains_key(&token) {
                break;
            }
            out.extend(self.handle_frame(token, &frame, now));
        }
        out
    }

    /// The transport reported a close or error. Idempotent; triggers a
    /// peer-list refresh so the overlay can heal around the loss.
    pub fn on_disconnected(&mut self, token: ConnId, now: u64) -> Vec<Action> {
        if !self.conns.contains_key(&token) {
            return Vec::new();
        }
        self.remove_bookkeeping(token);
        debug!(conn = %token, "connection closed");
        self.request_peers(now)
    }

    /// Close a connection deliberately. Idempotent.
    pub fn disconnect(&mut self, token: ConnId) -> Vec<Action> {
        self.teardown(token)
    }

    /// Broadcast payload packets to the whole overlay.
    pub fn send(&mut self, parts: &[&[u8]], now: u64) -> Vec<Action> {
        self.send_with(flag::BROADCAST, subflag::BROADCAST, parts, now)
    }

    /// Fan a message out to every routed peer, with explicit main flag and
    /// sub-flag. The seen-cache is primed so the overlay's echo of our own
    /// message is not delivered back to us.
    pub fn send_with(&mut self, kind: u8, sub: u8, parts: &[&[u8]], now: u64) -> Vec<Action> {
        let mut payload = vec![vec![sub]];
        payload.extend(parts.iter().map(|p| p.to_vec()));
        let env = Envelope::new(kind, self.id, payload, now);
        let key = (*env.id(), env.time());
        if !self.seen.contains(&key) {
            self.seen.push_front(key);
        }
        let mut out = Vec::new();
        let tokens: Vec<ConnId> = self.routing.values().copied().collect();
        for token in tokens {
            if let Some(conn) = self.conns.get_mut(&token) {
                match conn.send_envelope(&env) {
                    Ok(action) => out.push(action),
                    Err(err) => debug!(conn = %token, %err, "send failed"),
                }
            }
        }
        out
    }

    /// Next unclaimed application message, oldest first.
    pub fn recv(&mut self) -> Option<Delivery> {
        self.inbox.pop_front()
    }

    /// Whisper a reply to a delivery's sender. Without a direct route, the
    /// payload is parked and an indirect lookup goes out; the response
    /// handler flushes it once the target is found. Best effort.
    pub fn reply(&mut self, to: &Delivery, parts: &[&[u8]], now: u64) -> Vec<Action> {
        if let Some(&token) = self.routing.get(to.sender()) {
            let mut payload = vec![vec![subflag::WHISPER]];
            payload.extend(parts.iter().map(|p| p.to_vec()));
            if let Some(conn) = self.conns.get_mut(&token) {
                match conn.send(flag::WHISPER, payload, now) {
                    Ok(action) => return vec![action],
                    Err(err) => {
                        debug!(conn = %token, %err, "reply failed");
                        return Vec::new();
                    }
                }
            }
            Vec::new()
        } else {
            let request_id = lookup_request_id(to.sender(), now);
            let sender_text = to.sender().to_base58();
            let actions = self.send_with(
                flag::BROADCAST,
                subflag::REQUEST,
                &[request_id.as_bytes(), sender_text.as_bytes()],
                now,
            );
            let mut payload = vec![vec![subflag::WHISPER]];
            payload.extend(parts.iter().map(|p| p.to_vec()));
            self.requests.insert(
                request_id,
                Deferred {
                    kind: flag::WHISPER,
                    payload,
                },
            );
            actions
        }
    }

    /// Ask every routed peer for its current peer list.
    pub fn request_peers(&mut self, now: u64) -> Vec<Action> {
        self.send_with(flag::WHISPER, subflag::REQUEST, &[b"*"], now)
    }

    /// Periodic maintenance: reap stalled and never-handshaken connections,
    /// prune the seen-cache.
    pub fn tick(&mut self, now: u64) -> Vec<Action> {
        let mut stale = Vec::new();
        for (&token, conn) in &self.conns {
            if conn.mid_frame() && conn.last_active + STALL_TIMEOUT_SECS < now {
                stale.push(token);
            } else if self.awaiting.contains(&token)
                && conn.established + HANDSHAKE_TIMEOUT_SECS < now
            {
                stale.push(token);
            }
        }
        let mut out = Vec::new();
        for token in stale {
            debug!(conn = %token, "reaping unresponsive connection");
            out.extend(self.teardown(token));
        }
        self.prune_seen(now);
        out
    }

    /// Flood relay. Returns whether the message was fresh (and so relayed to
    /// every routed peer except where it arrived and its original sender),
    /// plus the relay actions.
    pub fn waterfall(
        &mut self,
        env: &Envelope,
        arrived: Option<ConnId>,
        now: u64,
    ) -> (bool, Vec<Action>) {
        self.prune_seen(now);
        let key = (*env.id(), env.time());
        if self.seen.contains(&key) {
            trace!(id = %env.id(), "not rebroadcasting");
            return (false, Vec::new());
        }
        self.seen.push_front(key);
        let mut out = Vec::new();
        let tokens: Vec<ConnId> = self
            .routing
            .values()
            .copied()
            .filter(|t| Some(*t) != arrived)
            .collect();
        for token in tokens {
            if let Some(conn) = self.conns.get_mut(&token) {
                if conn.id.as_ref() == Some(env.sender()) {
                    continue;
                }
                match conn.send_envelope(env) {
                    Ok(action) => out.push(action),
                    Err(err) => debug!(conn = %token, %err, "relay failed"),
                }
            }
        }
        (true, out)
    }

    fn alloc_conn(&mut self, outgoing: bool, now: u64) -> ConnId {
        self.next_token += 1;
        let token = ConnId(self.next_token);
        self.conns.insert(
            token,
            Connection::new(token, self.id, self.registry.clone(), outgoing, now),
        );
        token
    }

    fn send_handshake(&mut self, token: ConnId, now: u64) -> Vec<Action> {
        let id_text = self.id.to_base58();
        let proto_id = self.protocol.id();
        let addr_json = match serde_json::to_vec(&self.out_addr) {
            Ok(json) => json,
            Err(err) => {
                debug!(%err, "failed to encode out address");
                return Vec::new();
            }
        };
        let methods_json = match serde_json::to_vec(&self.registry.wire_ids()) {
            Ok(json) => json,
            Err(err) => {
                debug!(%err, "failed to encode method list");
                return Vec::new();
            }
        };
        let payload = vec![
            vec![subflag::HANDSHAKE],
            id_text.into_bytes(),
            proto_id.into_bytes(),
            addr_json,
            methods_json,
        ];
        match self.conns.get_mut(&token) {
            Some(conn) => match conn.send(flag::WHISPER, payload, now) {
                Ok(action) => vec![action],
                Err(err) => {
                    debug!(conn = %token, %err, "handshake send failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    fn handle_frame(&mut self, token: ConnId, frame: &[u8], now: u64) -> Vec<Action> {
        let mut out = Vec::new();
        let env = {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) => conn,
                None => return out,
            };
            match conn.decode_frame(frame) {
                Ok(env) => env,
                Err(err @ EnvelopeError::FrameLengthMismatch { .. }) => {
                    // The stream is out of sync; nothing after this frame can
                    // be trusted.
                    debug!(conn = %token, %err, "dropping unsynchronized connection");
                    return self.teardown(token);
                }
                Err(err) => {
                    debug!(conn = %token, %err, "failed to decode message, requesting resend");
                    out.extend(self.request_resend(token, now));
                    return out;
                }
            }
        };

        if env.kind() == flag::BROADCAST {
            if env.time() + CACHE_WINDOW_SECS < now {
                debug!(id = %env.id(), "flood message expired");
                return out;
            }
            let (fresh, relays) = self.waterfall(&env, Some(token), now);
            out.extend(relays);
            if !fresh {
                return out;
            }
        }

        if let Some(conn) = self.conns.get_mut(&token) {
            if let Some(replies) = conn.handle_renegotiate(&env, now) {
                out.extend(replies);
                return out;
            }
        }

        out.extend(self.handle_msg(env, token, now));
        out
    }

    /// The recovery path for garbled frames: tell the peer we accept no
    /// compression, then ask it to resend its last message.
    fn request_resend(&mut self, token: ConnId, now: u64) -> Vec<Action> {
        let conn = match self.conns.get_mut(&token) {
            Some(conn) => conn,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        let empty = match serde_json::to_vec(&Vec::<u8>::new()) {
            Ok(json) => json,
            Err(_) => b"[]".to_vec(),
        };
        match conn.send(
            flag::RENEGOTIATE,
            vec![vec![subflag::COMPRESSION], empty],
            now,
        ) {
            Ok(action) => out.push(action),
            Err(err) => debug!(conn = %token, %err, "renegotiate send failed"),
        }
        match conn.send(flag::RENEGOTIATE, vec![vec![subflag::RESEND]], now) {
            Ok(action) => out.push(action),
            Err(err) => debug!(conn = %token, %err, "resend request failed"),
        }
        out
    }

    /// Built-in handlers first, then the registered chain, first claim wins;
    /// unclaimed whisper and broadcast messages land in the inbox.
    fn handle_msg(&mut self, env: Envelope, token: ConnId, now: u64) -> Vec<Action> {
        let mut out = Vec::new();
        let sub = env.payload().first().and_then(|p| p.first().copied());
        let claimed = match sub {
            Some(subflag::HANDSHAKE) => {
                self.handle_handshake(&env, token, now, &mut out);
                true
            }
            Some(subflag::PEERS) => {
                self.handle_peers(&env, now, &mut out);
                true
            }
            Some(subflag::RESPONSE) => {
                self.handle_response(&env, now, &mut out);
                true
            }
            Some(subflag::REQUEST) => {
                self.handle_request(&env, token, now, &mut out);
                true
            }
            _ => false,
        };
        if claimed {
            return out;
        }

        let mut handlers = std::mem::take(&mut self.handlers);
        let mut external_claimed = false;
        for handler in handlers.iter_mut() {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) => conn,
                None => break,
            };
            if handler.handle(&env, conn, now, &mut out) {
                external_claimed = true;
                break;
            }
        }
        self.handlers = handlers;
        if external_claimed {
            return out;
        }

        if env.kind() == flag::WHISPER || env.kind() == flag::BROADCAST {
            self.inbox.push_back(Delivery { envelope: env });
        } else {
            trace!(kind = env.kind(), "ignoring message no handler claimed");
        }
        out
    }

    fn handle_handshake(&mut self, env: &Envelope, token: ConnId, now: u64, out: &mut Vec<Action>) {
        let payload = env.payload();
        if payload.len() < 5 {
            debug!(conn = %token, "short handshake");
            return;
        }
        let peer_id = match std::str::from_utf8(&payload[1])
            .ok()
            .and_then(|text| NodeId::from_base58(text).ok())
        {
            Some(id) => id,
            None => {
                debug!(conn = %token, "unreadable handshake id");
                out.extend(self.teardown(token));
                return;
            }
        };
        if payload[2] != self.protocol.id().as_bytes() {
            // Different subnet. Disconnect without explanation; foreign
            // networks learn nothing about this one.
            debug!(conn = %token, "protocol fingerprint mismatch");
            out.extend(self.teardown(token));
            return;
        }
        if let Some(&existing) = self.routing.get(&peer_id) {
            if existing != token && !self.resolve_conflict(peer_id, existing, token, out) {
                return;
            }
        }
        let addr: Option<PeerAddr> = serde_json::from_slice(&payload[3]).ok();
        let methods: Vec<Method> = serde_json::from_slice::<Vec<u8>>(&payload[4])
            .unwrap_or_default()
            .into_iter()
            .filter_map(Method::from_wire_id)
            .collect();
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.id = Some(peer_id);
            if addr.is_some() {
                conn.addr = addr;
            }
            conn.compression = methods;
            trace!(conn = %token, methods = ?conn.compression, "handshake compression set");
        }
        self.awaiting.retain(|t| *t != token);
        self.routing.insert(peer_id, token);
        debug!(conn = %token, peer = %peer_id, "peer identified");

        let peer_list = self.peer_list_json();
        if let Some(conn) = self.conns.get_mut(&token) {
            match conn.send(flag::WHISPER, vec![vec![subflag::PEERS], peer_list], now) {
                Ok(action) => out.push(action),
                Err(err) => debug!(conn = %token, %err, "peer list send failed"),
            }
        }
    }

    /// Two live connections claim the same peer id. Keep exactly one, chosen
    /// by comparing ids against the connection's direction so both ends pick
    /// the same survivor. Returns whether the new connection survived.
    fn resolve_conflict(
        &mut self,
        peer_id: NodeId,
        existing: ConnId,
        fresh: ConnId,
        out: &mut Vec<Action>,
    ) -> bool {
        let fresh_outgoing = self
            .conns
            .get(&fresh)
            .map(|c| c.outgoing)
            .unwrap_or(false);
        let keep_existing = (self.id > peer_id) ^ fresh_outgoing;
        debug!(peer = %peer_id, keep_existing, "resolving duplicate connection");
        if keep_existing {
            out.extend(self.teardown(fresh));
            false
        } else {
            out.extend(self.teardown(existing));
            self.routing.insert(peer_id, fresh);
            true
        }
    }

    fn handle_peers(&mut self, env: &Envelope, now: u64, out: &mut Vec<Action>) {
        let payload = env.payload();
        let advertised: Vec<(PeerAddr, String)> = match payload
            .get(1)
            .and_then(|raw| serde_json::from_slice(raw).ok())
        {
            Some(list) => list,
            None => {
                debug!("unreadable peer list");
                return;
            }
        };
        for (addr, id_text) in advertised {
            if self.outgoing_count() >= self.max_outgoing {
                break;
            }
            let id = match NodeId::from_base58(&id_text) {
                Ok(id) => id,
                Err(_) => continue,
            };
            // Best effort: one unreachable peer must not stop the rest.
            match self.connect(addr.clone(), Some(id), now) {
                Ok((_, actions)) => out.extend(actions),
                Err(err) => trace!(%addr, %err, "skipping advertised peer"),
            }
        }
    }

    fn handle_response(&mut self, env: &Envelope, now: u64, out: &mut Vec<Action>) {
        let payload = env.payload();
        let request_id = match payload.get(1).and_then(|p| std::str::from_utf8(p).ok()) {
            Some(text) => text.to_owned(),
            None => return,
        };
        if !self.requests.contains_key(&request_id) {
            return;
        }
        let found: Option<(PeerAddr, String)> = payload
            .get(2)
            .and_then(|raw| serde_json::from_slice(raw).ok());
        let (addr, id_text) = match found {
            Some(pair) => pair,
            None => return,
        };
        let target = match NodeId::from_base58(&id_text) {
            Ok(id) => id,
            Err(_) => return,
        };
        debug!(request = %request_id, peer = %target, "lookup response received");
        let deferred = match self.requests.remove(&request_id) {
            Some(d) => d,
            None => return,
        };
        match self.connect(addr, Some(target), now) {
            Ok((_, actions)) => out.extend(actions),
            Err(err) => trace!(%err, "lookup target already reachable"),
        }
        if let Some(&token) = self.routing.get(&target) {
            if let Some(conn) = self.conns.get_mut(&token) {
                match conn.send(deferred.kind, deferred.payload, now) {
                    Ok(action) => out.push(action),
                    Err(err) => debug!(conn = %token, %err, "deferred send failed"),
                }
            }
        }
    }

    fn handle_request(&mut self, env: &Envelope, token: ConnId, now: u64, out: &mut Vec<Action>) {
        let payload = env.payload();
        match payload.get(1).map(Vec::as_slice) {
            Some(b"*") => {
                let peer_list = self.peer_list_json();
                if let Some(conn) = self.conns.get_mut(&token) {
                    match conn.send(flag::WHISPER, vec![vec![subflag::PEERS], peer_list], now) {
                        Ok(action) => out.push(action),
                        Err(err) => debug!(conn = %token, %err, "peer list send failed"),
                    }
                }
            }
            Some(request_id) => {
                let target = match payload
                    .get(2)
                    .and_then(|p| std::str::from_utf8(p).ok())
                    .and_then(|text| NodeId::from_base58(text).ok())
                {
                    Some(id) => id,
                    None => return,
                };
                let addr = self
                    .routing
                    .get(&target)
                    .and_then(|t| self.conns.get(t))
                    .and_then(|c| c.addr.clone());
                let addr = match addr {
                    Some(addr) => addr,
                    None => return,
                };
                let body = match serde_json::to_vec(&(addr, target.to_base58())) {
                    Ok(json) => json,
                    Err(_) => return,
                };
                let request_id = request_id.to_vec();
                if let Some(conn) = self.conns.get_mut(&token) {
                    match conn.send(
                        flag::BROADCAST,
                        vec![vec![subflag::RESPONSE], request_id, body],
                        now,
                    ) {
                        Ok(action) => out.push(action),
                        Err(err) => debug!(conn = %token, %err, "lookup response failed"),
                    }
                }
            }
            None => {}
        }
    }

    /// Current peer list as a JSON body, shuffled so gossip spreads load.
    fn peer_list_json(&self) -> Vec<u8> {
        let mut list: Vec<(PeerAddr, String)> = self
            .routing
            .iter()
            .filter_map(|(id, token)| {
                let conn = self.conns.get(token)?;
                let addr = conn.addr.clone()?;
                Some((addr, id.to_base58()))
            })
            .collect();
        list.shuffle(&mut rand::thread_rng());
        serde_json::to_vec(&list).unwrap_or_else(|_| b"[]".to_vec())
    }

    fn teardown(&mut self, token: ConnId) -> Vec<Action> {
        if !self.conns.contains_key(&token) {
            return Vec::new();
        }
        self.remove_bookkeeping(token);
        vec![Action::Close(token)]
    }

    fn remove_bookkeeping(&mut self, token: ConnId) {
        self.conns.remove(&token);
        self.awaiting.retain(|t| *t != token);
        self.routing.retain(|_, t| *t != token);
    }

    fn prune_seen(&mut self, now: u64) {
        self.seen
            .retain(|(_, time)| time + CACHE_WINDOW_SECS >= now);
    }
}

fn lookup_request_id(target: &NodeId, now: u64) -> String {
    use sha2::{Digest, Sha384};
    let mut hasher = Sha384::new();
    hasher.update(target.to_base58().as_bytes());
    hasher.update(base58::to_base58(now).as_bytes());
    bs58::encode(hasher.finalize()).into_string()
}

/// Error starting an outbound connection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection would target the local node")]
    SelfConnect,
    #[error("already connected to that address or id")]
    AlreadyConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> MeshNode {
        MeshNode::new(
            Protocol::new("mesh", "Plaintext"),
            PeerAddr::new("127.0.0.1", port),
            Registry::with_defaults(),
        )
    }

    #[test]
    fn self_connect_refused() {
        let mut n = node(4444);
        let addr = n.out_addr().clone();
        assert_eq!(
            n.connect(addr, None, 100).unwrap_err(),
            ConnectError::SelfConnect
        );
        let own = *n.id();
        assert_eq!(
            n.connect(PeerAddr::new("10.0.0.9", 1), Some(own), 100)
                .unwrap_err(),
            ConnectError::SelfConnect
        );
    }

    #[test]
    fn duplicate_address_refused() {
        let mut n = node(4444);
        let addr = PeerAddr::new("10.0.0.2", 4445);
        n.connect(addr.clone(), None, 100).unwrap();
        assert_eq!(
            n.connect(addr, None, 100).unwrap_err(),
            ConnectError::AlreadyConnected
        );
    }

    #[test]
    fn connect_emits_open_then_handshake() {
        let mut n = node(4444);
        let (token, actions) = n.connect(PeerAddr::new("10.0.0.2", 4445), None, 100).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], Action::Open(t, _) if *t == token));
        assert!(matches!(&actions[1], Action::Send(t, _) if *t == token));
        assert_eq!(n.outgoing_count(), 1);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut n = node(4444);
        let (token, _) = n.connect(PeerAddr::new("10.0.0.2", 4445), None, 100).unwrap();
        assert_eq!(n.disconnect(token), vec![Action::Close(token)]);
        assert!(n.disconnect(token).is_empty());
        assert!(n.on_disconnected(token, 100).is_empty());
        assert_eq!(n.connection_count(), 0);
    }

    #[test]
    fn waterfall_dedups_and_expires() {
        let mut n = node(4444);
        let sender = NodeId::derive(&PeerAddr::new("10.0.0.2", 1), "p", &random_salt());
        let env = Envelope::new(flag::BROADCAST, sender, vec![vec![subflag::BROADCAST]], 100);
        let (fresh, _) = n.waterfall(&env, None, 100);
        assert!(fresh);
        let (fresh, _) = n.waterfall(&env, None, 100);
        assert!(!fresh);
        // Window rolls past the entry; the same id becomes fresh again.
        let (fresh, _) = n.waterfall(&env, None, 161);
        assert!(fresh);
    }

    #[test]
    fn handshake_timeout_reaps_awaiting() {
        let mut n = node(4444);
        let (token, _) = n.connect(PeerAddr::new("10.0.0.2", 4445), None, 100).unwrap();
        assert!(n.tick(100 + HANDSHAKE_TIMEOUT_SECS).is_empty());
        let actions = n.tick(101 + HANDSHAKE_TIMEOUT_SECS);
        assert_eq!(actions, vec![Action::Close(token)]);
        assert_eq!(n.connection_count(), 0);
    }

    #[test]
    fn reply_without_route_parks_payload() {
        let mut n = node(4444);
        let sender = NodeId::derive(&PeerAddr::new("10.0.0.2", 1), "p", &random_salt());
        let env = Envelope::new(
            flag::WHISPER,
            sender,
            vec![vec![subflag::WHISPER], b"question".to_vec()],
            100,
        );
        let delivery = Delivery { envelope: env };
        // No peers: nothing goes out yet, but the payload is parked under a
        // pending request.
        let actions = n.reply(&delivery, &[b"answer"], 100);
        assert!(actions.is_empty());
        assert_eq!(n.requests.len(), 1);
    }

    #[test]
    fn send_primes_seen_cache() {
        let mut n = node(4444);
        n.send(&[b"hello"], 100);
        assert_eq!(n.seen.len(), 1);
    }
}
