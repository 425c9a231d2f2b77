//! One peer link: streaming frame reassembly, negotiated compression,
//! and resend bookkeeping. Pure state; the owning node turns the returned
//! actions into transport writes.

use tracing::debug;

use crate::compression::{Method, Registry};
use crate::envelope::{Envelope, EnvelopeError};
use crate::identity::NodeId;
use crate::protocol::{flag, subflag, PeerAddr};

/// Upper bound on a single frame; a larger declared length means the stream
/// is corrupt or hostile.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Host-side token for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What the host must do on the node's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the connection's transport.
    Send(ConnId, Vec<u8>),
    /// Open a transport connection to the address; report bytes and lifecycle
    /// events back under this token.
    Open(ConnId, PeerAddr),
    /// Close the connection's transport.
    Close(ConnId),
}

/// Per-connection protocol state.
///
/// Lifecycle: created on accept or dial with no peer id, identified by
/// handshake (the node moves it into the routing table), destroyed on
/// close or error.
pub struct Connection {
    token: ConnId,
    local_id: NodeId,
    registry: Registry,
    pub(crate) id: Option<NodeId>,
    pub(crate) addr: Option<PeerAddr>,
    pub(crate) compression: Vec<Method>,
    buffer: Vec<u8>,
    expected: Option<usize>,
    last_sent: Option<Envelope>,
    pub(crate) outgoing: bool,
    pub(crate) last_active: u64,
    pub(crate) established: u64,
}

impl Connection {
    pub(crate) fn new(
        token: ConnId,
        local_id: NodeId,
        registry: Registry,
        outgoing: bool,
        now: u64,
    ) -> Self {
        Self {
            token,
            local_id,
            registry,
            id: None,
            addr: None,
            compression: Vec::new(),
            buffer: Vec::new(),
            expected: None,
            last_sent: None,
            outgoing,
            last_active: now,
            established: now,
        }
    }

    pub fn token(&self) -> ConnId {
        self.token
    }

    /// Peer id, once the handshake has identified it.
    pub fn id(&self) -> Option<&NodeId> {
        self.id.as_ref()
    }

    /// Peer's advertised outward address, once known.
    pub fn addr(&self) -> Option<&PeerAddr> {
        self.addr.as_ref()
    }

    pub fn outgoing(&self) -> bool {
        self.outgoing
    }

    /// Compression methods the peer advertised, in the peer's order.
    pub fn compression(&self) -> &[Method] {
        &self.compression
    }

    /// True while a frame is partially buffered.
    pub fn mid_frame(&self) -> bool {
        self.expected.is_some() || !self.buffer.is_empty()
    }

    /// Append transport bytes and pull out every complete frame.
    ///
    /// A single read may carry zero, one, or many frames, and a frame may
    /// span reads, so this loops until the buffer runs dry.
    pub fn push_bytes(&mut self, data: &[u8], now: u64) -> Result<Vec<Vec<u8>>, OversizedFrame> {
        self.buffer.extend_from_slice(data);
        self.last_active = now;
        let mut frames = Vec::new();
        loop {
            if self.expected.is_none() {
                if self.buffer.len() < 4 {
                    break;
                }
                let declared =
                    u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
                if declared > MAX_FRAME_LEN {
                    return Err(OversizedFrame {
                        declared,
                        conn: self.token,
                    });
                }
                self.expected = Some(declared as usize + 4);
            }
            match self.expected {
                Some(expected) if self.buffer.len() >= expected => {
                    let rest = self.buffer.split_off(expected);
                    frames.push(std::mem::replace(&mut self.buffer, rest));
                    self.expected = None;
                }
                _ => break,
            }
        }
        Ok(frames)
    }

    /// Decode one reassembled frame under this connection's negotiated
    /// compression.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Envelope, EnvelopeError> {
        Envelope::decode(frame, false, &self.compression, &self.registry)
    }

    /// Build and frame a fresh message from this node.
    pub fn send(
        &mut self,
        kind: u8,
        payload: Vec<Vec<u8>>,
        now: u64,
    ) -> Result<Action, EnvelopeError> {
        let env = Envelope::new(kind, self.local_id, payload, now);
        self.send_envelope(&env)
    }

    /// Frame an existing envelope (relay or replay) without re-stamping it.
    /// Whisper and broadcast messages are remembered for resend-on-request.
    pub fn send_envelope(&mut self, env: &Envelope) -> Result<Action, EnvelopeError> {
        if env.kind() == flag::WHISPER || env.kind() == flag::BROADCAST {
            self.last_sent = Some(env.clone());
        }
        let bytes = env.encode(&self.compression, &self.registry)?;
        Ok(Action::Send(self.token, bytes))
    }

    /// Handle a renegotiate message. Returns `Some` with the reply actions if
    /// the message was claimed, `None` to let normal dispatch proceed.
    pub fn handle_renegotiate(&mut self, env: &Envelope, now: u64) -> Option<Vec<Action>> {
        if env.kind() != flag::RENEGOTIATE {
            return None;
        }
        let payload = env.payload();
        match payload.first().map(Vec::as_slice) {
            Some([subflag::COMPRESSION]) => {
                let mut out = Vec::new();
                let advertised = payload
                    .get(1)
                    .and_then(|raw| serde_json::from_slice::<Vec<u8>>(raw).ok());
                match advertised {
                    Some(ids) => {
                        let methods: Vec<Method> =
                            ids.iter().copied().filter_map(Method::from_wire_id).collect();
                        let respond = self.compression != methods;
                        self.compression = methods;
                        debug!(conn = %self.token, methods = ?self.compression,
                               "compression methods changed");
                        if respond {
                            let common = self.registry.negotiate(&self.compression);
                            let ids: Vec<u8> = common.iter().map(|m| m.wire_id()).collect();
                            match serde_json::to_vec(&ids) {
                                Ok(body) => {
                                    match self.send(
                                        flag::RENEGOTIATE,
                                        vec![vec![subflag::COMPRESSION], body],
                                        now,
                                    ) {
                                        Ok(action) => out.push(action),
                                        Err(err) => {
                                            debug!(conn = %self.token, %err,
                                                   "failed to answer renegotiate")
                                        }
                                    }
                                }
                                Err(err) => {
                                    debug!(conn = %self.token, %err,
                                           "failed to encode method list")
                                }
                            }
                        }
                    }
                    None => debug!(conn = %self.token, "unreadable compression list"),
                }
                Some(out)
            }
            Some([subflag::RESEND]) => {
                let mut out = Vec::new();
                if let Some(last) = self.last_sent.clone() {
                    match self.send_envelope(&last) {
                        Ok(action) => out.push(action),
                        Err(err) => debug!(conn = %self.token, %err, "resend failed"),
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }
}

/// A frame whose declared length exceeds [`MAX_FRAME_LEN`]. Fatal to the
/// connection.
#[derive(Debug, thiserror::Error)]
#[error("{conn}: declared frame of {declared} bytes exceeds limit")]
pub struct OversizedFrame {
    pub declared: u32,
    pub conn: ConnId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::random_salt;

    fn node_id(port: u16) -> NodeId {
        NodeId::derive(&PeerAddr::new("10.0.0.1", port), "proto", &random_salt())
    }

    fn pair() -> (Connection, Connection) {
        let reg = Registry::with_defaults();
        let a = Connection::new(ConnId(1), node_id(1000), reg.clone(), true, 100);
        let b = Connection::new(ConnId(2), node_id(2000), reg, false, 100);
        (a, b)
    }

    fn sent_bytes(action: Action) -> Vec<u8> {
        match action {
            Action::Send(_, bytes) => bytes,
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[test]
    fn frame_spanning_multiple_reads() {
        let (mut a, mut b) = pair();
        let bytes = sent_bytes(
            a.send(flag::WHISPER, vec![vec![subflag::WHISPER], b"hello".to_vec()], 100)
                .unwrap(),
        );
        let mut frames = Vec::new();
        for chunk in bytes.chunks(1) {
            frames.extend(b.push_bytes(chunk, 100).unwrap());
        }
        assert_eq!(frames.len(), 1);
        let env = b.decode_frame(&frames[0]).unwrap();
        assert_eq!(env.payload()[1], b"hello");
        assert!(!b.mid_frame());
    }

    #[test]
    fn merged_frames_in_one_read() {
        let (mut a, mut b) = pair();
        let one = sent_bytes(
            a.send(flag::WHISPER, vec![vec![subflag::WHISPER], b"one".to_vec()], 100)
                .unwrap(),
        );
        let two = sent_bytes(
            a.send(flag::WHISPER, vec![vec![subflag::WHISPER], b"two".to_vec()], 101)
                .unwrap(),
        );
        let mut merged = one;
        merged.extend_from_slice(&two);
        let frames = b.push_bytes(&merged, 101).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(b.decode_frame(&frames[0]).unwrap().payload()[1], b"one");
        assert_eq!(b.decode_frame(&frames[1]).unwrap().payload()[1], b"two");
    }

    #[test]
    fn oversized_frame_rejected() {
        let (_, mut b) = pair();
        let declared = (MAX_FRAME_LEN + 1).to_be_bytes();
        assert!(b.push_bytes(&declared, 100).is_err());
    }

    #[test]
    fn resend_replays_last_content() {
        let (mut a, mut b) = pair();
        let first = sent_bytes(
            a.send(
                flag::BROADCAST,
                vec![vec![subflag::BROADCAST], b"payload".to_vec()],
                100,
            )
            .unwrap(),
        );
        let frame = b.push_bytes(&first, 100).unwrap().remove(0);
        let original = b.decode_frame(&frame).unwrap();

        // Peer asks for a resend; the replay carries identical content,
        // id, and timestamp.
        let ask = sent_bytes(
            b.send(flag::RENEGOTIATE, vec![vec![subflag::RESEND]], 105)
                .unwrap(),
        );
        let frame = a.push_bytes(&ask, 105).unwrap().remove(0);
        let ask_env = a.decode_frame(&frame).unwrap();
        let replies = a.handle_renegotiate(&ask_env, 105).expect("claimed");
        assert_eq!(replies.len(), 1);
        let frame = b
            .push_bytes(&sent_bytes(replies[0].clone()), 106)
            .unwrap()
            .remove(0);
        let replay = b.decode_frame(&frame).unwrap();
        assert_eq!(replay.id(), original.id());
        assert_eq!(replay.time(), original.time());
        assert_eq!(replay.payload(), original.payload());
    }

    #[test]
    fn renegotiate_not_remembered_for_resend() {
        let (mut a, _) = pair();
        a.send(
            flag::BROADCAST,
            vec![vec![subflag::BROADCAST], b"real".to_vec()],
            100,
        )
        .unwrap();
        a.send(flag::RENEGOTIATE, vec![vec![subflag::RESEND]], 101)
            .unwrap();
        assert_eq!(
            a.last_sent.as_ref().map(|e| e.kind()),
            Some(flag::BROADCAST)
        );
    }

    #[test]
    fn compression_renegotiate_updates_and_answers() {
        let (mut a, mut b) = pair();
        // Peer advertises zlib; we answer with our intersection.
        let ids = serde_json::to_vec(&[Method::Zlib.wire_id()]).unwrap();
        let offer = sent_bytes(
            b.send(
                flag::RENEGOTIATE,
                vec![vec![subflag::COMPRESSION], ids],
                100,
            )
            .unwrap(),
        );
        let frame = a.push_bytes(&offer, 100).unwrap().remove(0);
        let env = a.decode_frame(&frame).unwrap();
        let replies = a.handle_renegotiate(&env, 100).expect("claimed");
        assert_eq!(a.compression(), &[Method::Zlib]);
        assert_eq!(replies.len(), 1);

        // The same offer again changes nothing and stays silent.
        let again = a.handle_renegotiate(&env, 101).expect("claimed");
        assert!(again.is_empty());
    }

    #[test]
    fn non_renegotiate_not_claimed() {
        let (mut a, mut b) = pair();
        let bytes = sent_bytes(
            a.send(flag::WHISPER, vec![vec![subflag::WHISPER], b"x".to_vec()], 100)
                .unwrap(),
        );
        let frame = b.push_bytes(&bytes, 100).unwrap().remove(0);
        let env = b.decode_frame(&frame).unwrap();
        assert!(b.handle_renegotiate(&env, 100).is_none());
    }
}
