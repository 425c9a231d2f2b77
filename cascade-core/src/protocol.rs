//! Overlay compatibility: the subnet descriptor, its hash fingerprint, and
//! the fixed wire flag tables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current wire version. Folded into the protocol fingerprint, so nodes
/// speaking different wire versions never see each other as compatible.
pub const PROTOCOL_VERSION: &str = "0.5";

/// Main flags: packet 0 of every envelope.
pub mod flag {
    pub const BROADCAST: u8 = 0x00;
    pub const RENEGOTIATE: u8 = 0x01;
    pub const WHISPER: u8 = 0x02;
    /// Reserved, unused.
    pub const PING: u8 = 0x03;
    /// Reserved, unused.
    pub const PONG: u8 = 0x04;
}

/// Sub-flags: the first payload packet. Read from a different packet position
/// than the main flags, so the overlapping byte values never meet.
///
/// `STORE` through `DELTA` are reserved for layered protocols (key/value
/// store, sync, path-vector routing) registering through the handler chain.
pub mod subflag {
    pub const BROADCAST: u8 = 0x00;
    pub const COMPRESSION: u8 = 0x01;
    pub const WHISPER: u8 = 0x02;
    pub const PING: u8 = 0x03;
    pub const PONG: u8 = 0x04;
    pub const HANDSHAKE: u8 = 0x05;
    pub const NOTIFY: u8 = 0x06;
    pub const PEERS: u8 = 0x07;
    pub const REQUEST: u8 = 0x08;
    pub const RESEND: u8 = 0x09;
    pub const RESPONSE: u8 = 0x0A;
    pub const STORE: u8 = 0x0B;
    pub const RETRIEVE: u8 = 0x0C;
    pub const RETRIEVED: u8 = 0x0D;
    pub const FORWARD: u8 = 0x0E;
    pub const NEW_PATHS: u8 = 0x0F;
    pub const REVOKE_PATHS: u8 = 0x10;
    pub const DELTA: u8 = 0x11;
}

/// A peer's outward-facing address, as advertised in handshake and gossip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Service descriptor: a subnet name plus an encryption method name.
///
/// Its `id` is the network's compatibility fingerprint; nodes whose ids
/// differ disconnect at handshake. The encryption field is a token only, the
/// core never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub subnet: String,
    pub encryption: String,
}

impl Protocol {
    pub fn new(subnet: impl Into<String>, encryption: impl Into<String>) -> Self {
        Self {
            subnet: subnet.into(),
            encryption: encryption.into(),
        }
    }

    /// Base58 rendering of `SHA256(subnet ++ encryption ++ PROTOCOL_VERSION)`.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subnet.as_bytes());
        hasher.update(self.encryption.as_bytes());
        hasher.update(PROTOCOL_VERSION.as_bytes());
        bs58::encode(hasher.finalize()).into_string()
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new("mesh", "Plaintext")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Protocol::new("mesh", "Plaintext");
        let b = Protocol::new("mesh", "Plaintext");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn fingerprint_separates_subnets() {
        let a = Protocol::new("mesh1", "Plaintext");
        let b = Protocol::new("mesh2", "Plaintext");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn fingerprint_covers_encryption() {
        let a = Protocol::new("mesh", "Plaintext");
        let b = Protocol::new("mesh", "SSL");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn peer_addr_json_shape() {
        let addr = PeerAddr::new("192.168.1.5", 4444);
        let json = serde_json::to_string(&addr).unwrap();
        let back: PeerAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
