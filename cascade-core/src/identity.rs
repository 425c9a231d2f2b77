//! Node and message identifiers: 384-bit digests carried as base58 text.

use sha2::{Digest, Sha384};

use crate::base58::{self, Base58Error};
use crate::protocol::PeerAddr;

/// Identifier width in bytes (SHA-384 output).
pub const ID_LEN: usize = 48;

/// A node's identity on the overlay. Derived once at startup from the bind
/// address, the protocol fingerprint, and a random salt; immutable for the
/// process lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub fn derive(out_addr: &PeerAddr, protocol_id: &str, salt: &[u8]) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(out_addr.host.as_bytes());
        hasher.update(out_addr.port.to_be_bytes());
        hasher.update(protocol_id.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest);
        NodeId(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The wire form: base58 text of the raw digest.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(text: &str) -> Result<Self, Base58Error> {
        Ok(NodeId(decode_fixed(text)?))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.to_base58())
    }
}

/// A message's checksum identity: SHA-384 over the payload packets plus the
/// base58 timestamp. Excludes the type flag, so a relayed copy keeps its id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    pub fn compute(payload: &[Vec<u8>], time: u64) -> Self {
        let mut hasher = Sha384::new();
        for packet in payload {
            hasher.update(packet);
        }
        hasher.update(base58::to_base58(time).as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest);
        MessageId(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(text: &str) -> Result<Self, Base58Error> {
        Ok(MessageId(decode_fixed(text)?))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", self.to_base58())
    }
}

/// Fresh random salt for id derivation, one per process.
pub fn random_salt() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

fn decode_fixed(text: &str) -> Result<[u8; ID_LEN], Base58Error> {
    let bytes = bs58::decode(text)
        .into_vec()
        .map_err(Base58Error::InvalidCharacter)?;
    if bytes.len() != ID_LEN {
        return Err(Base58Error::BadLength {
            expected: ID_LEN,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; ID_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrip() {
        let addr = PeerAddr::new("10.0.0.1", 4444);
        let id = NodeId::derive(&addr, "fingerprint", &random_salt());
        assert_eq!(NodeId::from_base58(&id.to_base58()).unwrap(), id);
    }

    #[test]
    fn salt_separates_ids() {
        let addr = PeerAddr::new("10.0.0.1", 4444);
        let a = NodeId::derive(&addr, "fingerprint", &random_salt());
        let b = NodeId::derive(&addr, "fingerprint", &random_salt());
        assert_ne!(a, b);
    }

    #[test]
    fn message_id_covers_payload_and_time() {
        let payload = vec![b"a".to_vec(), b"b".to_vec()];
        let id = MessageId::compute(&payload, 100);
        assert_eq!(MessageId::compute(&payload, 100), id);
        assert_ne!(MessageId::compute(&payload, 101), id);
        assert_ne!(MessageId::compute(&[b"c".to_vec()], 100), id);
    }

    #[test]
    fn leading_zero_digest_roundtrip() {
        // Force a digest-shaped id with leading zero bytes through the text form.
        let mut raw = [0u8; ID_LEN];
        raw[ID_LEN - 1] = 1;
        let text = bs58::encode(raw).into_string();
        let id = NodeId::from_base58(&text).unwrap();
        assert_eq!(id.as_bytes(), &raw);
    }

    #[test]
    fn wrong_length_rejected() {
        let short = bs58::encode([1u8; 16]).into_string();
        assert!(matches!(
            NodeId::from_base58(&short),
            Err(Base58Error::BadLength { .. })
        ));
    }
}
