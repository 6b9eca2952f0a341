/// Identifiers for peers and messages.
///
/// A [`Key`] is a fixed-length opaque byte string. Keys double as points in
/// an XOR metric space: the XOR of two keys, compared lexicographically, is
/// their distance.
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::TransportError;

/// Length in bytes of every key on the network.
pub const KEY_LEN: usize = 16;

/// The "unknown / absent" key (all zero bytes).
///
/// [`KeyGenerator`] never hands it out, so it never equals a real identity.
pub const NULL_KEY: Key = Key([0u8; KEY_LEN]);

/// Peer or message identifier.
///
/// Ordering is lexicographic over the bytes, which is what closest-peer
/// ranking relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, which must be exactly [`KEY_LEN`] bytes.
    ///
    /// An empty slice is accepted and yields [`NULL_KEY`].
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.is_empty() {
            return Ok(NULL_KEY);
        }
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            TransportError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Whether this is [`NULL_KEY`].
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Byte-exact comparison.
    pub fn equals(&self, other: &Key) -> bool {
        self == other
    }

    /// Element-wise XOR.
    pub fn xor(&self, other: &Key) -> Key {
        let mut out = [0u8; KEY_LEN];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Key(out)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Key(null)");
        }
        let hex = hex::encode(self.0);
        write!(f, "Key({}...)", &hex[..12])
    }
}

impl FromStr for Key {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| TransportError::InvalidKey(format!("{s}: {e}")))?;
        Self::try_from_slice(&bytes)
    }
}

// The null key travels as an empty byte string, like an unset key would.
impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_null() {
            serializer.serialize_bytes(&[])
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(KeyVisitor)
    }
}

struct KeyVisitor;

impl<'de> Visitor<'de> for KeyVisitor {
    type Value = Key;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{KEY_LEN} bytes or an empty byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Key, E> {
        Key::try_from_slice(v).map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Key, E> {
        Ok(NULL_KEY)
    }

    fn visit_none<E: de::Error>(self) -> Result<Key, E> {
        Ok(NULL_KEY)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Key, A::Error> {
        let mut bytes = Vec::with_capacity(KEY_LEN);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        Key::try_from_slice(&bytes).map_err(de::Error::custom)
    }
}

// ── KeyGenerator ─────────────────────────────────────────────────────────

/// Source of fresh keys.
///
/// Each key is the truncated SHA-256 of a random 64-bit value drawn from a
/// seeded generator. Clones share the same generator, so one instance can be
/// handed to every component of a process.
#[derive(Clone)]
pub struct KeyGenerator {
    rng: Arc<Mutex<StdRng>>,
}

impl KeyGenerator {
    /// Seed from the wall clock.
    pub fn from_clock() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::seeded(seed)
    }

    /// Deterministic generator (tests, reproducible simulations).
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Produce a new key. Never returns [`NULL_KEY`].
    pub fn generate(&self) -> Key {
        loop {
            let value: u64 = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                rng.random()
            };
            let digest = Sha256::digest(value.to_le_bytes());
            let mut bytes = [0u8; KEY_LEN];
            bytes.copy_from_slice(&digest[..KEY_LEN]);
            let key = Key(bytes);
            if !key.is_null() {
                return key;
            }
        }
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> Key {
        Key::from_bytes([fill; KEY_LEN])
    }

    #[test]
    fn xor_is_commutative_and_self_cancels() {
        let keys = KeyGenerator::seeded(7);
        let a = keys.generate();
        let b = keys.generate();

        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), NULL_KEY);
        assert!(a.xor(&a).is_null());
    }

    #[test]
    fn null_key_equality() {
        assert!(NULL_KEY.equals(&NULL_KEY));
        let real = KeyGenerator::seeded(1).generate();
        assert!(!real.equals(&NULL_KEY));
        assert!(!NULL_KEY.equals(&real));
    }

    #[test]
    fn distinct_keys_are_not_equal() {
        let keys = KeyGenerator::seeded(42);
        let a = keys.generate();
        let b = keys.generate();
        assert_ne!(a, b);
        assert!(!a.equals(&b));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut low = [0u8; KEY_LEN];
        low[0] = 1;
        let mut high = [0u8; KEY_LEN];
        high[1] = 0xff;
        // first byte decides, regardless of later bytes
        assert!(Key::from_bytes(high) < Key::from_bytes(low));

        let mut sorted = vec![key(3), key(1), key(2)];
        sorted.sort();
        assert_eq!(sorted, vec![key(1), key(2), key(3)]);
    }

    #[test]
    fn seeded_generators_are_reproducible() {
        let a = KeyGenerator::seeded(99);
        let b = KeyGenerator::seeded(99);
        assert_eq!(a.generate(), b.generate());
        assert_eq!(a.generate(), b.generate());
    }

    #[test]
    fn clones_share_the_generator() {
        let a = KeyGenerator::seeded(5);
        let b = a.clone();
        let first = a.generate();
        let second = b.generate();
        assert_ne!(first, second);
    }

    #[test]
    fn display_and_parse() {
        let k = KeyGenerator::seeded(3).generate();
        let s = k.to_string();
        assert_eq!(s.len(), KEY_LEN * 2);
        let parsed: Key = s.parse().unwrap();
        assert_eq!(parsed, k);

        assert!("abcd".parse::<Key>().is_err());
        assert!("not hex".parse::<Key>().is_err());
    }

    #[test]
    fn try_from_slice_lengths() {
        assert_eq!(Key::try_from_slice(&[]).unwrap(), NULL_KEY);
        assert_eq!(Key::try_from_slice(&[9u8; KEY_LEN]).unwrap(), key(9));
        assert!(Key::try_from_slice(&[1u8; 8]).is_err());
        assert!(Key::try_from_slice(&[1u8; 32]).is_err());
    }

    #[test]
    fn msgpack_encodes_bin() {
        let k = key(0xab);
        let bytes = rmp_serde::to_vec(&k).unwrap();
        // bin8 marker, length, payload
        assert_eq!(bytes[0], 0xc4);
        assert_eq!(bytes[1] as usize, KEY_LEN);
        let decoded: Key = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, k);

        let null = rmp_serde::to_vec(&NULL_KEY).unwrap();
        assert_eq!(null, vec![0xc4, 0x00]);
        let decoded: Key = rmp_serde::from_slice(&null).unwrap();
        assert!(decoded.is_null());
    }
}
