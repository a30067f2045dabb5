//! Row keys.
//!
//! A `Key` is an opaque 128-bit pointer identifying a row. Keys derived from
//! values are deterministic across runs: the same primary-key or grouping
//! values always produce the same key.

use crate::value::Value;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

const SEED_HIGH: u64 = 0xcbf2_9ce4_8422_2325;
const SEED_LOW: u64 = 0x8422_2325_cbf2_9ce4;

/// Unique identifier of a row.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub u128);

/// Writes values into a hasher using an explicit, layout-independent encoding.
fn write_value(hasher: &mut FnvHasher, value: &Value) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Boolean(b) => {
            hasher.write_u8(1);
            hasher.write_u8(*b as u8);
        }
        Value::Int(i) => {
            hasher.write_u8(2);
            hasher.write_i64(*i);
        }
        Value::Float(f) => {
            // Integral floats share the encoding of the equal integer
            if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 {
                hasher.write_u8(2);
                hasher.write_i64(*f as i64);
            } else {
                hasher.write_u8(3);
                hasher.write_u64(f.to_bits());
            }
        }
        Value::String(s) => {
            hasher.write_u8(4);
            hasher.write_u64(s.len() as u64);
            hasher.write(s.as_bytes());
        }
        Value::DateTime(ms) => {
            hasher.write_u8(5);
            hasher.write_i64(*ms);
        }
        Value::Duration(ms) => {
            hasher.write_u8(6);
            hasher.write_i64(*ms);
        }
        Value::Pointer(k) => {
            hasher.write_u8(7);
            hasher.write_u128(k.0);
        }
        Value::Tuple(values) => {
            hasher.write_u8(8);
            hasher.write_u64(values.len() as u64);
            for v in values.iter() {
                write_value(hasher, v);
            }
        }
        Value::Error => hasher.write_u8(9),
    }
}

fn hash_with<F>(f: F) -> Key
where
    F: Fn(&mut FnvHasher),
{
    let mut high = FnvHasher::with_key(SEED_HIGH);
    let mut low = FnvHasher::with_key(SEED_LOW);
    f(&mut high);
    f(&mut low);
    Key(((high.finish() as u128) << 64) | low.finish() as u128)
}

impl Key {
    /// Derives a key from a list of values.
    pub fn for_values(values: &[Value]) -> Self {
        hash_with(|h| {
            h.write_u64(values.len() as u64);
            for v in values {
                write_value(h, v);
            }
        })
    }

    /// Derives a key for a pair of keys, e.g. the output row of a join.
    pub fn for_pair(left: Key, right: Key) -> Self {
        hash_with(|h| {
            h.write_u8(0xfe);
            h.write_u128(left.0);
            h.write_u128(right.0);
        })
    }

    /// Derives a key from this key and a salt value.
    pub fn with_salt(self, salt: &Value) -> Self {
        hash_with(|h| {
            h.write_u8(0xfd);
            h.write_u128(self.0);
            write_value(h, salt);
        })
    }

    /// Key used to mark the absent side of an outer join.
    pub const ABSENT: Key = Key(0);
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{:032X}", self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{:X}", self.0 >> 96)
    }
}

/// Generates keys for rows without a primary key.
///
/// Keys are derived from a source name and a sequence number, so replaying the
/// same source in the same order reproduces the same keys.
#[derive(Debug)]
pub struct KeyGenerator {
    source: Key,
    next: AtomicU64,
}

impl KeyGenerator {
    pub fn new(source_name: &str) -> Self {
        Self {
            source: Key::for_values(&[Value::from(source_name)]),
            next: AtomicU64::new(0),
        }
    }

    /// Returns the next key in the sequence.
    pub fn next_key(&self) -> Key {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        self.source.with_salt(&Value::Int(seq as i64))
    }

    /// Returns the sequence position of the next key.
    pub fn position(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Moves the sequence forward, e.g. after replaying persisted input.
    pub fn set_position(&self, position: u64) {
        self.next.fetch_max(position, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_values_deterministic() {
        let a = Key::for_values(&[Value::Int(1), Value::from("x")]);
        let b = Key::for_values(&[Value::Int(1), Value::from("x")]);
        assert_eq!(a, b);
        assert_ne!(a, Key::for_values(&[Value::from("x"), Value::Int(1)]));
    }

    #[test]
    fn test_for_values_numeric_equivalence() {
        assert_eq!(
            Key::for_values(&[Value::Int(3)]),
            Key::for_values(&[Value::Float(3.0)])
        );
    }

    #[test]
    fn test_for_pair_is_ordered() {
        let a = Key::for_values(&[Value::Int(1)]);
        let b = Key::for_values(&[Value::Int(2)]);
        assert_ne!(Key::for_pair(a, b), Key::for_pair(b, a));
    }

    #[test]
    fn test_generator_replays() {
        let g1 = KeyGenerator::new("events");
        let g2 = KeyGenerator::new("events");
        assert_eq!(g1.next_key(), g2.next_key());
        assert_eq!(g1.next_key(), g2.next_key());
        assert_eq!(g1.position(), 2);

        let g3 = KeyGenerator::new("other");
        assert_ne!(g3.next_key(), KeyGenerator::new("events").next_key());
    }

    #[test]
    fn test_display() {
        let s = Key(255).to_string();
        assert!(s.starts_with('^'));
        assert!(s.ends_with("FF"));
    }
}
