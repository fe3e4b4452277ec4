//! Fingerprint engine.
//!
//! Derives a [`CacheKey`] from a [`QueryDescriptor`]. The encoding is a
//! tagged, length-prefixed byte stream fed to SHA-256, so keys stay stable
//! across process restarts and builds (a persistent backend remains valid).

use std::fmt;

use sha2::{Digest, Sha256};

use super::query::{QueryDescriptor, ResultShape, SqlValue};

/// Bumped whenever the encoding below changes.
const FINGERPRINT_VERSION: u8 = 1;

/// Fixed-size digest identifying one cached read.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte, used to pick a backend shard.
    pub(crate) fn shard_hint(&self) -> usize {
        usize::from(self.0[0])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..16])
    }
}

/// Compute the cache key of a read descriptor. Pure.
pub fn fingerprint(descriptor: &QueryDescriptor) -> CacheKey {
    let mut encoder = Encoder::default();
    encoder.tag(FINGERPRINT_VERSION);
    encoder.str(descriptor.database());
    encoder.str(descriptor.sql());
    encoder.shape(descriptor.shape());
    encoder.len(descriptor.params().len());
    for param in descriptor.params() {
        encoder.value(param);
    }

    let digest = encoder.hasher.finalize();
    let mut bytes = [0_u8; 32];
    bytes.copy_from_slice(digest.as_slice());
    CacheKey(bytes)
}

#[derive(Default)]
struct Encoder {
    hasher: Sha256,
}

impl Encoder {
    fn tag(&mut self, tag: u8) {
        self.hasher.update([tag]);
    }

    fn len(&mut self, len: usize) {
        self.hasher.update((len as u64).to_be_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.len(bytes.len());
        self.hasher.update(bytes);
    }

    fn str(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn columns(&mut self, columns: &[String]) {
        self.len(columns.len());
        for column in columns {
            self.str(column);
        }
    }

    fn shape(&mut self, shape: &ResultShape) {
        match shape {
            ResultShape::Rows => self.tag(0),
            ResultShape::Fields(columns) => {
                self.tag(1);
                self.columns(columns);
            }
            ResultShape::Values(columns) => {
                self.tag(2);
                self.columns(columns);
            }
            ResultShape::ValuesList { columns, flat } => {
                self.tag(3);
                self.columns(columns);
                self.tag(u8::from(*flat));
            }
            ResultShape::Aggregate(aliases) => {
                self.tag(4);
                self.columns(aliases);
            }
            ResultShape::Count => self.tag(5),
            ResultShape::Exists => self.tag(6),
        }
    }

    fn value(&mut self, value: &SqlValue) {
        match value {
            SqlValue::Null => self.tag(0),
            SqlValue::Bool(flag) => {
                self.tag(1);
                self.tag(u8::from(*flag));
            }
            SqlValue::Int(number) => {
                self.tag(2);
                self.hasher.update(number.to_be_bytes());
            }
            SqlValue::Float(number) => {
                self.tag(3);
                self.hasher.update(number.to_bits().to_be_bytes());
            }
            SqlValue::Text(text) => {
                self.tag(4);
                self.str(text);
            }
            SqlValue::Bytes(bytes) => {
                self.tag(5);
                self.bytes(bytes);
            }
            SqlValue::Date(date) => {
                self.tag(6);
                self.hasher.update(date.to_julian_day().to_be_bytes());
            }
            SqlValue::Timestamp(moment) => {
                self.tag(7);
                self.hasher.update(moment.unix_timestamp_nanos().to_be_bytes());
                self.hasher
                    .update(moment.offset().whole_seconds().to_be_bytes());
            }
            SqlValue::List(items) => {
                self.tag(8);
                self.len(items.len());
                for item in items {
                    self.value(item);
                }
            }
        }
    }
}
