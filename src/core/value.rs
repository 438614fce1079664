use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::core::errors::*;

/// Immutable byte blob ordered byte-lexicographically.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Value {
    data: Arc<[u8]>,
}

impl Value {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn starts_with(&self, prefix: &Value) -> bool {
        self.data.starts_with(&prefix.data)
    }

    /// Index of the first byte where the two values differ, or the length of
    /// the shorter one when one is a prefix of the other.
    pub fn mismatch(&self, other: &Value) -> usize {
        self.data
            .iter()
            .zip(other.data.iter())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| self.len().min(other.len()))
    }

    /// Copy of the first `len` bytes (clamped to the value length).
    pub fn prefix(&self, len: usize) -> Value {
        Value::from(&self.data[..len.min(self.len())])
    }

    /// Java-style hash over signed bytes, stored in page headers as `keyHash`.
    pub fn hash_code(&self) -> i32 {
        self.data
            .iter()
            .fold(0i32, |h, &b| h.wrapping_mul(31).wrapping_add(b as i8 as i32))
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.data)?;
        Ok(())
    }

    pub fn read_from<R: Read>(input: &mut R, len: usize) -> Result<Self> {
        let mut buf = vec![0u8; len];
        input.read_exact(&mut buf)?;
        Ok(Value::from(buf))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.data) {
            Ok(s) => write!(f, "Value({:?})", s),
            Err(_) => write!(f, "Value({:02x?})", &self.data[..]),
        }
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<&[u8]> for Value {
    fn from(data: &[u8]) -> Self {
        Self { data: data.into() }
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(data: &[u8; N]) -> Self {
        Self { data: data[..].into() }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::from(s.into_bytes())
    }
}

/// Page key: a value positioned in the key region of a page header.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    value: Value,
}

impl Key {
    pub fn new(value: impl Into<Value>) -> Self {
        Self { value: value.into() }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn hash_code(&self) -> i32 {
        self.value.hash_code()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s)
    }
}
