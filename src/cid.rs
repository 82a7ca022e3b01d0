//! The 16-byte component identifier carried in every packet's root layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A sender's component identifier. Stored as a plain 16-byte array on
/// the wire; `Display` renders it as a UUID for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cid(pub [u8; 16]);

impl Cid {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Cid {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl From<Cid> for [u8; 16] {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_uuid() {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        let cid = Cid::new(bytes);
        assert_eq!(cid.to_string(), "01020304-0506-0708-090a-0b0c0d0e0f10");
    }
}
