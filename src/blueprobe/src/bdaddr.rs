use serde::{Deserialize, Serialize};
use std::fmt;

/// A 6-byte Bluetooth device address in display (big-endian) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const ZERO: BdAddr = BdAddr([0; 6]);

    /// Controllers keep addresses least-significant byte first.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        let mut addr: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        addr.reverse();
        Some(BdAddr(addr))
    }

    pub fn to_le_bytes(self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}
