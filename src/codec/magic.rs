//! Magic numbers tagging each entry in a common packet's VLP.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of payload a VLP entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Magic {
    Command,
    Event,
    Telemetry,
    FileBlock,
}

impl Magic {
    pub const ALL: [Magic; 4] = [Magic::Command, Magic::Event, Magic::Telemetry, Magic::FileBlock];

    /// Size of a magic on the wire.
    pub const SIZE: usize = 4;

    pub const fn code(self) -> u32 {
        match self {
            Magic::Command => 0xC000_DEED,
            Magic::Event => 0x0DEA_DBEE,
            Magic::Telemetry => 0x0C00_FFEE,
            Magic::FileBlock => 0xF11E_B10C,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    /// Reads a magic from the first four bytes, if they form a known one.
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        let head: [u8; 4] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        Self::from_code(u32::from_be_bytes(head))
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#010x})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_resolve() {
        for magic in Magic::ALL {
            assert_eq!(Magic::from_code(magic.code()), Some(magic));
            assert_eq!(Magic::peek(&magic.code().to_be_bytes()), Some(magic));
        }
        assert_eq!(Magic::from_code(0xAAAA_AAAA), None);
        assert_eq!(Magic::peek(&[0x0C, 0x00]), None);
    }
}
