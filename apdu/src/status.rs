// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! ISO 7816-4 / GlobalPlatform status word (`SW1SW2`) dictionary.

use std::fmt;

/// A two-byte card status word.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u8, pub u8);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x90, 0x00);
    pub const MORE_DATA_AVAILABLE: Self = Self(0x61, 0x00);
    pub const WARNING_STATE_UNCHANGED: Self = Self(0x62, 0x83);
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x69, 0x82);
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x69, 0x85);
    pub const MEMORY_FAILURE: Self = Self(0x65, 0x81);
    pub const INCORRECT_DATA: Self = Self(0x6A, 0x80);
    pub const FILE_NOT_FOUND: Self = Self(0x6A, 0x82);
    pub const INCORRECT_P1P2: Self = Self(0x6A, 0x86);
    pub const WRONG_LENGTH: Self = Self(0x67, 0x00);
    pub const CLASS_NOT_SUPPORTED: Self = Self(0x6E, 0x00);
    pub const INSTRUCTION_NOT_SUPPORTED: Self = Self(0x6D, 0x00);
    pub const UNKNOWN: Self = Self(0x6F, 0x00);

    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(sw1, sw2)
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.0, self.1]
    }

    /// `61xx` ("more data available, SW2 bytes ready") is success at the
    /// transport level as much as the exact `9000`; the card is reporting
    /// available response data, not an error.
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS || self.0 == 0x61
    }

    /// Human-readable name, matching the constants above; `61xx`/`6Cxx`
    /// are named by prefix since `SW2` there carries a length rather than
    /// selecting a distinct condition. Falls back to `None` for anything
    /// else the dictionary does not name explicitly.
    pub fn name(self) -> Option<&'static str> {
        if self.0 == 0x61 {
            return Some("more data available");
        }
        if self.0 == 0x6C {
            return Some("wrong length; reissue with Le = SW2");
        }
        match self {
            Self::SUCCESS => Some("success"),
            Self::WARNING_STATE_UNCHANGED => Some("warning: state unchanged"),
            Self::SECURITY_STATUS_NOT_SATISFIED => Some("security status not satisfied"),
            Self::CONDITIONS_NOT_SATISFIED => Some("conditions of use not satisfied"),
            Self::MEMORY_FAILURE => Some("memory failure"),
            Self::INCORRECT_DATA => Some("incorrect data"),
            Self::FILE_NOT_FOUND => Some("file or application not found"),
            Self::INCORRECT_P1P2 => Some("incorrect P1/P2"),
            Self::WRONG_LENGTH => Some("wrong length"),
            Self::CLASS_NOT_SUPPORTED => Some("class not supported"),
            Self::INSTRUCTION_NOT_SUPPORTED => Some("instruction not supported"),
            Self::UNKNOWN => Some("unknown / no precise diagnosis"),
            _ => None,
        }
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{:02X}{:02X} ({name})", self.0, self.1),
            None => write!(f, "{:02X}{:02X}", self.0, self.1),
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0, self.1)
    }
}
