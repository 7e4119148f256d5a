// Copyright (c) 2024 The SCP81 Admin Harness Authors

use num_enum::TryFromPrimitive;
use strum::{Display, EnumString};

/// GlobalPlatform Amendment B administration class byte.
pub const CLA_GP: u8 = 0x80;

/// ISO 7816-4 class byte used for SELECT / GET DATA / GET STATUS.
pub const CLA_ISO: u8 = 0x00;

/// GlobalPlatform / ISO 7816-4 instruction codes a card applet reachable
/// over SCP81 must recognise.
///
/// Covers `SELECT`, `GET DATA`, `GET STATUS`, `INSTALL`, `DELETE`,
/// `INITIALIZE UPDATE`, and `EXTERNAL AUTHENTICATE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    Select = 0xA4,
    GetData = 0xCA,
    GetStatus = 0xF2,
    Install = 0xE6,
    Delete = 0xE4,
    InitializeUpdate = 0x50,
    ExternalAuthenticate = 0x82,
}
