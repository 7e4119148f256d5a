// Copyright (c) 2024 The SCP81 Admin Harness Authors

/// Errors raised while encoding or decoding an APDU.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ApduError {
    /// Buffer too short to contain a valid APDU header
    #[error("APDU shorter than the 4-byte header")]
    TooShort,

    /// `Lc` declared more data than the buffer actually carries
    #[error("Lc exceeds the remaining buffer")]
    TruncatedBody,

    /// Encoded command exceeds the extended-form payload limit (65535 bytes)
    #[error("command data exceeds 65535 bytes")]
    PayloadTooLarge,

    /// Trailing bytes after `Lc`/data don't form a valid `Le` field
    #[error("malformed Le field")]
    MalformedLength,

    /// Response carried fewer than the 2 mandatory status bytes
    #[error("response shorter than SW1SW2")]
    MissingStatus,
}
