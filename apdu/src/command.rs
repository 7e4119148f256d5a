// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! ISO 7816-4 command APDU (Case 1-4, short and extended form) encode/decode.

use crate::error::ApduError;

/// A command APDU (C-APDU), as carried verbatim inside an Admin HTTP
/// request body.
///
/// Short-form (single-byte `Lc`/`Le`) and extended-form (3-byte `Lc`,
/// 2-byte `Le`) are both supported; `encode` picks the form a real card
/// reader would, by payload size, and `decode` tells them apart by the
/// ISO 7816-4 `00` extended-length marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Expected response length (`Le`); `None` for Case 1/3 (no response
    /// data requested), `Some(0)` means "as much as the card will give",
    /// matching the ISO 7816-4 convention that an `Le` byte/field of
    /// `0x00` requests the maximum the active form allows.
    pub le: Option<u16>,
}

impl CommandApdu {
    /// Short-form payload ceiling; above this, `encode` switches to the
    /// extended (3-byte `Lc`) form.
    pub const MAX_DATA_LEN: usize = 255;

    /// Extended-form payload ceiling (2-byte `Lc`).
    pub const MAX_EXTENDED_DATA_LEN: usize = 65_535;

    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2, data: Vec::new(), le: None }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Result<Self, ApduError> {
        if data.len() > Self::MAX_EXTENDED_DATA_LEN {
            return Err(ApduError::PayloadTooLarge);
        }
        self.data = data;
        Ok(self)
    }

    pub fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// Encode per ISO 7816-4. Short form: `CLA INS P1 P2 [Lc Data] [Le]`.
    /// Extended form, used once `data` exceeds [`Self::MAX_DATA_LEN`] or
    /// `le` exceeds what a single byte can carry: `CLA INS P1 P2 [00 Lc1
    /// Lc2 Data] [Le1 Le2]`, with the leading `00` written once even
    /// when both `Lc` and `Le` are present (Case 4E).
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        if self.data.len() > Self::MAX_EXTENDED_DATA_LEN {
            return Err(ApduError::PayloadTooLarge);
        }

        let extended = self.data.len() > Self::MAX_DATA_LEN || self.le.is_some_and(|le| le > 256);

        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 2);
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if extended {
            if !self.data.is_empty() {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                if self.data.is_empty() {
                    out.push(0x00);
                }
                out.extend_from_slice(&le.to_be_bytes());
            }
        } else {
            if !self.data.is_empty() {
                out.push(self.data.len() as u8);
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                out.push(le as u8);
            }
        }

        Ok(out)
    }

    /// Decode a command APDU, distinguishing the four ISO 7816-4 cases
    /// (and their extended variants) by the trailing bytes after the
    /// header. A leading `00` in those trailing bytes with at least one
    /// more byte following is the extended-length marker: short-form
    /// `encode` never emits a bare `Lc` of `0x00` (an empty `data` omits
    /// `Lc` entirely), so the marker is unambiguous for this codec's own
    /// output.
    pub fn decode(buf: &[u8]) -> Result<Self, ApduError> {
        if buf.len() < 4 {
            return Err(ApduError::TooShort);
        }

        let (cla, ins, p1, p2) = (buf[0], buf[1], buf[2], buf[3]);
        let rest = &buf[4..];

        if rest.len() >= 2 && rest[0] == 0x00 {
            return Self::decode_extended(cla, ins, p1, p2, rest);
        }

        match rest.len() {
            0 => Ok(Self { cla, ins, p1, p2, data: Vec::new(), le: None }),
            1 => Ok(Self { cla, ins, p1, p2, data: Vec::new(), le: Some(rest[0] as u16) }),
            _ => {
                let lc = rest[0] as usize;
                let body = &rest[1..];
                if body.len() < lc {
                    return Err(ApduError::TruncatedBody);
                }
                let data = body[..lc].to_vec();
                let le = match body.len() - lc {
                    0 => None,
                    1 => Some(body[lc] as u16),
                    _ => return Err(ApduError::MalformedLength),
                };
                log::trace!("decoded APDU ins={ins:02X} lc={lc} le={le:?}");
                Ok(Self { cla, ins, p1, p2, data, le })
            }
        }
    }

    fn decode_extended(cla: u8, ins: u8, p1: u8, p2: u8, rest: &[u8]) -> Result<Self, ApduError> {
        if rest.len() == 3 {
            let le = u16::from_be_bytes([rest[1], rest[2]]);
            return Ok(Self { cla, ins, p1, p2, data: Vec::new(), le: Some(le) });
        }
        if rest.len() < 3 {
            return Err(ApduError::MalformedLength);
        }

        let lc = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        let body = &rest[3..];
        if body.len() < lc {
            return Err(ApduError::TruncatedBody);
        }
        let data = body[..lc].to_vec();
        let le = match body.len() - lc {
            0 => None,
            2 => Some(u16::from_be_bytes([body[lc], body[lc + 1]])),
            _ => return Err(ApduError::MalformedLength),
        };
        log::trace!("decoded extended APDU ins={ins:02X} lc={lc} le={le:?}");
        Ok(Self { cla, ins, p1, p2, data, le })
    }
}
