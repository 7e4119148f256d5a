// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! The virtual UICC (spec §4.4): a stateful card that dispatches C-APDUs
//! to R-APDUs, shared by the server-side test oracle and the
//! simulator's in-process virtual card.
//!
//! Instruction coverage: `SELECT`, `INSTALL`, `DELETE`, `GET STATUS`,
//! `INITIALIZE UPDATE`, `EXTERNAL AUTHENTICATE`, and `GET DATA`.

use scp81_apdu::{CommandApdu, Instruction, ResponseApdu, StatusWord};

use crate::behavior::{BehaviorController, Outcome};

/// GET DATA tag values the engine recognises (GlobalPlatform / ISO 7816-6
/// common tags).
const TAG_ICCID: u8 = 0x66;
const TAG_CARD_RECOGNITION_DATA: u8 = 0x73;

/// Static profile the virtual card was provisioned with.
#[derive(Clone, Debug)]
pub struct CardProfile {
    pub iccid: [u8; 10],
    pub imsi: [u8; 8],
    pub isd_aid: Vec<u8>,
    pub applets: Vec<Vec<u8>>,
    /// Spec §9 open question: the source accepts any AID on SELECT.
    /// Kept as a configurable strictness flag, default permissive.
    pub strict_aid_matching: bool,
}

impl CardProfile {
    pub fn new(isd_aid: Vec<u8>) -> Self {
        Self {
            iccid: [0; 10],
            imsi: [0; 8],
            isd_aid,
            applets: Vec::new(),
            strict_aid_matching: false,
        }
    }

    fn knows_aid(&self, aid: &[u8]) -> bool {
        aid == self.isd_aid || self.applets.iter().any(|a| a == aid)
    }

    fn is_isd(&self, aid: &[u8]) -> bool {
        aid == self.isd_aid
    }
}

/// The stateful virtual card.
pub struct CardEngine {
    pub profile: CardProfile,
    pub selected_aid: Option<Vec<u8>>,
    behavior: Option<Box<dyn BehaviorController>>,
}

impl CardEngine {
    pub fn new(profile: CardProfile) -> Self {
        Self { profile, selected_aid: None, behavior: None }
    }

    pub fn with_behavior(mut self, behavior: Box<dyn BehaviorController>) -> Self {
        self.behavior = Some(behavior);
        self
    }

    /// Dispatch one C-APDU to an R-APDU, consulting the behavior
    /// controller first (spec §4.4: "Before returning a response the
    /// engine consults a BehaviorController").
    ///
    /// A command with no `Le` (ISO 7816-4 Case 1/3) requests no response
    /// data, so its R-APDU carries the status word alone even if the
    /// handler computed some (e.g. a SELECT's FCI) — this keeps each
    /// R-APDU's length fully determined by the request that produced it,
    /// which the Admin Server relies on to split a batched response body
    /// back into one R-APDU per command.
    pub fn process(&mut self, cmd: &CommandApdu) -> ResponseApdu {
        if let Some(behavior) = self.behavior.as_mut() {
            match behavior.maybe_inject() {
                Outcome::Timeout => {
                    // The caller is responsible for actually sleeping past
                    // its own read deadline; the engine only signals intent
                    // by returning an otherwise-unreachable status so tests
                    // can assert a timeout was requested rather than a
                    // normal dispatch.
                    return ResponseApdu::status_only(StatusWord::UNKNOWN);
                }
                Outcome::InjectError(sw) => return ResponseApdu::status_only(sw),
                Outcome::None => {}
            }
        }

        let mut resp = self.dispatch(cmd);
        if cmd.le.is_none() {
            resp.data.clear();
        }
        resp
    }

    fn dispatch(&mut self, cmd: &CommandApdu) -> ResponseApdu {
        let ins = match Instruction::try_from(cmd.ins) {
            Ok(ins) => ins,
            Err(_) => return ResponseApdu::status_only(StatusWord::INSTRUCTION_NOT_SUPPORTED),
        };

        match ins {
            Instruction::Select => self.select(cmd),
            Instruction::GetStatus => self.get_status(),
            Instruction::GetData => self.get_data(cmd),
            Instruction::Install | Instruction::Delete => {
                // Personalization pipeline is explicitly out of scope
                // (spec §1); acknowledge without mutating card state.
                ResponseApdu::status_only(StatusWord::SUCCESS)
            }
            Instruction::InitializeUpdate | Instruction::ExternalAuthenticate => {
                self.mock_secure_channel(cmd)
            }
        }
    }

    fn select(&mut self, cmd: &CommandApdu) -> ResponseApdu {
        if cmd.p1 != 0x04 {
            return ResponseApdu::status_only(StatusWord::INCORRECT_P1P2);
        }

        let aid = &cmd.data;
        if self.profile.strict_aid_matching && !self.profile.knows_aid(aid) {
            return ResponseApdu::status_only(StatusWord::FILE_NOT_FOUND);
        }

        self.selected_aid = Some(aid.clone());

        let fci = if self.profile.is_isd(aid) {
            let mut fci = vec![TAG_ICCID, self.profile.iccid.len() as u8];
            fci.extend_from_slice(&self.profile.iccid);
            fci
        } else {
            Vec::new()
        };

        ResponseApdu::ok(fci)
    }

    fn get_status(&self) -> ResponseApdu {
        // A minimal, well-formed GlobalPlatform status template: one
        // entry describing the currently selected (or issuer security
        // domain) AID with lifecycle state "selectable" (0x07).
        let aid = self.selected_aid.clone().unwrap_or_else(|| self.profile.isd_aid.clone());
        let mut data = vec![aid.len() as u8];
        data.extend_from_slice(&aid);
        data.push(0x07);
        ResponseApdu::ok(data)
    }

    fn get_data(&self, cmd: &CommandApdu) -> ResponseApdu {
        let tag = cmd.p2;
        match tag {
            TAG_ICCID => ResponseApdu::ok(self.profile.iccid.to_vec()),
            TAG_CARD_RECOGNITION_DATA => {
                let mut data = self.profile.iccid.to_vec();
                data.extend_from_slice(&self.profile.imsi);
                ResponseApdu::ok(data)
            }
            _ => ResponseApdu::status_only(StatusWord::from_bytes(0x6A, 0x88)),
        }
    }

    /// INITIALIZE UPDATE / EXTERNAL AUTHENTICATE: logical no-op (spec §9
    /// open question, left pluggable). Returns a cryptogram-shaped reply
    /// without performing SCP02/SCP03 key derivation.
    fn mock_secure_channel(&self, cmd: &CommandApdu) -> ResponseApdu {
        match Instruction::try_from(cmd.ins).unwrap() {
            Instruction::InitializeUpdate => {
                // key_diversification(10) + key_info(2) + card_challenge(8) + card_cryptogram(8)
                ResponseApdu::ok(vec![0u8; 28])
            }
            _ => ResponseApdu::ok(Vec::new()),
        }
    }
}

/// Pluggable authentication strategy for INITIALIZE UPDATE / EXTERNAL
/// AUTHENTICATE (spec §4.4, §9): the baseline `CardEngine` always uses
/// the mock above; a real deployment can implement this trait to run
/// genuine SCP02/SCP03 and wire it in via [`CardEngine::with_behavior`]-style
/// composition at the call site.
pub trait SecureChannelStrategy: Send {
    fn initialize_update(&mut self, cmd: &CommandApdu) -> ResponseApdu;
    fn external_authenticate(&mut self, cmd: &CommandApdu) -> ResponseApdu;
}
