//! EMM Message Handling
//!
//! Decoding of the Identity Response and hand-off to the identification
//! procedure.

use crate::context::UeId;
use crate::engine::EmmEngine;
use crate::error::{EmmError, EmmResult};
use crate::identification::LearnedIdentity;

/// Mobile identity type values (TS 24.301 9.9.2.3)
const MOBILE_IDENTITY_IMSI: u8 = 1;
const MOBILE_IDENTITY_IMEI: u8 = 2;
const MOBILE_IDENTITY_IMEISV: u8 = 3;
const MOBILE_IDENTITY_TMSI: u8 = 4;

// ============================================================================
// Identity Response Handling
// ============================================================================

/// Decode the body of an Identity Response (the length-prefixed mobile
/// identity following the message header)
pub fn parse_identity_response(data: &[u8]) -> EmmResult<LearnedIdentity> {
    let Some((&identity_len, rest)) = data.split_first() else {
        return Err(EmmError::InvalidMessage("Identity response empty".into()));
    };

    let identity_len = identity_len as usize;
    if identity_len == 0 || rest.len() < identity_len {
        return Err(EmmError::InvalidMessage("Invalid identity length".into()));
    }

    let identity_data = &rest[..identity_len];
    let identity_type = identity_data[0] & 0x07;

    match identity_type {
        MOBILE_IDENTITY_IMSI => Ok(LearnedIdentity::Imsi(decode_bcd(identity_data)?)),
        MOBILE_IDENTITY_IMEI => Ok(LearnedIdentity::Imei(decode_bcd(identity_data)?)),
        MOBILE_IDENTITY_IMEISV => Ok(LearnedIdentity::Imeisv(decode_bcd(identity_data)?)),
        MOBILE_IDENTITY_TMSI => {
            let octets: [u8; 4] = identity_data
                .get(1..5)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| EmmError::InvalidMessage("Invalid TMSI length".into()))?;
            Ok(LearnedIdentity::Tmsi(u32::from_be_bytes(octets)))
        }
        other => Err(EmmError::InvalidMessage(format!(
            "Unknown identity type: {}",
            other
        ))),
    }
}

/// Handle an Identity Response received from `ue_id`
pub fn handle_identity_response(engine: &EmmEngine, ue_id: UeId, data: &[u8]) -> EmmResult<()> {
    let identity = parse_identity_response(data)?;
    log::info!("[ue_id={}] Identity response: {}", ue_id, identity);
    engine.identification_complete(ue_id, identity)
}

/// Decode mobile identity digits from BCD format. The first digit sits in
/// the high nibble of the type octet; 0xF is filler.
fn decode_bcd(data: &[u8]) -> EmmResult<String> {
    let Some((&first, rest)) = data.split_first() else {
        return Err(EmmError::InvalidMessage("Empty identity data".into()));
    };

    let mut digits = String::with_capacity(16);

    let first_digit = (first >> 4) & 0x0f;
    if first_digit < 10 {
        digits.push((b'0' + first_digit) as char);
    }

    for &byte in rest {
        for nibble in [byte & 0x0f, (byte >> 4) & 0x0f] {
            if nibble < 10 {
                digits.push((b'0' + nibble) as char);
            }
        }
    }

    if digits.is_empty() {
        return Err(EmmError::InvalidMessage("Identity has no digits".into()));
    }
    Ok(digits)
}
