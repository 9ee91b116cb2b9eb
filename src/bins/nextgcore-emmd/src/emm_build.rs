//! EMM Message Building
//!
//! EMM cause codes, requestable identity types and Identity Request encoding.

use std::fmt;

use crate::error::EmmError;

// ============================================================================
// EMM Cause Codes (3GPP TS 24.301)
// ============================================================================

/// EMM Cause codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmmCause {
    /// Illegal UE
    IllegalUe = 3,
}

// ============================================================================
// NAS Message Types
// ============================================================================

/// NAS Protocol Discriminator
pub const NAS_PROTOCOL_DISCRIMINATOR_EMM: u8 = 0x07;

/// EMM message types sent by the identification procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NasEpsMessageType {
    /// Identity request
    IdentityRequest = 0x55,
}

// ============================================================================
// Identity Types
// ============================================================================

/// Identity type the network may request with an Identity Request.
///
/// TMSI (4) has no variant: the network never asks for a temporary identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestedIdentityType {
    /// IMSI
    Imsi = 1,
    /// IMEI
    Imei = 2,
    /// IMEISV
    Imeisv = 3,
}

impl TryFrom<u8> for RequestedIdentityType {
    type Error = EmmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Imsi),
            2 => Ok(Self::Imei),
            3 => Ok(Self::Imeisv),
            other => Err(EmmError::UnsupportedIdentityType(other)),
        }
    }
}

impl fmt::Display for RequestedIdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imsi => write!(f, "IMSI"),
            Self::Imei => write!(f, "IMEI"),
            Self::Imeisv => write!(f, "IMEISV"),
        }
    }
}

// ============================================================================
// NAS Buffer
// ============================================================================

/// NAS message buffer
#[derive(Debug, Clone, Default)]
pub struct NasBuffer {
    /// Message data
    pub data: Vec<u8>,
}

impl NasBuffer {
    /// Create new buffer
    pub fn new() -> Self {
        Self { data: Vec::with_capacity(16) }
    }

    /// Write byte
    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Get data
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

// ============================================================================
// Message Building
// ============================================================================

/// Build a plain Identity Request
pub fn build_identity_request(identity_type: RequestedIdentityType) -> Vec<u8> {
    let mut buf = NasBuffer::new();

    buf.write_u8(NAS_PROTOCOL_DISCRIMINATOR_EMM);
    buf.write_u8(NasEpsMessageType::IdentityRequest as u8);

    // Identity type (low 3 bits), spare high half-octet
    buf.write_u8(identity_type as u8);

    buf.into_vec()
}
