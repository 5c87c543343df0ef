//! Errors produced by the engine's public operations.
//!
//! Every rejected mutation carries the zone name and, where relevant, the
//! offending operand, so a caller can build a useful message without
//! re-deriving context the engine already had.

use std::fmt;

use domain::base::Rtype;

use crate::rr::StoredName;

/// An error returned by a public engine operation.
#[derive(Clone, Debug)]
pub enum EngineError {
    /// The requested operation is not valid in the zone's current state, or
    /// would violate an apex-only constraint.
    InvalidOperation { zone: StoredName, reason: String },

    /// The supplied RRSet violates TTL/class uniformity or contains
    /// duplicate RDATA.
    InvalidRRSet { zone: StoredName, reason: String },

    /// A parameter (NSEC3 iterations, salt length, TTL, ...) was outside its
    /// allowed range.
    InvalidParameter {
        zone: StoredName,
        parameter: String,
        reason: String,
    },

    /// The requested algorithm is not supported for signing.
    UnsupportedAlgorithm { zone: StoredName, algorithm: String },

    /// The given record type cannot exist in a signed zone.
    UnsupportedInSignedZone { zone: StoredName, rtype: Rtype },

    /// `sign-zone` was called on a zone that is already signed.
    ZoneAlreadySigned { zone: StoredName },

    /// An operation that requires a signed zone was called on an unsigned
    /// one.
    ZoneNotSigned { zone: StoredName },

    /// No key in the registry is eligible to sign the given RRset type.
    NoSigningKey { zone: StoredName, rtype: Rtype },

    /// Key generation could not find a free key tag after retrying.
    TagCollision { zone: StoredName },

    /// The given key tag does not exist in the zone's key registry.
    KeyNotFound { zone: StoredName, key_tag: u16 },

    /// A key cannot retire because no safe successor exists yet.
    SuccessorMissing { zone: StoredName, key_tag: u16 },

    /// An attempt to publish a DNSKEY that is already present.
    DuplicateKey { zone: StoredName, key_tag: u16 },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOperation { zone, reason } => {
                write!(f, "zone '{zone}': invalid operation: {reason}")
            }
            Self::InvalidRRSet { zone, reason } => {
                write!(f, "zone '{zone}': invalid RRset: {reason}")
            }
            Self::InvalidParameter {
                zone,
                parameter,
                reason,
            } => {
                write!(
                    f,
                    "zone '{zone}': invalid parameter '{parameter}': {reason}"
                )
            }
            Self::UnsupportedAlgorithm { zone, algorithm } => {
                write!(f, "zone '{zone}': unsupported algorithm '{algorithm}'")
            }
            Self::UnsupportedInSignedZone { zone, rtype } => {
                write!(
                    f,
                    "zone '{zone}': record type {rtype} is not supported in a signed zone"
                )
            }
            Self::ZoneAlreadySigned { zone } => {
                write!(f, "zone '{zone}' is already signed")
            }
            Self::ZoneNotSigned { zone } => {
                write!(f, "zone '{zone}' is not signed")
            }
            Self::NoSigningKey { zone, rtype } => {
                write!(
                    f,
                    "zone '{zone}': no eligible signing key for record type {rtype}"
                )
            }
            Self::TagCollision { zone } => {
                write!(f, "zone '{zone}': could not allocate a unique key tag")
            }
            Self::KeyNotFound { zone, key_tag } => {
                write!(f, "zone '{zone}': no key with tag {key_tag}")
            }
            Self::SuccessorMissing { zone, key_tag } => {
                write!(
                    f,
                    "zone '{zone}': key {key_tag} has no safe successor to retire to"
                )
            }
            Self::DuplicateKey { zone, key_tag } => {
                write!(f, "zone '{zone}': key {key_tag} is already published")
            }
        }
    }
}

impl std::error::Error for EngineError {}
