//! Public verification of a presented CSL.
//!
//! Every outcome is a [`Verdict`], never an error, since the input comes from anyone.
//! Checks run cheapest first:
//! 1. structure, no storage and no pepper involved
//! 2. owner lookup through the parsed core fields
//! 3. hash recomputation against the owner, before the stored status is trusted
//! 4. lifecycle status
use std::slice;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{
    pepper::Pepper,
    serial::{ParsedCsl, compute_hash, parse, validate_format},
    status::Status,
};

/// What storage knows about the certificate behind a core string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linked {
    pub owner_id: u64,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Valid,
    Malformed,
    NotFound,
    Tampered,
    Revoked,
    Suspended,
    Expired,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Valid => "valid",
            Reason::Malformed => "malformed",
            Reason::NotFound => "not_found",
            Reason::Tampered => "tampered",
            Reason::Revoked => "revoked",
            Reason::Suspended => "suspended",
            Reason::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    pub reason: Reason,
}

impl Verdict {
    pub fn reject(reason: Reason) -> Self {
        Self {
            valid: false,
            reason,
        }
    }

    fn accept() -> Self {
        Self {
            valid: true,
            reason: Reason::Valid,
        }
    }
}

pub fn verify<F>(csl: &str, lookup: F, pepper: &Pepper) -> Verdict
where
    F: FnOnce(&ParsedCsl) -> Option<Linked>,
{
    if !validate_format(csl) {
        return Verdict::reject(Reason::Malformed);
    }

    let Some(parsed) = parse(csl) else {
        return Verdict::reject(Reason::Malformed);
    };

    let linked = lookup(&parsed);

    verify_parsed(&parsed, linked, slice::from_ref(pepper))
}

/// Checks an already parsed CSL against its resolved record.
///
/// The hash may match any of `peppers`, which lets retired peppers keep older certificates
/// verifiable after a rotation.
pub fn verify_parsed(parsed: &ParsedCsl, linked: Option<Linked>, peppers: &[Pepper]) -> Verdict {
    let Some(linked) = linked else {
        return Verdict::reject(Reason::NotFound);
    };

    let core = parsed.core();
    let authentic = peppers.iter().any(|pepper| {
        let expected = compute_hash(&core, linked.owner_id, pepper);
        bool::from(expected.as_bytes().ct_eq(parsed.hash.as_bytes()))
    });

    if !authentic {
        return Verdict::reject(Reason::Tampered);
    }

    match linked.status {
        Status::Active => Verdict::accept(),
        Status::Revoked => Verdict::reject(Reason::Revoked),
        Status::Suspended => Verdict::reject(Reason::Suspended),
        Status::Expired => Verdict::reject(Reason::Expired),
    }
}
