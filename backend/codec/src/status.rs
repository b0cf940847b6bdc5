use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Lifecycle of an issued certificate. The CSL itself never changes, only this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Revoked,
    Suspended,
    Expired,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Active,
        Status::Revoked,
        Status::Suspended,
        Status::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Revoked => "revoked",
            Status::Suspended => "suspended",
            Status::Expired => "expired",
        }
    }

    /// Revoked and expired are terminal, suspension can be lifted.
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Active, Status::Revoked | Status::Suspended | Status::Expired)
                | (Status::Suspended, Status::Active | Status::Revoked | Status::Expired)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CodecError::UnknownStatus(s.to_string()))
    }
}
