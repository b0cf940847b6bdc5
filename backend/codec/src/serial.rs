use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{error::CodecError, pepper::Pepper};

pub const MAX_SEQUENCE: u32 = 9999;
pub const HASH_LEN: usize = 6;

const DOMAIN_CSL_V1: &[u8] = b"csl:hash:v1";

// `[0-9]` rather than `\d`, the latter also accepts non-ASCII digits.
static CSL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]{4})-([A-Z]{2,10})-([0-9]{4})-([A-Z0-9]{6})$").expect("valid CSL regex")
});

static COURSE_CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2,10}$").expect("valid course code regex"));

/// Fields recovered from a structurally valid CSL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCsl {
    pub year: u32,
    pub course_code: String,
    pub sequence: u32,
    pub hash: String,
}

impl ParsedCsl {
    /// `YYYY-CC-NNNN`, the part the hash is computed over.
    pub fn core(&self) -> String {
        core_string(self.year, &self.course_code, self.sequence)
    }
}

fn core_string(year: u32, course_code: &str, sequence: u32) -> String {
    format!("{year:04}-{course_code}-{sequence:04}")
}

/// Normalizes a course code the way issuance stores it.
pub fn normalize_course_code(course_code: &str) -> Result<String, CodecError> {
    let upper = course_code.to_ascii_uppercase();

    if !COURSE_CODE_PATTERN.is_match(&upper) {
        return Err(CodecError::InvalidCourseCode(course_code.to_string()));
    }

    Ok(upper)
}

pub fn format(year: u32, course_code: &str, sequence: u32) -> Result<String, CodecError> {
    if !(1000..=9999).contains(&year) {
        return Err(CodecError::InvalidYear(year));
    }

    if sequence == 0 || sequence > MAX_SEQUENCE {
        return Err(CodecError::InvalidSequence(sequence));
    }

    let course_code = normalize_course_code(course_code)?;

    Ok(core_string(year, &course_code, sequence))
}

pub fn compute_hash(core: &str, owner_id: u64, pepper: &Pepper) -> String {
    let owner = owner_id.to_string();

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_CSL_V1);
    for field in [core.as_bytes(), owner.as_bytes(), pepper.as_bytes()] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }

    // truncation happens on the encoded digest, never on the input
    let mut encoded = hex::encode_upper(hasher.finalize());
    encoded.truncate(HASH_LEN);
    encoded
}

pub fn mint(
    year: u32,
    course_code: &str,
    sequence: u32,
    owner_id: u64,
    pepper: &Pepper,
) -> Result<String, CodecError> {
    let core = format(year, course_code, sequence)?;
    let hash = compute_hash(&core, owner_id, pepper);

    Ok(format!("{core}-{hash}"))
}

pub fn validate_format(csl: &str) -> bool {
    CSL_PATTERN.is_match(csl)
}

pub fn parse(csl: &str) -> Option<ParsedCsl> {
    let captures = CSL_PATTERN.captures(csl)?;

    Some(ParsedCsl {
        year: captures[1].parse().ok()?,
        course_code: captures[2].to_string(),
        sequence: captures[3].parse().ok()?,
        hash: captures[4].to_string(),
    })
}

/// Payload for the QR code printed on the certificate.
pub fn verification_url(base_url: &str, csl: &str) -> String {
    format!("{}/verify?csl={csl}", base_url.trim_end_matches('/'))
}
