//! # CSL Codec
//!
//! Pure construction, parsing and verification of certificate serial numbers.
//!
//! ## Format
//!
//! `YYYY-CC-NNNN-HHHHHH`
//! - `YYYY`: issue year, 4 digits
//! - `CC`: course code, 2 to 10 uppercase letters
//! - `NNNN`: sequence inside the (year, course code) partition, zero padded
//! - `HHHHHH`: verification hash, uppercase hex
//!
//! The first three fields form the **core string**. The hash is a SHA-256 digest over the core,
//! the owner (student) id and the server pepper, hex encoded and cut to 6 characters.
//!
//! ## Notes
//! - No I/O in here. Storage lookups are handed in by the caller as a closure or as an
//!   already resolved [`Linked`] record.
//! - Every character of a CSL is URL safe, so it goes into `/verify?csl=` untouched.
//! - A partition holds at most 9999 certificates. The codec refuses anything wider.

pub mod error;
pub mod pepper;
pub mod serial;
pub mod status;
pub mod verify;

pub use error::CodecError;
pub use pepper::Pepper;
pub use serial::{
    HASH_LEN, MAX_SEQUENCE, ParsedCsl, compute_hash, format, mint, normalize_course_code, parse,
    validate_format, verification_url,
};
pub use status::Status;
pub use verify::{Linked, Reason, Verdict, verify, verify_parsed};
