//! # Operator Tooling
//!
//! Admin side of the certificate service, talking to the same store and secrets as the server.
//!
//! ## Commands
//! - `course <id> <code>`: registers the code a course mints under. Codes are normalized to
//!   uppercase and must be 2 to 10 letters. Changing a code later does not touch certificates
//!   already issued, the old code stays baked into their CSL.
//! - `validate <csl>`: structure only, needs no secrets.
//! - `check <csl> --owner <id>`: recomputes the hash for a claimed owner with the configured
//!   peppers, no store access. For support requests where the student id is known.
//! - `verify <csl>`: full verification against the store, same answer as `/verify`.
//! - `stats <year>`: issued certificates per course and per status.
//!
//! ## Notes
//! - Store and peppers come from the same environment as the server, see `server::config`.
//! - `check` and `verify` print the reason in plain words next to the machine reason.
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use codec::{
    Linked, Pepper, Reason, Status, Verdict, normalize_course_code, parse, validate_format,
    verify_parsed,
};
use server::{
    certificates::{CertificateService, SystemClock},
    config::Config,
    state::build_store,
    store::CertificateStore,
};

pub mod utils;

use utils::{describe, render_stats};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register or update the code of a course
    Course { course_id: u64, course_code: String },

    /// Check the structure of a CSL
    Validate { csl: String },

    /// Verify a CSL against a claimed owner without the store
    Check {
        csl: String,

        #[arg(long)]
        owner: u64,

        #[arg(long, default_value = "active")]
        status: Status,
    },

    /// Verify a CSL against the store
    Verify { csl: String },

    /// Issued certificates for a year
    Stats { year: u32 },
}

pub async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Validate { csl } => {
            let valid = validate_format(&csl);
            println!("{csl}: {}", if valid { "well formed" } else { "malformed" });
        }
        Command::Check { csl, owner, status } => {
            let config = Config::load()?;
            let linked = Linked {
                owner_id: owner,
                status,
            };

            let mut peppers = vec![config.pepper];
            peppers.extend(config.retired_peppers);

            let verdict = check_offline(&csl, linked, &peppers);
            println!("{csl}: {}", describe(&verdict));
        }
        Command::Course {
            course_id,
            course_code,
        } => {
            let course_code = normalize_course_code(&course_code)?;
            let config = Config::load()?;
            let store = build_store(&config).await?;

            store
                .register_course(course_id, &course_code)
                .await
                .context("registering course")?;
            println!("Course {course_id} now mints as {course_code}");
        }
        Command::Verify { csl } => {
            let verdict = service().await?.verify(&csl).await?;
            println!("{csl}: {}", describe(&verdict));
        }
        Command::Stats { year } => {
            let stats = service().await?.stats(year).await?;
            print!("{}", render_stats(&stats));
        }
    }

    Ok(())
}

/// Verifies `csl` as if the store had returned `linked`.
pub fn check_offline(csl: &str, linked: Linked, peppers: &[Pepper]) -> Verdict {
    match parse(csl) {
        Some(parsed) => verify_parsed(&parsed, Some(linked), peppers),
        None => Verdict::reject(Reason::Malformed),
    }
}

async fn service() -> anyhow::Result<CertificateService> {
    let config = Config::load()?;
    let store = build_store(&config).await?;

    Ok(CertificateService::new(
        store,
        config.pepper,
        config.retired_peppers,
        Arc::new(SystemClock),
        config.store_timeout,
        config.public_base_url,
    ))
}

#[cfg(test)]
mod tests {
    use codec::mint;

    use super::*;

    fn pepper(secret: &str) -> Pepper {
        Pepper::new(secret).unwrap()
    }

    fn active(owner_id: u64) -> Linked {
        Linked {
            owner_id,
            status: Status::Active,
        }
    }

    #[test]
    fn test_check_offline() {
        let csl = mint(2025, "wd", 4, 42, &pepper("old")).unwrap();
        let peppers = [pepper("new"), pepper("old")];

        assert!(check_offline(&csl, active(42), &peppers).valid);
        assert_eq!(check_offline(&csl, active(7), &peppers).reason, Reason::Tampered);
    }

    #[test]
    fn test_check_offline_malformed() {
        let verdict = check_offline("2025-wd-0004-ABC123", active(42), &[pepper("p")]);

        assert_eq!(verdict, Verdict::reject(Reason::Malformed));
    }
}
