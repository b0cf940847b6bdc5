use codec::{Reason, Verdict};
use server::store::YearStats;

pub fn describe(verdict: &Verdict) -> String {
    let words = match verdict.reason {
        Reason::Valid => "genuine and active",
        Reason::Malformed => "not a certificate serial",
        Reason::NotFound => "no certificate was issued under this serial",
        Reason::Tampered => "hash does not match, serial was altered or forged",
        Reason::Revoked => "genuine but revoked",
        Reason::Suspended => "genuine but suspended",
        Reason::Expired => "genuine but expired",
    };

    let tag = if verdict.valid { "VALID" } else { "INVALID" };

    format!("{tag} ({}) {words}", verdict.reason.as_str())
}

pub fn render_stats(stats: &YearStats) -> String {
    let mut out = format!("{}: {} issued\n", stats.year, stats.total);

    out.push_str("by course\n");
    for (course_code, count) in &stats.by_course {
        out.push_str(&format!("  {course_code:<10} {count}\n"));
    }

    out.push_str("by status\n");
    for (status, count) in &stats.by_status {
        out.push_str(&format!("  {:<10} {count}\n", status.as_str()));
    }

    out
}
