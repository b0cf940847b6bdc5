use std::collections::BTreeSet;

use anyhow::{Context, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;

/// Fires concurrent issuance requests at a running server and checks that no sequence repeats.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "http://localhost:1111")]
    url: String,

    #[arg(long, default_value_t = 100)]
    count: u64,

    #[arg(long, default_value_t = 1)]
    course_id: u64,

    /// First student id, each request uses the next one
    #[arg(long, default_value_t = 1_000_000)]
    student_base: u64,

    #[arg(long, default_value_t = 0)]
    issuer_id: u64,
}

#[derive(Deserialize)]
struct Issued {
    csl: String,
    sequence: u32,
}

enum Outcome {
    Issued(Issued),
    Rejected(StatusCode, String),
}

async fn issue(client: Client, url: String, args: (u64, u64, u64)) -> anyhow::Result<Outcome> {
    let (student_id, course_id, issuer_id) = args;

    let response = client
        .post(format!("{url}/certificates"))
        .json(&json!({
            "student_id": student_id,
            "course_id": course_id,
            "issuer_id": issuer_id,
        }))
        .send()
        .await
        .context("sending issuance request")?;

    let status = response.status();
    if status != StatusCode::CREATED {
        return Ok(Outcome::Rejected(status, response.text().await?));
    }

    Ok(Outcome::Issued(response.json().await?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let url = args.url.trim_end_matches('/').to_string();

    let pb = ProgressBar::new(args.count);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=> "),
    );
    pb.set_message("Issuing");

    let mut tasks = JoinSet::new();
    for offset in 0..args.count {
        tasks.spawn(issue(
            client.clone(),
            url.clone(),
            (args.student_base + offset, args.course_id, args.issuer_id),
        ));
    }

    let mut sequences = BTreeSet::new();
    let mut repeated = Vec::new();
    let mut rejected = 0;

    while let Some(joined) = tasks.join_next().await {
        match joined?? {
            Outcome::Issued(issued) => {
                if !sequences.insert(issued.sequence) {
                    repeated.push(issued.csl);
                }
            }
            Outcome::Rejected(status, body) => {
                rejected += 1;
                pb.println(format!("Rejected with {status}: {body}"));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("Done");

    println!("\nIssued: {}", sequences.len() + repeated.len());
    println!("Rejected: {rejected}");
    if let (Some(first), Some(last)) = (sequences.first(), sequences.last()) {
        println!("Sequences: {first}..={last}");
    }

    if !repeated.is_empty() {
        bail!("{} sequences were handed out twice: {repeated:?}", repeated.len());
    }

    println!("No sequence was handed out twice");

    Ok(())
}
