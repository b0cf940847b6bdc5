//! # Redis
//!
//! Durable store behind issuance and verification.
//!
//! ## Layout
//!
//! - `csl:courses` hash: course id -> course code
//! - `csl:sequences` hash: `{year}:{code}` -> last handed out sequence
//! - `csl:active` hash: `{student}:{course}` -> core string of the active certificate
//! - `csl:cert:{core}` hash: one certificate record, field per column
//! - `csl:stats:{year}` hash: `total`, `course:{code}`, `status:{status}` counters
//!
//! ## Atomicity
//!
//! - Sequences use `HINCRBY`. Redis runs commands one at a time, so two callers can never
//!   read the same value, unlike a `MAX() + 1` scan over the records.
//! - Insert and status transitions run as Lua scripts. A script executes as one unit, which
//!   gives the (student, course) slot check, the record write and the stats bump the same
//!   all-or-nothing behaviour a SQL transaction would.
//! - A sequence taken by a request that then fails to insert is simply burned.
use std::{collections::HashMap, str::FromStr, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codec::Status;
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::debug;

use crate::store::{
    CertificateRecord, CertificateStore, Partition, SequenceStore, StatusChange, StoreError,
    YearStats,
};

const COURSES_KEY: &str = "csl:courses";
const SEQUENCES_KEY: &str = "csl:sequences";
const ACTIVE_KEY: &str = "csl:active";

// KEYS: active index, record, stats
// ARGV: active field, core, course stat field, status stat field, record field/value pairs...
static INSERT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local holder = redis.call('HGET', KEYS[1], ARGV[1])
        if holder then
            return {0, holder}
        end
        if redis.call('EXISTS', KEYS[2]) == 1 then
            return {-1, ARGV[2]}
        end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        redis.call('HSET', KEYS[2], unpack(ARGV, 5))
        redis.call('HINCRBY', KEYS[3], 'total', 1)
        redis.call('HINCRBY', KEYS[3], ARGV[3], 1)
        redis.call('HINCRBY', KEYS[3], ARGV[4], 1)
        return {1, ARGV[2]}
        ",
    )
});

// KEYS: record, active index, stats
// ARGV: expected status, new status, active field, core, changed at, changed by, reason
static TRANSITION_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('HGET', KEYS[1], 'status')
        if not current then
            return {-2, ''}
        end
        if current ~= ARGV[1] then
            return {-1, current}
        end
        if ARGV[2] == 'active' then
            local holder = redis.call('HGET', KEYS[2], ARGV[3])
            if holder and holder ~= ARGV[4] then
                return {0, holder}
            end
            redis.call('HSET', KEYS[2], ARGV[3], ARGV[4])
        elseif ARGV[1] == 'active' and redis.call('HGET', KEYS[2], ARGV[3]) == ARGV[4] then
            redis.call('HDEL', KEYS[2], ARGV[3])
        end
        redis.call('HSET', KEYS[1],
            'status', ARGV[2],
            'status_changed_at', ARGV[5],
            'status_changed_by', ARGV[6],
            'status_reason', ARGV[7])
        redis.call('HINCRBY', KEYS[3], 'status:' .. ARGV[1], -1)
        redis.call('HINCRBY', KEYS[3], 'status:' .. ARGV[2], 1)
        return {1, ARGV[2]}
        ",
    )
});

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

fn record_key(core: &str) -> String {
    format!("csl:cert:{core}")
}

fn stats_key(year: u32) -> String {
    format!("csl:stats:{year}")
}

fn active_field(student_id: u64, course_id: u64) -> String {
    format!("{student_id}:{course_id}")
}

fn course_stat(course_code: &str) -> String {
    format!("course:{course_code}")
}

fn status_stat(status: Status) -> String {
    format!("status:{status}")
}

fn to_fields(record: &CertificateRecord) -> Vec<(&'static str, String)> {
    vec![
        ("csl", record.csl.clone()),
        ("core", record.core.clone()),
        ("year", record.year.to_string()),
        ("course_code", record.course_code.clone()),
        ("sequence", record.sequence.to_string()),
        ("student_id", record.student_id.to_string()),
        ("course_id", record.course_id.to_string()),
        ("issuer_id", record.issuer_id.to_string()),
        ("status", record.status.to_string()),
        ("issued_at", record.issued_at.to_rfc3339()),
        (
            "status_changed_at",
            record
                .status_changed_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ),
        (
            "status_changed_by",
            record
                .status_changed_by
                .map(|id| id.to_string())
                .unwrap_or_default(),
        ),
        (
            "status_reason",
            record.status_reason.clone().unwrap_or_default(),
        ),
    ]
}

fn corrupted(key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupted {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn required<T: FromStr>(
    key: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T, StoreError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| corrupted(key, format!("missing field {name}")))?;

    raw.parse()
        .map_err(|_| corrupted(key, format!("unparsable field {name}")))
}

// empty string stands in for NULL
fn optional<T: FromStr>(
    key: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, StoreError> {
    match fields.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(_) => required(key, fields, name).map(Some),
    }
}

fn from_fields(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<CertificateRecord, StoreError> {
    Ok(CertificateRecord {
        csl: required(key, fields, "csl")?,
        core: required(key, fields, "core")?,
        year: required(key, fields, "year")?,
        course_code: required(key, fields, "course_code")?,
        sequence: required(key, fields, "sequence")?,
        student_id: required(key, fields, "student_id")?,
        course_id: required(key, fields, "course_id")?,
        issuer_id: required(key, fields, "issuer_id")?,
        status: required(key, fields, "status")?,
        issued_at: required::<DateTime<Utc>>(key, fields, "issued_at")?,
        status_changed_at: optional::<DateTime<Utc>>(key, fields, "status_changed_at")?,
        status_changed_by: optional(key, fields, "status_changed_by")?,
        status_reason: optional(key, fields, "status_reason")?,
    })
}

fn stats_from_fields(
    year: u32,
    fields: &HashMap<String, String>,
) -> Result<YearStats, StoreError> {
    let key = stats_key(year);
    let mut stats = YearStats {
        year,
        ..Default::default()
    };

    for (field, raw) in fields {
        let count: i64 = raw
            .parse()
            .map_err(|_| corrupted(&key, format!("unparsable counter {field}")))?;
        let count = count.max(0) as u64;

        if field == "total" {
            stats.total = count;
        } else if let Some(code) = field.strip_prefix("course:") {
            stats.by_course.insert(code.to_string(), count);
        } else if let Some(status) = field.strip_prefix("status:") {
            let status: Status = status
                .parse()
                .map_err(|_| corrupted(&key, format!("unknown status counter {field}")))?;
            stats.by_status.insert(status, count);
        }
    }

    Ok(stats)
}

#[async_trait]
impl SequenceStore for RedisStore {
    async fn increment(&self, partition: &Partition) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let value: i64 = connection
            .hincr(SEQUENCES_KEY, partition.to_string(), 1)
            .await?;

        debug!(partition = %partition, value, "incremented sequence counter");

        u64::try_from(value).map_err(|_| corrupted(SEQUENCES_KEY, "negative counter"))
    }
}

#[async_trait]
impl CertificateStore for RedisStore {
    async fn register_course(&self, course_id: u64, course_code: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.hset(COURSES_KEY, course_id, course_code).await?;

        Ok(())
    }

    async fn course_code(&self, course_id: u64) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();

        Ok(connection.hget(COURSES_KEY, course_id).await?)
    }

    async fn active_certificate(
        &self,
        student_id: u64,
        course_id: u64,
    ) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();

        Ok(connection
            .hget(ACTIVE_KEY, active_field(student_id, course_id))
            .await?)
    }

    async fn insert_certificate(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();

        let mut invocation = INSERT_SCRIPT.prepare_invoke();
        invocation
            .key(ACTIVE_KEY)
            .key(record_key(&record.core))
            .key(stats_key(record.year))
            .arg(active_field(record.student_id, record.course_id))
            .arg(&record.core)
            .arg(course_stat(&record.course_code))
            .arg(status_stat(record.status));
        for (field, value) in to_fields(record) {
            invocation.arg(field).arg(value);
        }

        let (outcome, value): (i64, String) = invocation.invoke_async(&mut connection).await?;

        match outcome {
            1 => Ok(()),
            0 => Err(StoreError::Duplicate { existing: value }),
            _ => Err(StoreError::Conflict { key: value }),
        }
    }

    async fn find_by_core(&self, core: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let mut connection = self.connection.clone();
        let key = record_key(core);
        let fields: HashMap<String, String> = connection.hgetall(&key).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        from_fields(&key, &fields).map(Some)
    }

    async fn transition(
        &self,
        core: &str,
        change: &StatusChange,
    ) -> Result<CertificateRecord, StoreError> {
        let Some(record) = self.find_by_core(core).await? else {
            return Err(StoreError::Missing {
                key: record_key(core),
            });
        };

        let mut connection = self.connection.clone();
        let mut invocation = TRANSITION_SCRIPT.prepare_invoke();
        invocation
            .key(record_key(core))
            .key(ACTIVE_KEY)
            .key(stats_key(record.year))
            .arg(change.from.as_str())
            .arg(change.to.as_str())
            .arg(active_field(record.student_id, record.course_id))
            .arg(core)
            .arg(change.at.to_rfc3339())
            .arg(change.actor_id)
            .arg(change.reason.clone().unwrap_or_default());

        let (outcome, value): (i64, String) = invocation.invoke_async(&mut connection).await?;

        match outcome {
            1 => {
                let mut updated = record;
                updated.apply(change);
                Ok(updated)
            }
            0 => Err(StoreError::Duplicate { existing: value }),
            -2 => Err(StoreError::Missing {
                key: record_key(core),
            }),
            _ => Err(StoreError::Conflict {
                key: record_key(core),
            }),
        }
    }

    async fn stats(&self, year: u32) -> Result<YearStats, StoreError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection.hgetall(stats_key(year)).await?;

        stats_from_fields(year, &fields)
    }
}
