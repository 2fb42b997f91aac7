//! The command vocabulary spoken to a backend, and the replies it returns.
//!
//! [`Command`] covers exactly the operations the gateway needs from a
//! Redis-compatible store. Keys inside a command are physical keys: prefixing
//! and hashing has already happened in [`KeySpace`](crate::KeySpace).
//!
//! [`Reply`] is a deliberately small value model. Accessors such as
//! [`Reply::into_int`] convert it into the shape a caller expects and raise
//! [`StoreError::Protocol`] when the store answered with something else.

use std::{fmt, time::Duration};

use crate::error::{StoreError, StoreResult};

/// One bound of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBound {
    /// Negative infinity.
    NegInf,
    /// Scores greater/less than or equal to the value.
    Inclusive(i64),
    /// Scores strictly greater/less than the value.
    Exclusive(i64),
    /// Positive infinity.
    PosInf,
}

impl ScoreBound {
    /// Whether `score` lies on the allowed side of this bound when used as a lower bound.
    #[must_use]
    pub fn admits_from_below(self, score: i64) -> bool {
        match self {
            Self::NegInf => true,
            Self::Inclusive(bound) => score >= bound,
            Self::Exclusive(bound) => score > bound,
            Self::PosInf => false,
        }
    }

    /// Whether `score` lies on the allowed side of this bound when used as an upper bound.
    #[must_use]
    pub fn admits_from_above(self, score: i64) -> bool {
        match self {
            Self::NegInf => false,
            Self::Inclusive(bound) => score <= bound,
            Self::Exclusive(bound) => score < bound,
            Self::PosInf => true,
        }
    }
}

impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegInf => f.write_str("-inf"),
            Self::Inclusive(score) => write!(f, "{score}"),
            Self::Exclusive(score) => write!(f, "({score}"),
            Self::PosInf => f.write_str("+inf"),
        }
    }
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `GET key`
    Get { key: String },
    /// `SET key value [EX seconds]`
    Set { key: String, value: String, ttl: Option<Duration> },
    /// `DEL key [key ...]`
    Del { keys: Vec<String> },
    /// `INCR key`
    Incr { key: String },
    /// `DECR key`
    Decr { key: String },
    /// `EXPIRE key seconds`
    Expire { key: String, ttl: Duration },
    /// `TTL key`
    Ttl { key: String },
    /// `KEYS pattern`
    Keys { pattern: String },
    /// `MGET key [key ...]`
    MGet { keys: Vec<String> },
    /// `SADD key member`
    SAdd { key: String, member: String },
    /// `SREM key member`
    SRem { key: String, member: String },
    /// `SMEMBERS key`
    SMembers { key: String },
    /// `RPUSH key value`
    RPush { key: String, value: String },
    /// `LRANGE key start stop`
    LRange { key: String, start: i64, stop: i64 },
    /// `ZADD key score member`
    ZAdd { key: String, score: i64, member: String },
    /// `ZREMRANGEBYSCORE key min max`
    ZRemRangeByScore { key: String, min: ScoreBound, max: ScoreBound },
    /// `ZRANGE key start stop`
    ZRange { key: String, start: i64, stop: i64 },
    /// `PUBLISH channel message`
    Publish { channel: String, message: String },
}

impl Command {
    /// The Redis command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::Del { .. } => "DEL",
            Self::Incr { .. } => "INCR",
            Self::Decr { .. } => "DECR",
            Self::Expire { .. } => "EXPIRE",
            Self::Ttl { .. } => "TTL",
            Self::Keys { .. } => "KEYS",
            Self::MGet { .. } => "MGET",
            Self::SAdd { .. } => "SADD",
            Self::SRem { .. } => "SREM",
            Self::SMembers { .. } => "SMEMBERS",
            Self::RPush { .. } => "RPUSH",
            Self::LRange { .. } => "LRANGE",
            Self::ZAdd { .. } => "ZADD",
            Self::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Self::ZRange { .. } => "ZRANGE",
            Self::Publish { .. } => "PUBLISH",
        }
    }

    /// Whether the command only reads state.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::Get { .. }
                | Self::Ttl { .. }
                | Self::Keys { .. }
                | Self::MGet { .. }
                | Self::SMembers { .. }
                | Self::LRange { .. }
                | Self::ZRange { .. }
        )
    }
}

/// Whole seconds for `EXPIRE`/`SET EX`, rounded up so a sub-second TTL
/// never becomes "no expiry".
#[must_use]
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// A reply from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Absent value.
    Nil,
    /// Status reply (`+OK`).
    Ok,
    /// Integer reply.
    Int(i64),
    /// Bulk string reply.
    Bulk(String),
    /// Multi-bulk reply.
    Array(Vec<Reply>),
}

impl Reply {
    /// Converts an integer reply.
    ///
    /// Bulk strings holding a decimal integer are accepted as well, since some
    /// proxies re-encode counters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] for any other reply.
    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            Self::Int(value) => Ok(value),
            Self::Bulk(text) => text
                .parse()
                .map_err(|e| StoreError::protocol_with_source(format!("expected integer, got {text:?}"), e)),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Converts a bulk-or-nil reply.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] for any other reply.
    pub fn into_optional_string(self) -> StoreResult<Option<String>> {
        match self {
            Self::Nil => Ok(None),
            Self::Bulk(text) => Ok(Some(text)),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Converts a multi-bulk reply whose elements are all bulk strings.
    ///
    /// `Nil` is treated as the empty list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] if the reply or any element has the wrong shape.
    pub fn into_strings(self) -> StoreResult<Vec<String>> {
        match self {
            Self::Nil => Ok(Vec::new()),
            Self::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Self::Bulk(text) => Ok(text),
                    other => Err(unexpected("bulk string element", &other)),
                })
                .collect(),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Converts a multi-bulk reply whose elements may be nil (as `MGET` returns).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] if the reply or any element has the wrong shape.
    pub fn into_optional_strings(self) -> StoreResult<Vec<Option<String>>> {
        match self {
            Self::Array(items) => items.into_iter().map(Self::into_optional_string).collect(),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Checks for a status reply.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] for any other reply.
    pub fn into_ok(self) -> StoreResult<()> {
        match self {
            Self::Ok => Ok(()),
            other => Err(unexpected("OK", &other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Ok => "OK",
            Self::Int(_) => "integer",
            Self::Bulk(_) => "bulk string",
            Self::Array(_) => "array",
        }
    }
}

fn unexpected(expected: &str, got: &Reply) -> StoreError {
    StoreError::protocol(format!("expected {expected} reply, got {}", got.kind()))
}
