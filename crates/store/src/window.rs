//! Sliding-window event counting on sorted sets.
//!
//! Each observation on a window key runs four commands:
//!
//! 1. `ZREMRANGEBYSCORE key -inf (now-window` drops events older than the window
//! 2. `ZRANGE key 0 -1` reads what is left, which is the count returned
//! 3. `ZADD key now member` records the new event
//! 4. `EXPIRE key window` lets idle windows disappear
//!
//! Scores are Unix timestamps in nanoseconds. The returned count excludes the
//! event being recorded. [`StoreClient::set_rolling_window`] runs the
//! sequence as one transaction; [`StoreClient::set_rolling_window_pipeline`]
//! pipelines it without atomicity, which is enough for health counters.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    client::StoreClient,
    command::{Command, Reply, ScoreBound},
    error::StoreResult,
};

/// The state of a window just before an event was recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowObservation {
    /// Number of events inside the window, not counting the new one.
    pub count: usize,
    /// Members of those events, oldest first.
    pub members: Vec<String>,
}

impl WindowObservation {
    fn from_replies(key: &str, replies: Vec<Reply>) -> StoreResult<Self> {
        if replies.len() < 2 {
            tracing::warn!(key, replies = replies.len(), "sliding window returned too few replies");
            return Ok(Self::default());
        }
        let members = replies.into_iter().nth(1).map(Reply::into_strings).transpose()?.unwrap_or_default();
        Ok(Self { count: members.len(), members })
    }
}

/// Nanoseconds since the Unix epoch, saturating at the representable range.
#[must_use]
pub fn unix_nanos(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos()).map_or(i64::MIN, |n| -n),
    }
}

fn window_commands(key: &str, window: Duration, value: Option<&str>, now: i64) -> Vec<Command> {
    let window_nanos = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
    let cutoff = now.saturating_sub(window_nanos);
    let member = value.map_or_else(|| now.to_string(), str::to_owned);
    vec![
        Command::ZRemRangeByScore {
            key: key.to_owned(),
            min: ScoreBound::NegInf,
            max: ScoreBound::Exclusive(cutoff),
        },
        Command::ZRange { key: key.to_owned(), start: 0, stop: -1 },
        Command::ZAdd { key: key.to_owned(), score: now, member },
        Command::Expire { key: key.to_owned(), ttl: window },
    ]
}

impl StoreClient {
    /// Records an event in the window at physical `key` and returns the
    /// window's prior state. Runs atomically.
    ///
    /// `value` becomes the set member; without one, the timestamp is used.
    /// Two events with the same member and timestamp collapse into one.
    ///
    /// # Errors
    ///
    /// Returns the store error if the transaction fails.
    pub async fn set_rolling_window(
        &self,
        key: &str,
        window: Duration,
        value: Option<&str>,
    ) -> StoreResult<WindowObservation> {
        self.set_rolling_window_at(key, window, value, SystemTime::now()).await
    }

    /// [`set_rolling_window`](Self::set_rolling_window) with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns the store error if the transaction fails.
    #[tracing::instrument(skip(self, value))]
    pub async fn set_rolling_window_at(
        &self,
        key: &str,
        window: Duration,
        value: Option<&str>,
        at: SystemTime,
    ) -> StoreResult<WindowObservation> {
        let commands = window_commands(key, window, value, unix_nanos(at));
        let replies = self.transaction("rolling_window", commands).await?;
        WindowObservation::from_replies(key, replies)
    }

    /// Like [`set_rolling_window`](Self::set_rolling_window), pipelined
    /// without a transaction.
    ///
    /// # Errors
    ///
    /// Returns the store error if the pipeline fails.
    pub async fn set_rolling_window_pipeline(
        &self,
        key: &str,
        window: Duration,
        value: Option<&str>,
    ) -> StoreResult<WindowObservation> {
        self.set_rolling_window_pipeline_at(key, window, value, SystemTime::now()).await
    }

    /// [`set_rolling_window_pipeline`](Self::set_rolling_window_pipeline)
    /// with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns the store error if the pipeline fails.
    #[tracing::instrument(skip(self, value))]
    pub async fn set_rolling_window_pipeline_at(
        &self,
        key: &str,
        window: Duration,
        value: Option<&str>,
        at: SystemTime,
    ) -> StoreResult<WindowObservation> {
        let commands = window_commands(key, window, value, unix_nanos(at));
        let replies = self.pipeline("rolling_window_pipeline", commands).await?;
        WindowObservation::from_replies(key, replies)
    }

    /// Reads the events currently inside the window at `key` without
    /// recording a new one.
    ///
    /// # Errors
    ///
    /// Returns the store error if the transaction fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_rolling_window_at(
        &self,
        key: &str,
        window: Duration,
        at: SystemTime,
    ) -> StoreResult<WindowObservation> {
        let mut commands = window_commands(key, window, None, unix_nanos(at));
        commands.truncate(2);
        let replies = self.transaction("rolling_window_read", commands).await?;
        WindowObservation::from_replies(key, replies)
    }
}
