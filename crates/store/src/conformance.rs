//! Conformance suite for [`StoreBackend`] implementations.
//!
//! Each function exercises one part of the backend contract. The in-memory
//! backend runs the suite in `tests/conformance.rs`; the Redis backend runs it
//! against a live server in its ignored integration tests. Every function
//! works under its own `conformance:` key prefix and clears it first, so the
//! suite can run against a shared server.
//!
//! ```no_run
//! use tollgate_store::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn strings() {
//!     conformance::strings_round_trip(&MemoryBackend::new()).await;
//! }
//! ```
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Strings  | `GET`/`SET`/`DEL`, TTL reporting |
//! | Counters | `INCR`/`DECR`, non-integer values |
//! | Keys     | `KEYS` patterns, `MGET` with gaps |
//! | Sets     | `SADD`/`SREM`/`SMEMBERS` |
//! | Lists    | `RPUSH`/`LRANGE` |
//! | Windows  | `ZADD`/`ZRANGE`/`ZREMRANGEBYSCORE` |
//! | Batches  | transaction and pipeline reply ordering |
//! | Pub/sub  | delivery and cancellation |

use std::time::Duration;

use crate::{
    backend::StoreBackend,
    command::{Command, Reply, ScoreBound},
    error::StoreError,
};

async fn reset<B: StoreBackend + ?Sized>(backend: &B, keys: &[&str]) {
    let keys = keys.iter().map(|k| (*k).to_owned()).collect();
    backend.query(Command::Del { keys }).await.expect("reset should succeed");
}

fn bulk(items: &[&str]) -> Reply {
    Reply::Array(items.iter().map(|s| Reply::Bulk((*s).to_owned())).collect())
}

/// `SET`/`GET`/`DEL` round-trip, and `GET` of a missing key is nil.
pub async fn strings_round_trip<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:str";
    reset(backend, &[key]).await;

    let missing = backend.query(Command::Get { key: key.into() }).await.expect("get");
    assert_eq!(missing, Reply::Nil);

    let set = Command::Set { key: key.into(), value: "v1".into(), ttl: None };
    assert_eq!(backend.query(set).await.expect("set"), Reply::Ok);
    let got = backend.query(Command::Get { key: key.into() }).await.expect("get");
    assert_eq!(got, Reply::Bulk("v1".into()));

    let deleted = backend.query(Command::Del { keys: vec![key.into()] }).await.expect("del");
    assert_eq!(deleted, Reply::Int(1));
    let deleted_again = backend.query(Command::Del { keys: vec![key.into()] }).await.expect("del");
    assert_eq!(deleted_again, Reply::Int(0));
}

/// `SET ... EX` and `EXPIRE` are visible through `TTL`.
pub async fn ttl_is_reported<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:ttl";
    reset(backend, &[key]).await;

    let ttl = backend.query(Command::Ttl { key: key.into() }).await.expect("ttl");
    assert_eq!(ttl, Reply::Int(-2), "missing key reports -2");

    let set = Command::Set { key: key.into(), value: "v".into(), ttl: None };
    backend.query(set).await.expect("set");
    let ttl = backend.query(Command::Ttl { key: key.into() }).await.expect("ttl");
    assert_eq!(ttl, Reply::Int(-1), "persistent key reports -1");

    let expire = Command::Expire { key: key.into(), ttl: Duration::from_secs(100) };
    assert_eq!(backend.query(expire).await.expect("expire"), Reply::Int(1));
    let ttl = backend.query(Command::Ttl { key: key.into() }).await.expect("ttl");
    let seconds = ttl.into_int().expect("integer ttl");
    assert!((99..=100).contains(&seconds), "ttl should be ~100s, got {seconds}");
}

/// `INCR`/`DECR` count from zero and reject non-integer values.
pub async fn counters<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:counter";
    let text = "conformance:text";
    reset(backend, &[key, text]).await;

    assert_eq!(backend.query(Command::Incr { key: key.into() }).await.expect("incr"), Reply::Int(1));
    assert_eq!(backend.query(Command::Incr { key: key.into() }).await.expect("incr"), Reply::Int(2));
    assert_eq!(backend.query(Command::Decr { key: key.into() }).await.expect("decr"), Reply::Int(1));

    let set = Command::Set { key: text.into(), value: "abc".into(), ttl: None };
    backend.query(set).await.expect("set");
    let err = backend.query(Command::Incr { key: text.into() }).await;
    assert!(matches!(err, Err(StoreError::Protocol { .. })), "non-integer incr: {err:?}");
}

/// `KEYS` honours glob patterns and `MGET` returns nil for gaps.
pub async fn keys_and_mget<B: StoreBackend + ?Sized>(backend: &B) {
    let a = "conformance:keys:a";
    let b = "conformance:keys:b";
    let other = "conformance:other";
    reset(backend, &[a, b, other]).await;

    for key in [a, b, other] {
        let set = Command::Set { key: key.into(), value: key.into(), ttl: None };
        backend.query(set).await.expect("set");
    }

    let keys = backend
        .query(Command::Keys { pattern: "conformance:keys:*".into() })
        .await
        .expect("keys")
        .into_strings()
        .expect("strings");
    let mut keys = keys;
    keys.sort();
    assert_eq!(keys, vec![a.to_owned(), b.to_owned()]);

    let values = backend
        .query(Command::MGet { keys: vec![a.into(), "conformance:keys:missing".into()] })
        .await
        .expect("mget")
        .into_optional_strings()
        .expect("optional strings");
    assert_eq!(values, vec![Some(a.to_owned()), None]);
}

/// Set membership commands.
pub async fn set_membership<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:set";
    reset(backend, &[key]).await;

    let add = |member: &str| Command::SAdd { key: key.into(), member: member.into() };
    assert_eq!(backend.query(add("a")).await.expect("sadd"), Reply::Int(1));
    assert_eq!(backend.query(add("b")).await.expect("sadd"), Reply::Int(1));
    assert_eq!(backend.query(add("a")).await.expect("sadd"), Reply::Int(0));

    let removed = backend
        .query(Command::SRem { key: key.into(), member: "b".into() })
        .await
        .expect("srem");
    assert_eq!(removed, Reply::Int(1));

    let members = backend.query(Command::SMembers { key: key.into() }).await.expect("smembers");
    assert_eq!(members, bulk(&["a"]));
}

/// `RPUSH` appends and `LRANGE` reads with negative indices.
pub async fn list_append_and_range<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:list";
    reset(backend, &[key]).await;

    for (i, value) in ["a", "b", "c"].into_iter().enumerate() {
        let pushed = backend
            .query(Command::RPush { key: key.into(), value: value.into() })
            .await
            .expect("rpush");
        assert_eq!(pushed, Reply::Int(i64::try_from(i).expect("small") + 1));
    }
    let all = backend
        .query(Command::LRange { key: key.into(), start: 0, stop: -1 })
        .await
        .expect("lrange");
    assert_eq!(all, bulk(&["a", "b", "c"]));
    let tail = backend
        .query(Command::LRange { key: key.into(), start: -2, stop: -1 })
        .await
        .expect("lrange");
    assert_eq!(tail, bulk(&["b", "c"]));
}

/// Sorted-set trimming keeps members scored exactly at the exclusive bound.
pub async fn sorted_set_window<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:zset";
    reset(backend, &[key]).await;

    for (score, member) in [(100, "t0"), (200, "t1"), (300, "t2")] {
        let add = Command::ZAdd { key: key.into(), score, member: member.into() };
        assert_eq!(backend.query(add).await.expect("zadd"), Reply::Int(1));
    }

    let trim = Command::ZRemRangeByScore {
        key: key.into(),
        min: ScoreBound::NegInf,
        max: ScoreBound::Exclusive(200),
    };
    assert_eq!(backend.query(trim).await.expect("zremrangebyscore"), Reply::Int(1));

    let left = backend
        .query(Command::ZRange { key: key.into(), start: 0, stop: -1 })
        .await
        .expect("zrange");
    assert_eq!(left, bulk(&["t1", "t2"]));
}

/// Transactions and pipelines return one reply per command, in order.
pub async fn batches_preserve_order<B: StoreBackend + ?Sized>(backend: &B) {
    let key = "conformance:batch";
    reset(backend, &[key]).await;

    let commands = vec![
        Command::RPush { key: key.into(), value: "x".into() },
        Command::LRange { key: key.into(), start: 0, stop: -1 },
        Command::Del { keys: vec![key.into()] },
    ];
    let replies = backend.transaction(commands.clone()).await.expect("transaction");
    assert_eq!(replies, vec![Reply::Int(1), bulk(&["x"]), Reply::Int(1)]);

    let replies = backend.pipeline(commands).await.expect("pipeline");
    assert_eq!(replies, vec![Reply::Int(1), bulk(&["x"]), Reply::Int(1)]);
}

/// A published message reaches an active subscriber; cancelling ends the stream.
pub async fn publish_reaches_subscriber<B: StoreBackend + ?Sized>(backend: &B) {
    let channel = "conformance:channel";
    let mut subscription = backend.subscribe(channel).await.expect("subscribe");

    let mut delivered = 0;
    for _ in 0..50 {
        let publish = Command::Publish { channel: channel.into(), message: "hello".into() };
        delivered = backend.query(publish).await.expect("publish").into_int().expect("int");
        if delivered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered > 0, "subscriber never registered");

    let message = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("message within timeout")
        .expect("stream open")
        .expect("message");
    assert_eq!(message.channel, channel);
    assert_eq!(message.payload, "hello");

    subscription.cancel();
    assert!(subscription.next().await.is_none());
}

/// The backend reports itself available.
pub async fn health_check_is_available<B: StoreBackend + ?Sized>(backend: &B) {
    let status = backend.health_check().await.expect("health check");
    assert!(status.is_available(), "backend should be available: {status}");
}
