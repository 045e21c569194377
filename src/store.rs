//! The store adapter: a thin façade over the shared key/value store.
//!
//! Everything downstream of this module talks to [`Store`], never to the
//! `redis` crate directly, so the claim/producer/reaper logic can run
//! against an in-memory [`fake::FakeStore`] in tests.

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;

use crate::error::{MlqError, Result};

/// One reply slot from a pipelined [`Transaction`], in the order the
/// corresponding operation was queued.
#[derive(Clone, Debug)]
pub enum Reply {
    Int(i64),
    Bytes(Option<Bytes>),
    Ok,
}

enum Op {
    PushLeft(String, Bytes),
    PushRight(String, Bytes),
    Set(String, Bytes, Option<u64>),
    Incr(String),
    Remove(String, isize, Bytes),
}

/// A pipelined, atomically-executed batch of store operations.
///
/// Matches the "pipelined multi-command transaction" primitive in the
/// store adapter design: the queued operations execute in order without
/// another client's operations interleaving on the same keys, but there is
/// no cross-key isolation beyond that.
#[derive(Default)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_left(mut self, key: impl Into<String>, val: Bytes) -> Self {
        self.ops.push(Op::PushLeft(key.into(), val));
        self
    }

    pub fn push_right(mut self, key: impl Into<String>, val: Bytes) -> Self {
        self.ops.push(Op::PushRight(key.into(), val));
        self
    }

    pub fn set(mut self, key: impl Into<String>, val: Bytes, ttl: Option<u64>) -> Self {
        self.ops.push(Op::Set(key.into(), val, ttl));
        self
    }

    pub fn incr(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Op::Incr(key.into()));
        self
    }

    /// Removes up to `count` occurrences of `val` from the list at `key`.
    /// A negative count removes from the tail (matching Redis `LREM`
    /// semantics, which the reaper and worker rely on).
    pub fn remove(mut self, key: impl Into<String>, count: isize, val: Bytes) -> Self {
        self.ops.push(Op::Remove(key.into(), count, val));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A live subscription to a pub/sub channel.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for and returns the next published message, or `None` if the
    /// channel was closed.
    async fn recv(&mut self) -> Option<Bytes>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn push_left(&self, key: &str, val: Bytes) -> Result<()>;
    async fn push_right(&self, key: &str, val: Bytes) -> Result<()>;

    /// Atomically pops the rightmost element of `src` and pushes it onto
    /// the left of `dst`, blocking with no timeout until an element is
    /// available. This is the only primitive that guarantees no two
    /// workers claim the same job.
    async fn blocking_pop_right_push_left(&self, src: &str, dst: &str) -> Result<Bytes>;

    /// Returns the elements of the list at `key` in the inclusive range
    /// `[start, stop]`.
    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>>;

    async fn len(&self, key: &str) -> Result<i64>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn set(&self, key: &str, val: Bytes, ttl: Option<u64>) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn publish(&self, channel: &str, val: Bytes) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;

    /// Executes a [`Transaction`]'s queued operations as a single pipelined
    /// round-trip, returning one [`Reply`] per queued operation in order.
    async fn exec(&self, txn: Transaction) -> Result<Vec<Reply>>;
}

/// A [`Store`] backed by a real Redis-compatible server via
/// `redis::aio::ConnectionManager`.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(MlqError::Store)?;
        let conn = client.get_connection_manager().await.map_err(MlqError::Store)?;
        Ok(Self { client, conn })
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Option<Bytes> {
        use tokio_stream::StreamExt;
        let msg = self.pubsub.on_message().next().await?;
        let payload: Vec<u8> = msg.get_payload().ok()?;
        Some(Bytes::from(payload))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push_left(&self, key: &str, val: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, val.to_vec()).await.map_err(MlqError::Store)?;
        Ok(())
    }

    async fn push_right(&self, key: &str, val: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, val.to_vec()).await.map_err(MlqError::Store)?;
        Ok(())
    }

    async fn blocking_pop_right_push_left(&self, src: &str, dst: &str) -> Result<Bytes> {
        // A dedicated connection is used here rather than the shared
        // ConnectionManager: BRPOPLPUSH with an unbounded timeout blocks the
        // whole connection until an element arrives, which would stall every
        // other command multiplexed over a shared connection.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(MlqError::Store)?;
        let val: Vec<u8> = conn.brpoplpush(src, dst, 0.0).await.map_err(MlqError::Store)?;
        Ok(Bytes::from(val))
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>> {
        let mut conn = self.conn.clone();
        let items: Vec<Vec<u8>> = conn.lrange(key, start, stop).await.map_err(MlqError::Store)?;
        Ok(items.into_iter().map(Bytes::from).collect())
    }

    async fn len(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(MlqError::Store)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let val: Option<Vec<u8>> = conn.get(key).await.map_err(MlqError::Store)?;
        Ok(val.map(Bytes::from))
    }

    async fn set(&self, key: &str, val: Bytes, ttl: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(secs) => {
                let _: () = conn.set_ex(key, val.to_vec(), secs).await.map_err(MlqError::Store)?;
            },
            None => {
                let _: () = conn.set(key, val.to_vec()).await.map_err(MlqError::Store)?;
            },
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(MlqError::Store)
    }

    async fn publish(&self, channel: &str, val: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, val.to_vec()).await.map_err(MlqError::Store)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let conn = self.client.get_async_connection().await.map_err(MlqError::Store)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(MlqError::Store)?;
        Ok(Box::new(RedisSubscription { pubsub }))
    }

    async fn exec(&self, txn: Transaction) -> Result<Vec<Reply>> {
        if txn.ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &txn.ops {
            match op {
                Op::PushLeft(key, val) => {
                    pipe.lpush(key, val.to_vec());
                },
                Op::PushRight(key, val) => {
                    pipe.rpush(key, val.to_vec());
                },
                Op::Set(key, val, ttl) => match ttl {
                    Some(secs) => {
                        pipe.set_ex(key, val.to_vec(), *secs);
                    },
                    None => {
                        pipe.set(key, val.to_vec());
                    },
                },
                Op::Incr(key) => {
                    pipe.incr(key, 1);
                },
                Op::Remove(key, count, val) => {
                    pipe.lrem(key, *count as isize, val.to_vec());
                },
            }
        }

        let mut conn = self.conn.clone();
        let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await.map_err(MlqError::Store)?;

        Ok(raw
            .into_iter()
            .zip(txn.ops.iter())
            .map(|(value, op)| match (value, op) {
                (redis::Value::Int(n), _) => Reply::Int(n),
                (redis::Value::Data(d), _) => Reply::Bytes(Some(Bytes::from(d))),
                (redis::Value::Nil, _) => Reply::Bytes(None),
                _ => Reply::Ok,
            })
            .collect())
    }
}

/// In-memory [`Store`] used by tests. Lists, values, and pub/sub channels
/// each live behind their own mutex; blocking pop is implemented as a short
/// poll loop since there is no real blocking primitive to lean on.
pub mod fake {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::{broadcast, Mutex};

    use super::{Op, Reply, Store, Subscription, Transaction};
    use crate::error::Result;

    #[derive(Default)]
    struct Inner {
        lists: HashMap<String, VecDeque<Bytes>>,
        values: HashMap<String, Bytes>,
        counters: HashMap<String, i64>,
        channels: HashMap<String, broadcast::Sender<Bytes>>,
    }

    #[derive(Clone, Default)]
    pub struct FakeStore {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn channel(inner: &mut Inner, name: &str) -> broadcast::Sender<Bytes> {
            inner
                .channels
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .clone()
        }
    }

    struct FakeSubscription {
        rx: broadcast::Receiver<Bytes>,
    }

    #[async_trait]
    impl Subscription for FakeSubscription {
        async fn recv(&mut self) -> Option<Bytes> {
            self.rx.recv().await.ok()
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn push_left(&self, key: &str, val: Bytes) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner.lists.entry(key.to_string()).or_default().push_front(val);
            Ok(())
        }

        async fn push_right(&self, key: &str, val: Bytes) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner.lists.entry(key.to_string()).or_default().push_back(val);
            Ok(())
        }

        async fn blocking_pop_right_push_left(&self, src: &str, dst: &str) -> Result<Bytes> {
            loop {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(val) = inner.lists.entry(src.to_string()).or_default().pop_back() {
                        inner.lists.entry(dst.to_string()).or_default().push_front(val.clone());
                        return Ok(val);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Bytes>> {
            let inner = self.inner.lock().await;
            let Some(list) = inner.lists.get(key) else {
                return Ok(Vec::new());
            };
            let len = list.len() as isize;
            let norm = |i: isize| -> isize {
                if i < 0 {
                    (len + i).max(0)
                } else {
                    i.min(len)
                }
            };
            let start = norm(start);
            let stop = norm(stop).min(len - 1);
            if start > stop || len == 0 {
                return Ok(Vec::new());
            }
            Ok(list.iter().skip(start as usize).take((stop - start + 1) as usize).cloned().collect())
        }

        async fn len(&self, key: &str) -> Result<i64> {
            let inner = self.inner.lock().await;
            Ok(inner.lists.get(key).map(|l| l.len() as i64).unwrap_or(0))
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            let inner = self.inner.lock().await;
            Ok(inner.values.get(key).cloned())
        }

        async fn set(&self, key: &str, val: Bytes, ttl: Option<u64>) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner.values.insert(key.to_string(), val);
            if let Some(secs) = ttl {
                let inner_arc = self.inner.clone();
                let key = key.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    inner_arc.lock().await.values.remove(&key);
                });
            }
            Ok(())
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            let mut inner = self.inner.lock().await;
            let counter = inner.counters.entry(key.to_string()).or_insert(0);
            *counter += 1;
            Ok(*counter)
        }

        async fn publish(&self, channel: &str, val: Bytes) -> Result<()> {
            let mut inner = self.inner.lock().await;
            let tx = FakeStore::channel(&mut inner, channel);
            let _ = tx.send(val);
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
            let mut inner = self.inner.lock().await;
            let tx = FakeStore::channel(&mut inner, channel);
            Ok(Box::new(FakeSubscription { rx: tx.subscribe() }))
        }

        async fn exec(&self, txn: Transaction) -> Result<Vec<Reply>> {
            let mut inner = self.inner.lock().await;
            let mut replies = Vec::with_capacity(txn.ops.len());
            for op in txn.ops {
                match op {
                    Op::PushLeft(key, val) => {
                        inner.lists.entry(key).or_default().push_front(val);
                        replies.push(Reply::Ok);
                    },
                    Op::PushRight(key, val) => {
                        inner.lists.entry(key).or_default().push_back(val);
                        replies.push(Reply::Ok);
                    },
                    Op::Set(key, val, ttl) => {
                        inner.values.insert(key.clone(), val);
                        if let Some(secs) = ttl {
                            let inner_arc = self.inner.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(Duration::from_secs(secs)).await;
                                inner_arc.lock().await.values.remove(&key);
                            });
                        }
                        replies.push(Reply::Ok);
                    },
                    Op::Incr(key) => {
                        let counter = inner.counters.entry(key).or_insert(0);
                        *counter += 1;
                        replies.push(Reply::Int(*counter));
                    },
                    Op::Remove(key, count, val) => {
                        if let Some(list) = inner.lists.get_mut(&key) {
                            remove_occurrences(list, count, &val);
                        }
                        replies.push(Reply::Ok);
                    },
                }
            }
            Ok(replies)
        }
    }

    /// Mirrors Redis `LREM key count value` semantics: positive `count`
    /// removes from the head, negative from the tail, zero removes all
    /// occurrences.
    fn remove_occurrences(list: &mut VecDeque<Bytes>, count: isize, val: &Bytes) {
        if count == 0 {
            list.retain(|item| item != val);
            return;
        }

        let mut remaining = count.unsigned_abs();
        if count > 0 {
            let mut i = 0;
            while i < list.len() && remaining > 0 {
                if &list[i] == val {
                    list.remove(i);
                    remaining -= 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && remaining > 0 {
                i -= 1;
                if &list[i] == val {
                    list.remove(i);
                    remaining -= 1;
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn claim_moves_between_lists() {
            let store = FakeStore::new();
            store.push_left("pending", Bytes::from_static(b"job-1")).await.unwrap();
            let claimed = store.blocking_pop_right_push_left("pending", "processing").await.unwrap();
            assert_eq!(claimed, Bytes::from_static(b"job-1"));
            assert_eq!(store.len("pending").await.unwrap(), 0);
            assert_eq!(store.len("processing").await.unwrap(), 1);
        }

        #[tokio::test]
        async fn publish_before_subscribe_is_lost() {
            let store = FakeStore::new();
            store.publish("ch", Bytes::from_static(b"too-late")).await.unwrap();
            let mut sub = store.subscribe("ch").await.unwrap();
            store.publish("ch", Bytes::from_static(b"on-time")).await.unwrap();
            assert_eq!(sub.recv().await, Some(Bytes::from_static(b"on-time")));
        }

        #[tokio::test]
        async fn lrem_matches_redis_semantics() {
            let mut list: VecDeque<Bytes> = vec!["a", "b", "a", "a"].into_iter().map(Bytes::from_static).collect();
            remove_occurrences(&mut list, -1, &Bytes::from_static(b"a"));
            assert_eq!(list, VecDeque::from(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"a")]));
        }
    }
}
