//! # Client Facade
//!
//! Purpose: Expose the public cache API over the ring, the per-node pools,
//! and the failure policy, hiding routing and protocol details.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `CacheClient` is the only type callers need; it is
//!    cheap to clone and safe to share across threads.
//! 2. **One Connection Per Node Per Call**: Every operation acquires exactly
//!    one pooled connection per target node and releases or invalidates it
//!    before returning.
//! 3. **Fan-Out, Fan-In**: Multi-key operations group keys by target node
//!    and run the per-node batches on scoped threads; one failing node never
//!    aborts the others.
//! 4. **Fail Fast**: Suspended nodes are skipped without a network attempt;
//!    non-transient errors are never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use memring_proto::{validate_key, Command, ProtoError, Response, StoreMode, ValueItem};

use crate::config::ClientConfig;
use crate::error::{Error, NodeFailure, PartialFailure, Result};
use crate::policy::{CircuitBreaker, NodeHealth, RetryDecision, RetryPolicy};
use crate::pool::ConnectionPool;
use crate::ring::{HashRing, Node};

/// Outcome of a `cas` store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The token matched and the value was replaced.
    Stored,
    /// The entry changed since the token was read.
    Exists,
    /// The key no longer exists.
    NotFound,
}

struct Shared {
    config: Arc<ClientConfig>,
    ring: RwLock<Arc<HashRing>>,
    pools: Mutex<HashMap<String, ConnectionPool>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    retry: RetryPolicy,
}

/// Connection-pooled, failure-tolerant cache client.
///
/// Construct once with a [`ClientConfig`], share freely, and call
/// [`CacheClient::close`] at shutdown to drop pooled connections.
#[derive(Clone)]
pub struct CacheClient {
    shared: Arc<Shared>,
}

impl CacheClient {
    /// Creates a client over the configured servers.
    ///
    /// Configuration problems are the only fatal errors in this crate; every
    /// failure after construction is a recoverable result value.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let ring = HashRing::build(
            config
                .servers
                .iter()
                .map(|server| Node::new(server.addr.clone(), server.weight))
                .collect(),
            config.vnodes_per_node,
        );
        let retry = RetryPolicy::new(config.retry.clone());

        Ok(CacheClient {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                ring: RwLock::new(Arc::new(ring)),
                pools: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
                retry,
            }),
        })
    }

    /// Convenience constructor for a single unweighted server.
    pub fn connect(addr: impl Into<String>) -> Result<Self> {
        Self::new(ClientConfig::new([addr.into()]))
    }

    // ---- single-key operations ----

    /// Stores `value` under `key`. `exptime` of 0 means no expiration.
    pub fn set(&self, key: &str, value: &[u8], exptime: u32) -> Result<()> {
        match self.store(StoreMode::Set, key, value, exptime)? {
            Response::Stored => Ok(()),
            other => Err(self.store_failure(other, value.len(), "set")),
        }
    }

    /// Stores only if `key` does not exist. Returns false when it does.
    pub fn add(&self, key: &str, value: &[u8], exptime: u32) -> Result<bool> {
        match self.store(StoreMode::Add, key, value, exptime)? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            other => Err(self.store_failure(other, value.len(), "add")),
        }
    }

    /// Stores only if `key` already exists. Returns false when it does not.
    pub fn replace(&self, key: &str, value: &[u8], exptime: u32) -> Result<bool> {
        match self.store(StoreMode::Replace, key, value, exptime)? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            other => Err(self.store_failure(other, value.len(), "replace")),
        }
    }

    /// Stores only if the entry's CAS token still matches `token`.
    pub fn cas(&self, key: &str, value: &[u8], exptime: u32, token: u64) -> Result<CasOutcome> {
        match self.store(StoreMode::Cas(token), key, value, exptime)? {
            Response::Stored => Ok(CasOutcome::Stored),
            Response::Exists => Ok(CasOutcome::Exists),
            Response::NotFound => Ok(CasOutcome::NotFound),
            other => Err(self.store_failure(other, value.len(), "cas")),
        }
    }

    /// Fetches a value. A missing key is `Ok(None)`, not an error.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.fetch_one(key, false)?.map(|item| item.data))
    }

    /// Fetches a value together with its CAS token, for use with [`cas`].
    ///
    /// [`cas`]: CacheClient::cas
    pub fn gets(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        match self.fetch_one(key, true)? {
            None => Ok(None),
            Some(item) => {
                let cas = item.cas.ok_or(Error::Unexpected("gets"))?;
                Ok(Some((item.data, cas)))
            }
        }
    }

    /// Whether `key` currently exists.
    ///
    /// Implemented as a `get` with the value discarded; no command beyond
    /// the read is issued, so expiration is not reset client-side. Whether
    /// the read itself bumps access time is server configuration.
    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.fetch_one(key, false)?.is_some())
    }

    /// Increments the stored decimal value by `delta`. Returns the new value,
    /// or `None` when the key does not exist (the server never auto-creates).
    pub fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.counter_op(key, delta, true)
    }

    /// Decrements the stored decimal value by `delta`, clamping at zero.
    /// Returns the new value, or `None` when the key does not exist.
    pub fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.counter_op(key, delta, false)
    }

    /// Deletes a key. Returns true when an entry was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        checked_key(key)?;
        let addr = self.primary_for(key)?;
        match self.call(&addr, &Command::Delete { key })? {
            Response::Deleted => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(response_error(other, "delete")),
        }
    }

    // ---- multi-key operations ----

    /// Fetches many keys at once. Keys are grouped by target node and each
    /// node serves its group in a single protocol command, concurrently
    /// across nodes. Missing keys are simply absent from the result.
    ///
    /// If any node fails after retries, the whole call reports
    /// [`Error::Partial`] naming the failed nodes and their keys.
    pub fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
        for key in keys {
            checked_key(key)?;
        }
        let groups = self.group_keys(keys)?;

        let mut results = HashMap::new();
        let mut failures = Vec::new();

        thread::scope(|scope| {
            let mut handles = Vec::new();
            for (addr, node_keys) in &groups {
                let handle = scope.spawn(|| self.fetch_node(addr, node_keys));
                handles.push((addr, node_keys, handle));
            }
            for (addr, node_keys, handle) in handles {
                match handle.join().expect("fetch thread panicked") {
                    Ok(items) => {
                        for item in items {
                            results.insert(item.key, item.data);
                        }
                    }
                    Err(error) => failures.push(NodeFailure {
                        addr: addr.clone(),
                        keys: node_keys.iter().map(|k| k.to_string()).collect(),
                        error: Box::new(error),
                    }),
                }
            }
        });

        finish_partial(results, failures)
    }

    /// Stores many entries at once, grouped by target node and written as
    /// one batch per node, concurrently across nodes. A failing node never
    /// aborts the other nodes' batches; failures are reported per key via
    /// [`Error::Partial`].
    pub fn set_multi(&self, entries: &[(&str, &[u8])], exptime: u32) -> Result<()> {
        for (key, value) in entries {
            checked_key(key)?;
            self.checked_value(value.len())?;
        }

        let ring = self.ring_snapshot();
        if ring.is_empty() {
            return Err(Error::NoServers);
        }
        let mut groups: HashMap<String, Vec<(&str, &[u8])>> = HashMap::new();
        for (key, value) in entries {
            let addr = ring
                .select(key.as_bytes())
                .map(|node| node.addr.clone())
                .ok_or(Error::NoServers)?;
            groups.entry(addr).or_default().push((key, value));
        }

        let mut failures = Vec::new();
        thread::scope(|scope| {
            let mut handles = Vec::new();
            for (addr, batch) in &groups {
                let handle = scope.spawn(|| self.store_node(addr, batch, exptime));
                handles.push((addr, handle));
            }
            for (addr, handle) in handles {
                if let Err((keys, error)) = handle.join().expect("store thread panicked") {
                    failures.push(NodeFailure {
                        addr: addr.clone(),
                        keys,
                        error: Box::new(error),
                    });
                }
            }
        });

        finish_partial((), failures)
    }

    // ---- broadcast operations ----

    /// Invalidates every entry on every node, optionally after `delay`
    /// seconds.
    ///
    /// Flush is not atomic across nodes: when some nodes fail, the nodes
    /// that already flushed stay flushed and the call reports
    /// [`Error::Partial`].
    pub fn flush(&self, delay: Option<u32>) -> Result<()> {
        let failures = self.broadcast(|addr| {
            match self.call(addr, &Command::FlushAll { delay })? {
                Response::Ok => Ok(()),
                other => Err(response_error(other, "flush_all")),
            }
        })?;
        finish_partial((), failures)
    }

    /// Version string of every node, keyed by address.
    pub fn version(&self) -> Result<HashMap<String, String>> {
        let mut versions = HashMap::new();
        let failures = {
            let results = Mutex::new(&mut versions);
            self.broadcast(|addr| {
                match self.call(addr, &Command::Version)? {
                    Response::Version(version) => {
                        results.lock().insert(addr.to_string(), version);
                        Ok(())
                    }
                    other => Err(response_error(other, "version")),
                }
            })?
        };
        finish_partial(versions, failures)
    }

    // ---- topology and lifecycle ----

    /// Adds a node to the ring. Only keys on the arcs the new node claims
    /// change ownership.
    pub fn add_server(&self, addr: &str, weight: u32) {
        let mut guard = self.shared.ring.write();
        let mut ring = (**guard).clone();
        ring.add_node(Node::new(addr, weight));
        *guard = Arc::new(ring);
        debug!(addr, weight, "server added to ring");
    }

    /// Removes a node from the ring and closes its pooled connections.
    pub fn remove_server(&self, addr: &str) {
        {
            let mut guard = self.shared.ring.write();
            let mut ring = (**guard).clone();
            ring.remove_node(addr);
            *guard = Arc::new(ring);
        }
        if let Some(pool) = self.shared.pools.lock().remove(addr) {
            pool.close();
        }
        self.shared.breakers.lock().remove(addr);
        debug!(addr, "server removed from ring");
    }

    /// Health of every ring node as classified by its circuit breaker.
    pub fn node_health(&self) -> Vec<(String, NodeHealth)> {
        let ring = self.ring_snapshot();
        let breakers = self.shared.breakers.lock();
        ring.nodes()
            .iter()
            .map(|node| {
                let health = breakers
                    .get(&node.addr)
                    .map(|breaker| breaker.health())
                    .unwrap_or(NodeHealth::Healthy);
                (node.addr.clone(), health)
            })
            .collect()
    }

    /// Per-node pool statistics: (address, open connections, idle
    /// connections). Open minus idle is the number currently in use.
    pub fn pool_stats(&self) -> Vec<(String, usize, usize)> {
        self.shared
            .pools
            .lock()
            .iter()
            .map(|(addr, pool)| {
                (
                    addr.clone(),
                    pool.total_connections(),
                    pool.idle_connections(),
                )
            })
            .collect()
    }

    /// Reaps idle connections past their idle timeout on every pool.
    pub fn sweep_idle(&self) {
        for pool in self.shared.pools.lock().values() {
            pool.sweep();
        }
    }

    /// Closes all pooled connections. In-flight calls finish on their own
    /// connections; the client remains usable and will reconnect lazily.
    pub fn close(&self) {
        let pools: Vec<ConnectionPool> = self.shared.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close();
        }
    }

    // ---- internals ----

    fn ring_snapshot(&self) -> Arc<HashRing> {
        self.shared.ring.read().clone()
    }

    fn primary_for(&self, key: &str) -> Result<String> {
        self.ring_snapshot()
            .select(key.as_bytes())
            .map(|node| node.addr.clone())
            .ok_or(Error::NoServers)
    }

    fn pool_for(&self, addr: &str) -> ConnectionPool {
        let mut pools = self.shared.pools.lock();
        pools
            .entry(addr.to_string())
            .or_insert_with(|| ConnectionPool::new(addr, self.shared.config.clone()))
            .clone()
    }

    fn breaker_for(&self, addr: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.shared.breakers.lock();
        breakers
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(addr, self.shared.config.breaker.clone())))
            .clone()
    }

    fn checked_value(&self, len: usize) -> Result<()> {
        let max = self.shared.config.max_value_size;
        if len > max {
            return Err(Error::ValueTooLarge { len, max });
        }
        Ok(())
    }

    /// One command against one node, with breaker gating and retries. The
    /// pooled connection is always released or invalidated before returning.
    fn call(&self, addr: &str, cmd: &Command<'_>) -> Result<Response> {
        let breaker = self.breaker_for(addr);
        if !breaker.allow() {
            return Err(Error::NodeSuspended {
                addr: addr.to_string(),
            });
        }
        let pool = self.pool_for(addr);

        let mut attempt = 0;
        loop {
            let result = pool.acquire().and_then(|mut conn| conn.round_trip(cmd));
            match result {
                Ok(resp) => {
                    breaker.record_success();
                    return Ok(resp);
                }
                Err(err) => {
                    if err.is_transient() {
                        breaker.record_failure();
                    }
                    match self.shared.retry.decide(&err, attempt) {
                        RetryDecision::Retry(delay) => {
                            debug!(addr, attempt, error = %err, "retrying after transient failure");
                            thread::sleep(delay);
                            attempt += 1;
                            if !breaker.allow() {
                                return Err(Error::NodeSuspended {
                                    addr: addr.to_string(),
                                });
                            }
                        }
                        RetryDecision::GiveUp => return Err(err),
                    }
                }
            }
        }
    }

    /// Batch variant of [`call`]: the whole batch is one exchange and is
    /// retried as a unit.
    ///
    /// [`call`]: CacheClient::call
    fn call_batch(&self, addr: &str, cmds: &[Command<'_>]) -> Result<Vec<Response>> {
        let breaker = self.breaker_for(addr);
        if !breaker.allow() {
            return Err(Error::NodeSuspended {
                addr: addr.to_string(),
            });
        }
        let pool = self.pool_for(addr);

        let mut attempt = 0;
        loop {
            let result = pool
                .acquire()
                .and_then(|mut conn| conn.round_trip_batch(cmds));
            match result {
                Ok(responses) => {
                    breaker.record_success();
                    return Ok(responses);
                }
                Err(err) => {
                    if err.is_transient() {
                        breaker.record_failure();
                    }
                    match self.shared.retry.decide(&err, attempt) {
                        RetryDecision::Retry(delay) => {
                            debug!(addr, attempt, error = %err, "retrying batch after transient failure");
                            thread::sleep(delay);
                            attempt += 1;
                            if !breaker.allow() {
                                return Err(Error::NodeSuspended {
                                    addr: addr.to_string(),
                                });
                            }
                        }
                        RetryDecision::GiveUp => return Err(err),
                    }
                }
            }
        }
    }

    fn store(
        &self,
        mode: StoreMode,
        key: &str,
        value: &[u8],
        exptime: u32,
    ) -> Result<Response> {
        checked_key(key)?;
        self.checked_value(value.len())?;
        let addr = self.primary_for(key)?;
        self.call(
            &addr,
            &Command::Store {
                mode,
                key,
                value,
                flags: 0,
                exptime,
            },
        )
    }

    fn store_failure(&self, resp: Response, value_len: usize, op: &'static str) -> Error {
        if let Response::ServerError(msg) = &resp {
            // The classic reply for an over-limit value.
            if msg.contains("too large") {
                return Error::ValueTooLarge {
                    len: value_len,
                    max: self.shared.config.max_value_size,
                };
            }
        }
        response_error(resp, op)
    }

    fn fetch_one(&self, key: &str, with_cas: bool) -> Result<Option<ValueItem>> {
        checked_key(key)?;
        let addr = self.primary_for(key)?;
        let keys = [key];
        match self.call(&addr, &Command::Get { keys: &keys, with_cas })? {
            Response::Values(items) => Ok(items.into_iter().find(|item| item.key == key)),
            other => Err(response_error(other, "get")),
        }
    }

    fn counter_op(&self, key: &str, delta: u64, incr: bool) -> Result<Option<u64>> {
        checked_key(key)?;
        let addr = self.primary_for(key)?;
        let cmd = if incr {
            Command::Incr { key, delta }
        } else {
            Command::Decr { key, delta }
        };
        match self.call(&addr, &cmd)? {
            Response::Counter(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            other => Err(response_error(other, if incr { "incr" } else { "decr" })),
        }
    }

    fn group_keys<'k>(&self, keys: &[&'k str]) -> Result<HashMap<String, Vec<&'k str>>> {
        let ring = self.ring_snapshot();
        if ring.is_empty() {
            return Err(Error::NoServers);
        }
        let mut groups: HashMap<String, Vec<&str>> = HashMap::new();
        for key in keys {
            let addr = ring
                .select(key.as_bytes())
                .map(|node| node.addr.clone())
                .ok_or(Error::NoServers)?;
            groups.entry(addr).or_default().push(key);
        }
        Ok(groups)
    }

    fn fetch_node(&self, addr: &str, keys: &[&str]) -> Result<Vec<ValueItem>> {
        match self.call(addr, &Command::Get { keys, with_cas: false })? {
            Response::Values(items) => Ok(items),
            other => Err(response_error(other, "get")),
        }
    }

    fn store_node(
        &self,
        addr: &str,
        batch: &[(&str, &[u8])],
        exptime: u32,
    ) -> std::result::Result<(), (Vec<String>, Error)> {
        let cmds: Vec<Command<'_>> = batch
            .iter()
            .map(|(key, value)| Command::Store {
                mode: StoreMode::Set,
                key,
                value,
                flags: 0,
                exptime,
            })
            .collect();

        match self.call_batch(addr, &cmds) {
            Err(err) => Err((batch.iter().map(|(key, _)| key.to_string()).collect(), err)),
            Ok(responses) => {
                let mut failed_keys = Vec::new();
                let mut first_error = None;
                for ((key, value), resp) in batch.iter().zip(responses) {
                    match resp {
                        Response::Stored => {}
                        other => {
                            failed_keys.push(key.to_string());
                            if first_error.is_none() {
                                first_error =
                                    Some(self.store_failure(other, value.len(), "set"));
                            }
                        }
                    }
                }
                match first_error {
                    None => Ok(()),
                    Some(error) => Err((failed_keys, error)),
                }
            }
        }
    }

    /// Runs `op` once per ring node on scoped threads and collects the
    /// failures. Returns `Err` only when the ring is empty.
    fn broadcast(
        &self,
        op: impl Fn(&str) -> Result<()> + Sync,
    ) -> Result<Vec<NodeFailure>> {
        let ring = self.ring_snapshot();
        if ring.is_empty() {
            return Err(Error::NoServers);
        }

        let mut failures = Vec::new();
        thread::scope(|scope| {
            let mut handles = Vec::new();
            for node in ring.nodes() {
                let handle = scope.spawn(|| op(&node.addr));
                handles.push((node.addr.clone(), handle));
            }
            for (addr, handle) in handles {
                if let Err(error) = handle.join().expect("broadcast thread panicked") {
                    failures.push(NodeFailure {
                        addr,
                        keys: Vec::new(),
                        error: Box::new(error),
                    });
                }
            }
        });
        Ok(failures)
    }
}

fn checked_key(key: &str) -> Result<()> {
    validate_key(key).map_err(|err| match err {
        ProtoError::BadKey(msg) => Error::BadKey(msg),
        other => Error::Protocol(other),
    })
}

fn response_error(resp: Response, expected: &'static str) -> Error {
    match resp {
        Response::ClientError(msg) | Response::ServerError(msg) => Error::Server(msg),
        Response::Error => Error::Server("command not recognized by server".to_string()),
        _ => Error::Unexpected(expected),
    }
}

/// Collapses fan-out failures: every node succeeded, or the success value is
/// traded for a [`Error::Partial`] with a deterministic node order.
fn finish_partial<T>(value: T, mut failures: Vec<NodeFailure>) -> Result<T> {
    if failures.is_empty() {
        return Ok(value);
    }
    failures.sort_by(|a, b| a.addr.cmp(&b.addr));
    Err(Error::Partial(PartialFailure { failures }))
}
