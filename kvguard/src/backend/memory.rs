//! In-process backend
//!
//! Implements the subset of the store's command set this crate issues, with
//! per-key versions backing WATCH and per-connection MULTI queues. Clones
//! share the same data set, so a test can keep a handle to flip reachability
//! ([`MemoryBackend::set_reachable`]) while the pool owns another.
//!
//! Built for tests and the `test-util` feature only.

use super::{AtomicOp, Backend, Connection};
use crate::command::{Command, Reply};
use crate::error::{KvError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<Vec<u8>, Entry>,
    versions: HashMap<Vec<u8>, u64>,
    clock: u64,
}

fn wrong_type() -> KvError {
    KvError::Server(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn syntax_error() -> KvError {
    KvError::Server("ERR syntax error".to_string())
}

fn arity(cmd: &Command, min: usize) -> Result<&[Vec<u8>]> {
    let args = cmd.arguments();
    if args.len() < min {
        return Err(KvError::Server(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd.name().to_lowercase()
        )));
    }
    Ok(args)
}

fn parse_int(arg: &[u8]) -> Result<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            KvError::Server("ERR value is not an integer or out of range".to_string())
        })
}

fn ok() -> Reply {
    Reply::Status("OK".to_string())
}

impl Store {
    fn touch(&mut self, key: &[u8]) {
        self.clock += 1;
        self.versions.insert(key.to_vec(), self.clock);
    }

    fn version(&mut self, key: &[u8]) -> u64 {
        self.purge_expired(key);
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn purge_expired(&mut self, key: &[u8]) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<&Entry> {
        self.purge_expired(key);
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        self.purge_expired(key);
        self.entries.get_mut(key)
    }

    fn set_string(&mut self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_vec(),
            Entry {
                value: Value::Str(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        self.touch(key);
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        self.purge_expired(key);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.touch(key);
        }
        removed
    }

    fn string(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(data),
                ..
            }) => Ok(Some(data.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_mut(&mut self, key: &[u8]) -> Result<&mut BTreeMap<Vec<u8>, Vec<u8>>> {
        self.purge_expired(key);
        let entry = self.entries.entry(key.to_vec()).or_insert_with(|| Entry {
            value: Value::Hash(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type()),
        }
    }

    fn hash(&mut self, key: &[u8]) -> Result<Option<&BTreeMap<Vec<u8>, Vec<u8>>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(Some(hash)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn list_mut(&mut self, key: &[u8]) -> Result<&mut VecDeque<Vec<u8>>> {
        self.purge_expired(key);
        let entry = self.entries.entry(key.to_vec()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type()),
        }
    }

    fn list(&mut self, key: &[u8]) -> Result<Option<&VecDeque<Vec<u8>>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_mut(&mut self, key: &[u8]) -> Result<&mut BTreeSet<Vec<u8>>> {
        self.purge_expired(key);
        let entry = self.entries.entry(key.to_vec()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => Ok(set),
            _ => Err(wrong_type()),
        }
    }

    /// Drop a container key once it holds no elements
    fn drop_if_empty(&mut self, key: &[u8]) {
        let empty = match self.entries.get(key).map(|entry| &entry.value) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Set(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn pop(&mut self, key: &[u8], front: bool) -> Result<Reply> {
        if self.list(key)?.is_none() {
            return Ok(Reply::Nil);
        }
        let list = self.list_mut(key)?;
        let popped = if front {
            list.pop_front()
        } else {
            list.pop_back()
        };
        self.drop_if_empty(key);
        self.touch(key);
        Ok(popped.map(Reply::Bulk).unwrap_or(Reply::Nil))
    }

    fn push(&mut self, args: &[Vec<u8>], front: bool) -> Result<Reply> {
        let key = &args[0];
        let list = self.list_mut(key)?;
        for value in &args[1..] {
            if front {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
        }
        let len = list.len() as i64;
        self.touch(key);
        Ok(Reply::Int(len))
    }

    fn hash_set(&mut self, args: &[Vec<u8>], only_new: bool) -> Result<Reply> {
        let key = &args[0];
        let hash = self.hash_mut(key)?;
        let mut created = 0;
        for pair in args[1..].chunks(2) {
            let [field, value] = pair else {
                return Err(syntax_error());
            };
            if only_new && hash.contains_key(field) {
                continue;
            }
            if hash.insert(field.clone(), value.clone()).is_none() {
                created += 1;
            }
        }
        self.touch(key);
        Ok(Reply::Int(created))
    }

    fn hash_take(&mut self, table: &[u8], field: &[u8]) -> Result<Reply> {
        if self.hash(table)?.is_none() {
            return Ok(Reply::Nil);
        }
        let taken = self.hash_mut(table)?.remove(field);
        self.drop_if_empty(table);
        if taken.is_some() {
            self.touch(table);
        }
        Ok(taken.map(Reply::Bulk).unwrap_or(Reply::Nil))
    }

    fn delete_if_equals(&mut self, key: &[u8], expected: &[u8]) -> Result<Reply> {
        match self.string(key)? {
            Some(current) if current == expected => {
                self.remove(key);
                Ok(Reply::Int(1))
            }
            _ => Ok(Reply::Int(0)),
        }
    }

    fn ttl(&mut self, key: &[u8]) -> Reply {
        match self.get(key) {
            None => Reply::Int(-2),
            Some(Entry {
                expires_at: None, ..
            }) => Reply::Int(-1),
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                Reply::Int(((remaining.as_millis() + 500) / 1000) as i64)
            }
        }
    }

    fn set_with_options(&mut self, args: &[Vec<u8>]) -> Result<Reply> {
        let (key, value) = (&args[0], &args[1]);
        let mut only_new = false;
        let mut ttl = None;
        let mut options = args[2..].iter();
        while let Some(option) = options.next() {
            match option.to_ascii_uppercase().as_slice() {
                b"NX" => only_new = true,
                b"EX" => {
                    let secs = parse_int(options.next().ok_or_else(syntax_error)?)?;
                    ttl = Some(Duration::from_secs(secs.max(0) as u64));
                }
                b"PX" => {
                    let millis = parse_int(options.next().ok_or_else(syntax_error)?)?;
                    ttl = Some(Duration::from_millis(millis.max(0) as u64));
                }
                _ => return Err(syntax_error()),
            }
        }

        if only_new && self.get(key).is_some() {
            return Ok(Reply::Nil);
        }
        self.set_string(key, value.clone(), ttl);
        Ok(ok())
    }

    fn apply(&mut self, cmd: &Command) -> Result<Reply> {
        match cmd.name().to_ascii_uppercase().as_str() {
            "PING" => Ok(Reply::Status("PONG".to_string())),
            "AUTH" | "SELECT" => Ok(ok()),
            "TIME" => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                Ok(Reply::Array(vec![
                    Reply::Bulk(now.as_secs().to_string().into_bytes()),
                    Reply::Bulk(now.subsec_micros().to_string().into_bytes()),
                ]))
            }
            "GET" => {
                let args = arity(cmd, 1)?;
                Ok(self.string(&args[0])?.map(Reply::Bulk).unwrap_or(Reply::Nil))
            }
            "SET" => {
                let args = arity(cmd, 2)?;
                self.set_with_options(args)
            }
            "GETSET" => {
                let args = arity(cmd, 2)?;
                let old = self.string(&args[0])?;
                self.set_string(&args[0], args[1].clone(), None);
                Ok(old.map(Reply::Bulk).unwrap_or(Reply::Nil))
            }
            "SETEX" => {
                let args = arity(cmd, 3)?;
                let secs = parse_int(&args[1])?;
                if secs <= 0 {
                    return Err(KvError::Server(
                        "ERR invalid expire time in 'setex' command".to_string(),
                    ));
                }
                self.set_string(
                    &args[0],
                    args[2].clone(),
                    Some(Duration::from_secs(secs as u64)),
                );
                Ok(ok())
            }
            "SETNX" => {
                let args = arity(cmd, 2)?;
                if self.get(&args[0]).is_some() {
                    return Ok(Reply::Int(0));
                }
                self.set_string(&args[0], args[1].clone(), None);
                Ok(Reply::Int(1))
            }
            "EXPIRE" => {
                let args = arity(cmd, 2)?;
                let secs = parse_int(&args[1])?;
                let key = &args[0];
                if self.get(key).is_none() {
                    return Ok(Reply::Int(0));
                }
                if secs <= 0 {
                    self.remove(key);
                } else if let Some(entry) = self.get_mut(key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(secs as u64));
                    self.touch(key);
                }
                Ok(Reply::Int(1))
            }
            "DEL" => {
                let args = arity(cmd, 1)?;
                let removed = args.iter().filter(|key| self.remove(key)).count();
                Ok(Reply::Int(removed as i64))
            }
            "EXISTS" => {
                let args = arity(cmd, 1)?;
                let found = args.iter().filter(|key| self.get(key).is_some()).count();
                Ok(Reply::Int(found as i64))
            }
            "TTL" => {
                let args = arity(cmd, 1)?;
                Ok(self.ttl(&args[0]))
            }
            "INCR" => {
                let args = arity(cmd, 1)?;
                let current = match self.string(&args[0])? {
                    Some(data) => parse_int(&data)?,
                    None => 0,
                };
                let next = current + 1;
                let expires_at = self.get(&args[0]).and_then(|entry| entry.expires_at);
                self.set_string(&args[0], next.to_string().into_bytes(), None);
                if let Some(entry) = self.entries.get_mut(args[0].as_slice()) {
                    entry.expires_at = expires_at;
                }
                Ok(Reply::Int(next))
            }
            "HSET" => {
                let args = arity(cmd, 3)?;
                self.hash_set(args, false)
            }
            "HSETNX" => {
                let args = arity(cmd, 3)?;
                self.hash_set(&args[..3], true)
            }
            "HGET" => {
                let args = arity(cmd, 2)?;
                Ok(self
                    .hash(&args[0])?
                    .and_then(|hash| hash.get(&args[1]).cloned())
                    .map(Reply::Bulk)
                    .unwrap_or(Reply::Nil))
            }
            "HDEL" => {
                let args = arity(cmd, 2)?;
                if self.hash(&args[0])?.is_none() {
                    return Ok(Reply::Int(0));
                }
                let hash = self.hash_mut(&args[0])?;
                let removed = args[1..]
                    .iter()
                    .filter(|field| hash.remove(*field).is_some())
                    .count();
                self.drop_if_empty(&args[0]);
                if removed > 0 {
                    self.touch(&args[0]);
                }
                Ok(Reply::Int(removed as i64))
            }
            "HLEN" => {
                let args = arity(cmd, 1)?;
                let len = self.hash(&args[0])?.map(|hash| hash.len()).unwrap_or(0);
                Ok(Reply::Int(len as i64))
            }
            "HKEYS" => {
                let args = arity(cmd, 1)?;
                let keys = self
                    .hash(&args[0])?
                    .map(|hash| hash.keys().cloned().map(Reply::Bulk).collect())
                    .unwrap_or_default();
                Ok(Reply::Array(keys))
            }
            "HMGET" => {
                let args = arity(cmd, 2)?;
                let hash = self.hash(&args[0])?;
                let values = args[1..]
                    .iter()
                    .map(|field| {
                        hash.and_then(|hash| hash.get(field).cloned())
                            .map(Reply::Bulk)
                            .unwrap_or(Reply::Nil)
                    })
                    .collect();
                Ok(Reply::Array(values))
            }
            "LPUSH" => {
                let args = arity(cmd, 2)?;
                self.push(args, true)
            }
            "RPUSH" => {
                let args = arity(cmd, 2)?;
                self.push(args, false)
            }
            "LPOP" => {
                let args = arity(cmd, 1)?;
                self.pop(&args[0], true)
            }
            "RPOP" => {
                let args = arity(cmd, 1)?;
                self.pop(&args[0], false)
            }
            "LLEN" => {
                let args = arity(cmd, 1)?;
                let len = self.list(&args[0])?.map(|list| list.len()).unwrap_or(0);
                Ok(Reply::Int(len as i64))
            }
            "LRANGE" => {
                let args = arity(cmd, 3)?;
                let (start, stop) = (parse_int(&args[1])?, parse_int(&args[2])?);
                let Some(list) = self.list(&args[0])? else {
                    return Ok(Reply::Array(Vec::new()));
                };
                let len = list.len() as i64;
                let start = if start < 0 { (len + start).max(0) } else { start };
                let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
                if start > stop || start >= len {
                    return Ok(Reply::Array(Vec::new()));
                }
                let items = list
                    .range(start as usize..=stop as usize)
                    .cloned()
                    .map(Reply::Bulk)
                    .collect();
                Ok(Reply::Array(items))
            }
            "LPOS" => {
                let args = arity(cmd, 2)?;
                let position = self
                    .list(&args[0])?
                    .and_then(|list| list.iter().position(|item| item == &args[1]));
                Ok(position.map_or(Reply::Nil, |index| Reply::Int(index as i64)))
            }
            "SADD" => {
                let args = arity(cmd, 2)?;
                let set = self.set_mut(&args[0])?;
                let added = args[1..]
                    .iter()
                    .filter(|member| set.insert((*member).clone()))
                    .count();
                self.touch(&args[0]);
                Ok(Reply::Int(added as i64))
            }
            "SREM" => {
                let args = arity(cmd, 2)?;
                if self.get(&args[0]).is_none() {
                    return Ok(Reply::Int(0));
                }
                let set = self.set_mut(&args[0])?;
                let removed = args[1..]
                    .iter()
                    .filter(|member| set.remove(*member))
                    .count();
                self.drop_if_empty(&args[0]);
                self.touch(&args[0]);
                Ok(Reply::Int(removed as i64))
            }
            "SMEMBERS" => {
                let args = arity(cmd, 1)?;
                let members = match self.get(&args[0]) {
                    None => Vec::new(),
                    Some(Entry {
                        value: Value::Set(set),
                        ..
                    }) => set.iter().cloned().map(Reply::Bulk).collect(),
                    Some(_) => return Err(wrong_type()),
                };
                Ok(Reply::Array(members))
            }
            other => Err(KvError::Server(format!(
                "ERR unknown command '{}'",
                other.to_lowercase()
            ))),
        }
    }
}

struct Shared {
    store: Mutex<Store>,
    reachable: AtomicBool,
    served: AtomicU64,
}

/// An in-process key-value server
#[derive(Clone)]
pub struct MemoryBackend {
    address: String,
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Create an empty, reachable server
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                reachable: AtomicBool::new(true),
                served: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate the network going down (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.shared.reachable.load(Ordering::SeqCst)
    }

    /// Number of commands answered so far
    pub fn commands_served(&self) -> u64 {
        self.shared.served.load(Ordering::SeqCst)
    }

    /// Remove every key
    pub fn flush(&self) {
        let mut store = self.shared.store.lock();
        let keys: Vec<Vec<u8>> = store.entries.keys().cloned().collect();
        for key in keys {
            store.remove(&key);
        }
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(KvError::Connection(format!(
                "{}: connection refused",
                self.address
            )))
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Conn = MemoryConnection;

    fn address(&self) -> &str {
        &self.address
    }

    async fn checkout(&self) -> Result<MemoryConnection> {
        self.ensure_reachable()?;
        Ok(MemoryConnection {
            backend: self.clone(),
            watched: Vec::new(),
            queued: None,
        })
    }
}

/// A session on a [`MemoryBackend`]
pub struct MemoryConnection {
    backend: MemoryBackend,
    watched: Vec<(Vec<u8>, u64)>,
    queued: Option<Vec<Command>>,
}

impl MemoryConnection {
    fn exec(&mut self, store: &mut Store) -> Result<Reply> {
        let Some(queued) = self.queued.take() else {
            return Err(KvError::Server("ERR EXEC without MULTI".to_string()));
        };
        let watched = std::mem::take(&mut self.watched);
        let conflict = watched
            .iter()
            .any(|(key, version)| store.version(key) != *version);
        if conflict {
            return Ok(Reply::Nil);
        }

        // A failing command does not stop the ones queued after it
        let mut results = Vec::with_capacity(queued.len());
        for cmd in &queued {
            results.push(match store.apply(cmd) {
                Ok(reply) => reply,
                Err(KvError::Server(msg)) => Reply::Error(msg),
                Err(err) => return Err(err),
            });
        }
        Ok(Reply::Array(results))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&mut self, cmd: &Command) -> Result<Reply> {
        self.backend.ensure_reachable()?;
        let shared = Arc::clone(&self.backend.shared);
        let mut store = shared.store.lock();

        let reply = match cmd.name().to_ascii_uppercase().as_str() {
            "WATCH" => {
                if self.queued.is_some() {
                    return Err(KvError::Server(
                        "ERR WATCH inside MULTI is not allowed".to_string(),
                    ));
                }
                for key in arity(cmd, 1)? {
                    let version = store.version(key);
                    self.watched.push((key.clone(), version));
                }
                ok()
            }
            "UNWATCH" => {
                self.watched.clear();
                ok()
            }
            "MULTI" => {
                if self.queued.is_some() {
                    return Err(KvError::Server(
                        "ERR MULTI calls can not be nested".to_string(),
                    ));
                }
                self.queued = Some(Vec::new());
                ok()
            }
            "DISCARD" => {
                if self.queued.take().is_none() {
                    return Err(KvError::Server("ERR DISCARD without MULTI".to_string()));
                }
                self.watched.clear();
                ok()
            }
            "EXEC" => self.exec(&mut store)?,
            _ => match self.queued.as_mut() {
                Some(queued) => {
                    queued.push(cmd.clone());
                    Reply::Status("QUEUED".to_string())
                }
                None => store.apply(cmd)?,
            },
        };

        shared.served.fetch_add(1, Ordering::SeqCst);
        Ok(reply)
    }

    async fn atomic(&mut self, op: AtomicOp<'_>) -> Result<Reply> {
        self.backend.ensure_reachable()?;
        let shared = Arc::clone(&self.backend.shared);
        let mut store = shared.store.lock();

        let reply = match op {
            AtomicOp::HashTake { table, field } => {
                store.hash_take(table.as_bytes(), field.as_bytes())?
            }
            AtomicOp::DeleteIfEquals { key, expected } => {
                store.delete_if_equals(key.as_bytes(), expected)?
            }
        };

        shared.served.fetch_add(1, Ordering::SeqCst);
        Ok(reply)
    }
}
