//! Key-value shards: the [`KvStore`] seam, the device-type [`ShardRouter`],
//! a pooled memcached text-protocol client, and an in-process store.
use crate::config::ShardAddrs;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// memcached rejects keys longer than this.
pub const MAX_KEY_LENGTH: usize = 250;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid memcached key `{0}`")]
    InvalidKey(String),
    #[error("server rejected write: {0}")]
    Rejected(String),
    #[error("connection closed by server")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A shard that can hold one value per key.
///
/// Implementations are shared by every worker of a run and must tolerate
/// concurrent `put` calls.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
}

/// Maps a device type label to the store holding its records.
#[derive(Clone, Default)]
pub struct ShardRouter {
    shards: HashMap<String, Arc<dyn KvStore>>,
}

impl ShardRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One lazily-connected [`MemcacheClient`] per configured address.
    pub fn connect_memcache(addrs: &ShardAddrs) -> Self {
        let mut router = Self::new();
        for (device_type, addr) in addrs.iter() {
            router.insert(device_type, Arc::new(MemcacheClient::new(addr)));
        }
        router
    }

    pub fn insert(&mut self, device_type: impl Into<String>, store: Arc<dyn KvStore>) {
        self.shards.insert(device_type.into(), store);
    }

    /// `None` for a device type with no shard.
    pub fn route(&self, device_type: &str) -> Option<&Arc<dyn KvStore>> {
        self.shards.get(device_type)
    }

    pub fn device_types(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.device_types().collect();
        types.sort_unstable();
        f.debug_struct("ShardRouter").field("shards", &types).finish()
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.len() > MAX_KEY_LENGTH
        || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// memcached client speaking the text protocol (`set` only).
///
/// Connections are opened on demand and parked in a small idle pool between
/// writes; a connection that saw any error is dropped instead of returned.
pub struct MemcacheClient {
    addr: String,
    idle: Mutex<Vec<BufStream<TcpStream>>>,
    max_idle: usize,
}

impl MemcacheClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            idle: Mutex::new(Vec::new()),
            max_idle: 16,
        }
    }

    async fn checkout(&self) -> io::Result<BufStream<TcpStream>> {
        let parked = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match parked {
            Some(conn) => Ok(conn),
            None => {
                let stream = TcpStream::connect(&self.addr).await?;
                stream.set_nodelay(true)?;
                Ok(BufStream::new(stream))
            }
        }
    }

    fn checkin(&self, conn: BufStream<TcpStream>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
    }

    async fn set(conn: &mut BufStream<TcpStream>, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let header = format!("set {key} 0 0 {}\r\n", value.len());
        let mut frame = BytesMut::with_capacity(header.len() + value.len() + 2);
        frame.put_slice(header.as_bytes());
        frame.put_slice(value);
        frame.put_slice(b"\r\n");
        conn.write_all(&frame).await?;
        conn.flush().await?;

        let mut reply = String::new();
        if conn.read_line(&mut reply).await? == 0 {
            return Err(StoreError::Closed);
        }
        match reply.trim_end() {
            "STORED" => Ok(()),
            other => Err(StoreError::Rejected(other.to_string())),
        }
    }
}

impl std::fmt::Debug for MemcacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheClient").field("addr", &self.addr).finish()
    }
}

#[async_trait]
impl KvStore for MemcacheClient {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut conn = self.checkout().await?;
        let result = Self::set(&mut conn, key, &value).await;
        match result {
            Ok(()) => {
                self.checkin(conn);
                Ok(())
            }
            // NOT_STORED and friends leave the stream in sync
            Err(err @ StoreError::Rejected(_)) => {
                self.checkin(conn);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// In-process store, handy for tests and trial runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.items.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| StoreError::Rejected("memory store poisoned".into()))?;
        items.insert(key.to_string(), value);
        Ok(())
    }
}
