//! Redis Adapter
//!
//! Implements the [`KeyValueStore`] port over a single RESP2 connection.
//! Commands are serialized through one connection; a broken connection is
//! dropped and re-established on the next command.

mod resp;

pub use resp::{encode_command, parse_reply, RespValue};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::ports::{KeyValueStore, ServerScript};
use crate::error::{Error, Result};

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `host:port`
    pub addr: String,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(2),
        }
    }
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn open(config: &RedisConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.addr))
            .await
            .map_err(|_| Error::Substrate(format!("connect to {} timed out", config.addr)))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        if let Some(password) = &config.password {
            let reply = conn.request(&[b"AUTH".as_slice(), password.as_bytes()]).await?;
            expect_ok("AUTH", reply)?;
        }
        Ok(conn)
    }

    async fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<RespValue> {
        let mut out = BytesMut::new();
        encode_command(args, &mut out);
        self.stream.write_all(&out).await?;

        loop {
            if let Some((value, used)) = parse_reply(&self.buf)? {
                let _ = self.buf.split_to(used);
                return Ok(value);
            }
            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(Error::Substrate("connection closed by server".to_string()));
            }
        }
    }
}

/// Redis-backed key-value substrate.
pub struct RedisStore {
    config: RedisConfig,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.config.addr)
            .finish()
    }
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    #[instrument(skip(config), fields(addr = %config.addr))]
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let conn = Connection::open(&config).await?;
        let store = Self {
            config,
            conn: Mutex::new(Some(conn)),
        };
        match store.command(&["PING"]).await? {
            RespValue::Simple(s) if s == "PONG" => {}
            other => {
                return Err(Error::UnexpectedReply {
                    command: "PING".to_string(),
                    reply: other.describe(),
                })
            }
        }
        info!("Connected to Redis at {}", store.config.addr);
        Ok(store)
    }

    async fn command<A: AsRef<[u8]>>(&self, args: &[A]) -> Result<RespValue> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            debug!(addr = %self.config.addr, "Reconnecting to Redis");
            *guard = Some(Connection::open(&self.config).await?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("connection slot empty".to_string()))?;

        let outcome = tokio::time::timeout(self.config.command_timeout, conn.request(args)).await;
        match outcome {
            Ok(Ok(RespValue::Error(message))) => Err(Error::Substrate(message)),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(error = %e, "Dropping Redis connection");
                *guard = None;
                Err(e)
            }
            Err(_) => {
                // The reply may still arrive; the stream is no longer in sync.
                *guard = None;
                Err(Error::Substrate("command timed out".to_string()))
            }
        }
    }
}

fn expect_ok(command: &str, reply: RespValue) -> Result<()> {
    match reply {
        RespValue::Simple(s) if s == "OK" => Ok(()),
        RespValue::Error(e) => Err(Error::Substrate(e)),
        other => Err(Error::UnexpectedReply {
            command: command.to_string(),
            reply: other.describe(),
        }),
    }
}

fn expect_int(command: &str, reply: RespValue) -> Result<i64> {
    match reply {
        RespValue::Integer(n) => Ok(n),
        other => Err(Error::UnexpectedReply {
            command: command.to_string(),
            reply: other.describe(),
        }),
    }
}

fn bulk_to_string(command: &str, value: RespValue) -> Result<Option<String>> {
    match value {
        RespValue::Bulk(None) => Ok(None),
        RespValue::Bulk(Some(bytes)) => String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| Error::Protocol(format!("{} returned non-UTF-8 data", command))),
        other => Err(Error::UnexpectedReply {
            command: command.to_string(),
            reply: other.describe(),
        }),
    }
}

fn millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let reply = self.command(&["GET", key]).await?;
        bulk_to_string("GET", reply)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let reply = match ttl {
            Some(ttl) => {
                let px = millis(ttl);
                self.command(&["SET", key, value, "PX", px.as_str()]).await?
            }
            None => self.command(&["SET", key, value]).await?,
        };
        expect_ok("SET", reply)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let px = millis(ttl);
        match self
            .command(&["SET", key, value, "NX", "PX", px.as_str()])
            .await?
        {
            RespValue::Bulk(None) => Ok(false),
            reply => expect_ok("SET NX", reply).map(|_| true),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let reply = self.command(&["DEL", key]).await?;
        expect_int("DEL", reply).map(|n| n > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let reply = self.command(&["INCR", key]).await?;
        expect_int("INCR", reply)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = Vec::with_capacity(2 + fields.len() * 2);
        args.push("HSET");
        args.push(key);
        for (field, value) in fields {
            args.push(field);
            args.push(value);
        }
        let reply = self.command(args.as_slice()).await?;
        expect_int("HSET", reply).map(|_| ())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let items = match self.command(&["HGETALL", key]).await? {
            RespValue::Array(Some(items)) => items,
            RespValue::Array(None) => return Ok(HashMap::new()),
            other => {
                return Err(Error::UnexpectedReply {
                    command: "HGETALL".to_string(),
                    reply: other.describe(),
                })
            }
        };
        if items.len() % 2 != 0 {
            return Err(Error::Protocol("HGETALL returned an odd element count".to_string()));
        }
        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            let field = bulk_to_string("HGETALL", field)?.unwrap_or_default();
            let value = bulk_to_string("HGETALL", value)?.unwrap_or_default();
            map.insert(field, value);
        }
        Ok(map)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let reply = self.command(&["SADD", key, member]).await?;
        expect_int("SADD", reply).map(|n| n > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let reply = self.command(&["SISMEMBER", key, member]).await?;
        expect_int("SISMEMBER", reply).map(|n| n == 1)
    }

    async fn eval(&self, script: ServerScript, keys: &[String], args: &[String]) -> Result<i64> {
        let numkeys = keys.len().to_string();
        let mut command: Vec<&str> = Vec::with_capacity(3 + keys.len() + args.len());
        command.push("EVAL");
        command.push(script.source());
        command.push(&numkeys);
        command.extend(keys.iter().map(String::as_str));
        command.extend(args.iter().map(String::as_str));
        let reply = self.command(command.as_slice()).await?;
        expect_int(script.name(), reply)
    }
}
