//! RESP wire client.
//!
//! Each operation opens a fresh connection, authenticates, runs its commands
//! and drops the socket. The control plane performs a handful of store
//! round-trips per second at most, so per-operation connections keep the
//! client stateless and make compare-and-swap (`WATCH`/`MULTI`/`EXEC`) safe
//! without a connection pool.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::{Result, StateStore, StoreError};

const DEFAULT_PORT: u16 = 6379;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const SCAN_COUNT: &str = "100";

/// One reply from the store
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Simple(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

#[derive(Debug)]
pub struct RedisStore {
    addr: String,
    password: Option<String>,
    db: Option<u32>,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(endpoint: &str) -> Result<Self> {
        if !endpoint.starts_with("redis://") && !endpoint.starts_with("rediss://") {
            return Err(StoreError::InvalidUrl(format!(
                "expected redis:// or memory://, got {endpoint}"
            )));
        }
        let parsed =
            Url::parse(endpoint).map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| StoreError::InvalidUrl("missing host".into()))?;
        let port = parsed.port().unwrap_or(DEFAULT_PORT);
        let db = parsed
            .path()
            .trim_start_matches('/')
            .parse::<u32>()
            .ok()
            .filter(|db| *db != 0);
        let password = parsed
            .password()
            .filter(|p| !p.is_empty())
            .map(ToString::to_string);

        Ok(Self {
            addr: format!("{host}:{port}"),
            password,
            db,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    async fn open(&self) -> Result<TcpStream> {
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.addr)).await??;
        if let Some(password) = self.password.as_deref() {
            let reply = run(&mut stream, &[b"AUTH", password.as_bytes()], self.timeout).await?;
            expect_ok(reply)?;
        }
        if let Some(db) = self.db {
            let reply = run(
                &mut stream,
                &[b"SELECT", db.to_string().as_bytes()],
                self.timeout,
            )
            .await?;
            expect_ok(reply)?;
        }
        Ok(stream)
    }

    async fn exec(&self, parts: &[&[u8]]) -> Result<Reply> {
        let mut stream = self.open().await?;
        run(&mut stream, parts, self.timeout).await
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        match self.exec(&[b"PING"]).await? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(StoreError::Protocol(format!("PING answered {other:?}"))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.exec(&[b"GET", key.as_bytes()]).await? {
            Reply::Bulk(bytes) => bytes.map(into_string).transpose(),
            other => Err(StoreError::Protocol(format!("GET answered {other:?}"))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let reply = match ttl {
            Some(ttl) => {
                let secs = ttl_secs(ttl);
                self.exec(&[
                    b"SET",
                    key.as_bytes(),
                    value.as_bytes(),
                    b"EX",
                    secs.as_bytes(),
                ])
                .await?
            }
            None => self.exec(&[b"SET", key.as_bytes(), value.as_bytes()]).await?,
        };
        expect_ok(reply)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let reply = match ttl {
            Some(ttl) => {
                let secs = ttl_secs(ttl);
                self.exec(&[
                    b"SET",
                    key.as_bytes(),
                    value.as_bytes(),
                    b"NX",
                    b"EX",
                    secs.as_bytes(),
                ])
                .await?
            }
            None => {
                self.exec(&[b"SET", key.as_bytes(), value.as_bytes(), b"NX"])
                    .await?
            }
        };
        match reply {
            Reply::Simple(_) => Ok(true),
            Reply::Bulk(None) => Ok(false),
            other => Err(StoreError::Protocol(format!("SET NX answered {other:?}"))),
        }
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool> {
        // The whole WATCH/GET/MULTI/EXEC sequence must ride one connection.
        let mut stream = self.open().await?;

        let reply = run(&mut stream, &[b"WATCH", key.as_bytes()], self.timeout).await?;
        expect_ok(reply)?;

        let current = match run(&mut stream, &[b"GET", key.as_bytes()], self.timeout).await? {
            Reply::Bulk(bytes) => bytes,
            other => return Err(StoreError::Protocol(format!("GET answered {other:?}"))),
        };
        if current.as_deref() != Some(expected.as_bytes()) {
            let _ = run(&mut stream, &[b"UNWATCH"], self.timeout).await;
            return Ok(false);
        }

        let reply = run(&mut stream, &[b"MULTI"], self.timeout).await?;
        expect_ok(reply)?;
        let reply = run(
            &mut stream,
            &[b"SET", key.as_bytes(), new.as_bytes(), b"KEEPTTL"],
            self.timeout,
        )
        .await?;
        match reply {
            Reply::Simple(s) if s == "QUEUED" => {}
            other => return Err(StoreError::Protocol(format!("MULTI SET answered {other:?}"))),
        }
        match run(&mut stream, &[b"EXEC"], self.timeout).await? {
            // nil array: another writer touched the key between WATCH and EXEC
            Reply::Array(None) => Ok(false),
            Reply::Array(Some(_)) => Ok(true),
            other => Err(StoreError::Protocol(format!("EXEC answered {other:?}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.exec(&[b"DEL", key.as_bytes()]).await? {
            Reply::Integer(n) => Ok(n > 0),
            other => Err(StoreError::Protocol(format!("DEL answered {other:?}"))),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let delta = delta.to_string();
        match self
            .exec(&[b"INCRBY", key.as_bytes(), delta.as_bytes()])
            .await?
        {
            Reply::Integer(n) => Ok(n),
            other => Err(StoreError::Protocol(format!("INCRBY answered {other:?}"))),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        let mut cursor = String::from("0");
        let mut keys = Vec::new();
        loop {
            let reply = self
                .exec(&[
                    b"SCAN",
                    cursor.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    SCAN_COUNT.as_bytes(),
                ])
                .await?;
            let Reply::Array(Some(items)) = reply else {
                return Err(StoreError::Protocol("SCAN answered non-array".into()));
            };
            let mut items = items.into_iter();
            let (Some(next), Some(page)) = (items.next(), items.next()) else {
                return Err(StoreError::Protocol("short SCAN reply".into()));
            };
            cursor = match next {
                Reply::Bulk(Some(bytes)) => into_string(bytes)?,
                other => {
                    return Err(StoreError::Protocol(format!("SCAN cursor was {other:?}")))
                }
            };
            if let Reply::Array(Some(page)) = page {
                for item in page {
                    if let Reply::Bulk(Some(bytes)) = item {
                        keys.push(into_string(bytes)?);
                    }
                }
            }
            if cursor == "0" {
                return Ok(keys);
            }
        }
    }

    async fn memory_usage(&self) -> Result<Option<String>> {
        let reply = self.exec(&[b"INFO", b"memory"]).await?;
        let Reply::Bulk(Some(bytes)) = reply else {
            return Ok(None);
        };
        let info = String::from_utf8_lossy(&bytes).into_owned();
        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory_human:"))
            .map(|v| v.trim().to_string()))
    }
}

async fn run<S>(stream: &mut S, parts: &[&[u8]], dur: Duration) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cmd = encode_command(parts);
    timeout(dur, stream.write_all(&cmd)).await??;
    read_reply(stream, dur).await
}

fn encode_command(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn read_reply<'a, S>(
    stream: &'a mut S,
    dur: Duration,
) -> Pin<Box<dyn Future<Output = Result<Reply>> + Send + 'a>>
where
    S: AsyncRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(stream, dur).await?;
        let (kind, rest) = line
            .split_first()
            .ok_or_else(|| StoreError::Protocol("empty reply line".into()))?;
        match kind {
            b'+' => Ok(Reply::Simple(String::from_utf8_lossy(rest).into_owned())),
            b'-' => Err(StoreError::Protocol(format!(
                "store error: {}",
                String::from_utf8_lossy(rest)
            ))),
            b':' => {
                let n = std::str::from_utf8(rest)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| StoreError::Protocol("bad integer reply".into()))?;
                Ok(Reply::Integer(n))
            }
            b'$' => {
                let len = parse_len(rest)?;
                match len {
                    None => Ok(Reply::Bulk(None)),
                    Some(len) => {
                        let mut payload = vec![0u8; len + 2];
                        timeout(dur, stream.read_exact(&mut payload)).await??;
                        if &payload[len..] != b"\r\n" {
                            return Err(StoreError::Protocol("bad bulk terminator".into()));
                        }
                        payload.truncate(len);
                        Ok(Reply::Bulk(Some(payload)))
                    }
                }
            }
            b'*' => {
                let len = parse_len(rest)?;
                match len {
                    None => Ok(Reply::Array(None)),
                    Some(len) => {
                        let mut items = Vec::with_capacity(len);
                        for _ in 0..len {
                            items.push(read_reply(stream, dur).await?);
                        }
                        Ok(Reply::Array(Some(items)))
                    }
                }
            }
            other => Err(StoreError::Protocol(format!(
                "unknown reply marker {:?}",
                char::from(*other)
            ))),
        }
    })
}

async fn read_line<S>(stream: &mut S, dur: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    timeout(dur, async {
        let mut line = Vec::with_capacity(64);
        loop {
            let mut b = [0u8; 1];
            stream.read_exact(&mut b).await?;
            line.push(b[0]);
            if line.len() >= 2 && line[line.len() - 2..] == *b"\r\n" {
                line.truncate(line.len() - 2);
                return Ok(line);
            }
            if line.len() > 64 * 1024 {
                return Err(StoreError::Protocol("reply line too long".into()));
            }
        }
    })
    .await?
}

fn parse_len(bytes: &[u8]) -> Result<Option<usize>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::Protocol("bad length prefix".into()))?;
    if text == "-1" {
        return Ok(None);
    }
    text.parse::<usize>()
        .map(Some)
        .map_err(|_| StoreError::Protocol("bad length prefix".into()))
}

fn ttl_secs(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| StoreError::Protocol("non-utf8 value".into()))
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Simple(_) => Ok(()),
        other => Err(StoreError::Protocol(format!("expected OK, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_resp() {
        let cmd = encode_command(&[b"SET", b"k", b"v"]);
        assert_eq!(cmd, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn parse_plain_endpoint() {
        let store = RedisStore::new("redis://cache.internal:6380/2").expect("store");
        assert_eq!(store.addr, "cache.internal:6380");
        assert_eq!(store.db, Some(2));
        assert!(store.password.is_none());
    }

    #[test]
    fn parse_endpoint_with_password() {
        let store = RedisStore::new("redis://:hunter2@127.0.0.1").expect("store");
        assert_eq!(store.addr, "127.0.0.1:6379");
        assert_eq!(store.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn reject_non_redis_scheme() {
        assert!(RedisStore::new("http://127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn reads_simple_and_integer_replies() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = server.write_all(b"+PONG\r\n:42\r\n").await;
        });
        let dur = Duration::from_secs(1);
        assert_eq!(
            read_reply(&mut client, dur).await.unwrap(),
            Reply::Simple("PONG".into())
        );
        assert_eq!(read_reply(&mut client, dur).await.unwrap(), Reply::Integer(42));
    }

    #[tokio::test]
    async fn reads_bulk_and_nil_replies() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = server.write_all(b"$5\r\nhello\r\n$-1\r\n").await;
        });
        let dur = Duration::from_secs(1);
        assert_eq!(
            read_reply(&mut client, dur).await.unwrap(),
            Reply::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(read_reply(&mut client, dur).await.unwrap(), Reply::Bulk(None));
    }

    #[tokio::test]
    async fn reads_nested_scan_reply() {
        let (mut client, mut server) = tokio::io::duplex(128);
        tokio::spawn(async move {
            let _ = server
                .write_all(b"*2\r\n$1\r\n0\r\n*2\r\n$8\r\ntunnel:a\r\n$8\r\ntunnel:b\r\n")
                .await;
        });
        let reply = read_reply(&mut client, Duration::from_secs(1)).await.unwrap();
        let Reply::Array(Some(items)) = reply else {
            panic!("expected array");
        };
        assert_eq!(items[0], Reply::Bulk(Some(b"0".to_vec())));
        assert_eq!(
            items[1],
            Reply::Array(Some(vec![
                Reply::Bulk(Some(b"tunnel:a".to_vec())),
                Reply::Bulk(Some(b"tunnel:b".to_vec())),
            ]))
        );
    }

    #[tokio::test]
    async fn error_reply_becomes_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = server.write_all(b"-ERR wrong type\r\n").await;
        });
        let err = read_reply(&mut client, Duration::from_secs(1))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("wrong type"));
    }
}
