//! Minimal RESP2 client codec
//!
//! Enough of the Redis protocol for `AUTH`, `PUBLISH` and the sentinel
//! master lookup: commands are arrays of bulk strings, replies are parsed
//! incrementally from a read buffer.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::{Result, SinkError};

const MAX_REPLY_LEN: usize = 512 * 1024 * 1024;

/// One RESP value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Bulk or simple string contents
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Simple(s) => Some(s.clone()),
            Self::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }
}

/// Append a command as an array of bulk strings
pub fn encode_command(out: &mut BytesMut, args: &[&[u8]]) {
    out.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SinkError::write("malformed RESP integer"))
}

/// Parse one reply from the front of `buf`
///
/// Returns the reply and the number of bytes it used, or `None` when more
/// input is needed.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    let Some(&prefix) = buf.first() else {
        return Ok(None);
    };
    let Some(end) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let line = &buf[1..1 + end];
    let after_line = 1 + end + 2;

    match prefix {
        b'+' => Ok(Some((
            Reply::Simple(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            Reply::Error(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), after_line))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), after_line)));
            }
            let len = len as usize;
            if len > MAX_REPLY_LEN {
                return Err(SinkError::write("RESP bulk string too large"));
            }
            if buf.len() < after_line + len + 2 {
                return Ok(None);
            }
            let data = buf[after_line..after_line + len].to_vec();
            Ok(Some((Reply::Bulk(Some(data)), after_line + len + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Array(None), after_line)));
            }
            let mut items = Vec::with_capacity((count as usize).min(64));
            let mut used = after_line;
            for _ in 0..count {
                match parse_reply(&buf[used..])? {
                    Some((item, n)) => {
                        items.push(item);
                        used += n;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), used)))
        }
        other => Err(SinkError::write(format!(
            "unexpected RESP prefix 0x{other:02x}"
        ))),
    }
}

/// One client connection
pub struct RespConnection {
    addr: String,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl RespConnection {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SinkError::connection(addr, "connect timed out"))?
            .map_err(|e| SinkError::connection(addr, e))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr: addr.to_string(),
            stream,
            read_buf: BytesMut::with_capacity(1024),
            write_buf: BytesMut::with_capacity(1024),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a command and wait for its reply
    ///
    /// Error replies are turned into `SinkError::Write`.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply> {
        self.write_buf.clear();
        encode_command(&mut self.write_buf, args);
        self.stream.write_all(&self.write_buf).await?;

        loop {
            if let Some((reply, used)) = parse_reply(&self.read_buf)? {
                self.read_buf.advance(used);
                return match reply {
                    Reply::Error(msg) => Err(SinkError::write(format!("redis: {msg}"))),
                    reply => Ok(reply),
                };
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(SinkError::connection(&self.addr, "connection closed by peer"));
            }
        }
    }
}
