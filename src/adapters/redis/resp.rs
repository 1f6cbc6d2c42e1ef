//! RESP2 encoder and reply parser.
//!
//! Only what a client needs: commands are always sent as arrays of bulk
//! strings, and replies may be any RESP2 type.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum accepted bulk string size (512 MiB, the Redis limit).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum accepted array length.
pub const MAX_ELEMENTS: usize = 1024 * 1024;

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`)
    Bulk(Option<Bytes>),
    /// `None` is the null array (`*-1`)
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Short description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            RespValue::Simple(s) => format!("+{}", s),
            RespValue::Error(e) => format!("-{}", e),
            RespValue::Integer(n) => format!(":{}", n),
            RespValue::Bulk(None) | RespValue::Array(None) => "nil".to_string(),
            RespValue::Bulk(Some(b)) => format!("${}", b.len()),
            RespValue::Array(Some(items)) => format!("*{}", items.len()),
        }
    }
}

/// Append a command as an array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Parse one reply from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and
/// the number of bytes consumed.
pub fn parse_reply(data: &[u8]) -> Result<Option<(RespValue, usize)>> {
    parse_value(data, 0)
}

fn parse_value(data: &[u8], depth: usize) -> Result<Option<(RespValue, usize)>> {
    if depth > 32 {
        return Err(Error::Protocol("maximum nesting depth exceeded".to_string()));
    }
    let Some((&type_byte, rest)) = data.split_first() else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(rest) else {
        return Ok(None);
    };
    let line = &rest[..line_end];
    // prefix byte + line + CRLF
    let header_len = line_end + 3;

    match type_byte {
        b'+' => Ok(Some((RespValue::Simple(lossy(line)), header_len))),
        b'-' => Ok(Some((RespValue::Error(lossy(line)), header_len))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((RespValue::Bulk(None), header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| Error::Protocol("invalid bulk string length".to_string()))?;
            if len > MAX_BULK_SIZE {
                return Err(Error::Protocol(format!(
                    "bulk string too large: {} > {}",
                    len, MAX_BULK_SIZE
                )));
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(Error::Protocol("missing CRLF after bulk string".to_string()));
            }
            let payload = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Some((RespValue::Bulk(Some(payload)), end + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((RespValue::Array(None), header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| Error::Protocol("invalid array length".to_string()))?;
            if len > MAX_ELEMENTS {
                return Err(Error::Protocol(format!(
                    "array too large: {} > {}",
                    len, MAX_ELEMENTS
                )));
            }
            let mut items = Vec::with_capacity(len);
            let mut offset = header_len;
            for _ in 0..len {
                match parse_value(&data[offset..], depth + 1)? {
                    Some((item, used)) => {
                        items.push(item);
                        offset += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), offset)))
        }
        other => Err(Error::Protocol(format!(
            "unknown RESP type byte 0x{:02x}",
            other
        ))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid integer: {}", lossy(line))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_command() {
        let mut buf = BytesMut::new();
        encode_command(&["SET", "k", "v"], &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(
            parse_reply(b"+OK\r\n").unwrap(),
            Some((RespValue::Simple("OK".into()), 5))
        );
        assert_eq!(
            parse_reply(b":-12\r\n").unwrap(),
            Some((RespValue::Integer(-12), 6))
        );
        assert_eq!(
            parse_reply(b"$-1\r\n").unwrap(),
            Some((RespValue::Bulk(None), 5))
        );
        assert_eq!(
            parse_reply(b"-ERR boom\r\n").unwrap(),
            Some((RespValue::Error("ERR boom".into()), 11))
        );
    }

    #[test]
    fn test_parse_nested_array() {
        let data = b"*2\r\n$1\r\na\r\n*1\r\n:1\r\n";
        let (value, used) = parse_reply(data).unwrap().unwrap();
        assert_eq!(used, data.len());
        assert_eq!(
            value,
            RespValue::Array(Some(vec![
                RespValue::Bulk(Some(Bytes::from_static(b"a"))),
                RespValue::Array(Some(vec![RespValue::Integer(1)])),
            ]))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_reply(b"?what\r\n").is_err());
        assert!(parse_reply(b":abc\r\n").is_err());
        assert!(parse_reply(b"$3\r\nabcd\r\n").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every strict prefix of a complete reply is reported as incomplete.
        #[test]
        fn prop_truncated_reply_is_incomplete(payload in prop::collection::vec(any::<u8>(), 0..64)) {
            let mut frame = format!("${}\r\n", payload.len()).into_bytes();
            frame.extend_from_slice(&payload);
            frame.extend_from_slice(b"\r\n");

            for cut in 0..frame.len() {
                prop_assert!(parse_reply(&frame[..cut]).unwrap().is_none());
            }
            let (value, used) = parse_reply(&frame).unwrap().unwrap();
            prop_assert_eq!(used, frame.len());
            prop_assert_eq!(value, RespValue::Bulk(Some(Bytes::from(payload))));
        }
    }
}
