//! # Text-Protocol Encoding and Parsing
//!
//! Purpose: Serialize commands to the memcached text protocol and parse
//! server responses without external dependencies, keeping allocations
//! under control.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Callers provide the write buffer and a scratch line
//!    buffer so the hot path allocates only for returned values.
//! 2. **Binary-Safe Values**: Data blocks are raw bytes, length-prefixed by
//!    the preceding `VALUE` line.
//! 3. **Bounded Frames**: The decoder rejects value blocks larger than the
//!    caller's configured maximum before reading them.
//! 4. **Fail Fast**: Any framing violation surfaces immediately as a
//!    protocol error.

use std::io::BufRead;

use crate::command::{Command, StoreMode};
use crate::error::{ProtoError, ProtoResult};

/// One `VALUE` block returned by `get`/`gets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueItem {
    pub key: String,
    pub flags: u32,
    pub cas: Option<u64>,
    pub data: Vec<u8>,
}

/// Parsed server response, one variant per reply class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `STORED`
    Stored,
    /// `NOT_STORED` (add/replace precondition failed)
    NotStored,
    /// `EXISTS` (cas token stale)
    Exists,
    /// `NOT_FOUND`
    NotFound,
    /// `DELETED`
    Deleted,
    /// `OK` (flush_all)
    Ok,
    /// Zero or more `VALUE` blocks terminated by `END`.
    Values(Vec<ValueItem>),
    /// Bare decimal reply from incr/decr.
    Counter(u64),
    /// `VERSION <string>`
    Version(String),
    /// `ERROR` (verb not recognized by the server)
    Error,
    /// `CLIENT_ERROR <message>`
    ClientError(String),
    /// `SERVER_ERROR <message>`
    ServerError(String),
}

/// Encodes a command into the provided buffer, including trailing CRLF.
pub fn encode_command(cmd: &Command<'_>, out: &mut Vec<u8>) {
    match cmd {
        Command::Store {
            mode,
            key,
            value,
            flags,
            exptime,
        } => {
            out.extend_from_slice(mode.verb());
            out.push(b' ');
            out.extend_from_slice(key.as_bytes());
            out.push(b' ');
            push_u64(out, u64::from(*flags));
            out.push(b' ');
            push_u64(out, u64::from(*exptime));
            out.push(b' ');
            push_u64(out, value.len() as u64);
            if let StoreMode::Cas(token) = mode {
                out.push(b' ');
                push_u64(out, *token);
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        Command::Get { keys, with_cas } => {
            out.extend_from_slice(if *with_cas { b"gets" } else { b"get" });
            for key in *keys {
                out.push(b' ');
                out.extend_from_slice(key.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Command::Incr { key, delta } => {
            out.extend_from_slice(b"incr ");
            out.extend_from_slice(key.as_bytes());
            out.push(b' ');
            push_u64(out, *delta);
            out.extend_from_slice(b"\r\n");
        }
        Command::Decr { key, delta } => {
            out.extend_from_slice(b"decr ");
            out.extend_from_slice(key.as_bytes());
            out.push(b' ');
            push_u64(out, *delta);
            out.extend_from_slice(b"\r\n");
        }
        Command::Delete { key } => {
            out.extend_from_slice(b"delete ");
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Command::FlushAll { delay } => {
            out.extend_from_slice(b"flush_all");
            if let Some(delay) = delay {
                out.push(b' ');
                push_u64(out, u64::from(*delay));
            }
            out.extend_from_slice(b"\r\n");
        }
        Command::Version => {
            out.extend_from_slice(b"version\r\n");
        }
    }
}

/// Reads one complete response from the buffered reader.
///
/// `max_value` bounds the size of any single `VALUE` data block; a larger
/// announced length fails with `FrameTooLarge` before the block is read.
pub fn read_response<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    max_value: usize,
) -> ProtoResult<Response> {
    read_line(reader, line_buf)?;

    match line_buf.as_slice() {
        b"STORED" => return Ok(Response::Stored),
        b"NOT_STORED" => return Ok(Response::NotStored),
        b"EXISTS" => return Ok(Response::Exists),
        b"NOT_FOUND" => return Ok(Response::NotFound),
        b"DELETED" => return Ok(Response::Deleted),
        b"OK" => return Ok(Response::Ok),
        b"END" => return Ok(Response::Values(Vec::new())),
        b"ERROR" => return Ok(Response::Error),
        _ => {}
    }

    if let Some(rest) = strip_prefix(line_buf, b"VALUE ") {
        let first = parse_value_header(rest, max_value)?;
        return read_value_blocks(reader, line_buf, first, max_value);
    }
    if let Some(rest) = strip_prefix(line_buf, b"VERSION ") {
        return Ok(Response::Version(String::from_utf8_lossy(rest).into_owned()));
    }
    if let Some(rest) = strip_prefix(line_buf, b"CLIENT_ERROR ") {
        return Ok(Response::ClientError(String::from_utf8_lossy(rest).into_owned()));
    }
    if let Some(rest) = strip_prefix(line_buf, b"SERVER_ERROR ") {
        return Ok(Response::ServerError(String::from_utf8_lossy(rest).into_owned()));
    }
    if line_buf.iter().all(|b| b.is_ascii_digit()) {
        return Ok(Response::Counter(parse_u64(line_buf)?));
    }

    Err(ProtoError::Malformed("unrecognized response line"))
}

/// Parsed `VALUE <key> <flags> <bytes> [cas]` header, before its data block.
struct ValueHeader {
    key: String,
    flags: u32,
    len: usize,
    cas: Option<u64>,
}

fn parse_value_header(rest: &[u8], max_value: usize) -> ProtoResult<ValueHeader> {
    let mut fields = rest.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let key = fields
        .next()
        .ok_or(ProtoError::Malformed("VALUE line missing key"))?;
    let flags = fields
        .next()
        .ok_or(ProtoError::Malformed("VALUE line missing flags"))?;
    let len = fields
        .next()
        .ok_or(ProtoError::Malformed("VALUE line missing length"))?;
    let cas = fields.next().map(parse_u64).transpose()?;
    if fields.next().is_some() {
        return Err(ProtoError::Malformed("VALUE line has trailing fields"));
    }

    let len = parse_u64(len)? as usize;
    if len > max_value {
        return Err(ProtoError::FrameTooLarge { len, max: max_value });
    }

    Ok(ValueHeader {
        key: String::from_utf8_lossy(key).into_owned(),
        flags: parse_u64(flags)? as u32,
        len,
        cas,
    })
}

fn read_value_blocks<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    first: ValueHeader,
    max_value: usize,
) -> ProtoResult<Response> {
    let mut items = Vec::new();
    let mut header = first;

    loop {
        let mut data = vec![0u8; header.len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(ProtoError::Malformed("data block missing CRLF"));
        }
        items.push(ValueItem {
            key: header.key,
            flags: header.flags,
            cas: header.cas,
            data,
        });

        read_line(reader, line_buf)?;
        if line_buf.as_slice() == b"END" {
            return Ok(Response::Values(items));
        }
        let rest = strip_prefix(line_buf, b"VALUE ")
            .ok_or(ProtoError::Malformed("expected VALUE or END"))?;
        header = parse_value_header(rest, max_value)?;
    }
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ProtoResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ProtoError::Eof);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ProtoError::Malformed("line missing CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn strip_prefix<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if line.len() >= prefix.len() && &line[..prefix.len()] == prefix {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn parse_u64(data: &[u8]) -> ProtoResult<u64> {
    if data.is_empty() {
        return Err(ProtoError::Malformed("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(ProtoError::Malformed("non-digit in number"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or(ProtoError::Malformed("number overflows u64"))?;
    }
    Ok(value)
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DEFAULT_MAX_VALUE_SIZE;
    use std::io::Cursor;

    fn parse(input: &[u8]) -> ProtoResult<Response> {
        let mut reader = Cursor::new(input.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line, DEFAULT_MAX_VALUE_SIZE)
    }

    #[test]
    fn encodes_set() {
        let mut buf = Vec::new();
        encode_command(
            &Command::Store {
                mode: StoreMode::Set,
                key: "key",
                value: b"value",
                flags: 7,
                exptime: 60,
            },
            &mut buf,
        );
        assert_eq!(&buf, b"set key 7 60 5\r\nvalue\r\n");
    }

    #[test]
    fn encodes_cas_with_token() {
        let mut buf = Vec::new();
        encode_command(
            &Command::Store {
                mode: StoreMode::Cas(31),
                key: "key",
                value: b"v",
                flags: 0,
                exptime: 0,
            },
            &mut buf,
        );
        assert_eq!(&buf, b"cas key 0 0 1 31\r\nv\r\n");
    }

    #[test]
    fn encodes_multi_key_get() {
        let mut buf = Vec::new();
        encode_command(
            &Command::Get {
                keys: &["a", "b", "c"],
                with_cas: false,
            },
            &mut buf,
        );
        assert_eq!(&buf, b"get a b c\r\n");
    }

    #[test]
    fn encodes_gets() {
        let mut buf = Vec::new();
        encode_command(
            &Command::Get {
                keys: &["a"],
                with_cas: true,
            },
            &mut buf,
        );
        assert_eq!(&buf, b"gets a\r\n");
    }

    #[test]
    fn encodes_incr_decr_delete() {
        let mut buf = Vec::new();
        encode_command(&Command::Incr { key: "n", delta: 2 }, &mut buf);
        assert_eq!(&buf, b"incr n 2\r\n");

        buf.clear();
        encode_command(&Command::Decr { key: "n", delta: 1 }, &mut buf);
        assert_eq!(&buf, b"decr n 1\r\n");

        buf.clear();
        encode_command(&Command::Delete { key: "n" }, &mut buf);
        assert_eq!(&buf, b"delete n\r\n");
    }

    #[test]
    fn encodes_flush_with_and_without_delay() {
        let mut buf = Vec::new();
        encode_command(&Command::FlushAll { delay: None }, &mut buf);
        assert_eq!(&buf, b"flush_all\r\n");

        buf.clear();
        encode_command(&Command::FlushAll { delay: Some(30) }, &mut buf);
        assert_eq!(&buf, b"flush_all 30\r\n");
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(parse(b"STORED\r\n").unwrap(), Response::Stored);
        assert_eq!(parse(b"NOT_STORED\r\n").unwrap(), Response::NotStored);
        assert_eq!(parse(b"EXISTS\r\n").unwrap(), Response::Exists);
        assert_eq!(parse(b"NOT_FOUND\r\n").unwrap(), Response::NotFound);
        assert_eq!(parse(b"DELETED\r\n").unwrap(), Response::Deleted);
        assert_eq!(parse(b"OK\r\n").unwrap(), Response::Ok);
        assert_eq!(parse(b"ERROR\r\n").unwrap(), Response::Error);
    }

    #[test]
    fn parses_counter() {
        assert_eq!(parse(b"42\r\n").unwrap(), Response::Counter(42));
        assert_eq!(parse(b"0\r\n").unwrap(), Response::Counter(0));
    }

    #[test]
    fn parses_value_blocks() {
        let resp = parse(b"VALUE a 0 5\r\nhello\r\nVALUE b 7 2 99\r\nhi\r\nEND\r\n").unwrap();
        assert_eq!(
            resp,
            Response::Values(vec![
                ValueItem {
                    key: "a".to_string(),
                    flags: 0,
                    cas: None,
                    data: b"hello".to_vec(),
                },
                ValueItem {
                    key: "b".to_string(),
                    flags: 7,
                    cas: Some(99),
                    data: b"hi".to_vec(),
                },
            ])
        );
    }

    #[test]
    fn parses_empty_get_as_end() {
        assert_eq!(parse(b"END\r\n").unwrap(), Response::Values(Vec::new()));
    }

    #[test]
    fn parses_binary_data_block() {
        let resp = parse(b"VALUE k 0 4\r\n\x00\xff\r\t\r\nEND\r\n").unwrap();
        match resp {
            Response::Values(items) => assert_eq!(items[0].data, vec![0x00, 0xff, b'\r', b'\t']),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn parses_error_messages() {
        assert_eq!(
            parse(b"CLIENT_ERROR bad data chunk\r\n").unwrap(),
            Response::ClientError("bad data chunk".to_string())
        );
        assert_eq!(
            parse(b"SERVER_ERROR out of memory\r\n").unwrap(),
            Response::ServerError("out of memory".to_string())
        );
    }

    #[test]
    fn parses_version() {
        assert_eq!(
            parse(b"VERSION 1.6.21\r\n").unwrap(),
            Response::Version("1.6.21".to_string())
        );
    }

    #[test]
    fn rejects_oversized_frame_before_reading() {
        let mut reader = Cursor::new(b"VALUE k 0 11\r\nhello worldXX".to_vec());
        let mut line = Vec::new();
        let err = read_response(&mut reader, &mut line, 10).unwrap_err();
        match err {
            ProtoError::FrameTooLarge { len, max } => {
                assert_eq!(len, 11);
                assert_eq!(max, 10);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // The data block must not have been consumed.
        assert_eq!(reader.position(), 14);
    }

    #[test]
    fn rejects_missing_crlf() {
        assert!(parse(b"STORED\n").is_err());
        assert!(parse(b"VALUE k 0 5\r\nhelloXXEND\r\n").is_err());
    }

    #[test]
    fn rejects_garbage_line() {
        assert!(parse(b"WHATEVER\r\n").is_err());
    }

    #[test]
    fn eof_is_distinguished() {
        match parse(b"") {
            Err(ProtoError::Eof) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
