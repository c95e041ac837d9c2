//! Big-endian request/response codec over any `Read`/`Write` stream.
//!
//! Request: `[u8 id][i32 argc]` then per slot `[u8 present]` followed, when
//! present, by `[u16 len][utf8]`.
//!
//! Response: `[u8 id][u8 tag][body]` with tags `0` none, `1` int, `2`
//! string, `3` coverage snapshot, `4` error.

use std::io::{Read, Write};

use crate::{CoverageSnapshot, Error, ErrorValue, Payload, Request, Response, Result};

/// Maximum number of argument slots in a request.
pub const MAX_ARGS: usize = u8::MAX as usize;

/// Maximum size of a string or snapshot body in a response (16 MiB).
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Maximum nesting of error causes.
pub const MAX_CAUSE_DEPTH: usize = 32;

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;
const TAG_COVERAGE: u8 = 3;
const TAG_ERROR: u8 = 4;

/// Writes `req` to `w` and flushes.
///
/// Nothing is written if the request exceeds a limit.
pub fn encode_request<W: Write>(w: &mut W, req: &Request) -> Result<()> {
    w.write_all(&request_to_vec(req)?)?;
    w.flush()?;
    Ok(())
}

/// Reads one request from `r`.
pub fn decode_request(r: &mut impl Read) -> Result<Request> {
    let id = read_u8(r)?;
    let argc = read_i32(r)?;
    let count = usize::try_from(argc)
        .ok()
        .filter(|&n| n <= MAX_ARGS)
        .ok_or(Error::InvalidArgCount(argc))?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        match read_u8(r)? {
            0 => args.push(None),
            1 => {
                let len = read_u16(r)?;
                args.push(Some(read_string(r, usize::from(len))?));
            }
            flag => return Err(Error::InvalidPresenceFlag(flag)),
        }
    }
    Ok(Request::new(id, args))
}

/// Writes `resp` to `w` and flushes.
///
/// Nothing is written if the response exceeds a limit.
pub fn encode_response<W: Write>(w: &mut W, resp: &Response) -> Result<()> {
    w.write_all(&response_to_vec(resp)?)?;
    w.flush()?;
    Ok(())
}

/// Reads one response from `r`.
pub fn decode_response(r: &mut impl Read) -> Result<Response> {
    let id = read_u8(r)?;
    let payload = match read_u8(r)? {
        TAG_NONE => Payload::None,
        TAG_INT => Payload::Int(read_i32(r)?),
        TAG_STR => {
            let len = read_len(r)?;
            Payload::Str(read_string(r, len)?)
        }
        TAG_COVERAGE => {
            let len = read_len(r)?;
            let mut body = vec![0u8; len];
            r.read_exact(&mut body)?;
            Payload::Coverage(CoverageSnapshot::from_bytes(&body)?)
        }
        TAG_ERROR => Payload::Error(read_error(r, 1)?),
        tag => return Err(Error::UnknownPayloadTag(tag)),
    };
    Ok(Response::new(id, payload))
}

/// Encodes `req` into a new buffer.
pub fn request_to_vec(req: &Request) -> Result<Vec<u8>> {
    let args = req.args();
    if args.len() > MAX_ARGS {
        return Err(Error::TooLong {
            len: args.len(),
            max: MAX_ARGS,
        });
    }
    let mut buf = vec![req.id()];
    // Bounded by MAX_ARGS above.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    buf.extend_from_slice(&(args.len() as i32).to_be_bytes());
    for arg in args {
        match arg {
            None => buf.push(0),
            Some(s) => {
                let len = u16::try_from(s.len()).map_err(|_| Error::TooLong {
                    len: s.len(),
                    max: usize::from(u16::MAX),
                })?;
                buf.push(1);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    Ok(buf)
}

/// Encodes `resp` into a new buffer.
pub fn response_to_vec(resp: &Response) -> Result<Vec<u8>> {
    let mut buf = vec![resp.id];
    match &resp.payload {
        Payload::None => buf.push(TAG_NONE),
        Payload::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Payload::Str(s) => {
            buf.push(TAG_STR);
            write_bytes(&mut buf, s.as_bytes())?;
        }
        Payload::Coverage(snap) => {
            buf.push(TAG_COVERAGE);
            write_bytes(&mut buf, &snap.to_bytes()?)?;
        }
        Payload::Error(e) => {
            if e.depth() > MAX_CAUSE_DEPTH {
                return Err(Error::CauseTooDeep(MAX_CAUSE_DEPTH));
            }
            buf.push(TAG_ERROR);
            write_error(&mut buf, e)?;
        }
    }
    Ok(buf)
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_PAYLOAD {
        return Err(Error::TooLong {
            len: bytes.len(),
            max: MAX_PAYLOAD,
        });
    }
    // Bounded by MAX_PAYLOAD above.
    #[allow(clippy::cast_possible_truncation)]
    w.write_all(&(bytes.len() as u32).to_be_bytes())?;
    w.write_all(bytes)?;
    Ok(())
}

fn write_error<W: Write>(w: &mut W, e: &ErrorValue) -> Result<()> {
    write_bytes(w, e.kind.as_bytes())?;
    write_bytes(w, e.message.as_bytes())?;
    match &e.cause {
        Some(cause) => {
            w.write_all(&[1])?;
            write_error(w, cause)
        }
        None => Ok(w.write_all(&[0])?),
    }
}

fn read_error(r: &mut impl Read, depth: usize) -> Result<ErrorValue> {
    if depth > MAX_CAUSE_DEPTH {
        return Err(Error::CauseTooDeep(MAX_CAUSE_DEPTH));
    }
    let len = read_len(r)?;
    let kind = read_string(r, len)?;
    let len = read_len(r)?;
    let message = read_string(r, len)?;
    let cause = match read_u8(r)? {
        0 => None,
        1 => Some(Box::new(read_error(r, depth + 1)?)),
        flag => return Err(Error::InvalidPresenceFlag(flag)),
    };
    Ok(ErrorValue {
        kind,
        message,
        cause,
    })
}

fn read_len(r: &mut impl Read) -> Result<usize> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_be_bytes(buf) as usize;
    if len > MAX_PAYLOAD {
        return Err(Error::TooLong {
            len,
            max: MAX_PAYLOAD,
        });
    }
    Ok(len)
}

fn read_string(r: &mut impl Read, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::ClassRecord;

    fn roundtrip_response(resp: &Response) -> Response {
        let buf = response_to_vec(resp).unwrap();
        decode_response(&mut Cursor::new(&buf)).unwrap()
    }

    #[test]
    fn request_layout_is_big_endian() {
        let req = Request::new(2, vec![None, Some("ab".into())]);
        let buf = request_to_vec(&req).unwrap();
        assert_eq!(buf, [2, 0, 0, 0, 2, 0, 1, 0, 2, b'a', b'b']);
        assert_eq!(decode_request(&mut Cursor::new(&buf)).unwrap(), req);
    }

    #[test]
    fn response_payloads_roundtrip() {
        let mut snap = CoverageSnapshot::new();
        snap.insert(
            "com.example.Main",
            ClassRecord {
                stamp: 42,
                blocks: vec![vec![true, false]],
            },
        );
        let err = ErrorValue::new("dump", "disk full").with_cause(ErrorValue::new("io", "ENOSPC"));

        for payload in [
            Payload::None,
            Payload::Int(-7),
            Payload::Str("coverage reset for 0 classes".into()),
            Payload::Coverage(snap),
            Payload::Error(err),
        ] {
            let resp = Response::new(3, payload);
            assert_eq!(roundtrip_response(&resp), resp);
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        let result = decode_response(&mut Cursor::new([0u8, 9]));
        assert!(matches!(result, Err(Error::UnknownPayloadTag(9))));
    }

    #[test]
    fn rejects_negative_arg_count() {
        let bytes = [0u8, 0xff, 0xff, 0xff, 0xff];
        let result = decode_request(&mut Cursor::new(bytes));
        assert!(matches!(result, Err(Error::InvalidArgCount(-1))));
    }

    #[test]
    fn rejects_bad_presence_flag() {
        let bytes = [0u8, 0, 0, 0, 1, 7];
        let result = decode_request(&mut Cursor::new(bytes));
        assert!(matches!(result, Err(Error::InvalidPresenceFlag(7))));
    }

    #[test]
    fn truncated_request_is_eof() {
        let bytes = [1u8, 0, 0, 0, 3, 1, 0, 5, b'x'];
        let err = decode_request(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn rejects_oversized_string_body() {
        let header = [0u8, TAG_STR, 0x02, 0, 0, 0];
        let result = decode_response(&mut Cursor::new(header));
        assert!(matches!(result, Err(Error::TooLong { .. })));
    }

    #[test]
    fn rejects_overlong_argument() {
        let req = Request::new(0, vec![Some("x".repeat(70_000))]);
        let result = encode_request(&mut Vec::new(), &req);
        assert!(matches!(result, Err(Error::TooLong { .. })));
    }

    #[test]
    fn oversized_response_writes_nothing() {
        let resp = Response::new(1, Payload::Str("x".repeat(MAX_PAYLOAD + 1)));
        let mut out = Vec::new();
        let result = encode_response(&mut out, &resp);
        assert!(matches!(result, Err(Error::TooLong { .. })));
        assert!(out.is_empty());
    }

    #[test]
    fn limits_cause_depth() {
        let mut err = ErrorValue::new("e", "0");
        for i in 1..=MAX_CAUSE_DEPTH {
            err = ErrorValue::new("e", i.to_string()).with_cause(err);
        }
        let result = encode_response(&mut Vec::new(), &Response::new(0, Payload::Error(err)));
        assert!(matches!(result, Err(Error::CauseTooDeep(_))));
    }
}
