//! Message encoders and decoders
//!
//! Every message is a 1-byte tag followed by a 4-byte big-endian length that
//! counts itself but not the tag. Encoders append to a `BytesMut`; decoders
//! take the body (everything after the header).

use bytes::{BufMut, BytesMut};

use super::{backend, frontend};
use crate::constants::buffer::MAX_MESSAGE;
use crate::constants::startup::{CANCEL_REQUEST, PROTOCOL_V3};
use crate::error::ProtocolError;
use crate::types::CancelKey;

/// Tag byte plus length word
pub const HEADER_LEN: usize = 5;

/// Parse the header at the start of `buf`
///
/// Returns `None` while fewer than [`HEADER_LEN`] bytes are available,
/// otherwise the tag and the total size of the message including its tag.
pub fn parse_header(buf: &[u8]) -> Result<Option<(u8, usize)>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE {
        return Err(ProtocolError::BadLength {
            tag: tag as char,
            len: len.into(),
        });
    }
    Ok(Some((tag, 1 + len as usize)))
}

/// Body of a complete framed message
#[inline]
pub fn body(frame: &[u8]) -> &[u8] {
    &frame[HEADER_LEN.min(frame.len())..]
}

fn put_message(buf: &mut BytesMut, tag: u8, fill: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    fill(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// -----------------------------------------------------------------------------
// Backend -> client messages generated by the pooler
// -----------------------------------------------------------------------------

pub fn auth_ok(buf: &mut BytesMut) {
    put_message(buf, backend::AUTHENTICATION, |b| b.put_i32(0));
}

pub fn auth_cleartext(buf: &mut BytesMut) {
    put_message(buf, backend::AUTHENTICATION, |b| b.put_i32(3));
}

pub fn parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
    put_message(buf, backend::PARAMETER_STATUS, |b| {
        put_cstr(b, name);
        put_cstr(b, value);
    });
}

pub fn backend_key_data(buf: &mut BytesMut, key: CancelKey) {
    put_message(buf, backend::BACKEND_KEY_DATA, |b| {
        b.put_i32(key.pid);
        b.put_i32(key.secret);
    });
}

pub fn ready_for_query(buf: &mut BytesMut, status: u8) {
    put_message(buf, backend::READY_FOR_QUERY, |b| b.put_u8(status));
}

pub fn error_response(buf: &mut BytesMut, severity: &str, code: &str, message: &str) {
    put_message(buf, backend::ERROR_RESPONSE, |b| {
        b.put_u8(b'S');
        put_cstr(b, severity);
        b.put_u8(b'V');
        put_cstr(b, severity);
        b.put_u8(b'C');
        put_cstr(b, code);
        b.put_u8(b'M');
        put_cstr(b, message);
        b.put_u8(0);
    });
}

/// RowDescription for a set of text columns
pub fn row_description(buf: &mut BytesMut, columns: &[&str]) {
    put_message(buf, backend::ROW_DESCRIPTION, |b| {
        b.put_i16(columns.len() as i16);
        for name in columns {
            put_cstr(b, name);
            b.put_i32(0); // table oid
            b.put_i16(0); // column number
            b.put_i32(25); // text
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0); // text format
        }
    });
}

pub fn data_row(buf: &mut BytesMut, values: &[Option<&str>]) {
    put_message(buf, backend::DATA_ROW, |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.put_slice(v.as_bytes());
                }
                None => b.put_i32(-1),
            }
        }
    });
}

pub fn command_complete(buf: &mut BytesMut, tag: &str) {
    put_message(buf, backend::COMMAND_COMPLETE, |b| put_cstr(b, tag));
}

// -----------------------------------------------------------------------------
// Frontend -> backend messages generated by the pooler
// -----------------------------------------------------------------------------

pub fn query(buf: &mut BytesMut, sql: &str) {
    put_message(buf, frontend::QUERY, |b| put_cstr(b, sql));
}

pub fn terminate(buf: &mut BytesMut) {
    put_message(buf, frontend::TERMINATE, |_| {});
}

pub fn password(buf: &mut BytesMut, password: &str) {
    put_message(buf, frontend::PASSWORD, |b| put_cstr(b, password));
}

/// StartupMessage (untagged)
pub fn startup_message(buf: &mut BytesMut, params: &[(&str, &str)]) {
    let start = buf.len();
    buf.put_i32(0);
    buf.put_i32(PROTOCOL_V3);
    for (name, value) in params {
        put_cstr(buf, name);
        put_cstr(buf, value);
    }
    buf.put_u8(0);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// CancelRequest (untagged, fixed 16 bytes)
pub fn cancel_request(buf: &mut BytesMut, key: CancelKey) {
    buf.put_i32(16);
    buf.put_i32(CANCEL_REQUEST);
    buf.put_i32(key.pid);
    buf.put_i32(key.secret);
}

// -----------------------------------------------------------------------------
// Decoders
// -----------------------------------------------------------------------------

/// Read a NUL-terminated string and advance past it
pub fn read_cstr<'a>(data: &mut &'a [u8], what: &'static str) -> Result<&'a str, ProtocolError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Malformed(what))?;
    let s = std::str::from_utf8(&data[..end]).map_err(|_| ProtocolError::Malformed(what))?;
    *data = &data[end + 1..];
    Ok(s)
}

fn read_i32(data: &mut &[u8], what: &'static str) -> Result<i32, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Malformed(what));
    }
    let v = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    *data = &data[4..];
    Ok(v)
}

pub fn parse_parameter_status(mut body: &[u8]) -> Result<(String, String), ProtocolError> {
    let name = read_cstr(&mut body, "ParameterStatus")?;
    let value = read_cstr(&mut body, "ParameterStatus")?;
    Ok((name.to_owned(), value.to_owned()))
}

pub fn parse_backend_key_data(mut body: &[u8]) -> Result<CancelKey, ProtocolError> {
    let pid = read_i32(&mut body, "BackendKeyData")?;
    let secret = read_i32(&mut body, "BackendKeyData")?;
    Ok(CancelKey::new(pid, secret))
}

pub fn parse_ready_status(body: &[u8]) -> Result<u8, ProtocolError> {
    body.first()
        .copied()
        .ok_or(ProtocolError::Malformed("ReadyForQuery"))
}

pub fn parse_query(mut body: &[u8]) -> Result<&str, ProtocolError> {
    read_cstr(&mut body, "Query")
}

pub fn parse_password(mut body: &[u8]) -> Result<&str, ProtocolError> {
    read_cstr(&mut body, "PasswordMessage")
}

/// Authentication request sent by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    Cleartext,
    Md5 { salt: [u8; 4] },
    Other(i32),
}

pub fn parse_auth_request(mut body: &[u8]) -> Result<AuthRequest, ProtocolError> {
    match read_i32(&mut body, "Authentication")? {
        0 => Ok(AuthRequest::Ok),
        3 => Ok(AuthRequest::Cleartext),
        5 => {
            let salt: [u8; 4] = body
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or(ProtocolError::Malformed("AuthenticationMD5Password"))?;
            Ok(AuthRequest::Md5 { salt })
        }
        other => Ok(AuthRequest::Other(other)),
    }
}

/// The fields of an ErrorResponse or NoticeResponse that get logged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
}

pub fn parse_error_fields(mut body: &[u8]) -> Result<ErrorFields, ProtocolError> {
    let mut fields = ErrorFields::default();
    while let Some((&field, rest)) = body.split_first() {
        if field == 0 {
            break;
        }
        body = rest;
        let value = read_cstr(&mut body, "ErrorResponse")?;
        match field {
            b'S' if fields.severity.is_empty() => fields.severity = value.to_owned(),
            b'V' => fields.severity = value.to_owned(),
            b'C' => fields.code = value.to_owned(),
            b'M' => fields.message = value.to_owned(),
            _ => {}
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_needs_five_bytes() {
        assert_eq!(parse_header(b"Z\0\0\0").unwrap(), None);
        assert_eq!(parse_header(b"Z\0\0\0\x05I").unwrap(), Some((b'Z', 6)));
    }

    #[test]
    fn test_parse_header_rejects_short_length() {
        let err = parse_header(b"Q\0\0\0\x03").unwrap_err();
        assert_eq!(err, ProtocolError::BadLength { tag: 'Q', len: 3 });
        assert!(parse_header(b"Q\xff\xff\xff\xff").is_err());
    }

    #[test]
    fn test_ready_for_query_layout() {
        let mut buf = BytesMut::new();
        ready_for_query(&mut buf, b'T');
        assert_eq!(&buf[..], b"Z\0\0\0\x05T");
        assert_eq!(parse_ready_status(body(&buf)).unwrap(), b'T');
    }

    #[test]
    fn test_query_layout() {
        let mut buf = BytesMut::new();
        query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], b'Q');
        assert_eq!(parse_header(&buf).unwrap(), Some((b'Q', buf.len())));
        assert_eq!(parse_query(body(&buf)).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_terminate_is_header_only() {
        let mut buf = BytesMut::new();
        terminate(&mut buf);
        assert_eq!(&buf[..], b"X\0\0\0\x04");
    }

    #[test]
    fn test_parameter_status_decode() {
        let mut buf = BytesMut::new();
        parameter_status(&mut buf, "TimeZone", "UTC");
        let (name, value) = parse_parameter_status(body(&buf)).unwrap();
        assert_eq!(name, "TimeZone");
        assert_eq!(value, "UTC");
    }

    #[test]
    fn test_backend_key_data_decode() {
        let mut buf = BytesMut::new();
        backend_key_data(&mut buf, CancelKey::new(1234, -99));
        assert_eq!(buf.len(), 13);
        let key = parse_backend_key_data(body(&buf)).unwrap();
        assert_eq!(key, CancelKey::new(1234, -99));
    }

    #[test]
    fn test_error_response_fields() {
        let mut buf = BytesMut::new();
        error_response(&mut buf, "FATAL", "53300", "too many connections");
        let fields = parse_error_fields(body(&buf)).unwrap();
        assert_eq!(fields.severity, "FATAL");
        assert_eq!(fields.code, "53300");
        assert_eq!(fields.message, "too many connections");
    }

    #[test]
    fn test_auth_requests() {
        let mut buf = BytesMut::new();
        auth_ok(&mut buf);
        assert_eq!(parse_auth_request(body(&buf)).unwrap(), AuthRequest::Ok);

        let md5 = [0u8, 0, 0, 5, 1, 2, 3, 4];
        assert_eq!(
            parse_auth_request(&md5).unwrap(),
            AuthRequest::Md5 { salt: [1, 2, 3, 4] }
        );
        assert_eq!(
            parse_auth_request(&[0, 0, 0, 10]).unwrap(),
            AuthRequest::Other(10)
        );
        assert!(parse_auth_request(&[0, 0, 0, 5, 1]).is_err());
    }

    #[test]
    fn test_startup_message_length() {
        let mut buf = BytesMut::new();
        startup_message(&mut buf, &[("user", "bob"), ("database", "app")]);
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len());
        assert_eq!(buf.last(), Some(&0));
    }

    #[test]
    fn test_cancel_request_layout() {
        let mut buf = BytesMut::new();
        cancel_request(&mut buf, CancelKey::new(7, 8));
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[4..8], &CANCEL_REQUEST.to_be_bytes());
    }

    #[test]
    fn test_data_row_with_null() {
        let mut buf = BytesMut::new();
        data_row(&mut buf, &[Some("a"), None]);
        assert_eq!(&buf[5..7], &2i16.to_be_bytes());
        assert_eq!(&buf[7..11], &1i32.to_be_bytes());
        assert_eq!(buf[11], b'a');
        assert_eq!(&buf[12..16], &(-1i32).to_be_bytes());
    }

    #[test]
    fn test_read_cstr_requires_terminator() {
        let mut data: &[u8] = b"abc";
        assert!(read_cstr(&mut data, "x").is_err());
    }
}
