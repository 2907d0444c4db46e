//! Request-target forms, path decoding and Host validation

use crate::{errors::BadRequest, http::types::Method};
use memchr::{memchr, memchr2, memrchr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetForm {
    /// `/path?query`
    Origin,
    /// `http://host:port/path?query`
    Absolute,
    /// `host:port`, `CONNECT` only
    Authority,
    /// `*`, `OPTIONS` only
    Asterisk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) form: TargetForm,
    pub(crate) path: String,
    pub(crate) query: String,
    /// Authority of an absolute-form or authority-form target, userinfo removed.
    pub(crate) authority: Option<String>,
    pub(crate) default_port: Option<u16>,
}

/// Classifies and decodes a raw request-target.
pub(crate) fn parse(method: &Method, raw: &[u8], allow_latin1: bool) -> Result<Target, BadRequest> {
    validate_raw(raw, allow_latin1)?;

    let target = match raw {
        [b'/', ..] => origin_form(raw, allow_latin1)?,
        b"*" => {
            if *method != Method::Options {
                return Err(BadRequest::method_not_allowed(Method::Options));
            }

            Target {
                form: TargetForm::Asterisk,
                path: String::new(),
                query: String::new(),
                authority: None,
                default_port: None,
            }
        }
        _ if scheme_len(raw).is_some() => absolute_form(raw, allow_latin1)?,
        _ => authority_form(method, raw)?,
    };

    if *method == Method::Connect && target.form != TargetForm::Authority {
        return Err(BadRequest::invalid_target(raw));
    }

    Ok(target)
}

#[inline]
fn validate_raw(raw: &[u8], allow_latin1: bool) -> Result<(), BadRequest> {
    let valid = !raw.is_empty()
        && raw.iter().all(|&b| match b {
            0x21..=0x7E => true,
            0x80..=0xFF => allow_latin1,
            _ => false,
        });

    if !valid {
        return Err(BadRequest::invalid_target(raw));
    }

    Ok(())
}

fn origin_form(raw: &[u8], allow_latin1: bool) -> Result<Target, BadRequest> {
    let (path, query) = split_query(raw);

    Ok(Target {
        form: TargetForm::Origin,
        path: decode_path(path, allow_latin1).ok_or_else(|| BadRequest::invalid_target(raw))?,
        query: ascii_string(query),
        authority: None,
        default_port: None,
    })
}

fn absolute_form(raw: &[u8], allow_latin1: bool) -> Result<Target, BadRequest> {
    let invalid = || BadRequest::invalid_target(raw);

    let scheme = scheme_len(raw).ok_or_else(invalid)?;
    let default_port = match scheme {
        7 => 80,
        _ => 443,
    };

    let rest = &raw[scheme..];
    let end = memchr2(b'/', b'?', rest).unwrap_or(rest.len());
    let mut authority = &rest[..end];

    // userinfo is never part of the effective authority
    if let Some(at) = memrchr(b'@', authority) {
        authority = &authority[at + 1..];
    }

    if authority.is_empty() || !is_valid_host(authority) {
        return Err(invalid());
    }

    let (path, query) = split_query(&rest[end..]);
    let path = match path {
        b"" => String::from("/"),
        path => decode_path(path, allow_latin1).ok_or_else(invalid)?,
    };

    Ok(Target {
        form: TargetForm::Absolute,
        path,
        query: ascii_string(query),
        authority: Some(ascii_string(authority)),
        default_port: Some(default_port),
    })
}

fn authority_form(method: &Method, raw: &[u8]) -> Result<Target, BadRequest> {
    if !raw.iter().all(|&b| is_authority_char(b)) {
        return Err(BadRequest::invalid_target(raw));
    }

    if *method != Method::Connect {
        return Err(BadRequest::method_not_allowed(Method::Connect));
    }

    if !is_valid_host(raw) {
        return Err(BadRequest::invalid_target(raw));
    }

    Ok(Target {
        form: TargetForm::Authority,
        path: String::new(),
        query: String::new(),
        authority: Some(ascii_string(raw)),
        default_port: None,
    })
}

// Length of `http://` or `https://`, any case.
#[inline]
fn scheme_len(raw: &[u8]) -> Option<usize> {
    if raw.len() >= 7 && raw[..7].eq_ignore_ascii_case(b"http://") {
        Some(7)
    } else if raw.len() >= 8 && raw[..8].eq_ignore_ascii_case(b"https://") {
        Some(8)
    } else {
        None
    }
}

#[inline]
fn split_query(src: &[u8]) -> (&[u8], &[u8]) {
    match memchr(b'?', src) {
        Some(pos) => src.split_at(pos),
        None => (src, &b""[..]),
    }
}

#[inline]
fn ascii_string(src: &[u8]) -> String {
    src.iter().map(|&b| b as char).collect()
}

// Path decoding

/// Percent-decodes and normalizes a path, `None` if it encodes a NUL.
///
/// `%2F` stays encoded so that decoding cannot introduce new segments.
pub(crate) fn decode_path(raw: &[u8], allow_latin1: bool) -> Option<String> {
    let decoded = remove_dot_segments(&percent_decode(raw)?);

    if let Ok(path) = simdutf8::basic::from_utf8(&decoded) {
        return Some(path.to_owned());
    }

    match allow_latin1 {
        true => Some(ascii_string(&decoded)),
        false => Some(ascii_string(&remove_dot_segments(raw))),
    }
}

fn percent_decode(src: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        let byte = src[i];

        if byte == b'%' && i + 2 < src.len() {
            if let (Some(hi), Some(lo)) = (hex_val(src[i + 1]), hex_val(src[i + 2])) {
                match hi << 4 | lo {
                    0 => return None,
                    b'/' => out.extend_from_slice(&src[i..i + 3]),
                    value => out.push(value),
                }

                i += 3;
                continue;
            }
        }

        out.push(byte);
        i += 1;
    }

    Some(out)
}

#[inline(always)]
const fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

// RFC 3986, section 5.2.4
pub(crate) fn remove_dot_segments(path: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(path.len());
    let mut input = path;

    while !input.is_empty() {
        if input.starts_with(b"../") {
            input = &input[3..];
        } else if input.starts_with(b"./") || input.starts_with(b"/./") {
            input = &input[2..];
        } else if input == b"/." {
            input = &b"/"[..];
        } else if input.starts_with(b"/../") {
            input = &input[3..];
            pop_segment(&mut out);
        } else if input == b"/.." {
            input = &b"/"[..];
            pop_segment(&mut out);
        } else if input == b"." || input == b".." {
            input = &b""[..];
        } else {
            let start = usize::from(input[0] == b'/');
            let end = memchr(b'/', &input[start..]).map_or(input.len(), |pos| pos + start);

            out.extend_from_slice(&input[..end]);
            input = &input[end..];
        }
    }

    out
}

#[inline]
fn pop_segment(out: &mut Vec<u8>) {
    let pos = memrchr(b'/', out).unwrap_or(0);
    out.truncate(pos);
}

// Host

#[inline]
const fn is_unreserved_or_sub_delim(byte: u8) -> bool {
    matches!(byte,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' |
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=' | b'%'
    )
}

#[inline]
const fn is_authority_char(byte: u8) -> bool {
    is_unreserved_or_sub_delim(byte) || matches!(byte, b':' | b'@' | b'[' | b']')
}

/// `reg-name` / IPv4 / `[IPv6]`, with an optional `:port`.
///
/// An empty value is valid, callers decide whether it is acceptable.
pub(crate) fn is_valid_host(value: &[u8]) -> bool {
    let (host, port) = match value {
        [] => return true,
        [b'[', rest @ ..] => {
            let Some(close) = memchr(b']', rest) else {
                return false;
            };
            let literal = &rest[..close];

            if literal.is_empty()
                || !literal.iter().all(|&b| b.is_ascii_hexdigit() || b == b':' || b == b'.')
            {
                return false;
            }

            match &rest[close + 1..] {
                [] => return true,
                [b':', port @ ..] => (&b""[..], port),
                _ => return false,
            }
        }
        _ => match memrchr(b':', value) {
            Some(pos) => (&value[..pos], &value[pos + 1..]),
            None => (value, &b""[..]),
        },
    };

    let host_valid = host.is_empty() && value.starts_with(b"[")
        || !host.is_empty() && host.iter().all(|&b| is_unreserved_or_sub_delim(b));

    host_valid && port.iter().all(u8::is_ascii_digit)
}

/// Drops `:80` or `:443` when it is the scheme's default port.
pub(crate) fn strip_default_port(authority: &str, default_port: Option<u16>) -> &str {
    let Some(default_port) = default_port else {
        return authority;
    };

    match authority.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().ok() == Some(default_port) => host,
        _ => authority,
    }
}

/// Host header versus the authority of the target, ignoring case and default port.
pub(crate) fn host_matches(host: &[u8], authority: &str, default_port: Option<u16>) -> bool {
    let Ok(host) = simdutf8::basic::from_utf8(host) else {
        return false;
    };

    strip_default_port(host, default_port)
        .eq_ignore_ascii_case(strip_default_port(authority, default_port))
}
