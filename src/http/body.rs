//! Request body framing and decoding

use crate::{
    errors::{BadRequest, RejectionReason, UsageError},
    http::{
        request::{parse_field, strip_terminator, HeaderSection, RequestHead},
        types::{slice_to_u64, trim_ows, Header, Method, Version},
    },
    limits::ReqLimits,
};
use bytes::{Buf, BytesMut};
use memchr::memchr2;

/// How the length of a request body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    ContentLength(u64),
    Chunked,
}

impl Framing {
    /// Applies the message length rules to a parsed head.
    ///
    /// `Content-Length` is dropped from the head when `Transfer-Encoding` wins.
    pub(crate) fn for_request(head: &mut RequestHead) -> Result<Self, BadRequest> {
        let transfer_encoding = head.header_all("transfer-encoding").last();
        let content_length = head.header_all("content-length").next();
        let multiple = head.header_all("content-length").nth(1).is_some();

        if head.is_upgradable() {
            let has_payload = transfer_encoding.is_some()
                || content_length.map_or(false, |cl| slice_to_u64(trim_ows(cl)) != Some(0));

            if has_payload {
                return Err(BadRequest::new(
                    RejectionReason::UpgradeRequestCannotHavePayload,
                ));
            }

            return Ok(Self::Empty);
        }

        if let Some(value) = transfer_encoding {
            let last = value
                .rsplit(|&b| b == b',')
                .map(trim_ows)
                .find(|coding| !coding.is_empty())
                .unwrap_or_default();

            if !last.eq_ignore_ascii_case(b"chunked") {
                return Err(BadRequest::final_coding_not_chunked(value));
            }

            head.remove_header("content-length");
            return Ok(Self::Chunked);
        }

        if multiple {
            return Err(BadRequest::new(RejectionReason::MultipleContentLengths));
        }

        if let Some(value) = content_length {
            return match slice_to_u64(trim_ows(value)) {
                Some(0) => Ok(Self::Empty),
                Some(len) => Ok(Self::ContentLength(len)),
                None => Err(BadRequest::invalid_content_length(value)),
            };
        }

        match (head.method(), head.version()) {
            (Method::Post | Method::Put, Version::Http11) => {
                Err(BadRequest::length_required(head.method()))
            }
            (Method::Post | Method::Put, Version::Http10) => {
                Err(BadRequest::new(RejectionReason::LengthRequiredHttp10))
            }
            _ => Ok(Self::Empty),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    NotStarted,
    Reading,
    Completed,
    Failed(BadRequest),
    Upgraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size { value: u64, digits: usize },
    Extension { value: u64 },
    SizeLf { value: u64 },
    Data(u64),
    DataCr,
    DataLf,
    Trailers,
}

/// Result of one [`BodyReader::decode`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// Bytes written to the output.
    Data(usize),
    /// The body is complete.
    End,
    /// The input holds no complete unit, read more from the transport.
    NeedMore,
}

/// Decodes one request body out of the connection input buffer.
///
/// Every byte taken from the wire for the body counts toward the size limit,
/// chunk sizes, extensions and delimiters included. Trailers do not. Once a
/// read fails, every later read fails with the same error.
#[derive(Debug)]
pub(crate) struct BodyReader {
    framing: Framing,
    state: State,
    max_size: Option<u64>,
    consumed: u64,
    remaining: u64,

    chunk: Chunk,
    trailer_section: HeaderSection,
    trailers: Vec<Header>,
}

impl BodyReader {
    pub(crate) fn new(framing: Framing, limits: &ReqLimits) -> Self {
        Self {
            framing,
            state: State::NotStarted,
            max_size: limits.max_request_body_size,
            consumed: 0,
            remaining: match framing {
                Framing::ContentLength(len) => len,
                _ => 0,
            },

            chunk: Chunk::Size { value: 0, digits: 0 },
            trailer_section: HeaderSection::default(),
            trailers: Vec::new(),
        }
    }

    /// Nothing is left on the wire for this body.
    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state, State::Completed | State::Upgraded) || self.framing == Framing::Empty
    }

    /// First failure recorded for this body.
    #[inline]
    pub(crate) fn error(&self) -> Option<&BadRequest> {
        match &self.state {
            State::Failed(err) => Some(err),
            _ => None,
        }
    }

    #[inline]
    pub(crate) const fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    pub(crate) fn set_max_size(&mut self, max: Option<u64>) -> Result<(), UsageError> {
        match self.state {
            State::Upgraded => Err(UsageError::BodySizeAfterUpgrade),
            State::NotStarted => {
                self.max_size = max;
                Ok(())
            }
            _ => Err(UsageError::BodySizeReadOnly),
        }
    }

    /// Retires the reader, reads return end of body from now on.
    #[inline]
    pub(crate) fn mark_upgraded(&mut self) {
        self.state = State::Upgraded;
    }

    /// Trailers of a completed chunked body.
    #[inline]
    pub(crate) fn trailers(&self) -> &[Header] {
        match self.state {
            State::Completed => &self.trailers,
            _ => &[],
        }
    }

    /// Records a failure raised outside the decoder (peer EOF, data rate).
    ///
    /// The first failure sticks and is returned from every later call.
    pub(crate) fn fail(&mut self, err: BadRequest) -> BadRequest {
        match &self.state {
            State::Failed(first) => first.clone(),
            State::Completed | State::Upgraded => err,
            _ => {
                self.state = State::Failed(err.clone());
                err
            }
        }
    }

    /// Decodes as much as possible from `input` into `out`.
    pub(crate) fn decode(
        &mut self,
        input: &mut BytesMut,
        out: &mut [u8],
        limits: &ReqLimits,
    ) -> Result<Decoded, BadRequest> {
        match &self.state {
            State::Failed(err) => return Err(err.clone()),
            State::Completed | State::Upgraded => return Ok(Decoded::End),
            State::Reading => {}
            State::NotStarted => {
                self.state = State::Reading;

                if let (Framing::ContentLength(len), Some(max)) = (self.framing, self.max_size) {
                    if len > max {
                        return Err(self.fail(BadRequest::body_too_large(max)));
                    }
                }
            }
        }

        let result = match self.framing {
            Framing::Empty => Ok(Decoded::End),
            Framing::ContentLength(_) => self.decode_length(input, out),
            Framing::Chunked => self.decode_chunked(input, out, limits),
        };

        match result {
            Ok(Decoded::End) => self.state = State::Completed,
            Err(err) => return Err(self.fail(err)),
            _ => {}
        }

        result
    }

    #[inline]
    fn count(&mut self, n: usize) -> Result<(), BadRequest> {
        self.consumed += n as u64;

        match self.max_size {
            Some(max) if self.consumed > max => Err(BadRequest::body_too_large(max)),
            _ => Ok(()),
        }
    }
}

// Content-Length
impl BodyReader {
    fn decode_length(&mut self, input: &mut BytesMut, out: &mut [u8]) -> Result<Decoded, BadRequest> {
        if self.remaining == 0 {
            return Ok(Decoded::End);
        }

        if input.is_empty() {
            return Ok(Decoded::NeedMore);
        }

        let n = input.len().min(out.len()).min(self.remaining as usize);
        self.count(n)?;

        out[..n].copy_from_slice(&input[..n]);
        input.advance(n);
        self.remaining -= n as u64;

        if self.remaining == 0 {
            self.state = State::Completed;
        }

        Ok(Decoded::Data(n))
    }
}

// Chunked
impl BodyReader {
    fn decode_chunked(
        &mut self,
        input: &mut BytesMut,
        out: &mut [u8],
        limits: &ReqLimits,
    ) -> Result<Decoded, BadRequest> {
        let bad_size = || BadRequest::new(RejectionReason::BadChunkSize);
        let bad_suffix = || BadRequest::new(RejectionReason::BadChunkSuffix);

        loop {
            let Some(&byte) = input.first() else {
                return Ok(Decoded::NeedMore);
            };

            self.chunk = match self.chunk {
                Chunk::Size { value, digits } => match byte {
                    b';' | b'\r' if digits == 0 => return Err(bad_size()),
                    b';' => Chunk::Extension { value },
                    b'\r' => Chunk::SizeLf { value },
                    _ => {
                        let digit = (byte as char).to_digit(16).ok_or_else(bad_size)?;
                        let value = value
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit as u64))
                            .ok_or_else(bad_size)?;

                        Chunk::Size {
                            value,
                            digits: digits + 1,
                        }
                    }
                },
                Chunk::Extension { value } => {
                    let Some(pos) = memchr2(b'\r', b'\n', input) else {
                        let len = input.len();
                        self.count(len)?;
                        input.clear();
                        return Ok(Decoded::NeedMore);
                    };

                    if input[pos] == b'\n' {
                        return Err(BadRequest::new(RejectionReason::BadChunkExtension));
                    }

                    self.count(pos + 1)?;
                    input.advance(pos + 1);
                    self.chunk = Chunk::SizeLf { value };
                    continue;
                }
                Chunk::SizeLf { value } => match byte {
                    b'\n' if value == 0 => Chunk::Trailers,
                    b'\n' => Chunk::Data(value),
                    _ => return Err(bad_size()),
                },
                Chunk::Data(remaining) => {
                    let n = input.len().min(out.len()).min(remaining as usize);
                    self.count(n)?;

                    out[..n].copy_from_slice(&input[..n]);
                    input.advance(n);

                    self.chunk = match remaining - n as u64 {
                        0 => Chunk::DataCr,
                        left => Chunk::Data(left),
                    };
                    return Ok(Decoded::Data(n));
                }
                Chunk::DataCr => match byte {
                    b'\r' => Chunk::DataLf,
                    _ => return Err(bad_suffix()),
                },
                Chunk::DataLf => match byte {
                    b'\n' => Chunk::Size { value: 0, digits: 0 },
                    _ => return Err(bad_suffix()),
                },
                // Trailer lines are bounded by the header limits, not the body size.
                Chunk::Trailers => return self.decode_trailers(input, limits),
            };

            self.count(1)?;
            input.advance(1);
        }
    }

    fn decode_trailers(&mut self, input: &mut BytesMut, limits: &ReqLimits) -> Result<Decoded, BadRequest> {
        loop {
            let Some(len) = self.trailer_section.next_line(input, limits)? else {
                return Ok(Decoded::NeedMore);
            };

            let line = input.split_to(len).freeze();
            let content = strip_terminator(&line)
                .ok_or(BadRequest::new(RejectionReason::MalformedHeaders))?;

            if content.is_empty() {
                return Ok(Decoded::End);
            }

            self.trailer_section.count_field(limits)?;

            let (name, value) = parse_field(content, limits.allow_non_ascii_header_values)?;
            self.trailers
                .push(Header::new(line.slice(name), line.slice(value)));
        }
    }
}

#[cfg(test)]
mod body_self {
    use super::*;
    use crate::tools::parse_head;

    const CHUNKED: &str = "5;random chunk extension\r\nHello\r\n6\r\n World\r\n0\r\n";

    fn reader(framing: Framing, max: Option<u64>) -> (BodyReader, ReqLimits) {
        let limits = ReqLimits {
            max_request_body_size: max,
            ..ReqLimits::default()
        };
        (BodyReader::new(framing, &limits), limits)
    }

    // Decodes everything, `Err` with the collected bytes if more input is needed.
    fn drain(
        body: &mut BodyReader,
        input: &mut BytesMut,
        limits: &ReqLimits,
    ) -> Result<Result<Vec<u8>, Vec<u8>>, BadRequest> {
        let mut data = Vec::new();
        let mut out = [0u8; 4];

        loop {
            match body.decode(input, &mut out, limits)? {
                Decoded::Data(n) => data.extend_from_slice(&out[..n]),
                Decoded::End => return Ok(Ok(data)),
                Decoded::NeedMore => return Ok(Err(data)),
            }
        }
    }

    #[test]
    fn framing_rules() {
        #[rustfmt::skip]
        let cases: [(&str, Result<Framing, RejectionReason>); 12] = [
            ("GET / HTTP/1.1\r\nHost: a\r\n\r\n",                                        Ok(Framing::Empty)),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n",                 Ok(Framing::ContentLength(10))),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n",                  Ok(Framing::Empty)),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",   Ok(Framing::Chunked)),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n", Ok(Framing::Chunked)),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked, gzip\r\n\r\n",   Err(RejectionReason::FinalTransferCodingNotChunked)),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 1\r\nContent-Length: 1\r\n\r\n", Err(RejectionReason::MultipleContentLengths)),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: -1\r\n\r\n",                 Err(RejectionReason::InvalidContentLength)),
            ("POST / HTTP/1.1\r\nHost: a\r\n\r\n",                                       Err(RejectionReason::LengthRequired)),
            ("PUT / HTTP/1.0\r\n\r\n",                                                   Err(RejectionReason::LengthRequiredHttp10)),
            ("GET / HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\n\r\n",                 Ok(Framing::Empty)),
            ("GET / HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nContent-Length: 1\r\n\r\n", Err(RejectionReason::UpgradeRequestCannotHavePayload)),
        ];

        for (src, expected) in cases {
            let mut head = parse_head(src, &ReqLimits::default());
            let framing = Framing::for_request(&mut head).map_err(|err| err.reason());

            assert_eq!(framing, expected, "{src:?}");
        }

        let mut head = parse_head(
            "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n",
            &ReqLimits::default(),
        );
        Framing::for_request(&mut head).unwrap();
        assert_eq!(head.header("content-length"), None);
    }

    #[test]
    fn framing_messages() {
        let mut head = parse_head("POST / HTTP/1.0\r\n\r\n", &ReqLimits::default());
        let err = Framing::for_request(&mut head).unwrap_err();

        assert_eq!(err.status(), crate::StatusCode::BadRequest);
        assert_eq!(err.message(), "Content-Length required for HTTP/1.0 POST/PUT.");

        let mut head = parse_head("POST / HTTP/1.1\r\nHost: a\r\n\r\n", &ReqLimits::default());
        let err = Framing::for_request(&mut head).unwrap_err();
        assert_eq!(err.status(), crate::StatusCode::LengthRequired);
    }

    #[test]
    fn content_length() {
        let (mut body, limits) = reader(Framing::ContentLength(11), None);
        let mut input = BytesMut::from(&b"hello"[..]);

        assert_eq!(drain(&mut body, &mut input, &limits).unwrap(), Err(b"hello".to_vec()));
        assert!(!body.is_finished());

        input.extend_from_slice(b" worldGET /");
        assert_eq!(drain(&mut body, &mut input, &limits).unwrap(), Ok(b" world".to_vec()));
        assert!(body.is_finished());
        assert_eq!(&input[..], b"GET /");
    }

    #[test]
    fn content_length_over_limit() {
        let (mut body, limits) = reader(Framing::ContentLength(11), Some(10));
        let mut input = BytesMut::new();

        for _ in 0..3 {
            let err = drain(&mut body, &mut input, &limits).unwrap_err();
            assert_eq!(err.reason(), RejectionReason::RequestBodyTooLarge);
            assert_eq!(err.message(), "Request body too large. The max request body size is 10 bytes.");
        }
    }

    #[test]
    fn chunked_any_split() {
        let wire = format!("{CHUNKED}Trailer-Header: value\r\n\r\n");

        for split in 0..wire.len() {
            let (mut body, limits) = reader(Framing::Chunked, None);
            let mut input = BytesMut::from(&wire.as_bytes()[..split]);

            let first = match drain(&mut body, &mut input, &limits).unwrap() {
                Ok(data) | Err(data) => data,
            };

            input.extend_from_slice(&wire.as_bytes()[split..]);
            let rest = drain(&mut body, &mut input, &limits).unwrap().unwrap();

            assert_eq!([first, rest].concat(), b"Hello World", "split at {split}");
            assert_eq!(body.trailers().len(), 1);
            assert_eq!(body.trailers()[0].name(), b"Trailer-Header");
            assert_eq!(body.trailers()[0].value(), b"value");
        }
    }

    #[test]
    fn chunked_limit_excludes_trailers() {
        let max = CHUNKED.len() as u64;
        let wire = format!("{CHUNKED}Trailer-Header: value\r\nOther: x\r\n\r\n");

        let (mut body, limits) = reader(Framing::Chunked, Some(max));
        let mut input = BytesMut::from(wire.as_bytes());

        assert_eq!(drain(&mut body, &mut input, &limits).unwrap(), Ok(b"Hello World".to_vec()));
        assert_eq!(body.trailers().len(), 2);
    }

    #[test]
    fn chunked_limit_is_sticky() {
        let max = CHUNKED.len() as u64 - 1;
        let (mut body, limits) = reader(Framing::Chunked, Some(max));
        let mut input = BytesMut::from(CHUNKED.as_bytes());

        let first = drain(&mut body, &mut input, &limits).unwrap_err();
        assert_eq!(first.reason(), RejectionReason::RequestBodyTooLarge);

        for _ in 0..3 {
            assert_eq!(drain(&mut body, &mut input, &limits).unwrap_err(), first);
        }
        assert!(body.error().is_some());
    }

    #[test]
    fn chunked_errors() {
        #[rustfmt::skip]
        let cases = [
            ("x\r\n",                  RejectionReason::BadChunkSize),
            ("\r\n",                   RejectionReason::BadChunkSize),
            ("5\rx",                   RejectionReason::BadChunkSize),
            ("5\r\nHelloX",            RejectionReason::BadChunkSuffix),
            ("5\r\nHello\rX",          RejectionReason::BadChunkSuffix),
            ("5;ext\nHello",           RejectionReason::BadChunkExtension),
            ("fffffffffffffffff\r\n",  RejectionReason::BadChunkSize),
        ];

        for (wire, expected) in cases {
            let (mut body, limits) = reader(Framing::Chunked, None);
            let mut input = BytesMut::from(wire.as_bytes());

            let err = drain(&mut body, &mut input, &limits).unwrap_err();
            assert_eq!(err.reason(), expected, "{wire:?}");
        }
    }

    #[test]
    fn trailer_limits() {
        let limits = ReqLimits {
            max_request_header_count: 1,
            max_request_body_size: None,
            ..ReqLimits::default()
        };
        let mut body = BodyReader::new(Framing::Chunked, &limits);
        let mut input = BytesMut::from(&b"0\r\nA: 1\r\nB: 2\r\n\r\n"[..]);

        let err = drain(&mut body, &mut input, &limits).unwrap_err();
        assert_eq!(err.reason(), RejectionReason::TooManyHeaders);
    }

    #[test]
    fn max_size_feature() {
        let (mut body, limits) = reader(Framing::ContentLength(3), Some(1));

        assert_eq!(body.set_max_size(Some(5)), Ok(()));
        assert_eq!(body.max_size(), Some(5));

        let mut input = BytesMut::from(&b"abc"[..]);
        assert_eq!(drain(&mut body, &mut input, &limits).unwrap(), Ok(b"abc".to_vec()));
        assert_eq!(body.set_max_size(None), Err(UsageError::BodySizeReadOnly));

        let (mut body, _) = reader(Framing::Empty, None);
        body.mark_upgraded();
        assert_eq!(body.set_max_size(None), Err(UsageError::BodySizeAfterUpgrade));
    }

    #[test]
    fn failures_are_sticky() {
        let (mut body, limits) = reader(Framing::ContentLength(10), None);
        let mut input = BytesMut::from(&b"abc"[..]);
        drain(&mut body, &mut input, &limits).unwrap().unwrap_err();

        let eof = body.fail(BadRequest::new(RejectionReason::UnexpectedEndOfRequestContent));
        assert_eq!(eof.message(), "Unexpected end of request content.");

        let later = body.fail(BadRequest::new(RejectionReason::RequestBodyTimeout));
        assert_eq!(later, eof);
        assert_eq!(drain(&mut body, &mut input, &limits).unwrap_err(), eof);
    }

    #[test]
    fn upgraded_reads_nothing() {
        let (mut body, limits) = reader(Framing::ContentLength(3), None);
        body.mark_upgraded();

        let mut input = BytesMut::from(&b"raw"[..]);
        assert_eq!(drain(&mut body, &mut input, &limits).unwrap(), Ok(vec![]));
        assert_eq!(&input[..], b"raw");
    }
}
