use crate::{
    errors::ErrorKind,
    http::types::{self, Method},
};
use memchr::{memchr, memmem};

/// A parsed request head.
///
/// Owns its data, so the frame buffer it was parsed from can be reused or
/// grown right away.
///
/// # Request line
///
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/1.1" CRLF
/// ```
/// `[METHOD]` and `[TARGET]` contain no whitespace and `[TARGET]` starts
/// with `/`. Anything else is `400 Bad Request`. Methods other than `GET` and
/// `HEAD` parse fine and are reported as [`Method::Other`].
///
/// A target is *well formed* when it matches `^/[A-Za-z0-9./-]*$`. A target
/// that is not is still accepted by the parser; it is answered with
/// `404 Not Found`.
///
/// # Headers
///
/// ```text
/// [NAME] ":" *SP [VALUE] *SP CRLF
/// ```
/// `[NAME]` contains no whitespace and no colon, `[VALUE]` is at least one
/// byte. Header names are matched case-insensitively:
///
/// | Header           | Policy                                                      |
/// |------------------|-------------------------------------------------------------|
/// | `Connection`     | At most once. The value `close` (exact case) closes after the response |
/// | `Server`         | At most once, otherwise ignored                             |
/// | `Content-Type`   | Rejected, requests carry no body                            |
/// | `Content-Length` | Rejected, requests carry no body                            |
/// | anything else    | Ignored                                                     |
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    target: Box<[u8]>,
    target_well_formed: bool,
    connection_close: bool,
    seen: SeenHeaders,
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The raw request target as sent by the client.
    #[inline(always)]
    pub fn target(&self) -> &[u8] {
        &self.target
    }

    /// The target as text, if it is valid UTF-8.
    #[inline]
    pub fn target_str(&self) -> Option<&str> {
        simdutf8::basic::from_utf8(&self.target).ok()
    }

    /// Whether the target only uses the characters the server can map to files.
    #[inline(always)]
    pub const fn is_target_well_formed(&self) -> bool {
        self.target_well_formed
    }

    /// Whether the client sent `Connection: close`.
    #[inline(always)]
    pub const fn is_connection_close(&self) -> bool {
        self.connection_close
    }

    #[inline(always)]
    pub const fn seen_headers(&self) -> SeenHeaders {
        self.seen
    }
}

/// Headers with a policy attached, as encountered while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeenHeaders {
    pub connection: bool,
    pub content_type: bool,
    pub content_length: bool,
    pub server: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderName {
    Connection,
    ContentType,
    ContentLength,
    Server,
    Other,
}

/// Matching tables for the request grammar.
///
/// Built once when the server starts and shared by every connection.
#[derive(Debug, Clone)]
pub struct ParserRules {
    target_chars: [bool; 256],
    header_names: [(&'static [u8], HeaderName); 4],
}

impl Default for ParserRules {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserRules {
    pub fn new() -> Self {
        let mut target_chars = [false; 256];
        for byte in (b'a'..=b'z').chain(b'A'..=b'Z').chain(b'0'..=b'9') {
            target_chars[byte as usize] = true;
        }
        for byte in [b'.', b'/', b'-'] {
            target_chars[byte as usize] = true;
        }

        ParserRules {
            target_chars,
            header_names: [
                (b"connection", HeaderName::Connection),
                (b"content-type", HeaderName::ContentType),
                (b"content-length", HeaderName::ContentLength),
                (b"server", HeaderName::Server),
            ],
        }
    }

    /// Parses one frame, terminator included.
    pub fn parse(&self, frame: &[u8]) -> Result<Request, ErrorKind> {
        let head = frame
            .strip_suffix(b"\r\n\r\n")
            .ok_or(ErrorKind::InvalidRequestLine)?;

        let mut lines = memmem::find_iter(head, b"\r\n");
        let end_first_line = lines.next().unwrap_or(head.len());

        let mut request = self.parse_request_line(&head[..end_first_line])?;

        let mut start = end_first_line + 2;
        while start <= head.len() {
            let end = lines.next().unwrap_or(head.len());
            self.parse_header(&mut request, &head[start..end])?;
            start = end + 2;
        }

        Ok(request)
    }

    #[inline]
    pub fn is_well_formed_target(&self, target: &[u8]) -> bool {
        target.first() == Some(&b'/') && target.iter().all(|b| self.target_chars[*b as usize])
    }
}

// Parse first line
impl ParserRules {
    #[inline]
    fn parse_request_line(&self, line: &[u8]) -> Result<Request, ErrorKind> {
        let method_end = memchr(b' ', line).ok_or(ErrorKind::InvalidRequestLine)?;
        let method = &line[..method_end];
        let rest = &line[method_end + 1..];

        let target_end = memchr(b' ', rest).ok_or(ErrorKind::InvalidRequestLine)?;
        let target = &rest[..target_end];
        let version = &rest[target_end + 1..];

        if method.is_empty()
            || method.iter().any(|b| types::is_space(*b))
            || target.first() != Some(&b'/')
            || target.iter().any(|b| types::is_space(*b))
            || version != b"HTTP/1.1"
        {
            return Err(ErrorKind::InvalidRequestLine);
        }

        Ok(Request {
            method: Method::from_bytes(method),
            target: target.into(),
            target_well_formed: self.is_well_formed_target(target),
            connection_close: false,
            seen: SeenHeaders::default(),
        })
    }
}

// Parse headers
impl ParserRules {
    #[inline]
    fn parse_header(&self, request: &mut Request, line: &[u8]) -> Result<(), ErrorKind> {
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let name = &line[..colon];
        let value = &line[colon + 1..];

        if name.is_empty()
            || name.iter().any(|b| types::is_space(*b))
            || value.is_empty()
            || value.iter().any(|b| matches!(b, b'\r' | b'\n'))
        {
            return Err(ErrorKind::InvalidHeader);
        }

        let seen = &mut request.seen;
        match self.classify(name) {
            HeaderName::Connection => {
                if seen.connection {
                    return Err(ErrorKind::DuplicateHeader);
                }
                seen.connection = true;
                request.connection_close = types::trim_spaces(value) == b"close";
            }
            HeaderName::ContentType => {
                seen.content_type = true;
                return Err(ErrorKind::ForbiddenHeader);
            }
            HeaderName::ContentLength => {
                seen.content_length = true;
                return Err(ErrorKind::ForbiddenHeader);
            }
            HeaderName::Server => {
                if seen.server {
                    return Err(ErrorKind::DuplicateHeader);
                }
                seen.server = true;
            }
            HeaderName::Other => {}
        }

        Ok(())
    }

    #[inline]
    fn classify(&self, name: &[u8]) -> HeaderName {
        self.header_names
            .iter()
            .find(|(known, _)| name.eq_ignore_ascii_case(known))
            .map_or(HeaderName::Other, |(_, kind)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<V: AsRef<[u8]>>(value: V) -> Result<Request, ErrorKind> {
        ParserRules::new().parse(value.as_ref())
    }

    #[test]
    fn parse_method() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",     Method::Get),
            ("HEAD / HTTP/1.1\r\n\r\n",    Method::Head),
            ("POST / HTTP/1.1\r\n\r\n",    Method::Other),
            ("DELETE / HTTP/1.1\r\n\r\n",  Method::Other),
            ("get / HTTP/1.1\r\n\r\n",     Method::Other),
            ("GETX / HTTP/1.1\r\n\r\n",    Method::Get),
            ("HEADS / HTTP/1.1\r\n\r\n",   Method::Head),
            ("BREW / HTTP/1.1\r\n\r\n",    Method::Other),
        ];

        for (req, expected) in cases {
            assert_eq!(parse(req).map(|r| r.method()), Ok(expected), "{req:?}");
        }
    }

    #[test]
    fn parse_request_line() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1",                   true),
            ("GET /a/b.txt HTTP/1.1",            true),
            ("GET /%20?q=1 HTTP/1.1",            true),

            ("GET / HTTP/1.0",                   false),
            ("GET / HTTP/1.1 ",                  false),
            ("GET  / HTTP/1.1",                  false),
            ("GET /  HTTP/1.1",                  false),
            (" GET / HTTP/1.1",                  false),
            ("GET a.txt HTTP/1.1",               false),
            ("GET http://x/ HTTP/1.1",           false),
            ("GET / http/1.1",                   false),
            ("GET\t/ HTTP/1.1",                  false),
            ("GET /a\tb HTTP/1.1",               false),
            ("GET /",                            false),
            ("GET",                              false),
            ("",                                 false),
        ];

        for (line, ok) in cases {
            let result = parse(format!("{line}\r\n\r\n"));

            if ok {
                assert!(result.is_ok(), "{line:?}");
            } else {
                assert_eq!(result, Err(ErrorKind::InvalidRequestLine), "{line:?}");
            }
        }
    }

    #[test]
    fn parse_target() {
        #[rustfmt::skip]
        let cases = [
            ("/",                   true),
            ("/index.html",         true),
            ("/a/b/c-d/E.F0",       true),
            ("/../etc/passwd",      true),
            ("//",                  true),

            ("/a_b",                false),
            ("/a%20b",              false),
            ("/a?b=c",              false),
            ("/~user",              false),
            ("/a|b",                false),
            ("/\u{e9}t\u{e9}",      false),
        ];

        for (target, well_formed) in cases {
            let request = parse(format!("GET {target} HTTP/1.1\r\n\r\n")).unwrap();

            assert_eq!(request.target(), target.as_bytes());
            assert_eq!(request.target_str(), Some(target));
            assert_eq!(request.is_target_well_formed(), well_formed, "{target:?}");
        }
    }

    #[test]
    fn parse_header() {
        #[rustfmt::skip]
        let cases = [
            ("Host: example.com",      Ok(())),
            ("Host:example.com",       Ok(())),
            ("Host:    example.com  ", Ok(())),
            ("X-Empty:   ",            Ok(())),
            ("Accept: */*",            Ok(())),
            ("X-Tab: a\tb",            Ok(())),

            ("Host:",                  Err(ErrorKind::InvalidHeader)),
            (": value",                Err(ErrorKind::InvalidHeader)),
            ("No-Colon value",         Err(ErrorKind::InvalidHeader)),
            ("Bad Name: value",        Err(ErrorKind::InvalidHeader)),
            ("Host : value",           Err(ErrorKind::InvalidHeader)),
            ("Host: a\nb",             Err(ErrorKind::InvalidHeader)),
            ("Host: a\rb",             Err(ErrorKind::InvalidHeader)),
            ("",                       Err(ErrorKind::InvalidHeader)),
        ];

        for (header, expected) in cases {
            let result = parse(format!("GET / HTTP/1.1\r\n{header}\r\n\r\n"));
            assert_eq!(result.map(|_| ()), expected, "{header:?}");
        }
    }

    #[test]
    fn parse_special_header() {
        #[rustfmt::skip]
        let cases = [
            ("Connection: close",               Ok(true)),
            ("connection:close",                Ok(true)),
            ("CONNECTION:   close   ",          Ok(true)),
            ("Connection: keep-alive",          Ok(false)),
            ("Connection: Close",               Ok(false)),
            ("Connection: close, upgrade",      Ok(false)),
            ("Server: peer",                    Ok(false)),
            ("X-Connection: close",             Ok(false)),
            ("Connection-Extra: close",         Ok(false)),

            ("Content-Type: text/plain",        Err(ErrorKind::ForbiddenHeader)),
            ("content-length: 0",               Err(ErrorKind::ForbiddenHeader)),
            ("CONTENT-LENGTH: 12",              Err(ErrorKind::ForbiddenHeader)),
            (
                "Connection: close\r\nConnection: close",
                Err(ErrorKind::DuplicateHeader),
            ),
            (
                "Connection: keep-alive\r\nHost: a\r\nconnection: close",
                Err(ErrorKind::DuplicateHeader),
            ),
            ("Server: a\r\nSERVER: b",          Err(ErrorKind::DuplicateHeader)),
        ];

        for (headers, expected) in cases {
            let result = parse(format!("GET / HTTP/1.1\r\n{headers}\r\n\r\n"));
            assert_eq!(result.map(|r| r.is_connection_close()), expected, "{headers:?}");
        }
    }

    #[test]
    fn seen_headers() {
        let request =
            parse("GET / HTTP/1.1\r\nServer: a\r\nHost: b\r\nConnection: close\r\n\r\n").unwrap();

        assert_eq!(
            request.seen_headers(),
            SeenHeaders {
                connection: true,
                server: true,
                ..SeenHeaders::default()
            }
        );
        assert!(request.is_connection_close());
    }

    #[test]
    fn default_keeps_alive() {
        let request = parse("GET /a.txt HTTP/1.1\r\nHost: b\r\n\r\n").unwrap();

        assert_eq!(request.method(), Method::Get);
        assert!(!request.is_connection_close());
        assert_eq!(request.seen_headers(), SeenHeaders::default());
    }

    #[test]
    fn missing_terminator() {
        assert_eq!(
            parse("GET / HTTP/1.1\r\n"),
            Err(ErrorKind::InvalidRequestLine)
        );
    }

    #[test]
    fn rules_are_reusable() {
        let rules = ParserRules::new();
        let ok = b"GET /a HTTP/1.1\r\nConnection: close\r\n\r\n";
        let bad = b"GET /a HTTP/1.1\r\nContent-Length: 1\r\n\r\n";

        for _ in 0..3 {
            assert!(rules.parse(ok).unwrap().is_connection_close());
            assert_eq!(rules.parse(bad), Err(ErrorKind::ForbiddenHeader));
        }
    }

    #[test]
    fn inserting_second_connection_fails() {
        let base = "GET /x HTTP/1.1\r\nHost: a\r\nConnection: keep-alive\r\nAccept: */*\r\n";

        assert!(parse(format!("{base}\r\n")).is_ok());
        assert_eq!(
            parse(format!("{base}Connection: keep-alive\r\n\r\n")),
            Err(ErrorKind::DuplicateHeader)
        );
    }
}
