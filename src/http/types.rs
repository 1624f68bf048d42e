#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

/// Bytes treated as whitespace by the request grammar (`[ \t\n\r\f\v]`).
#[inline(always)]
pub(crate) const fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r' | 0x0C | 0x0B)
}

/// Strips leading and trailing ASCII spaces (only `0x20`).
#[inline]
pub(crate) fn trim_spaces(mut src: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = src {
        src = rest;
    }
    while let [rest @ .., b' '] = src {
        src = rest;
    }
    src
}

// METHOD

/// HTTP request methods recognized by the server
///
/// Only `GET` and `HEAD` are served. Every other syntactically valid method
/// token parses as [`Method::Other`] and is answered with
/// `501 Not Implemented`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method - transfer a current representation of the target resource
    /// [[RFC9110, Section 9.3.1](https://datatracker.ietf.org/doc/html/rfc9110#section-9.3.1)]
    Get,
    /// HEAD method - same as GET but without response body
    /// [[RFC9110, Section 9.3.2](https://datatracker.ietf.org/doc/html/rfc9110#section-9.3.2)]
    Head,
    /// Any other token
    Other,
}

impl Method {
    /// Classifies a method token by its prefix, so `GETX` is still `Get`.
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Self {
        match src {
            [b'G', b'E', b'T', ..] => Method::Get,
            [b'H', b'E', b'A', b'D', ..] => Method::Head,
            _ => Method::Other,
        }
    }

    /// Returns `true` if a response to this method carries a body.
    #[inline(always)]
    pub const fn has_body(self) -> bool {
        matches!(self, Method::Get)
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])+
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes produced by the server
        ///
        /// A subset of [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])+
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the status line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn to_first_line(self) -> &'static [u8] {
                match self { $(
                    StatusCode::$name => concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes(),
                )+ }
            }

            /// Returns the numeric code.
            #[inline]
            pub const fn as_u16(self) -> u16 {
                self as u16
            }
        }
    }
}

set_status_codes! {
    /// [[RFC9110, Section 15.3.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.1)]
    Ok = (200, "OK");
    /// [[RFC9110, Section 15.4.3](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.3)]
    Found = (302, "Found");
    /// [[RFC9110, Section 15.5.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.1)]
    BadRequest = (400, "Bad Request");
    /// [[RFC9110, Section 15.5.5](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.5)]
    NotFound = (404, "Not Found");
    /// [[RFC6585, Section 5](https://datatracker.ietf.org/doc/html/rfc6585#section-5)]
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");
    /// [[RFC9110, Section 15.6.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.1)]
    InternalServerError = (500, "Internal Server Error");
    /// [[RFC9110, Section 15.6.2](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.2)]
    NotImplemented = (501, "Not Implemented");
    /// [[RFC9110, Section 15.6.4](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.4)]
    ServiceUnavailable = (503, "Service Unavailable");
}
