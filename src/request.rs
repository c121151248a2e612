use core::fmt;

use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use url::Url;

use crate::ascii::{CRLF, find_crlf};
use crate::{DEFAULT_PORT, MAX_URL, SCHEME};

/// Errors produced while reading, parsing or sending a request line.
#[derive(Debug, PartialEq)]
pub enum RequestError {
    /// The request line or reference is not acceptable
    Malformed(String),
    /// The serialized reference exceeds `MAX_URL` bytes
    TooLong(usize),
    /// The underlying stream failed
    Network(ErrorKind),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "invalid request: {msg}"),
            Self::TooLong(len) => write!(
                f,
                "invalid request: reference is {len} bytes, the limit is {MAX_URL}"
            ),
            Self::Network(kind) => write!(f, "network error while handling request: {kind:?}"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Request is the target reference sent by a client, one per connection.
///
/// Requests come either from the wire ([`Request::read_from`]) or from a string
/// ([`Request::parse`]). Before a client sends one it must be [canonicalized](Request::canonicalize).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    scheme: Option<String>,
    user_info: Option<String>,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
    opaque: Option<String>,
}

impl Request {
    /// Parse a reference that does not carry the trailing `\r\n`.
    ///
    /// Absolute URLs, scheme relative references (`//host/path`) and bare paths are accepted.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        reject_control(text)?;

        match Url::parse(text) {
            Ok(url) => {
                let mut req = Self::from_url(&url, true);
                req.keep_default_port(&url, text);
                Ok(req)
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => Self::parse_reference(text),
            Err(e) => Err(RequestError::Malformed(e.to_string())),
        }
    }

    /// Read a request line from `source`.
    ///
    /// At most `MAX_URL + 2` bytes are read. Gemini requests have no body so reading past the
    /// terminator is harmless, but a line without `\r\n` inside that window is rejected.
    pub async fn read_from<S: Read>(source: &mut S) -> Result<Self, RequestError> {
        let mut buf = [0u8; MAX_URL + 2];
        let mut filled = 0;

        let end = loop {
            if let Some(end) = find_crlf(&buf[..filled]) {
                break Some(end);
            }
            if filled == buf.len() {
                break None;
            }
            match source.read(&mut buf[filled..]).await {
                Ok(0) => break None,
                Ok(n) => filled += n,
                Err(e) => return Err(RequestError::Network(e.kind())),
            }
        };

        let Some(end) = end else {
            return Err(RequestError::Malformed(format!(
                "no \\r\\n in {} bytes",
                MAX_URL + 2
            )));
        };

        let line = core::str::from_utf8(&buf[..end])
            .map_err(|_| RequestError::Malformed("request is not valid utf8".into()))?;

        Self::parse(line)
    }

    /// Prepare the request for sending, filling in the gemini defaults.
    ///
    /// User info and opaque parts are removed. Returns `false` when the request cannot be
    /// sent: the host is empty or the path is not absolute.
    pub fn canonicalize(&mut self) -> bool {
        self.opaque = None;
        self.user_info = None;

        if self.host.is_empty() || !self.path.starts_with('/') {
            return false;
        }

        if self.scheme.is_none() {
            self.scheme = Some(SCHEME.into());
        }
        if self.port.is_none() {
            self.port = Some(DEFAULT_PORT);
        }

        true
    }

    /// Resolve `reference` relative to this request, as done for links in a document.
    ///
    /// A request without a scheme resolves as a gemini one and the result keeps no scheme,
    /// unless `reference` names its own.
    pub fn join(&self, reference: &str) -> Result<Self, RequestError> {
        reject_control(reference)?;

        let base = match self.scheme {
            Some(_) => self.to_string(),
            None => format!("{SCHEME}:{self}"),
        };
        let base = Url::parse(&base)
            .map_err(|e| RequestError::Malformed(format!("request is not a valid base: {e}")))?;
        let url = base
            .join(reference)
            .map_err(|e| RequestError::Malformed(e.to_string()))?;

        let with_scheme = self.scheme.is_some() || Url::parse(reference).is_ok();
        let mut joined = Self::from_url(&url, with_scheme);
        if authority(reference).is_some() {
            joined.keep_default_port(&url, reference);
        } else if joined.host == self.host {
            joined.port = self.port;
        }

        Ok(joined)
    }

    /// Write the request line, `\r\n` included, to `sink`.
    pub async fn write_to<W: Write>(&self, sink: &mut W) -> Result<(), RequestError> {
        let mut line = self.to_string().into_bytes();
        if line.len() > MAX_URL {
            return Err(RequestError::TooLong(line.len()));
        }
        line.extend_from_slice(CRLF);

        sink.write_all(&line)
            .await
            .map_err(|e| RequestError::Network(e.kind()))
    }

    /// Scheme, if the reference carried one
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// Host name without the brackets of an IPv6 literal
    pub fn host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Port, if the reference carried one
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Escaped path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query, without the `?`
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Fragment, without the `#`
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    fn from_url(url: &Url, with_scheme: bool) -> Self {
        let user_info = match (url.username(), url.password()) {
            ("", None) => None,
            (user, None) => Some(user.to_string()),
            (user, Some(password)) => Some(format!("{user}:{password}")),
        };

        let (path, opaque) = if url.cannot_be_a_base() {
            (String::new(), Some(url.path().to_string()))
        } else {
            (url.path().to_string(), None)
        };

        Self {
            scheme: with_scheme.then(|| url.scheme().to_string()),
            user_info,
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port(),
            path,
            query: url.query().map(str::to_string),
            fragment: url.fragment().map(str::to_string),
            opaque,
        }
    }

    fn parse_reference(text: &str) -> Result<Self, RequestError> {
        if text.starts_with("//") {
            let url = Url::parse(&format!("{SCHEME}:{text}"))
                .map_err(|e| RequestError::Malformed(e.to_string()))?;
            let mut req = Self::from_url(&url, false);
            req.keep_default_port(&url, text);
            return Ok(req);
        }

        let (rest, fragment) = match text.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (text, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (rest, None),
        };

        Ok(Self {
            path: path.to_string(),
            query,
            fragment,
            ..Self::default()
        })
    }

    // the url parser drops a port equal to the scheme default, a named port must survive
    fn keep_default_port(&mut self, url: &Url, text: &str) {
        if self.port.is_none() && names_port(text) {
            self.port = url.port_or_known_default();
        }
    }

    fn has_authority(&self) -> bool {
        !self.host.is_empty() || self.port.is_some() || self.user_info.is_some()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{scheme}:")?;
        }

        if let Some(opaque) = &self.opaque {
            f.write_str(opaque)?;
        } else {
            if self.has_authority() {
                f.write_str("//")?;
                if let Some(user_info) = &self.user_info {
                    write!(f, "{user_info}@")?;
                }
                f.write_str(&self.host)?;
                if let Some(port) = self.port {
                    write!(f, ":{port}")?;
                }
            }
            f.write_str(&self.path)?;
        }

        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }

        Ok(())
    }
}

/// Authority component of `text`, when it has one.
fn authority(text: &str) -> Option<&str> {
    let rest = match text.split_once(':') {
        _ if text.starts_with("//") => &text[2..],
        Some((scheme, rest))
            if scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            rest.strip_prefix("//")?
        }
        _ => return None,
    };

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Returns `true` when the authority of `text` carries a non-empty port.
fn names_port(text: &str) -> bool {
    let Some(authority) = authority(text) else {
        return false;
    };
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host_port)| host_port);
    let after_host = match host_port.rfind(']') {
        Some(i) => &host_port[i + 1..],
        None => host_port,
    };

    after_host
        .split_once(':')
        .is_some_and(|(_, port)| !port.is_empty())
}

// the url parser strips tabs and newlines on its own, which would hide a malformed request
fn reject_control(text: &str) -> Result<(), RequestError> {
    if text.bytes().any(|b| b.is_ascii_control()) {
        return Err(RequestError::Malformed(
            "request contains control characters".into(),
        ));
    }
    Ok(())
}
