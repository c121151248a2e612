use core::convert::Infallible;
use core::fmt;
use core::mem;

use embedded_io_async::{Error as _, ErrorKind, ErrorType, Read, Write};

use crate::MAX_META;
use crate::ascii::{CRLF, SP, atoi, find_crlf};
use crate::status::Status;

/// Exact size of the largest valid header: 2 status digits, a space, meta and `\r\n`.
const MAX_HEADER: usize = MAX_META + 5;

/// Write buffers larger than this are released instead of being kept for reuse.
const MAX_SPARE_CAPACITY: usize = 64 * 1024;

const DRAIN_CHUNK: usize = 4096;

/// Errors returned by [`Response`] operations.
#[derive(Debug, PartialEq)]
pub enum ResponseError {
    /// The header is malformed: bad status, meta too long, missing `\r\n`...
    Header(String),
    /// `write` was called after `flush`
    Flushed,
    /// The body was consumed in the other mode: `body` after `read`, or `read` after `body`
    Consumed,
    /// The operation is not valid in the current state of the response
    State(&'static str),
    /// The underlying stream failed
    Network(ErrorKind),
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(msg) => write!(f, "invalid header: {msg}"),
            Self::Flushed => f.write_str("already flushed"),
            Self::Consumed => f.write_str("body already consumed"),
            Self::State(msg) => write!(f, "invalid response state: {msg}"),
            Self::Network(kind) => write!(f, "network error while handling response: {kind:?}"),
        }
    }
}

impl std::error::Error for ResponseError {}

impl embedded_io_async::Error for ResponseError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(kind) => *kind,
            Self::Header(_) => ErrorKind::InvalidData,
            _ => ErrorKind::Other,
        }
    }
}

/// Body source of a response produced locally by a server. It is never read from.
#[derive(Debug)]
pub enum Detached {}

impl ErrorType for Detached {
    type Error = Infallible;
}

impl Read for Detached {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> {
        match *self {}
    }
}

enum Body<S> {
    Idle,
    Writing(Vec<u8>),
    Flushed {
        buf: Vec<u8>,
        offset: usize,
    },
    Streaming {
        head: Vec<u8>,
        offset: usize,
        source: S,
        read: bool,
    },
    Buffered(Vec<u8>),
}

impl<S> Body<S> {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Writing(_) => "writing",
            Self::Flushed { .. } => "flushed",
            Self::Streaming { .. } => "streaming",
            Self::Buffered(_) => "buffered",
        }
    }
}

/// Response is a gemini response header plus its body, for both ends of a connection.
///
/// A server fills it in: [`Response::new`] (or [`Response::prepare`] on a pooled instance),
/// any number of [`Response::write`] calls, then exactly one [`Response::flush`]. After the
/// flush the body is readable and no longer writable.
///
/// A client parses one with [`Response::read_from`]. The header is read eagerly, the body is
/// left in the stream. It can then be consumed **either** incrementally with
/// [`Response::read`] **or** at once with [`Response::body`]; mixing the two yields
/// [`ResponseError::Consumed`].
///
/// [`Response::reset`] brings any response back to the idle state and is the only way to
/// reuse one.
pub struct Response<S = Detached> {
    status: Option<Status>,
    meta: String,
    body: Body<S>,
    spare: Vec<u8>,
}

impl<S> Default for Response<S> {
    fn default() -> Self {
        Self {
            status: None,
            meta: String::new(),
            body: Body::Idle,
            spare: Vec::new(),
        }
    }
}

impl<S> fmt::Debug for Response<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("meta", &self.meta)
            .field("body", &self.body.name())
            .finish()
    }
}

impl Response {
    /// Create a response ready to be written to, as a server does.
    ///
    /// Fails when `status` is outside `10..=99`, when `meta` is longer than `MAX_META`
    /// bytes or when it contains `\r\n`. `meta` must not include the terminating `\r\n`.
    pub fn new(status: u8, meta: &str) -> Result<Self, ResponseError> {
        let mut res = Self::default();
        res.set_header(status, meta)?;
        res.prepare()?;
        Ok(res)
    }
}

impl<S: Read> Response<S> {
    /// Read the header of a response from `source`, keeping the stream as the lazy body.
    pub async fn from_source(source: S) -> Result<Self, ResponseError> {
        let mut res = Self::default();
        res.read_from(source).await?;
        Ok(res)
    }

    /// Populate an idle response from `source`, as a client does.
    ///
    /// At most `MAX_META + 5` bytes are read for the header. Whatever follows the header in
    /// that window, then the rest of `source`, forms the body.
    pub async fn read_from(&mut self, mut source: S) -> Result<(), ResponseError> {
        if !matches!(self.body, Body::Idle) || self.status.is_some() {
            return Err(ResponseError::State(
                "response must be reset before reading another one",
            ));
        }

        let mut window = mem::take(&mut self.spare);
        window.clear();
        window.resize(MAX_HEADER, 0);

        let mut filled = 0;
        loop {
            if filled > 3 && find_crlf(&window[3..filled]).is_some() {
                break;
            }
            if filled == window.len() {
                break;
            }
            match source.read(&mut window[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(ResponseError::Network(e.kind())),
            }
        }

        if filled < 4 {
            return Err(ResponseError::Header(
                "not enough data for a valid header".into(),
            ));
        }

        let status = atoi(&window[..2])
            .and_then(|code| u8::try_from(code).ok())
            .and_then(Status::new)
            .ok_or_else(|| {
                ResponseError::Header(format!(
                    "status corrupted: {:?}",
                    String::from_utf8_lossy(&window[..2])
                ))
            })?;

        if window[2] != SP {
            return Err(ResponseError::Header(format!(
                "{:?} is not a space",
                char::from(window[2])
            )));
        }

        let Some(end) = find_crlf(&window[3..filled]).map(|i| i + 3) else {
            return Err(ResponseError::Header(format!(
                "no \\r\\n in {MAX_HEADER} bytes"
            )));
        };

        let meta = core::str::from_utf8(&window[3..end])
            .map_err(|_| ResponseError::Header("meta is not valid utf8".into()))?;

        self.status = Some(status);
        self.meta.clear();
        self.meta.push_str(meta);

        // everything after the header is the start of the body
        window.copy_within(end + 2..filled, 0);
        window.truncate(filled - end - 2);

        self.body = Body::Streaming {
            head: window,
            offset: 0,
            source,
            read: false,
        };

        Ok(())
    }

    /// Stream the body.
    ///
    /// Valid once flushed (server) or once a header was read (client). Returns `Ok(0)` at the
    /// end of the body. After a client reads, [`Response::body`] is no longer available.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ResponseError> {
        self.pull(buf).await
    }

    /// The whole body.
    ///
    /// A server gets its flushed buffer back. A client drains the stream the first time and
    /// gets the cached copy afterwards, unless [`Response::read`] was used before.
    pub async fn body(&mut self) -> Result<&[u8], ResponseError> {
        match mem::replace(&mut self.body, Body::Idle) {
            Body::Streaming {
                mut head,
                offset,
                mut source,
                read: false,
            } => {
                head.drain(..offset);
                if let Err(e) = drain(&mut source, &mut head).await {
                    // keep what arrived so a retry resumes where the stream stopped
                    self.body = Body::Streaming {
                        head,
                        offset: 0,
                        source,
                        read: false,
                    };
                    return Err(e);
                }
                self.body = Body::Buffered(head);
            }
            other => self.body = other,
        }

        match &self.body {
            Body::Flushed { buf, .. } | Body::Buffered(buf) => Ok(buf.as_slice()),
            Body::Streaming { .. } => Err(ResponseError::Consumed),
            Body::Idle | Body::Writing(_) => Err(ResponseError::State("response has not been flushed")),
        }
    }

    async fn pull(&mut self, buf: &mut [u8]) -> Result<usize, ResponseError> {
        match &mut self.body {
            Body::Flushed { buf: body, offset } => {
                let n = copy_into(&body[*offset..], buf);
                *offset += n;
                Ok(n)
            }
            Body::Streaming {
                head,
                offset,
                source,
                read,
            } => {
                *read = true;
                if *offset < head.len() {
                    let n = copy_into(&head[*offset..], buf);
                    *offset += n;
                    return Ok(n);
                }
                source
                    .read(buf)
                    .await
                    .map_err(|e| ResponseError::Network(e.kind()))
            }
            Body::Buffered(_) => Err(ResponseError::Consumed),
            Body::Idle | Body::Writing(_) => {
                Err(ResponseError::State("response has no readable body"))
            }
        }
    }
}

impl<S> Response<S> {
    /// Set the header of a response being produced.
    pub fn set_header(&mut self, code: u8, meta: &str) -> Result<(), ResponseError> {
        if matches!(self.body, Body::Streaming { .. } | Body::Buffered(_)) {
            return Err(ResponseError::State(
                "the header of a received response is read only",
            ));
        }

        let status = Status::new(code)
            .ok_or_else(|| ResponseError::Header(format!("invalid status ({code})")))?;
        check_meta(meta)?;

        self.status = Some(status);
        self.meta.clear();
        self.meta.push_str(meta);
        Ok(())
    }

    /// Start writing a body: idle → writing. Used on pooled responses.
    pub fn prepare(&mut self) -> Result<(), ResponseError> {
        if !matches!(self.body, Body::Idle) {
            return Err(ResponseError::State(
                "response must be reset before it is prepared",
            ));
        }
        self.body = Body::Writing(mem::take(&mut self.spare));
        Ok(())
    }

    /// Append `data` to the body.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, ResponseError> {
        self.push(data)
    }

    /// Append `text` to the body.
    pub fn write_str(&mut self, text: &str) -> Result<usize, ResponseError> {
        self.push(text.as_bytes())
    }

    /// Freeze what was written as the body. Further writes fail with [`ResponseError::Flushed`].
    pub fn flush(&mut self) -> Result<(), ResponseError> {
        self.seal()
    }

    /// Status, once set or parsed
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Meta field of the header
    pub fn meta(&self) -> &str {
        &self.meta
    }

    /// Returns `true` once the body can no longer be written.
    pub fn is_flushed(&self) -> bool {
        matches!(self.body, Body::Flushed { .. })
    }

    /// The raw header line, `\r\n` included.
    pub fn header(&self) -> Result<Vec<u8>, ResponseError> {
        let status = self
            .status
            .ok_or(ResponseError::State("response has no status"))?;

        let mut out = Vec::with_capacity(self.meta.len() + 5);
        out.extend_from_slice(&status.to_ascii());
        out.push(SP);
        out.extend_from_slice(self.meta.as_bytes());
        out.extend_from_slice(CRLF);
        Ok(out)
    }

    /// Write the header line to `sink`.
    pub async fn write_header<W: Write>(&self, sink: &mut W) -> Result<(), ResponseError> {
        let header = self.header()?;
        sink.write_all(&header)
            .await
            .map_err(|e| ResponseError::Network(e.kind()))
    }

    /// Clear every field and return to the idle state.
    ///
    /// The stream of a received response is dropped. A write buffer is kept, emptied, for
    /// the next [`Response::prepare`].
    pub fn reset(&mut self) {
        self.status = None;
        self.meta.clear();

        match mem::replace(&mut self.body, Body::Idle) {
            Body::Writing(mut buf)
            | Body::Flushed { mut buf, .. }
            | Body::Buffered(mut buf)
            | Body::Streaming { head: mut buf, .. } => {
                buf.clear();
                if buf.capacity() <= MAX_SPARE_CAPACITY {
                    self.spare = buf;
                }
            }
            Body::Idle => {}
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<usize, ResponseError> {
        match &mut self.body {
            Body::Writing(buf) => {
                buf.extend_from_slice(data);
                Ok(data.len())
            }
            Body::Flushed { .. } => Err(ResponseError::Flushed),
            _ => Err(ResponseError::State("response is not prepared for writing")),
        }
    }

    fn seal(&mut self) -> Result<(), ResponseError> {
        match mem::replace(&mut self.body, Body::Idle) {
            Body::Writing(buf) => {
                self.body = Body::Flushed { buf, offset: 0 };
                Ok(())
            }
            flushed @ Body::Flushed { .. } => {
                self.body = flushed;
                Ok(())
            }
            other => {
                self.body = other;
                Err(ResponseError::State("only a prepared response can be flushed"))
            }
        }
    }
}

impl<S> ErrorType for Response<S> {
    type Error = ResponseError;
}

impl<S: Read> Read for Response<S> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.pull(buf).await
    }
}

impl<S> Write for Response<S> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.push(buf)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.seal()
    }
}

fn check_meta(meta: &str) -> Result<(), ResponseError> {
    if meta.len() > MAX_META {
        return Err(ResponseError::Header(format!(
            "meta length > {MAX_META} bytes"
        )));
    }
    if find_crlf(meta.as_bytes()).is_some() {
        return Err(ResponseError::Header("meta contains \\r\\n".into()));
    }
    Ok(())
}

fn copy_into(from: &[u8], to: &mut [u8]) -> usize {
    let n = from.len().min(to.len());
    to[..n].copy_from_slice(&from[..n]);
    n
}

async fn drain<S: Read>(source: &mut S, into: &mut Vec<u8>) -> Result<(), ResponseError> {
    let mut chunk = [0u8; DRAIN_CHUNK];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => return Ok(()),
            Ok(n) => into.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(ResponseError::Network(e.kind())),
        }
    }
}
