use core::fmt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use futures::FutureExt;
use log::{debug, error};

use crate::request::{Request, RequestError};
use crate::response::{Response, ResponseError};
use crate::status::Status;

/// Idle responses kept by a [`Server`] unless configured otherwise.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// HandlerError is returned by `Handler` implementations.  Errors returned by `Response`
/// methods should be passed up in the `Response` variant, other errors are a `Custom` error.
#[derive(Debug, PartialEq)]
pub enum HandlerError {
    /// Errors returned by `Response` methods
    Response(ResponseError),
    /// Custom errors as specified by the `Handler` implementation author
    Custom(&'static str),
    /// The handler panicked, with the panic message
    Panicked(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(e) => write!(f, "handler failed: {e}"),
            Self::Custom(msg) => write!(f, "handler failed: {msg}"),
            Self::Panicked(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ResponseError> for HandlerError {
    fn from(value: ResponseError) -> Self {
        Self::Response(value)
    }
}

impl From<&'static str> for HandlerError {
    fn from(value: &'static str) -> Self {
        Self::Custom(value)
    }
}

/// Trait required to be implemented by the resource that will be responsible for handling
/// requests.
pub trait Handler {
    /// Called by the server with the request and a response ready to be written to.  The
    /// implementation must set a status with `Response::set_header` and may write a body.
    /// Flushing is optional, the server flushes before sending.
    ///
    /// If the handler fails, panics, or leaves the status unset, whatever it wrote is discarded
    /// and the client gets a temporary failure.
    ///
    /// ```
    /// use gemlite::request::Request;
    /// use gemlite::response::Response;
    /// use gemlite::server::{Handler, HandlerError};
    ///
    /// struct Redirect;
    ///
    /// impl Handler for Redirect {
    ///     async fn handle(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError> {
    ///         let target = req.join("/moved/").map_err(|_| "cannot build the target")?;
    ///         res.set_header(31, &target.to_string())?;
    ///         Ok(())
    ///     }
    /// }
    /// ```
    fn handle(
        &self,
        req: &Request,
        res: &mut Response,
    ) -> impl Future<Output = Result<(), HandlerError>>;
}

/// ServerError is returned by the gemlite::server::Server::serve() method when any of the
/// variants occur.  In every case the connection should be closed.
#[derive(Debug, PartialEq)]
pub enum ServerError {
    /// The request was malformed, the client was answered with a bad request status
    Request(RequestError),
    /// The response could not be produced
    Response(ResponseError),
    /// The handler failed, the client was answered with a temporary failure status
    Handler(HandlerError),
    /// The connection failed
    Network(ErrorKind),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => e.fmt(f),
            Self::Response(e) => e.fmt(f),
            Self::Handler(e) => e.fmt(f),
            Self::Network(kind) => write!(f, "network error while serving: {kind:?}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ResponseError> for ServerError {
    fn from(value: ResponseError) -> Self {
        match value {
            ResponseError::Network(kind) => Self::Network(kind),
            e => Self::Response(e),
        }
    }
}

/// Free list of idle responses, so their buffers are reused across connections.
///
/// Every response is reset when released, `acquire` only ever hands out idle responses.
#[derive(Debug)]
pub struct ResponsePool {
    free: Mutex<Vec<Response>>,
    capacity: usize,
}

impl Default for ResponsePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl ResponsePool {
    /// A pool keeping at most `capacity` idle responses.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// An idle response, recycled when possible
    pub fn acquire(&self) -> Response {
        self.lock().pop().unwrap_or_default()
    }

    /// Reset `res` and keep it for a later `acquire`, unless the pool is full.
    pub fn release(&self, mut res: Response) {
        res.reset();
        let mut free = self.lock();
        if free.len() < self.capacity {
            free.push(res);
        }
    }

    /// Number of idle responses
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no idle response is kept.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // idle responses are always reset, a panic elsewhere cannot leave them half-used
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Response>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Server is the main struct to be used by users of the crate.  It is constructed with an
/// implementation of Handler, and provides a serve() method to be called on each new client
/// connection.
pub struct Server<H> {
    handler: H,
    responses: ResponsePool,
}

impl<H> Server<H>
where
    H: Handler,
{
    /// Construct a Server using the provided implementation of Handler
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            responses: ResponsePool::default(),
        }
    }

    /// Keep at most `capacity` idle responses between connections.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.responses = ResponsePool::new(capacity);
        self
    }

    /// Pool of idle responses
    pub fn pool(&self) -> &ResponsePool {
        &self.responses
    }

    /// Serve the single request of a connection.
    ///
    /// A malformed request is answered with `59` and a handler failure with `40`, both are
    /// then reported as an Err.  The client is expected to be disconnected afterwards,
    /// whatever the result.
    pub async fn serve<C>(&self, conn: &mut C) -> Result<(), ServerError>
    where
        C: Read + Write,
    {
        let request = match Request::read_from(conn).await {
            Ok(request) => request,
            Err(RequestError::Network(kind)) => return Err(ServerError::Network(kind)),
            Err(e) => {
                debug!("bad request: {e}");
                let header = Response::new(Status::BAD_REQUEST.code(), "bad request")?.header()?;
                send(conn, &header).await?;
                flush(conn).await?;
                return Err(ServerError::Request(e));
            }
        };

        let mut res = self.responses.acquire();
        let served = self.respond(&request, &mut res, conn).await;
        self.responses.release(res);
        served
    }

    async fn respond<C: Write>(
        &self,
        req: &Request,
        res: &mut Response,
        conn: &mut C,
    ) -> Result<(), ServerError> {
        res.prepare()?;

        let handled = AssertUnwindSafe(self.handler.handle(req, res))
            .catch_unwind()
            .await;

        let failure = match handled {
            Ok(Ok(())) if res.status().is_some() => None,
            Ok(Ok(())) => Some(HandlerError::Custom("no status set")),
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(HandlerError::Panicked(panic_message(&*panic))),
        };

        if let Some(e) = &failure {
            error!("{req}: {e}");
            res.reset();
            res.prepare()?;
            res.set_header(Status::TEMPORARY_FAILURE.code(), "internal server error")?;
        }

        res.flush()?;
        send(conn, &res.header()?).await?;
        send(conn, res.body().await?).await?;
        flush(conn).await?;

        debug!("{req}: {}", res.status().map(|s| s.code()).unwrap_or_default());

        match failure {
            Some(e) => Err(ServerError::Handler(e)),
            None => Ok(()),
        }
    }
}

async fn send<C: Write>(conn: &mut C, data: &[u8]) -> Result<(), ServerError> {
    conn.write_all(data)
        .await
        .map_err(|e| ServerError::Network(e.kind()))
}

async fn flush<C: Write>(conn: &mut C) -> Result<(), ServerError> {
    conn.flush()
        .await
        .map_err(|e| ServerError::Network(e.kind()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestStream;

    enum Mode {
        Ok,
        Fail,
        Panic,
        Silent,
    }

    struct TestHandler {
        mode: Mode,
    }

    impl Handler for TestHandler {
        async fn handle(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError> {
            res.write_str("partial ")?;
            match self.mode {
                Mode::Ok => {
                    res.set_header(Status::SUCCESS.code(), "text/gemini")?;
                    res.write_str(&format!("=> {}", req.path()))?;
                    Ok(())
                }
                Mode::Fail => Err(HandlerError::Custom("no such capsule")),
                Mode::Panic => panic!("boom"),
                Mode::Silent => Ok(()),
            }
        }
    }

    fn server(mode: Mode) -> Server<TestHandler> {
        Server::new(TestHandler { mode })
    }

    #[tokio::test]
    async fn test_serve() {
        let server = server(Mode::Ok);
        let mut client = TestStream::new(b"gemini://example.org/foo\r\n").chunked(5);

        server.serve(&mut client).await.unwrap();
        assert_eq!(client.output(), b"20 text/gemini\r\npartial => /foo");
    }

    #[tokio::test]
    async fn test_bad_request() {
        let cases: &[&[u8]] = &[
            b"gemini://example.org/foo",
            b"gemini://exa\x01mple.org/\r\n",
            b"gemini://\xff/\r\n",
            b"gemini://example.org:99999/\r\n",
        ];

        for case in cases {
            let server = server(Mode::Ok);
            let mut client = TestStream::new(case);

            let res = server.serve(&mut client).await;
            assert!(matches!(res, Err(ServerError::Request(_))), "oops, served {case:?}");
            assert_eq!(client.output(), b"59 bad request\r\n");
        }
    }

    #[tokio::test]
    async fn test_request_too_long() {
        let server = server(Mode::Ok);
        let path = "a".repeat(crate::MAX_URL);
        let line = format!("gemini://example.org/{path}\r\n");
        let mut client = TestStream::new(line.as_bytes());

        let res = server.serve(&mut client).await;
        assert!(matches!(res, Err(ServerError::Request(_))));
        assert_eq!(client.output(), b"59 bad request\r\n");
    }

    #[tokio::test]
    async fn test_handler_failures() {
        for mode in [Mode::Fail, Mode::Panic, Mode::Silent] {
            let server = server(mode);
            let mut client = TestStream::new(b"gemini://example.org/\r\n");

            let res = server.serve(&mut client).await;
            assert!(matches!(res, Err(ServerError::Handler(_))));
            // nothing the handler wrote leaks out
            assert_eq!(client.output(), b"40 internal server error\r\n");
        }
    }

    #[tokio::test]
    async fn test_handler_errors_are_reported() {
        let mut client = TestStream::new(b"gemini://example.org/\r\n");
        let res = server(Mode::Fail).serve(&mut client).await;
        assert_eq!(
            res,
            Err(ServerError::Handler(HandlerError::Custom("no such capsule")))
        );

        let mut client = TestStream::new(b"gemini://example.org/\r\n");
        let res = server(Mode::Panic).serve(&mut client).await;
        assert_eq!(
            res,
            Err(ServerError::Handler(HandlerError::Panicked("boom".into())))
        );
    }

    #[tokio::test]
    async fn test_network_error() {
        let server = server(Mode::Ok);
        let mut client = TestStream::failing();

        let res = server.serve(&mut client).await;
        assert_eq!(res, Err(ServerError::Network(ErrorKind::ConnectionReset)));
        assert!(client.output().is_empty());
    }

    #[tokio::test]
    async fn test_responses_are_recycled() {
        let server = server(Mode::Ok);
        assert!(server.pool().is_empty());

        for path in ["/one", "/two"] {
            let line = format!("gemini://example.org{path}\r\n");
            let mut client = TestStream::new(line.as_bytes());
            server.serve(&mut client).await.unwrap();
            assert_eq!(
                client.output(),
                format!("20 text/gemini\r\npartial => {path}").as_bytes()
            );
            assert_eq!(server.pool().len(), 1);
        }

        // failures recycle too
        let server = self::server(Mode::Panic);
        let mut client = TestStream::new(b"gemini://example.org/\r\n");
        assert!(server.serve(&mut client).await.is_err());
        assert_eq!(server.pool().len(), 1);
    }

    #[tokio::test]
    async fn test_pool_capacity() {
        let server = server(Mode::Ok).with_pool_capacity(0);
        let mut client = TestStream::new(b"gemini://example.org/\r\n");
        server.serve(&mut client).await.unwrap();
        assert!(server.pool().is_empty());

        let pool = ResponsePool::new(2);
        let responses = [pool.acquire(), pool.acquire(), pool.acquire()];
        for res in responses {
            pool.release(res);
        }
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_released_responses_are_idle() {
        let pool = ResponsePool::new(1);
        let mut res = Response::new(20, "text/gemini").unwrap();
        res.write(b"body").unwrap();
        res.flush().unwrap();
        pool.release(res);

        let mut res = pool.acquire();
        assert_eq!(res.status(), None);
        assert_eq!(res.meta(), "");
        res.prepare().unwrap();
        res.set_header(20, "text/plain").unwrap();
        res.flush().unwrap();
        assert_eq!(res.body().await.unwrap(), b"");
    }
}
