//! # Gemlite
//!
//! `gemlite` is a small implementation of the [Gemini](https://geminiprotocol.net) protocol
//! over any byte stream implementing `embedded_io_async::{Read, Write}`.
//!
//! This crate provides:
//!
//! * encoding and decoding of gemini requests and responses on the "wire" respectively.
//! * a pool of self-signed server certificates kept in a directory and renewed on expiry.
//! * a "trust on first use" known hosts store for clients.
//! * a minimal server routine and client routine tying the above together.
//!
//! This crate does **not** provide:
//!
//! * TLS. Bring a TLS stream (e.g. `tokio-rustls` behind an adapter) and hand it to
//!   [`server::Server::serve`] or [`client::Client::send`]. Certificates from the
//!   [`cert_pool::CertPool`] convert to the `rustls-pki-types` types such a stream needs.
//! * any mechanism for routing requests, accepting connections, or timeouts.
//!
//! ## Basic Use
//!
//! Create a `server::Server` passing it a resource that implements the `server::Handler`
//! trait.  When a client connects, call `serve()` on the `Server` passing the stream.  A
//! single request is read, handed to the handler along with an empty `Response`, and the
//! response is written back.  Gemini closes the connection after every response.
//!
//! ## Example
//!
//! ```
//! # use tokio;
//! use gemlite::request::Request;
//! use gemlite::response::Response;
//! use gemlite::server::{Handler, HandlerError, Server};
//! use gemlite::status::Status;
//!
//! struct Capsule;
//!
//! impl Handler for Capsule {
//!     async fn handle(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError> {
//!         match req.path() {
//!             "/" => {
//!                 res.set_header(Status::SUCCESS.code(), "text/gemini")?;
//!                 res.write_str("# Welcome\n")?;
//!             }
//!             _ => res.set_header(Status::NOT_FOUND.code(), "not found")?,
//!         }
//!
//!         Ok(())
//!     }
//! }
//!
//! # struct Conn {
//! #     input: &'static [u8],
//! #     output: Vec<u8>,
//! # }
//! #
//! # impl embedded_io_async::ErrorType for Conn {
//! #     type Error = embedded_io_async::ErrorKind;
//! # }
//! #
//! # impl embedded_io_async::Read for Conn {
//! #     async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
//! #         let n = buf.len().min(self.input.len());
//! #         buf[..n].copy_from_slice(&self.input[..n]);
//! #         self.input = &self.input[n..];
//! #         Ok(n)
//! #     }
//! # }
//! #
//! # impl embedded_io_async::Write for Conn {
//! #     async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
//! #         self.output.extend_from_slice(buf);
//! #         Ok(buf.len())
//! #     }
//! # }
//! #
//! async fn run_server() {
//!     // Conn implements embedded_io_async::{Read, Write} (not shown)
//!     // this would typically be a TLS stream accepted from a TCP listener.
//!     let mut conn = Conn {
//!         input: b"gemini://example.org/\r\n",
//!         output: Vec::new(),
//!     };
//!
//!     let server = Server::new(Capsule);
//!     if server.serve(&mut conn).await.is_err() {
//!         // handle error
//!     }
//!
//!     assert_eq!(conn.output, b"20 text/gemini\r\n# Welcome\n");
//! }
//! #
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! #     run_server().await;
//! # })
//! ```

#![warn(missing_docs)]

mod ascii;
mod persist;
/// Self-signed server certificates
pub mod cert_pool;
/// Gemini client
pub mod client;
/// Trust on first use
pub mod known_hosts;
/// Gemini requests
pub mod request;
/// Gemini responses
pub mod response;
/// Gemini server
pub mod server;
/// Status codes
pub mod status;

#[cfg(test)]
mod testing;

/// Maximum length in bytes of the meta field of a response header.
pub const MAX_META: usize = 1024;

/// Maximum length in bytes of a request reference, `\r\n` excluded.
pub const MAX_URL: usize = 1024;

/// Port assumed when a request does not name one.
pub const DEFAULT_PORT: u16 = 1965;

/// Scheme of gemini references.
pub const SCHEME: &str = "gemini";
