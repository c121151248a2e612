use core::fmt;
use std::sync::Arc;

use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use log::debug;
use rustls_pki_types::CertificateDer;

use crate::known_hosts::VerifyError;
use crate::request::{Request, RequestError};
use crate::response::{Response, ResponseError};

/// Decides whether the certificate chain presented by a host is trusted.
///
/// [`KnownHosts`](crate::known_hosts::KnownHosts) implements it, and so does any closure
/// with the same signature.
pub trait CertVerifier {
    /// Returns `Ok(())` when `chain`, leaf first, may be trusted for `host`.
    fn verify_cert(&self, host: &str, chain: &[CertificateDer<'_>]) -> Result<(), VerifyError>;
}

impl<F> CertVerifier for F
where
    F: Fn(&str, &[CertificateDer<'_>]) -> Result<(), VerifyError>,
{
    fn verify_cert(&self, host: &str, chain: &[CertificateDer<'_>]) -> Result<(), VerifyError> {
        self(host, chain)
    }
}

/// Transports that know the certificates presented by the peer, typically a TLS stream after
/// its handshake.
pub trait PeerCertificates {
    /// Certificate chain of the peer, leaf first. Empty when the peer presented none.
    fn peer_certificates(&self) -> &[CertificateDer<'static>];
}

impl<T: PeerCertificates + ?Sized> PeerCertificates for &mut T {
    fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        T::peer_certificates(self)
    }
}

/// Errors returned by [`Client`].
#[derive(Debug)]
pub enum ClientError {
    /// The request cannot be sent
    Request(RequestError),
    /// The server is not trusted, or its trust could not be recorded
    Verify(VerifyError),
    /// The response header is invalid
    Response(ResponseError),
    /// The connection failed
    Network(ErrorKind),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => e.fmt(f),
            Self::Verify(e) => e.fmt(f),
            Self::Response(e) => e.fmt(f),
            Self::Network(kind) => write!(f, "network error while sending request: {kind:?}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(e) => Some(e),
            Self::Verify(e) => Some(e),
            Self::Response(e) => Some(e),
            Self::Network(_) => None,
        }
    }
}

impl From<RequestError> for ClientError {
    fn from(value: RequestError) -> Self {
        match value {
            RequestError::Network(kind) => Self::Network(kind),
            e => Self::Request(e),
        }
    }
}

impl From<VerifyError> for ClientError {
    fn from(value: VerifyError) -> Self {
        Self::Verify(value)
    }
}

impl From<ResponseError> for ClientError {
    fn from(value: ResponseError) -> Self {
        match value {
            ResponseError::Network(kind) => Self::Network(kind),
            e => Self::Response(e),
        }
    }
}

/// Client sends one request per connection and hands back the response header, with the body
/// still in the connection.
///
/// Without a verifier every server is trusted; use [`Client::with_verifier`], usually with
/// a [`KnownHosts`](crate::known_hosts::KnownHosts) store.
#[derive(Clone, Default)]
pub struct Client {
    verifier: Option<Arc<dyn CertVerifier + Send + Sync>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

impl Client {
    /// A client trusting every server
    pub fn new() -> Self {
        Self::default()
    }

    /// Check servers with `verifier` before sending them anything.
    pub fn with_verifier(mut self, verifier: impl CertVerifier + Send + Sync + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Send `request` over `conn` and read the response header.
    ///
    /// The request is canonicalized first, a request without host or with a relative path is
    /// refused before anything is written. The certificates of the peer are checked against
    /// the host of the request. The returned response owns `conn` and reads its body from it.
    pub async fn send<C>(&self, mut conn: C, request: &Request) -> Result<Response<C>, ClientError>
    where
        C: Read + Write + PeerCertificates,
    {
        let mut request = request.clone();
        if !request.canonicalize() {
            return Err(ClientError::Request(RequestError::Malformed(format!(
                "{request} is not an absolute reference"
            ))));
        }

        if let Some(verifier) = &self.verifier {
            verifier.verify_cert(request.host(), conn.peer_certificates())?;
        }

        request.write_to(&mut conn).await?;
        conn.flush()
            .await
            .map_err(|e| ClientError::Network(e.kind()))?;

        let response = Response::from_source(conn).await?;
        debug!(
            "{request}: {} {}",
            response.status().map(|s| s.code()).unwrap_or_default(),
            response.meta()
        );

        Ok(response)
    }

    /// Parse `reference` then [send](Client::send) it.
    pub async fn fetch<C>(&self, conn: C, reference: &str) -> Result<Response<C>, ClientError>
    where
        C: Read + Write + PeerCertificates,
    {
        let request = Request::parse(reference)?;
        self.send(conn, &request).await
    }
}
