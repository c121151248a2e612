//! In-memory connection used by the tests of every module.

use embedded_io_async::{ErrorKind, ErrorType, Read, Write};
use rustls_pki_types::CertificateDer;

use crate::client::PeerCertificates;

pub(crate) struct TestStream {
    input: Vec<u8>,
    offset: usize,
    chunk: usize,
    fail: bool,
    output: Vec<u8>,
    peer: Vec<CertificateDer<'static>>,
}

impl TestStream {
    pub(crate) fn new(input: &[u8]) -> Self {
        Self {
            input: input.to_vec(),
            offset: 0,
            chunk: usize::MAX,
            fail: false,
            output: Vec::new(),
            peer: Vec::new(),
        }
    }

    /// Every read fails with a reset connection.
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(b"")
        }
    }

    /// Reads return at most `chunk` bytes.
    pub(crate) fn chunked(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub(crate) fn with_peer(mut self, chain: Vec<CertificateDer<'static>>) -> Self {
        self.peer = chain;
        self
    }

    pub(crate) fn output(&self) -> &[u8] {
        &self.output
    }
}

impl ErrorType for TestStream {
    type Error = ErrorKind;
}

impl Read for TestStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.fail {
            return Err(ErrorKind::ConnectionReset);
        }

        let remaining = &self.input[self.offset..];
        let n = remaining.len().min(buf.len()).min(self.chunk);
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        Ok(n)
    }
}

impl Write for TestStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl PeerCertificates for TestStream {
    fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer
    }
}
