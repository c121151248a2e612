use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64ct::{Base64Unpadded, Encoding};
use log::{debug, info, warn};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use time::OffsetDateTime;

use crate::client::CertVerifier;
use crate::persist::{create_private_dir, write_atomic};

/// Digest and encoding of [`fingerprint`].
pub const FINGERPRINT_ALGORITHM: &str = "sha512/base64-nopad";

/// Fingerprint of a DER encoded certificate: SHA-512 of the raw bytes, standard base64
/// without padding.
pub fn fingerprint(der: &[u8]) -> String {
    Base64Unpadded::encode_string(&Sha512::digest(der))
}

/// Errors returned by [`KnownHosts`] operations.
///
/// [`VerifyError::is_trust_failure`] separates peers that must not be trusted from stores
/// that could not do their job.
#[derive(Debug)]
pub enum VerifyError {
    /// The peer presented no certificate
    EmptyChain,
    /// The pinned fingerprint of a host is still valid and differs from the presented one
    Mismatch {
        /// Host being verified
        host: String,
        /// Pinned fingerprint
        known: String,
        /// Fingerprint of the presented leaf certificate
        found: String,
    },
    /// The leaf certificate could not be parsed
    Certificate(String),
    /// A custom verifier refused the peer
    Rejected(String),
    /// Reading or writing the store failed
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// The store could not be encoded or decoded
    Serialize(serde_json::Error),
    /// A thread panicked while holding the lock of the store
    LockPoisoned,
}

impl VerifyError {
    /// Returns `true` when the peer must not be trusted, `false` when the store itself failed.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::EmptyChain | Self::Mismatch { .. } | Self::Certificate(_) | Self::Rejected(_)
        )
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyChain => f.write_str("no certificate presented"),
            Self::Mismatch { host, known, found } => write!(
                f,
                "{host}: non-expired known fingerprint ({known}) does not match the one found ({found})"
            ),
            Self::Certificate(reason) => write!(f, "invalid certificate: {reason}"),
            Self::Rejected(reason) => write!(f, "certificate rejected: {reason}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Serialize(e) => write!(f, "known hosts encoding: {e}"),
            Self::LockPoisoned => f.write_str("known hosts lock poisoned"),
        }
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for VerifyError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialize(value)
    }
}

/// Pinned identity of a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHost {
    /// End of the pin, `None` for a pin that never expires
    #[serde(
        rename = "Expiry",
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub expiry: Option<OffsetDateTime>,
    /// [`fingerprint`] of the pinned leaf certificate
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,
}

impl KnownHost {
    /// Returns `true` when the pin no longer applies at `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }
}

/// KnownHosts is a "trust on first use" store, persisted as a JSON file.
///
/// The first certificate seen for a host is pinned until it expires. Until then, any other
/// certificate for that host is refused. Once the pin expires, whatever the host presents is
/// pinned again.
#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    hosts: Mutex<BTreeMap<String, KnownHost>>,
}

impl KnownHosts {
    /// Open the store at `path`, creating its directory if needed.
    ///
    /// A missing file is an empty store. So is an unreadable or corrupt one, the problem is
    /// logged and the file is overwritten by the next pin.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VerifyError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_private_dir(parent).map_err(|e| VerifyError::io(parent, e))?;
        }

        let hosts = read_hosts(&path).unwrap_or_else(|e| {
            warn!("ignoring known hosts file: {e}");
            BTreeMap::new()
        });
        debug!("{} known hosts in {}", hosts.len(), path.display());

        Ok(Self {
            path,
            hosts: Mutex::new(hosts),
        })
    }

    /// Location of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory records with the content of the file.
    pub fn load(&self) -> Result<(), VerifyError> {
        let loaded = read_hosts(&self.path)?;
        *self.hosts.lock().map_err(|_| VerifyError::LockPoisoned)? = loaded;
        Ok(())
    }

    /// Write every record to the file.
    pub fn save(&self) -> Result<(), VerifyError> {
        let hosts = self.hosts.lock().map_err(|_| VerifyError::LockPoisoned)?;
        self.persist(&hosts)
    }

    /// The record for `host`, if any.
    pub fn get(&self, host: &str) -> Result<Option<KnownHost>, VerifyError> {
        let hosts = self.hosts.lock().map_err(|_| VerifyError::LockPoisoned)?;
        Ok(hosts.get(host).cloned())
    }

    /// Check the certificate chain presented by `host`. Only the leaf, `chain[0]`, is
    /// considered.
    ///
    /// A host that is unknown, or whose pin expired, gets the leaf pinned until the leaf's own
    /// expiry and the store is saved. A host with a valid pin must present the pinned
    /// certificate.
    pub fn verify(&self, host: &str, chain: &[CertificateDer<'_>]) -> Result<(), VerifyError> {
        let leaf = chain.first().ok_or(VerifyError::EmptyChain)?;
        let found = fingerprint(leaf);
        let now = OffsetDateTime::now_utc();

        let mut hosts = self.hosts.lock().map_err(|_| VerifyError::LockPoisoned)?;
        match hosts.get(host) {
            Some(known) if !known.is_expired_at(now) => {
                if known.fingerprint == found {
                    return Ok(());
                }
                return Err(VerifyError::Mismatch {
                    host: host.to_owned(),
                    known: known.fingerprint.clone(),
                    found,
                });
            }
            Some(known) if known.fingerprint != found => {
                warn!("pin of {host} expired, trusting its new certificate {found}")
            }
            Some(_) => debug!("pin of {host} expired, renewing it"),
            None => info!("trusting {host} on first use: {found}"),
        }

        let (_, cert) = x509_parser::parse_x509_certificate(leaf)
            .map_err(|e| VerifyError::Certificate(e.to_string()))?;
        let expiry = cert.validity().not_after.to_datetime();

        let previous = hosts.insert(
            host.to_owned(),
            KnownHost {
                expiry: Some(expiry),
                fingerprint: found,
            },
        );

        // a pin only counts once it is on disk
        if let Err(e) = self.persist(&hosts) {
            match previous {
                Some(previous) => hosts.insert(host.to_owned(), previous),
                None => hosts.remove(host),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, hosts: &BTreeMap<String, KnownHost>) -> Result<(), VerifyError> {
        let data = serde_json::to_vec_pretty(hosts)?;
        write_atomic(&self.path, &data).map_err(|e| VerifyError::io(&self.path, e))
    }
}

impl CertVerifier for KnownHosts {
    fn verify_cert(&self, host: &str, chain: &[CertificateDer<'_>]) -> Result<(), VerifyError> {
        self.verify(host, chain)
    }
}

fn read_hosts(path: &Path) -> Result<BTreeMap<String, KnownHost>, VerifyError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(VerifyError::io(path, e)),
    };

    let mut hosts: BTreeMap<String, KnownHost> = serde_json::from_slice(&data)?;
    for known in hosts.values_mut() {
        // 0001-01-01T00:00:00Z is the zero time of other tools, meaning "no expiry"
        if known.expiry.is_some_and(|expiry| expiry.year() <= 1) {
            known.expiry = None;
        }
    }
    Ok(hosts)
}
