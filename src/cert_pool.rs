use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use x509_parser::pem::parse_x509_pem;

use crate::persist::{create_private_dir, write_atomic};

/// Validity window of generated certificates unless [`CertPool::with_validity`] says otherwise.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60 * 24 * 60 * 60);

const KEY_EXTENSION: &str = "key";
const CERT_EXTENSION: &str = "pem";

/// Errors returned by [`CertPool`] operations.
#[derive(Debug)]
pub enum PoolError {
    /// The name is not a single file name component
    InvalidName(String),
    /// Reading or writing a file of the pool failed
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// Key or certificate generation failed
    Generate(rcgen::Error),
    /// A stored key or certificate could not be parsed
    Parse {
        /// Offending file
        path: PathBuf,
        /// What the parser reported
        reason: String,
    },
    /// The stored key does not belong to the stored certificate
    KeyMismatch(PathBuf),
    /// The validity window does not fit in a certificate
    InvalidValidity(Duration),
    /// A thread panicked while holding a lock of the pool
    LockPoisoned,
}

impl PoolError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid certificate name {name:?}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Generate(e) => write!(f, "certificate generation failed: {e}"),
            Self::Parse { path, reason } => write!(f, "{}: {reason}", path.display()),
            Self::KeyMismatch(path) => {
                write!(f, "{}: key does not match the certificate", path.display())
            }
            Self::InvalidValidity(validity) => {
                write!(f, "validity of {validity:?} is out of range")
            }
            Self::LockPoisoned => f.write_str("certificate pool lock poisoned"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Generate(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rcgen::Error> for PoolError {
    fn from(value: rcgen::Error) -> Self {
        Self::Generate(value)
    }
}

/// A certificate of the pool and its private key.
pub struct Certificate {
    name: String,
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    not_after: OffsetDateTime,
}

impl Certificate {
    /// Parse a PEM certificate and its PEM PKCS#8 key, checking that they belong together.
    fn from_pem(
        name: &str,
        cert_pem: String,
        key_pem: String,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, PoolError> {
        let (_, pem) =
            parse_x509_pem(cert_pem.as_bytes()).map_err(|e| PoolError::parse(cert_path, e))?;
        let x509 = pem.parse_x509().map_err(|e| PoolError::parse(cert_path, e))?;
        let key = KeyPair::from_pem(&key_pem).map_err(|e| PoolError::parse(key_path, e))?;

        if key.public_key_raw() != x509.public_key().subject_public_key.data.as_ref() {
            return Err(PoolError::KeyMismatch(key_path.to_path_buf()));
        }
        let not_after = x509.validity().not_after.to_datetime();

        Ok(Self {
            name: name.to_owned(),
            cert_der: pem.contents,
            key_der: key.serialize_der(),
            cert_pem,
            key_pem,
            not_after,
        })
    }

    /// Name the certificate was requested under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DER encoded certificate, ready for a TLS certificate chain.
    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    /// DER encoded PKCS#8 private key, ready for a TLS server configuration.
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    /// PEM encoded certificate, as stored on disk
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM encoded private key, as stored on disk
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Returns `true` when the certificate is no longer valid at `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("name", &self.name)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

type Slot = Arc<Mutex<Option<Arc<Certificate>>>>;

/// CertPool keeps self-signed certificates, one per host name, in a directory.
///
/// Each certificate is stored as `<name>.pem` next to its key `<name>.key`. Certificates are
/// loaded lazily, cached, and regenerated when missing, unreadable or expired. The pool can be
/// shared between tasks behind an `Arc`: loading or generating a name only locks that name.
pub struct CertPool {
    dir: PathBuf,
    validity: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl CertPool {
    /// Open the pool stored in `dir`, creating the directory if needed.
    ///
    /// Existing pairs are indexed but not read until they are needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PoolError> {
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir).map_err(|e| PoolError::io(&dir, e))?;

        let mut slots = HashMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| PoolError::io(&dir, e))? {
            let path = entry.map_err(|e| PoolError::io(&dir, e))?.path();
            if path.extension() != Some(OsStr::new(CERT_EXTENSION)) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            if check_name(name).is_ok() && path.with_extension(KEY_EXTENSION).is_file() {
                slots.insert(name.to_owned(), Slot::default());
            }
        }

        debug!("opened certificate pool {} with {} entries", dir.display(), slots.len());

        Ok(Self {
            dir,
            validity: DEFAULT_VALIDITY,
            slots: Mutex::new(slots),
        })
    }

    /// Use `validity` for certificates generated from now on.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Directory of the pool
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names known to the pool, sorted.
    pub fn names(&self) -> Result<Vec<String>, PoolError> {
        let slots = self.slots.lock().map_err(|_| PoolError::LockPoisoned)?;
        let mut names: Vec<String> = slots.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Read every indexed pair from disk into the cache and return how many were loaded.
    ///
    /// Pairs that cannot be loaded are logged and skipped, [`CertPool::get`] regenerates them
    /// when they are asked for.
    pub fn load_all(&self) -> Result<usize, PoolError> {
        let mut loaded = 0;
        for name in self.names()? {
            let slot = self.slot(&name)?;
            let mut cached = slot.lock().map_err(|_| PoolError::LockPoisoned)?;
            match self.load(&name) {
                Ok(cert) => {
                    *cached = Some(Arc::new(cert));
                    loaded += 1;
                }
                Err(e) => warn!("skipping certificate {name}: {e}"),
            }
        }
        Ok(loaded)
    }

    /// The certificate for `name`, generating it if there is no valid one.
    pub fn get(&self, name: &str) -> Result<Arc<Certificate>, PoolError> {
        check_name(name)?;
        let slot = self.slot(name)?;
        let mut cached = slot.lock().map_err(|_| PoolError::LockPoisoned)?;

        let now = OffsetDateTime::now_utc();
        if let Some(cert) = cached.as_ref()
            && !cert.is_expired_at(now)
        {
            return Ok(Arc::clone(cert));
        }

        match self.load(name) {
            Ok(cert) if !cert.is_expired_at(now) => {
                debug!("loaded certificate {name} from {}", self.dir.display());
                let cert = Arc::new(cert);
                *cached = Some(Arc::clone(&cert));
                return Ok(cert);
            }
            Ok(cert) => info!("certificate {name} expired on {}, renewing", cert.not_after),
            Err(PoolError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!("no certificate for {name} yet")
            }
            Err(e) => warn!("discarding certificate {name}: {e}"),
        }

        // a fresh certificate is handed out as is, even with a zero validity window
        let cert = Arc::new(self.create(name)?);
        *cached = Some(Arc::clone(&cert));
        Ok(cert)
    }

    /// Replace the certificate for `name` with a newly generated one.
    pub fn generate(&self, name: &str) -> Result<Arc<Certificate>, PoolError> {
        check_name(name)?;
        let slot = self.slot(name)?;
        let mut cached = slot.lock().map_err(|_| PoolError::LockPoisoned)?;

        let cert = Arc::new(self.create(name)?);
        *cached = Some(Arc::clone(&cert));
        Ok(cert)
    }

    fn slot(&self, name: &str) -> Result<Slot, PoolError> {
        let mut slots = self.slots.lock().map_err(|_| PoolError::LockPoisoned)?;
        Ok(Arc::clone(slots.entry(name.to_owned()).or_default()))
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{name}.{CERT_EXTENSION}")),
            self.dir.join(format!("{name}.{KEY_EXTENSION}")),
        )
    }

    fn load(&self, name: &str) -> Result<Certificate, PoolError> {
        let (cert_path, key_path) = self.paths(name);
        let cert_pem =
            fs::read_to_string(&cert_path).map_err(|e| PoolError::io(&cert_path, e))?;
        let key_pem = fs::read_to_string(&key_path).map_err(|e| PoolError::io(&key_path, e))?;

        Certificate::from_pem(name, cert_pem, key_pem, &cert_path, &key_path)
    }

    fn create(&self, name: &str) -> Result<Certificate, PoolError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;

        let now = OffsetDateTime::now_utc();
        let not_after = time::Duration::try_from(self.validity)
            .ok()
            .and_then(|validity| now.checked_add(validity))
            .ok_or(PoolError::InvalidValidity(self.validity))?;

        // an ip address becomes an ip SAN, anything else a dns SAN
        let mut params = CertificateParams::new(vec![name.to_owned()])?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;
        params.serial_number = Some(random_serial());
        params.not_before = now;
        params.not_after = not_after;

        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();

        let (cert_path, key_path) = self.paths(name);
        write_atomic(&key_path, key_pem.as_bytes()).map_err(|e| PoolError::io(&key_path, e))?;
        write_atomic(&cert_path, cert_pem.as_bytes())
            .map_err(|e| PoolError::io(&cert_path, e))?;

        info!("generated certificate {name}, valid until {not_after}");

        Certificate::from_pem(name, cert_pem, key_pem, &cert_path, &key_path)
    }
}

/// 128 random bits, top bit cleared so the DER integer stays positive.
fn random_serial() -> SerialNumber {
    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7f;
    SerialNumber::from_slice(&serial)
}

fn check_name(name: &str) -> Result<(), PoolError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);

    if valid {
        Ok(())
    } else {
        Err(PoolError::InvalidName(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    use super::*;

    fn pool() -> (tempfile::TempDir, CertPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = CertPool::open(dir.path().join("certs")).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_get_generates_and_persists() {
        let (_dir, pool) = pool();
        let cert = pool.get("localhost").unwrap();

        assert_eq!(cert.name(), "localhost");
        assert!(pool.dir().join("localhost.pem").is_file());
        assert!(pool.dir().join("localhost.key").is_file());
        assert_eq!(
            fs::read_to_string(pool.dir().join("localhost.pem")).unwrap(),
            cert.cert_pem()
        );
        assert_eq!(pool.names().unwrap(), vec!["localhost".to_string()]);

        let remaining = cert.not_after() - OffsetDateTime::now_utc();
        assert!(remaining > time::Duration::days(59));
        assert!(remaining <= time::Duration::days(60));

        let der = cert.cert_der();
        let (_, x509) = parse_x509_certificate(&der).unwrap();
        assert!(!x509.is_ca());
        let cn = x509.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "localhost");
        let san = x509.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names, vec![GeneralName::DNSName("localhost")]);
        assert!(x509.raw_serial()[0] & 0x80 == 0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for file in ["localhost.pem", "localhost.key"] {
                let mode = fs::metadata(pool.dir().join(file))
                    .unwrap()
                    .permissions()
                    .mode();
                assert_eq!(mode & 0o777, 0o600);
            }
        }
    }

    #[test]
    fn test_ip_address_san() {
        let (_dir, pool) = pool();
        let cert = pool.get("127.0.0.1").unwrap();

        let der = cert.cert_der();
        let (_, x509) = parse_x509_certificate(&der).unwrap();
        let san = x509.subject_alternative_name().unwrap().unwrap();
        assert_eq!(
            san.value.general_names,
            vec![GeneralName::IPAddress(&[127, 0, 0, 1])]
        );
    }

    #[test]
    fn test_get_is_idempotent() {
        let (dir, pool) = pool();
        let first = pool.get("example.org").unwrap();
        let second = pool.get("example.org").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // a new pool over the same directory reads the stored pair back
        let reopened = CertPool::open(dir.path().join("certs")).unwrap();
        assert_eq!(reopened.names().unwrap(), vec!["example.org".to_string()]);
        let third = reopened.get("example.org").unwrap();
        assert_eq!(third.cert_der(), first.cert_der());
        assert_eq!(third.key_pem(), first.key_pem());
    }

    #[test]
    fn test_expired_certificate_is_renewed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CertPool::open(dir.path())
            .unwrap()
            .with_validity(Duration::from_secs(1));

        let first = pool.get("short.example").unwrap();
        thread::sleep(Duration::from_millis(2100));
        let second = pool.get("short.example").unwrap();

        assert_ne!(first.cert_der(), second.cert_der());
        assert!(second.not_after() > first.not_after());
        assert_eq!(
            fs::read_to_string(dir.path().join("short.example.pem")).unwrap(),
            second.cert_pem()
        );
    }

    #[test]
    fn test_zero_validity_does_not_loop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CertPool::open(dir.path())
            .unwrap()
            .with_validity(Duration::ZERO);

        let cert = pool.get("zero.example").unwrap();
        assert!(cert.is_expired_at(OffsetDateTime::now_utc()));
    }

    #[test]
    fn test_generate_replaces() {
        let (_dir, pool) = pool();
        let first = pool.get("example.org").unwrap();
        let second = pool.generate("example.org").unwrap();
        assert_ne!(first.cert_der(), second.cert_der());

        let third = pool.get("example.org").unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn test_invalid_names() {
        let (_dir, pool) = pool();
        for name in ["", ".", "..", "a/b", "../escape", "a\\b", "nul\0"] {
            assert!(
                matches!(pool.get(name), Err(PoolError::InvalidName(_))),
                "oops, accepted {name:?}"
            );
        }
        assert!(pool.names().unwrap().is_empty());
    }

    #[test]
    fn test_mismatched_pair_is_regenerated() {
        let (_dir, pool) = pool();
        let a = pool.get("a.example").unwrap();
        pool.get("b.example").unwrap();
        fs::copy(pool.dir().join("b.example.key"), pool.dir().join("a.example.key")).unwrap();

        let reopened = CertPool::open(pool.dir()).unwrap();
        assert!(matches!(
            reopened.load("a.example"),
            Err(PoolError::KeyMismatch(_))
        ));

        let renewed = reopened.get("a.example").unwrap();
        assert_ne!(renewed.cert_der(), a.cert_der());
        // and the new pair on disk is consistent again
        assert!(reopened.load("a.example").is_ok());
    }

    #[test]
    fn test_corrupt_certificate_is_regenerated() {
        let (_dir, pool) = pool();
        fs::write(pool.dir().join("broken.pem"), "not a certificate").unwrap();
        fs::write(pool.dir().join("broken.key"), "not a key").unwrap();

        let reopened = CertPool::open(pool.dir()).unwrap();
        assert_eq!(reopened.names().unwrap(), vec!["broken".to_string()]);
        assert_eq!(reopened.load_all().unwrap(), 0);

        let cert = reopened.get("broken").unwrap();
        assert!(cert.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_open_ignores_unpaired_files() {
        let (_dir, pool) = pool();
        pool.get("paired").unwrap();
        fs::write(pool.dir().join("lonely.pem"), "").unwrap();
        fs::write(pool.dir().join("notes.txt"), "").unwrap();

        let reopened = CertPool::open(pool.dir()).unwrap();
        assert_eq!(reopened.names().unwrap(), vec!["paired".to_string()]);
        assert_eq!(reopened.load_all().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_get() {
        let (_dir, pool) = pool();
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.get("shared.example").unwrap().cert_der())
            })
            .collect();

        let ders: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ders.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_key_der_matches_pem() {
        let (_dir, pool) = pool();
        let cert = pool.get("keys.example").unwrap();
        let key = KeyPair::from_pem(cert.key_pem()).unwrap();

        match cert.key_der() {
            PrivateKeyDer::Pkcs8(der) => assert_eq!(der.secret_pkcs8_der(), key.serialize_der()),
            _ => panic!("expected a pkcs8 key"),
        }
    }
}
