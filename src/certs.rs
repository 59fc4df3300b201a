//! A tiny certificate authority for API server serving certificates.

use std::fs;
use std::io::{ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};

use crate::error::{Error, Result};

pub const CA_CERT_FILE: &str = "apiserver-ca.crt";
pub const SERVING_CERT_FILE: &str = "apiserver.crt";
pub const SERVING_KEY_FILE: &str = "apiserver.key";

/// Mode of every artifact written by [`ensure_serving_cert`].
pub const ARTIFACT_MODE: u32 = 0o640;

const ORGANIZATION: &str = "kube-testenv";

/// A PEM encoded certificate and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertPair {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for CertPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertPair")
            .field("cert", &String::from_utf8_lossy(&self.cert))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// A self-signed CA that lives only in memory.
pub struct TinyCa {
    ca: Certificate,
    cert_pem: String,
}

impl TinyCa {
    pub fn new() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = distinguished_name("kube-testenv-ca");
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];

        let ca = Certificate::from_params(params)?;
        let cert_pem = ca.serialize_pem()?;
        Ok(Self { ca, cert_pem })
    }

    /// The CA certificate, PEM encoded.
    pub fn cert_bytes(&self) -> &[u8] {
        self.cert_pem.as_bytes()
    }

    /// Issues a serving certificate valid for `localhost` and `127.0.0.1`.
    pub fn new_serving_cert(&self) -> Result<CertPair> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("localhost");
        params.subject_alt_names = vec![
            SanType::DnsName("localhost".to_string()),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = Certificate::from_params(params)?;
        Ok(CertPair {
            cert: cert.serialize_pem_with_signer(&self.ca)?.into_bytes(),
            key: cert.serialize_private_key_pem().into_bytes(),
        })
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Makes sure `dir` holds an API server serving certificate.
///
/// If `apiserver.crt` already exists it is trusted as is: nothing is
/// regenerated and the certificate and key found on disk are returned.
/// Otherwise a fresh CA and serving certificate are generated and
/// `apiserver-ca.crt`, `apiserver.crt` and `apiserver.key` are written.
/// A failed write leaves whatever was already written in place.
///
/// Any error other than "not found" while checking for the certificate is
/// returned unchanged.
pub fn ensure_serving_cert(dir: &Path) -> Result<CertPair> {
    let cert_path = dir.join(SERVING_CERT_FILE);
    let key_path = dir.join(SERVING_KEY_FILE);

    match fs::metadata(&cert_path) {
        Ok(_) => {
            log::debug!("reusing serving certificate in {}", dir.display());
            return Ok(CertPair {
                cert: fs::read(&cert_path).map_err(|err| Error::io(&cert_path, err))?,
                key: fs::read(&key_path).map_err(|err| Error::io(&key_path, err))?,
            });
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(Error::io(cert_path, err)),
    }

    let ca = TinyCa::new()?;
    let serving = ca.new_serving_cert()?;

    write_artifact(&dir.join(CA_CERT_FILE), ca.cert_bytes())?;
    write_artifact(&cert_path, &serving.cert)?;
    write_artifact(&key_path, &serving.key)?;

    log::debug!("wrote serving certificate to {}", dir.display());
    Ok(serving)
}

fn write_artifact(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(ARTIFACT_MODE);
    }

    options
        .open(path)
        .and_then(|mut file| file.write_all(contents))
        .map_err(|err| Error::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_all_artifacts_in_empty_dir() {
        let dir = tempfile::tempdir().unwrap();

        let pair = ensure_serving_cert(dir.path()).unwrap();

        for file in [CA_CERT_FILE, SERVING_CERT_FILE, SERVING_KEY_FILE] {
            assert!(dir.path().join(file).is_file(), "{file} missing");
        }
        assert_eq!(fs::read(dir.path().join(SERVING_CERT_FILE)).unwrap(), pair.cert);
        assert!(String::from_utf8_lossy(&pair.cert).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&pair.key).contains("PRIVATE KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn artifacts_are_not_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        ensure_serving_cert(dir.path()).unwrap();

        let mode = fs::metadata(dir.path().join(SERVING_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o007, 0);
    }

    #[test]
    fn existing_cert_skips_regeneration() {
        let dir = tempfile::tempdir().unwrap();

        let first = ensure_serving_cert(dir.path()).unwrap();
        let ca = fs::read(dir.path().join(CA_CERT_FILE)).unwrap();
        let second = ensure_serving_cert(dir.path()).unwrap();
        let third = ensure_serving_cert(dir.path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(fs::read(dir.path().join(CA_CERT_FILE)).unwrap(), ca);
    }

    #[test]
    fn existing_cert_without_key_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SERVING_CERT_FILE), b"stale").unwrap();

        let err = ensure_serving_cert(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err}");
    }

    #[test]
    fn stat_failure_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        fs::write(&not_a_dir, b"").unwrap();

        let err = ensure_serving_cert(&not_a_dir).unwrap_err();
        match err {
            Error::Io { path, source } => {
                assert_eq!(path, not_a_dir.join(SERVING_CERT_FILE));
                assert_ne!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn missing_dir_fails_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = ensure_serving_cert(&missing).unwrap_err();
        match err {
            Error::Io { path, .. } => assert_eq!(path, missing.join(CA_CERT_FILE)),
            other => panic!("unexpected error {other}"),
        }
    }
}
