//! The leaf certificate authority: given a hostname (usually from SNI),
//! synthesize a key and certificate signed by the operator's CA so the
//! proxy can impersonate that host. Results are cached on disk under
//! `<root>/<hostname>/` and reused across runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509, X509NameBuilder, X509Req};

use crate::Error;

const KEY_BITS: u32 = 4096;
const DAYS_VALID: u32 = 90;

/// File paths of one cached leaf.
#[derive(Debug, Clone)]
pub struct LeafPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub conf: PathBuf,
    pub req: PathBuf,
}

pub struct LeafAuthority {
    ca_cert_path: PathBuf,
    ca_key_path: PathBuf,
    default_hostname: String,
    root: PathBuf,
    key_bits: u32,
    // Serializes generation so concurrent handshakes for one hostname
    // don't clobber each other's files.
    lock: Mutex<()>,
}

impl LeafAuthority {
    pub fn new(
        ca_cert_path: impl Into<PathBuf>,
        ca_key_path: impl Into<PathBuf>,
        default_hostname: &str,
        root: impl Into<PathBuf>,
    ) -> LeafAuthority {
        LeafAuthority {
            ca_cert_path: ca_cert_path.into(),
            ca_key_path: ca_key_path.into(),
            default_hostname: default_hostname.to_string(),
            root: root.into(),
            key_bits: KEY_BITS,
            lock: Mutex::new(()),
        }
    }

    /// Use smaller (faster to generate) keys. Intended for tests.
    pub fn with_key_bits(mut self, bits: u32) -> LeafAuthority {
        self.key_bits = bits;
        self
    }

    /// Return the cached or freshly generated leaf for `hostname`.
    /// Idempotent: a second call for the same hostname returns the same
    /// files untouched, as long as they still form a valid pair.
    pub fn leaf_for(&self, hostname: Option<&str>) -> Result<LeafPaths, Error> {
        let hostname = match hostname {
            Some(h) if !h.is_empty() => h,
            _ => self.default_hostname.as_str(),
        };
        // SNI values land on the filesystem as directory names; rustls has
        // already validated DNS syntax, this is a backstop.
        if hostname.contains(['/', '\\']) || hostname.contains("..") {
            return Err(Error::Config(format!(
                "refusing to build a certificate path from hostname {hostname:?}"
            )));
        }

        let dir = self.root.join(hostname);
        let paths = LeafPaths {
            cert: dir.join(format!("{hostname}.cert")),
            key: dir.join(format!("{hostname}.key")),
            conf: dir.join(format!("{hostname}.conf")),
            req: dir.join(format!("{hostname}.req")),
        };

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if paths.cert.is_file() && paths.key.is_file() && self.pair_verifies(&paths)? {
            tracing::debug!(hostname, "reusing cached leaf certificate");
            return Ok(paths);
        }

        tracing::info!(hostname, "generating leaf certificate");
        fs::create_dir_all(&dir)?;
        self.generate(hostname, &paths)?;
        Ok(paths)
    }

    fn load_ca(&self) -> Result<(X509, PKey<Private>), Error> {
        let ca_cert = X509::from_pem(&fs::read(&self.ca_cert_path)?)?;
        let ca_key = PKey::private_key_from_pem(&fs::read(&self.ca_key_path)?)?;
        Ok((ca_cert, ca_key))
    }

    // True when the cached cert and key are a matched pair signed by the
    // configured CA. Anything else gets regenerated in place.
    fn pair_verifies(&self, paths: &LeafPaths) -> Result<bool, Error> {
        let (ca_cert, _) = self.load_ca()?;
        let cert = match X509::from_pem(&fs::read(&paths.cert)?) {
            Ok(cert) => cert,
            Err(_) => return Ok(false),
        };
        let key = match PKey::private_key_from_pem(&fs::read(&paths.key)?) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };
        let ca_pub = ca_cert.public_key()?;
        Ok(cert.public_key()?.public_eq(&key) && cert.verify(&ca_pub)?)
    }

    fn generate(&self, hostname: &str, paths: &LeafPaths) -> Result<(), Error> {
        let (ca_cert, ca_key) = self.load_ca()?;

        fs::write(&paths.conf, openssl_conf(hostname))?;

        let key = PKey::from_rsa(Rsa::generate(self.key_bits)?)?;
        fs::write(&paths.key, key.private_key_to_pem_pkcs8()?)?;

        // The signing request is persisted for the operator's benefit; the
        // cert below is built directly from the same key and name.
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", hostname)?;
        let name = name.build();

        let mut req = X509Req::builder()?;
        req.set_subject_name(&name)?;
        req.set_pubkey(&key)?;
        req.sign(&key, MessageDigest::sha256())?;
        fs::write(&paths.req, req.build().to_pem()?)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(ca_cert.subject_name())?;
        builder.set_pubkey(&key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(DAYS_VALID)?;
        builder.set_not_after(&not_after)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .non_repudiation()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        let san = SubjectAlternativeName::new()
            .dns(hostname)
            .dns(&format!("*.{hostname}"))
            .build(&builder.x509v3_context(Some(&ca_cert), None))?;
        builder.append_extension(san)?;

        builder.sign(&ca_key, MessageDigest::sha256())?;
        fs::write(&paths.cert, builder.build().to_pem()?)?;
        Ok(())
    }
}

impl std::fmt::Debug for LeafAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafAuthority")
            .field("root", &self.root)
            .field("default_hostname", &self.default_hostname)
            .finish_non_exhaustive()
    }
}

// The config the original openssl pipeline consumed; kept alongside the
// other artifacts so an operator can re-run signing by hand.
fn openssl_conf(hostname: &str) -> String {
    format!(
        "prompt = no\r\n\
         distinguished_name = req_distinguished_name\r\n\
         req_extensions = v3_req\r\n\
         \r\n\
         [ req_distinguished_name ]\r\n\
         CN = {hostname}\r\n\
         \r\n\
         [ v3_req ]\r\n\
         basicConstraints = CA:FALSE\r\n\
         keyUsage = nonRepudiation, digitalSignature, keyEncipherment\r\n\
         subjectAltName = @alt_names\r\n\
         \r\n\
         [ alt_names ]\r\n\
         DNS.1 = {hostname}\r\n\
         DNS.2 = *.{hostname}\r\n"
    )
}

/// Generate a self-signed CA pair for tests and first-run setups.
pub fn generate_test_ca(cert_path: &Path, key_path: &Path) -> Result<(), Error> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", "redline test CA")?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(DAYS_VALID)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.sign(&key, MessageDigest::sha256())?;

    fs::write(cert_path, builder.build().to_pem()?)?;
    fs::write(key_path, key.private_key_to_pem_pkcs8()?)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_authority(dir: &Path) -> LeafAuthority {
        let ca_cert = dir.join("ca.pem");
        let ca_key = dir.join("ca.key");
        generate_test_ca(&ca_cert, &ca_key).unwrap();
        LeafAuthority::new(ca_cert, ca_key, "example.com", dir.join("certs")).with_key_bits(2048)
    }

    #[test]
    fn leaf_generation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let authority = test_authority(dir.path());

        let first = authority.leaf_for(Some("example.test")).unwrap();
        let cert_bytes = fs::read(&first.cert).unwrap();
        let key_bytes = fs::read(&first.key).unwrap();
        for p in [&first.cert, &first.key, &first.conf, &first.req] {
            assert!(p.is_file(), "{p:?} missing");
        }

        let second = authority.leaf_for(Some("example.test")).unwrap();
        assert_eq!(fs::read(&second.cert).unwrap(), cert_bytes);
        assert_eq!(fs::read(&second.key).unwrap(), key_bytes);
    }

    #[test]
    fn leaf_names_and_signature() {
        let dir = tempfile::tempdir().unwrap();
        let authority = test_authority(dir.path());

        let paths = authority.leaf_for(Some("example.test")).unwrap();
        let cert = X509::from_pem(&fs::read(&paths.cert).unwrap()).unwrap();

        let cn = cert
            .subject_name()
            .entries()
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "example.test");

        let sans: Vec<String> = cert
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(sans, vec!["example.test", "*.example.test"]);

        let ca_cert = X509::from_pem(&fs::read(dir.path().join("ca.pem")).unwrap()).unwrap();
        assert!(cert.verify(&ca_cert.public_key().unwrap()).unwrap());
    }

    #[test]
    fn empty_hostname_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let authority = test_authority(dir.path());

        let paths = authority.leaf_for(None).unwrap();
        assert!(paths.cert.ends_with("example.com/example.com.cert"));
        let paths = authority.leaf_for(Some("")).unwrap();
        assert!(paths.cert.ends_with("example.com/example.com.cert"));
    }

    #[test]
    fn corrupted_pair_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let authority = test_authority(dir.path());

        let paths = authority.leaf_for(Some("example.test")).unwrap();
        fs::write(&paths.key, "not a key").unwrap();

        let again = authority.leaf_for(Some("example.test")).unwrap();
        let cert = X509::from_pem(&fs::read(&again.cert).unwrap()).unwrap();
        let key = PKey::private_key_from_pem(&fs::read(&again.key).unwrap()).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));
    }

    #[test]
    fn hostile_hostnames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let authority = test_authority(dir.path());
        assert!(authority.leaf_for(Some("../../etc")).is_err());
        assert!(authority.leaf_for(Some("a/b")).is_err());
    }
}
