use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use crate::TlsError;

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";

const ROOT_COMMON_NAME: &str = "ProxyWoman Root CA";
const ROOT_ORGANIZATION: &str = "ProxyWoman CA";
const ROOT_VALID_DAYS: i64 = 365 * 10;

/// Long-lived signing root. Generated once per install and persisted in the
/// config directory; every minted leaf chains up to it.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateAuthority {
    /// Load the root from `<config_dir>/ca.crt` + `ca.key`, or mint and
    /// persist a fresh one on first run. Unparseable material is fatal.
    pub fn ensure_root(config_dir: impl AsRef<Path>) -> Result<Self, TlsError> {
        let config_dir = config_dir.as_ref();
        let cert_path = config_dir.join(CA_CERT_FILE);
        let key_path = config_dir.join(CA_KEY_FILE);

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => Self::load(cert_path, key_path),
            (false, false) => {
                fs::create_dir_all(config_dir)?;
                let authority = Self::generate(cert_path, key_path)?;
                authority.persist()?;
                tracing::info!(
                    cert = %authority.cert_path.display(),
                    "generated new root certificate authority"
                );
                Ok(authority)
            }
            _ => Err(TlsError::InvalidMaterial(
                "CA certificate and key files must both exist or both be absent".to_string(),
            )),
        }
    }

    fn generate(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, TlsError> {
        let key = generate_key_pair()?;
        let key_pem = key.serialize_pem();
        let params = root_params();
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        let issuer = Issuer::new(params, key);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            key_pem,
            cert_path,
            key_path,
        })
    }

    fn load(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, TlsError> {
        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            TlsError::InvalidMaterial(format!(
                "failed to parse CA certificate {}: {error}",
                cert_path.display()
            ))
        })?;
        let key = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
            TlsError::InvalidMaterial(format!(
                "failed to parse issuer metadata from {}: {error}",
                cert_path.display()
            ))
        })?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            key_pem,
            cert_path,
            key_path,
        })
    }

    fn persist(&self) -> Result<(), TlsError> {
        fs::write(&self.cert_path, self.cert_pem.as_bytes())?;
        fs::write(&self.key_path, self.key_pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.key_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn root_pem_path(&self) -> &Path {
        &self.cert_path
    }

    /// Whether the root material is present on disk. Trust-store installation
    /// is platform-specific and left to the embedder.
    pub fn root_installed(&self) -> bool {
        self.cert_path.exists()
    }
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    // Backdated a day so freshly minted material is valid on clients with
    // skewed clocks (virtual machines in particular).
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(24);
    params.not_after = now + Duration::days(ROOT_VALID_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;
    params
}

pub(crate) fn generate_key_pair() -> Result<KeyPair, rcgen::Error> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).or_else(|_| KeyPair::generate())
}
