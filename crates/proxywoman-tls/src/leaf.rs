use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
    SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::authority::{generate_key_pair, CertificateAuthority};
use crate::TlsError;

const LEAF_VALID_DAYS: i64 = 365;

/// A per-host server certificate minted on demand, ready to terminate TLS.
pub struct MintedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_names: Vec<IpAddr>,
}

struct CacheState {
    authority: CertificateAuthority,
    leaves: HashMap<String, Arc<MintedLeaf>>,
}

/// Host-keyed leaf cache. Leaves live for the process lifetime and are never
/// evicted; the signing root and the table share one lock so at most one
/// mint per host is ever in flight.
pub struct LeafCache {
    state: Mutex<CacheState>,
    root_cert_der: CertificateDer<'static>,
    root_cert_pem: String,
    root_pem_path: PathBuf,
    minted: AtomicU64,
}

impl LeafCache {
    pub fn new(authority: CertificateAuthority) -> Self {
        Self {
            root_cert_der: authority.cert_der().clone(),
            root_cert_pem: authority.cert_pem().to_string(),
            root_pem_path: authority.root_pem_path().to_path_buf(),
            state: Mutex::new(CacheState {
                authority,
                leaves: HashMap::new(),
            }),
            minted: AtomicU64::new(0),
        }
    }

    pub fn root_cert_der(&self) -> &CertificateDer<'static> {
        &self.root_cert_der
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    pub fn root_pem_path(&self) -> &std::path::Path {
        &self.root_pem_path
    }

    pub fn root_installed(&self) -> bool {
        self.root_pem_path.exists()
    }

    /// Returns the cached leaf for `host`, minting it on first use. The mint
    /// happens under the cache lock so concurrent callers for the same host
    /// all observe the one leaf.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<MintedLeaf>, TlsError> {
        let key = normalize_host(host);
        let mut state = self.state.lock().expect("leaf cache lock poisoned");
        if let Some(leaf) = state.leaves.get(&key) {
            return Ok(Arc::clone(leaf));
        }

        let leaf = Arc::new(mint_leaf(&state.authority, &key)?);
        self.minted.fetch_add(1, Ordering::Relaxed);
        state.leaves.insert(key, Arc::clone(&leaf));
        Ok(leaf)
    }

    pub fn minted_count(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn mint_leaf(authority: &CertificateAuthority, host: &str) -> Result<MintedLeaf, TlsError> {
    let (params, dns_names, ip_names) = leaf_params(host)?;
    let key = generate_key_pair()?;
    let cert = params.signed_by(&key, authority.issuer())?;
    let cert_der = cert.der().clone();
    let cert_pem = cert.pem();

    let chain = vec![cert_der.clone(), authority.cert_der().clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(MintedLeaf {
        server_config: Arc::new(server_config),
        cert_der,
        cert_pem,
        common_name: host.to_string(),
        dns_names,
        ip_names,
    })
}

fn leaf_params(host: &str) -> Result<(CertificateParams, Vec<String>, Vec<IpAddr>), TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(24);
    params.not_after = now + Duration::days(LEAF_VALID_DAYS);
    params.serial_number = Some(SerialNumber::from(unix_nanos().to_be_bytes().to_vec()));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    let mut dns_names = Vec::new();
    let mut ip_names = Vec::new();
    if let Ok(ip) = host.parse::<IpAddr>() {
        ip_names.push(ip);
    } else {
        dns_names.push(host.to_string());
        if !host.starts_with("*.") {
            dns_names.push(format!("*.{host}"));
        }
        let www = format!("www.{host}");
        if www != host {
            dns_names.push(www);
        }
    }
    if host == "localhost" || host == "127.0.0.1" {
        if !dns_names.iter().any(|name| name == "localhost") {
            dns_names.push("localhost".to_string());
        }
        for literal in ["127.0.0.1", "::1"] {
            let ip: IpAddr = literal.parse().expect("loopback literal must parse");
            if !ip_names.contains(&ip) {
                ip_names.push(ip);
            }
        }
    }

    for name in &dns_names {
        params
            .subject_alt_names
            .push(SanType::DnsName(name.as_str().try_into()?));
    }
    for ip in &ip_names {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    Ok((params, dns_names, ip_names))
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}
