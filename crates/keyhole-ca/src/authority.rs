use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::loader::{CaLoader, RootMaterialPem};
use crate::{process_key_log, CaError};

const ROOT_COMMON_NAME: &str = "keyhole proxy CA";
const ROOT_ORGANIZATION: &str = "keyhole";

// Leaves are backdated so clients with skewed clocks accept freshly issued
// certificates.
const BACKDATE: Duration = Duration::days(2);
const LEAF_VALIDITY: Duration = Duration::days(365);
const ROOT_VALIDITY: Duration = Duration::days(365 * 10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub leaf_der: CertificateDer<'static>,
    pub cache_status: LeafCacheStatus,
}

struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_der: CertificateDer<'static>,
}

struct CaState {
    issuer: Issuer<'static, KeyPair>,
    leaf_cache: HashMap<String, CachedLeaf>,
}

/// Root CA plus leaf issuer. Leaf lookups share a single mutex with a fast
/// path for cache hits; issuance happens under the lock, so concurrent
/// requesters for the same common name observe exactly one signing.
pub struct CertificateAuthority {
    state: Mutex<CaState>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    signing_count: AtomicU64,
    cache_hits: AtomicU64,
}

impl CertificateAuthority {
    /// Recover the root from the loader, or generate a fresh one and ask the
    /// loader to persist it. Parse failures of existing material surface as
    /// errors and never trigger regeneration.
    pub fn new(loader: &dyn CaLoader) -> Result<Self, CaError> {
        let (material, issuer, cert_der) = match loader.load()? {
            Some(persisted) => {
                let (issuer, cert_der) = parse_root_material(&persisted)?;
                (persisted, issuer, cert_der)
            }
            None => {
                let (generated, issuer, cert_der) = generate_root_material()?;
                loader.store(&generated)?;
                (generated, issuer, cert_der)
            }
        };

        Ok(Self {
            state: Mutex::new(CaState {
                issuer,
                leaf_cache: HashMap::new(),
            }),
            cert_pem: material.cert_pem,
            cert_der,
            signing_count: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    /// Leaf certificate for `common_name`, cached per name for the process
    /// lifetime. Repeated lookups return byte-identical certificates.
    pub fn generate_cert(&self, common_name: &str) -> Result<IssuedLeaf, CaError> {
        let name = normalize_name(common_name);
        let mut state = self.state.lock().map_err(|_| CaError::LockPoisoned)?;

        if let Some(cached) = state.leaf_cache.get(&name) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedLeaf {
                server_config: Arc::clone(&cached.server_config),
                leaf_der: cached.leaf_der.clone(),
                cache_status: LeafCacheStatus::Hit,
            });
        }

        let (server_config, leaf_der) = issue_leaf(&state.issuer, &self.cert_der, &name)?;
        self.signing_count.fetch_add(1, Ordering::Relaxed);
        state.leaf_cache.insert(
            name,
            CachedLeaf {
                server_config: Arc::clone(&server_config),
                leaf_der: leaf_der.clone(),
            },
        );

        Ok(IssuedLeaf {
            server_config,
            leaf_der,
            cache_status: LeafCacheStatus::Miss,
        })
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn root_cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn signing_count(&self) -> u64 {
        self.signing_count.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

fn generate_root_material(
) -> Result<(RootMaterialPem, Issuer<'static, KeyPair>, CertificateDer<'static>), CaError> {
    let root_key = KeyPair::generate()?;
    let key_pem = root_key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(random_serial());
    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + ROOT_VALIDITY;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
    distinguished_name.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = distinguished_name;

    let root_cert = params.self_signed(&root_key)?;
    let cert_pem = root_cert.pem();
    let cert_der = root_cert.der().clone();
    let issuer = Issuer::new(params, root_key);

    Ok((RootMaterialPem { cert_pem, key_pem }, issuer, cert_der))
}

fn parse_root_material(
    material: &RootMaterialPem,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>), CaError> {
    let cert_der = CertificateDer::from_pem_slice(material.cert_pem.as_bytes()).map_err(|error| {
        CaError::InvalidMaterial(format!("failed to parse persisted CA certificate: {error}"))
    })?;
    let root_key = KeyPair::from_pem(&material.key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, root_key).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to recover issuer metadata from persisted CA certificate: {error}"
        ))
    })?;
    Ok((issuer, cert_der))
}

fn issue_leaf(
    issuer: &Issuer<'static, KeyPair>,
    root_der: &CertificateDer<'static>,
    name: &str,
) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.serial_number = Some(random_serial());
    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + LEAF_VALIDITY;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, name);
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = name.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(name.try_into()?));
    }

    let leaf_key = KeyPair::generate()?;
    let leaf_cert = params.signed_by(&leaf_key, issuer)?;
    let leaf_der = leaf_cert.der().clone();

    let chain = vec![leaf_der.clone(), root_der.clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    server_config.key_log = process_key_log();

    Ok((Arc::new(server_config), leaf_der))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0_u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Keep the DER integer positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn normalize_name(name: &str) -> String {
    match name.parse::<IpAddr>() {
        Ok(_) => name.to_string(),
        Err(_) => name.to_ascii_lowercase(),
    }
}
