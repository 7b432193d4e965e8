//! Certificate authority and per-host leaf certificate cache.
//!
//! On first run, a self-signed root is generated and persisted. From then
//! on, every MITM TLS handshake asks [`Ca::get_certificate`] for a leaf
//! bound to the SNI the client presented; results are cached and evicted
//! LRU-style once the cache reaches its configured size.

mod atomic_write;
mod lru;

use crate::error::EngineError;
use atomic_write::write_atomic_create_new;
use lru::LruCache;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Issuer, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;

const LEAF_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const DEFAULT_LEAF_CACHE_SIZE: usize = 512;

/// A minted leaf certificate plus its signing chain, ready to hand to
/// `rustls` as a server identity.
#[derive(Clone)]
pub struct LeafCertificate {
    /// DER-encoded `[leaf, root]` certificate chain.
    pub chain_der: Vec<Vec<u8>>,
    /// DER-encoded PKCS#8 private key for the leaf.
    pub key_der: Vec<u8>,
    pub created_at: SystemTime,
}

struct CaMaterial {
    root_cert_der: Vec<u8>,
    root_key: KeyPair,
    root_params: CertificateParams,
}

pub struct Ca {
    material: CaMaterial,
    cache: Mutex<LruCache<String, LeafCertificate>>,
    /// Serializes concurrent leaf generation for the *same* host so two
    /// simultaneous handshakes for one SNI never mint duplicate certs.
    generation_lock: AsyncMutex<()>,
}

impl Ca {
    /// Read `ca.crt`/`ca.key` from `dir` if both are present; otherwise
    /// generate a fresh root and persist it there. It is an error for only
    /// one of the two files to exist (a partially-written CA).
    pub fn load_or_create(cert_path: &Path, key_path: &Path, leaf_cache_size: Option<usize>) -> anyhow::Result<Self> {
        let cert_exists = cert_path.exists();
        let key_exists = key_path.exists();

        let (cert_pem, key_pem) = match (cert_exists, key_exists) {
            (true, true) => (
                std::fs::read_to_string(cert_path)?,
                std::fs::read_to_string(key_path)?,
            ),
            (false, false) => {
                if let Some(parent) = cert_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let (cert_pem, key_pem) = generate_root()?;
                // Key first, then cert: if the cert write fails we want to
                // remove the orphaned key rather than leave a partial CA.
                if let Err(e) = write_atomic_create_new(key_path, key_pem.as_bytes(), 0o600) {
                    let _ = std::fs::remove_file(key_path);
                    return Err(e);
                }
                if let Err(e) = write_atomic_create_new(cert_path, cert_pem.as_bytes(), 0o644) {
                    let _ = std::fs::remove_file(key_path);
                    return Err(e);
                }
                (cert_pem, key_pem)
            }
            _ => {
                anyhow::bail!(
                    "CA is partially present: cert_exists={cert_exists} key_exists={key_exists}; \
                     refusing to guess, remove both files to regenerate"
                );
            }
        };

        let root_key = KeyPair::from_pem(&key_pem)?;
        let root_params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let root_cert = root_params.clone().self_signed(&root_key)?;

        Ok(Self {
            material: CaMaterial {
                root_cert_der: root_cert.der().to_vec(),
                root_key,
                root_params,
            },
            cache: Mutex::new(LruCache::new(leaf_cache_size.unwrap_or(DEFAULT_LEAF_CACHE_SIZE))),
            generation_lock: AsyncMutex::new(()),
        })
    }

    /// Root certificate in DER, suitable for appending to a leaf chain.
    pub fn root_der(&self) -> &[u8] {
        &self.material.root_cert_der
    }

    /// Return the cached leaf for `host`, minting and caching one if
    /// absent. `host` should already have any `:port` suffix stripped.
    pub async fn get_certificate(&self, host: &str) -> Result<LeafCertificate, EngineError> {
        if let Some(hit) = self.touch_cache(host) {
            return Ok(hit);
        }

        // Only one generation per host at a time; a second caller that
        // raced us here will see the first caller's cached result.
        let _guard = self.generation_lock.lock().await;
        if let Some(hit) = self.touch_cache(host) {
            return Ok(hit);
        }

        let leaf = self
            .mint_leaf(host)
            .map_err(|e| EngineError::ClientError(format!("failed to mint leaf certificate: {e}")))?;

        let mut cache = self.cache.lock().expect("leaf cache mutex poisoned");
        cache.insert(host.to_string(), leaf.clone());
        Ok(leaf)
    }

    fn touch_cache(&self, host: &str) -> Option<LeafCertificate> {
        let mut cache = self.cache.lock().expect("leaf cache mutex poisoned");
        cache.get(host).cloned()
    }

    fn mint_leaf(&self, host: &str) -> anyhow::Result<LeafCertificate> {
        let san = if let Ok(ip) = host.parse::<IpAddr>() {
            SanType::IpAddress(ip)
        } else {
            SanType::DnsName(host.try_into()?)
        };

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.subject_alt_names = vec![san];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial().into());
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::try_from(LEAF_VALIDITY)?;

        let leaf_key = KeyPair::generate()?;
        let issuer = Issuer::new(self.material.root_params.clone(), &self.material.root_key);
        let leaf_cert = params.signed_by(&leaf_key, &issuer)?;

        Ok(LeafCertificate {
            chain_der: vec![leaf_cert.der().to_vec(), self.material.root_cert_der.clone()],
            key_der: leaf_key.serialize_der(),
            created_at: SystemTime::now(),
        })
    }
}

fn generate_root() -> anyhow::Result<(String, String)> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Langley Local MITM CA");
    dn.push(DnType::OrganizationName, "Langley");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::try_from(ROOT_VALIDITY)?;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// A cryptographically random, positive serial of at least 64 bits.
fn random_serial() -> Vec<u8> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Clear the top bit so the big-endian integer is always positive.
    bytes[0] &= 0x7f;
    bytes.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_serial_is_nonzero_and_positive() {
        let a = random_serial();
        let b = random_serial();
        assert_ne!(a, b, "two random serials should not collide in practice");
        assert_eq!(a[0] & 0x80, 0, "top bit must be clear to stay positive");
    }
}
