//! Key material and encryption helpers
//!
//! Every settings version carries a [`KeyBundle`]: the root token, the JWT
//! signing key, an asymmetric key pair and the root/intermediate CA. Bundles
//! travel in the clear between nodes (over TLS) and are sealed field by field
//! with a node-local key when written to disk.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub const ROOT_TOKEN_PREFIX: &str = "mrt.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// JWT signing key (base64)
    pub jwt: String,
    /// Root token
    pub mrt: String,
    pub public: String,
    pub private: String,
    pub cluster: Uuid,
    /// Root CA fingerprint (hex SHA-256 of the DER certificate)
    pub rfpr: String,
    pub rcrt: String,
    pub rkey: String,
    pub icrt: String,
    pub ikey: String,
}

/// Generate a fresh root token: `mrt.` followed by 64 lowercase hex characters
pub fn generate_root_token() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{}{}", ROOT_TOKEN_PREFIX, hex::encode(bytes))
}

pub fn generate_jwt_key() -> String {
    let mut bytes = [0u8; 64];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    B64.encode(bytes)
}

/// Generate the full key bundle for a new cluster
pub fn generate_key_bundle(cluster: Uuid, display_name: &str) -> Result<KeyBundle> {
    let mrt = generate_root_token();
    let jwt = generate_jwt_key();

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;

    let (root_cert, root_key) = generate_ca(&format!("{} Root CA", display_name), None, Duration::days(3650))?;
    let (int_cert, int_key) = generate_ca(
        &format!("{} Intermediate CA", display_name),
        Some((&root_cert, &root_key)),
        Duration::days(1825),
    )?;

    Ok(KeyBundle {
        jwt,
        mrt,
        public: key_pair.public_key_pem(),
        private: key_pair.serialize_pem(),
        cluster,
        rfpr: fingerprint(root_cert.der()),
        rcrt: root_cert.pem(),
        rkey: root_key.serialize_pem(),
        icrt: int_cert.pem(),
        ikey: int_key.serialize_pem(),
    })
}

/// Self-signed root CA when `issuer` is `None`, otherwise an intermediate
/// CA signed by the issuer
fn generate_ca(
    cn: &str,
    issuer: Option<(&rcgen::Certificate, &KeyPair)>,
    validity: Duration,
) -> Result<(rcgen::Certificate, KeyPair)> {
    let key_pair = KeyPair::generate().context("Failed to generate CA key pair")?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn.push(DnType::OrganizationName, "Morio");
    params.distinguished_name = dn;
    params.is_ca = match issuer {
        None => IsCa::Ca(BasicConstraints::Unconstrained),
        Some(_) => IsCa::Ca(BasicConstraints::Constrained(0)),
    };
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + validity;

    let cert = match issuer {
        None => params
            .self_signed(&key_pair)
            .context("Failed to generate root CA certificate")?,
        Some((ca_cert, ca_key)) => params
            .signed_by(&key_pair, ca_cert, ca_key)
            .context("Failed to sign intermediate CA certificate")?,
    };

    Ok((cert, key_pair))
}

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

// ============================================================================
// Encryption
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Sealed {
    iv: String,
    ct: String,
}

/// AES-256-GCM cipher; ciphertext is a JSON string `{"iv": .., "ct": ..}`
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive a cipher from a passphrase such as the root token
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| anyhow!("Invalid key length"))?;
        let iv: [u8; 12] = rand::random();
        let ct = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| anyhow!("Encryption failed"))?;

        let sealed = Sealed {
            iv: B64.encode(iv),
            ct: B64.encode(ct),
        };
        serde_json::to_string(&sealed).context("Failed to serialize ciphertext")
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let sealed: Sealed = serde_json::from_str(sealed).context("Value is not encrypted")?;
        let iv = B64.decode(&sealed.iv).context("Invalid iv")?;
        let ct = B64.decode(&sealed.ct).context("Invalid ciphertext")?;
        if iv.len() != 12 {
            anyhow::bail!("Invalid iv length: {}", iv.len());
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| anyhow!("Invalid key length"))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), ct.as_ref())
            .map_err(|_| anyhow!("Decryption failed"))?;

        String::from_utf8(plain).context("Decrypted value is not UTF-8")
    }

    pub fn is_encrypted(value: &str) -> bool {
        serde_json::from_str::<Sealed>(value).is_ok()
    }
}

/// Seal every field of a key bundle individually
pub fn seal_bundle(bundle: &KeyBundle, cipher: &Cipher) -> Result<BTreeMap<String, String>> {
    let value = serde_json::to_value(bundle).context("Failed to serialize key bundle")?;
    let fields = value
        .as_object()
        .ok_or_else(|| anyhow!("Key bundle is not an object"))?;

    let mut sealed = BTreeMap::new();
    for (name, field) in fields {
        let plain = field.as_str().map(str::to_string).unwrap_or_else(|| field.to_string());
        sealed.insert(name.clone(), cipher.encrypt(&plain)?);
    }
    Ok(sealed)
}

pub fn open_bundle(sealed: &BTreeMap<String, String>, cipher: &Cipher) -> Result<KeyBundle> {
    let mut fields = serde_json::Map::new();
    for (name, ct) in sealed {
        let plain = cipher
            .decrypt(ct)
            .with_context(|| format!("Failed to decrypt key field {}", name))?;
        fields.insert(name.clone(), serde_json::Value::String(plain));
    }
    serde_json::from_value(serde_json::Value::Object(fields)).context("Failed to parse key bundle")
}

/// Load the node-local at-rest key, creating it on first use
pub fn load_or_create_rest_key(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rest key {:?}", path))?;
        let bytes = hex::decode(text.trim()).context("Rest key is not hex")?;
        return bytes
            .try_into()
            .map_err(|_| anyhow!("Rest key in {:?} has the wrong length", path));
    }

    let key: [u8; 32] = rand::random();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create dir {:?}", parent))?;
    }
    std::fs::write(path, hex::encode(key))
        .with_context(|| format!("Failed to write rest key {:?}", path))?;
    Ok(key)
}
