use anyhow::{Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Load the TLS configuration of the core API from PEM files.
///
/// With `ca_path` set, peers must present a certificate issued by that CA,
/// which is how cluster nodes authenticate each other.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> Result<ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to open cert file: {:?}", cert_path))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to open key file: {:?}", key_path))?;
    let ca_pem = ca_path
        .map(|path| std::fs::read(path).with_context(|| format!("Failed to open CA file: {:?}", path)))
        .transpose()?;

    server_config_from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
}

pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: Option<&[u8]>,
) -> Result<ServerConfig> {
    let cert_chain = parse_certs(cert_pem).context("Invalid server certificate")?;
    let key = parse_private_key(key_pem)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?;

    let config = if let Some(ca_pem) = ca_pem {
        let mut root_store = rustls::RootCertStore::empty();
        for cert in parse_certs(ca_pem).context("Invalid CA certificate")? {
            root_store
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }

        let verifier =
            rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider())
                .build()
                .context("Failed to build client certificate verifier")?;

        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .context("Failed to create mTLS server config")?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("Failed to create TLS server config")?
    };

    Ok(config)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs: Vec<_> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found");
    }

    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    private_key(&mut reader)
        .context("Failed to parse private key")?
        .context("No private key found")
}
