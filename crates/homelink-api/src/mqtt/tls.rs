// TLS setup for the broker connection.
//
// WARNING: the server certificate chain and hostname are NOT verified.
// Home brokers run on self-signed certificates, so any certificate is
// accepted; handshake signatures are still checked against the presented
// key. Deployments exposed beyond a trusted LAN need certificate pinning.

use std::sync::Arc;

use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;

use crate::assets::AssetSource;
use crate::error::Error;

pub const PFX_ASSET: &str = "client.pfx";
pub const CERT_ASSET: &str = "client-cert.pem";
pub const KEY_ASSET: &str = "client-key.pem";

/// Certificate chain plus private key presented to the broker.
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain_len", &self.chain.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

// ── Server verification ──────────────────────────────────────────────

/// Accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        tracing::debug!(
            server = ?server_name,
            cert_len = end_entity.as_ref().len(),
            "accepting broker certificate without verification"
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ── Client identity ──────────────────────────────────────────────────

/// Load the client identity: `client.pfx` first, then the PEM pair.
pub fn load_identity(assets: &dyn AssetSource) -> Result<ClientIdentity, Error> {
    match identity_from_pfx(assets) {
        Ok(identity) => {
            tracing::info!("loaded client identity from {PFX_ASSET}");
            return Ok(identity);
        }
        Err(e) => tracing::debug!(error = %e, "no usable {PFX_ASSET}, trying PEM pair"),
    }

    let identity = identity_from_pem(assets)?;
    tracing::info!("loaded client identity from {CERT_ASSET} + {KEY_ASSET}");
    Ok(identity)
}

fn read_asset(assets: &dyn AssetSource, name: &str) -> Result<Vec<u8>, Error> {
    assets.load(name).map_err(|source| Error::Asset {
        name: name.to_owned(),
        source,
    })
}

#[cfg(feature = "pkcs12")]
fn identity_from_pfx(assets: &dyn AssetSource) -> Result<ClientIdentity, Error> {
    use rustls::pki_types::PrivatePkcs8KeyDer;

    let der = read_asset(assets, PFX_ASSET)?;
    let tls_err = |e: openssl::error::ErrorStack| Error::Tls(format!("{PFX_ASSET}: {e}"));

    let parsed = openssl::pkcs12::Pkcs12::from_der(&der)
        .and_then(|p| p.parse2(""))
        .map_err(tls_err)?;

    let cert = parsed
        .cert
        .ok_or_else(|| Error::Tls(format!("{PFX_ASSET} has no certificate")))?;
    let pkey = parsed
        .pkey
        .ok_or_else(|| Error::Tls(format!("{PFX_ASSET} has no private key")))?;

    let mut chain = vec![CertificateDer::from(cert.to_der().map_err(tls_err)?)];
    if let Some(extra) = parsed.ca {
        for ca in &extra {
            chain.push(CertificateDer::from(ca.to_der().map_err(tls_err)?));
        }
    }
    let key = pkey.private_key_to_pkcs8().map_err(tls_err)?;

    Ok(ClientIdentity {
        chain,
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
    })
}

#[cfg(not(feature = "pkcs12"))]
fn identity_from_pfx(_assets: &dyn AssetSource) -> Result<ClientIdentity, Error> {
    Err(Error::Tls(format!(
        "{PFX_ASSET} support not compiled in (enable the `pkcs12` feature)"
    )))
}

fn identity_from_pem(assets: &dyn AssetSource) -> Result<ClientIdentity, Error> {
    let cert_pem = read_asset(assets, CERT_ASSET)?;
    let key_pem = read_asset(assets, KEY_ASSET)?;

    let chain = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{CERT_ASSET}: {e:?}")))?;
    if chain.is_empty() {
        return Err(Error::Tls(format!("{CERT_ASSET} contains no certificates")));
    }

    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| Error::Tls(format!("{KEY_ASSET}: {e:?}")))?;

    Ok(ClientIdentity { chain, key })
}

// ── ClientConfig ─────────────────────────────────────────────────────

/// Build the rustls config for the broker connection.
///
/// When `assets` is given the client identity is loaded from it. A
/// missing or broken identity is logged and the connection proceeds
/// without a client certificate.
pub fn client_config(assets: Option<&dyn AssetSource>) -> Result<ClientConfig, Error> {
    let provider = rustls::crypto::ring::default_provider();
    let verifier = Arc::new(AcceptAnyServerCert::new(&provider));
    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let identity = assets.and_then(|a| {
        load_identity(a)
            .map_err(|e| {
                tracing::warn!(error = %e, "client certificate unavailable, continuing without it");
            })
            .ok()
    });

    match identity {
        Some(ClientIdentity { chain, key }) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Tls(format!("client identity rejected: {e}"))),
        None => Ok(builder.with_no_client_auth()),
    }
}
