use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CipherSuite, DigitallySignedStruct, SignatureScheme, SupportedCipherSuite};
use tracing::debug;

use crate::error::Error;

pub const DEFAULT_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-CHACHA20-POLY1305:ECDHE-ECDSA-AES128-SHA:ECDHE-ECDSA-AES256-SHA:ECDHE-RSA-AES128-SHA:ECDHE-RSA-AES256-SHA:AES128-GCM-SHA256:AES256-GCM-SHA384:AES128-SHA:AES256-SHA";

const SECURITY_LEVEL_RELAXED: &str = "@SECLEVEL=0";

/// OpenSSL-style option bits presented with a cipher list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlsOptionFlags(u32);

impl TlsOptionFlags {
    pub const NONE: Self = Self(0);
    pub const NO_SSLV2: Self = Self(1 << 0);
    pub const NO_SSLV3: Self = Self(1 << 1);
    pub const NO_COMPRESSION: Self = Self(1 << 2);
    pub const NO_TLSV1_2: Self = Self(1 << 3);
    pub const NO_TLSV1_3: Self = Self(1 << 4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for TlsOptionFlags {
    fn default() -> Self {
        Self::NO_SSLV2 | Self::NO_SSLV3 | Self::NO_COMPRESSION
    }
}

impl std::ops::BitOr for TlsOptionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Cipher list and options presented on every TLS handshake of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TlsProfile {
    pub ciphers: String,
    pub options: TlsOptionFlags,
}

impl Default for TlsProfile {
    fn default() -> Self {
        Self {
            ciphers: DEFAULT_CIPHERS.to_owned(),
            options: TlsOptionFlags::default(),
        }
    }
}

impl TlsProfile {
    pub fn new(ciphers: impl Into<String>, options: TlsOptionFlags) -> Self {
        Self {
            ciphers: ciphers.into(),
            options,
        }
    }

    pub fn fingerprint(&self) -> TlsFingerprint {
        TlsFingerprint {
            ciphers: self.ciphers.clone(),
            options: self.options.bits(),
        }
    }

    /// Lowers the security level so older client certificates are still accepted.
    pub fn with_security_level_relaxed(mut self) -> Self {
        if !self.ciphers.contains("@SECLEVEL") {
            if !self.ciphers.is_empty() {
                self.ciphers.push(':');
            }
            self.ciphers.push_str(SECURITY_LEVEL_RELAXED);
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TlsFingerprint {
    pub ciphers: String,
    pub options: u32,
}

fn tls12_suite_for(name: &str) -> Option<CipherSuite> {
    let suite = match name.to_ascii_uppercase().as_str() {
        "ECDHE-ECDSA-AES128-GCM-SHA256" => CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        "ECDHE-ECDSA-AES256-GCM-SHA384" => CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        "ECDHE-ECDSA-CHACHA20-POLY1305" => {
            CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        }
        "ECDHE-RSA-AES128-GCM-SHA256" => CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        "ECDHE-RSA-AES256-GCM-SHA384" => CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        "ECDHE-RSA-CHACHA20-POLY1305" => CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        _ => return None,
    };
    Some(suite)
}

/// Orders the provider's suites after `ciphers`. TLS 1.3 suites are not governed
/// by the list and are always kept; names rustls cannot offer are ignored.
pub(crate) fn select_cipher_suites(
    ciphers: &str,
    available: &[SupportedCipherSuite],
) -> Vec<SupportedCipherSuite> {
    let mut selected = available
        .iter()
        .filter(|suite| matches!(suite, SupportedCipherSuite::Tls13(_)))
        .copied()
        .collect::<Vec<_>>();

    for name in ciphers.split(':').map(str::trim) {
        if name.is_empty() || name.starts_with('@') || name.starts_with('!') {
            continue;
        }
        let Some(wanted) = tls12_suite_for(name) else {
            debug!(cipher = name, "cipher is not offered by rustls; ignoring");
            continue;
        };
        if let Some(suite) = available.iter().find(|suite| suite.suite() == wanted)
            && !selected.contains(suite)
        {
            selected.push(*suite);
        }
    }
    selected
}

pub(crate) fn build_client_config(
    profile: &TlsProfile,
    verify: bool,
    client_cert: Option<&Path>,
) -> Result<rustls::ClientConfig, Error> {
    let base = rustls::crypto::ring::default_provider();
    let cipher_suites = select_cipher_suites(&profile.ciphers, &base.cipher_suites);
    let provider = Arc::new(CryptoProvider {
        cipher_suites,
        ..base
    });

    let mut versions = Vec::new();
    if !profile.options.contains(TlsOptionFlags::NO_TLSV1_3) {
        versions.push(&rustls::version::TLS13);
    }
    if !profile.options.contains(TlsOptionFlags::NO_TLSV1_2) {
        versions.push(&rustls::version::TLS12);
    }
    if versions.is_empty() {
        return Err(tls_config_error("tls options disable every protocol version"));
    }

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|source| tls_config_error(source.to_string()))?;

    let builder = if verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                algorithms: provider.signature_verification_algorithms,
            }))
    };

    match client_cert {
        None => Ok(builder.with_no_client_auth()),
        Some(path) => {
            let (cert_chain, private_key) = read_client_identity(path)?;
            builder
                .with_client_auth_cert(cert_chain, private_key)
                .map_err(|source| {
                    tls_config_error(format!("failed to configure client certificate: {source}"))
                })
        }
    }
}

fn read_client_identity(
    path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    use rustls::pki_types::pem::PemObject;

    let pem = std::fs::read(path).map_err(|source| Error::Io {
        context: format!("reading client certificate {}", path.display()),
        source,
    })?;

    let mut cert_chain = Vec::new();
    for item in CertificateDer::pem_slice_iter(&pem) {
        let certificate = item.map_err(|source| {
            tls_config_error(format!("failed to parse client certificate PEM: {source}"))
        })?;
        cert_chain.push(certificate);
    }
    if cert_chain.is_empty() {
        return Err(tls_config_error(format!(
            "no certificate blocks found in {}",
            path.display()
        )));
    }
    let private_key = PrivateKeyDer::from_pem_slice(&pem).map_err(|source| {
        tls_config_error(format!("failed to parse client private key PEM: {source}"))
    })?;
    Ok((cert_chain, private_key))
}

/// Skips chain validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
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

pub(crate) fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        message: message.into(),
    }
}
