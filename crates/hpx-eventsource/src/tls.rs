//! TLS options and rustls client configuration.
//!
//! [`TlsOptions`] enumerates every TLS setting the client understands. Each
//! field maps onto one piece of the rustls [`ClientConfig`]; there is no
//! pass-through of arbitrary settings. Settings arriving as loose string
//! pairs go through [`TlsOptions::from_pairs`], which drops unknown names.

use std::{fmt, sync::Arc};

use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tracing::debug;

use crate::error::{TransportError, TransportResult};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Pinned TLS protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2 only.
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

impl TlsVersion {
    /// Parse a protocol name such as `TLSv1.2`, `TLSv1_3_method` or `1.3`.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name
            .trim()
            .trim_end_matches("_client_method")
            .trim_end_matches("_method")
            .to_ascii_lowercase()
            .replace('_', ".");
        match normalized.trim_start_matches("tlsv").trim_start_matches("tls") {
            "1.2" => Some(Self::Tls12),
            "1.3" => Some(Self::Tls13),
            _ => None,
        }
    }

    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => TLS12_ONLY,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

/// Callback replacing the default hostname check.
///
/// Called with the name being verified and the server's end-entity
/// certificate once the chain itself has validated. Returning `Err` fails the
/// handshake with the given message.
#[derive(Clone)]
pub struct IdentityCheck(Arc<dyn Fn(&str, &CertificateDer<'_>) -> Result<(), String> + Send + Sync>);

impl IdentityCheck {
    /// Wrap a closure.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&str, &CertificateDer<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        Self(Arc::new(check))
    }

    fn check(&self, host: &str, cert: &CertificateDer<'_>) -> Result<(), String> {
        (self.0)(host, cert)
    }
}

impl fmt::Debug for IdentityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityCheck(..)")
    }
}

/// TLS settings for `https` connections.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// PEM client certificate chain, used together with `key`.
    pub cert: Option<Vec<u8>>,
    /// PEM private key for `cert`.
    pub key: Option<Vec<u8>>,
    /// Passphrase for an encrypted `key`.
    pub passphrase: Option<String>,
    /// PKCS#12 client identity bundle. Not supported by rustls; setting it
    /// makes [`build_client_config`](Self::build_client_config) fail.
    pub pfx: Option<Vec<u8>>,
    /// PEM trust anchors replacing the bundled webpki roots.
    pub ca: Option<Vec<u8>>,
    /// IANA cipher suite names to allow, e.g. `TLS13_AES_128_GCM_SHA256`.
    pub ciphers: Option<Vec<String>>,
    /// Pin a single protocol version.
    pub protocol: Option<TlsVersion>,
    /// Name sent as SNI and verified against the certificate, instead of the
    /// URL host.
    pub servername: Option<String>,
    /// Replace the hostname check.
    pub check_server_identity: Option<IdentityCheck>,
    /// Verify the server certificate chain. Falls back to the legacy
    /// top-level flag when unset.
    pub reject_unauthorized: Option<bool>,
}

impl TlsOptions {
    /// Build options from Node-style key/value pairs.
    ///
    /// Recognised keys: `cert`, `key`, `passphrase`, `pfx`, `ca`, `ciphers`
    /// (colon-separated), `secureProtocol`, `servername` and
    /// `rejectUnauthorized`. Every other key is ignored.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (name, value) in pairs {
            match name {
                "cert" => options.cert = Some(value.as_bytes().to_vec()),
                "key" => options.key = Some(value.as_bytes().to_vec()),
                "passphrase" => options.passphrase = Some(value.to_string()),
                "pfx" => options.pfx = Some(value.as_bytes().to_vec()),
                "ca" => options.ca = Some(value.as_bytes().to_vec()),
                "ciphers" => {
                    options.ciphers = Some(
                        value
                            .split(':')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(String::from)
                            .collect(),
                    );
                }
                "secureProtocol" => match TlsVersion::parse(value) {
                    Some(version) => options.protocol = Some(version),
                    None => debug!(protocol = value, "Ignoring unsupported TLS protocol"),
                },
                "servername" => options.servername = Some(value.to_string()),
                "rejectUnauthorized" => match value {
                    "true" => options.reject_unauthorized = Some(true),
                    "false" => options.reject_unauthorized = Some(false),
                    _ => debug!(value, "Ignoring non-boolean rejectUnauthorized"),
                },
                other => debug!(option = other, "Ignoring unrecognized TLS option"),
            }
        }
        options
    }

    /// Set the client certificate chain and key.
    #[must_use]
    pub fn identity(mut self, cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        self.cert = Some(cert_pem.into());
        self.key = Some(key_pem.into());
        self
    }

    /// Set the trust anchors.
    #[must_use]
    pub fn ca(mut self, ca_pem: impl Into<Vec<u8>>) -> Self {
        self.ca = Some(ca_pem.into());
        self
    }

    /// Restrict the allowed cipher suites.
    #[must_use]
    pub fn ciphers<I, S>(mut self, ciphers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ciphers = Some(ciphers.into_iter().map(Into::into).collect());
        self
    }

    /// Pin the protocol version.
    #[must_use]
    pub fn protocol(mut self, version: TlsVersion) -> Self {
        self.protocol = Some(version);
        self
    }

    /// Override the SNI / verification name.
    #[must_use]
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Replace the hostname check.
    #[must_use]
    pub fn check_server_identity(mut self, check: IdentityCheck) -> Self {
        self.check_server_identity = Some(check);
        self
    }

    /// Enable or disable certificate verification.
    #[must_use]
    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = Some(reject);
        self
    }

    /// Whether certificates are verified: the structured option wins, then
    /// the legacy flag, then `true`.
    pub fn resolve_reject_unauthorized(&self, legacy: Option<bool>) -> bool {
        self.reject_unauthorized.or(legacy).unwrap_or(true)
    }

    /// Build the rustls configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if PEM material cannot be read, only one of
    /// `cert`/`key` is set, a passphrase or PKCS#12 bundle is supplied, no
    /// cipher suite matches or rustls rejects the combination.
    pub fn build_client_config(&self, legacy_reject: Option<bool>) -> TransportResult<ClientConfig> {
        let provider = Arc::new(self.crypto_provider()?);
        let versions = self
            .protocol
            .map_or(rustls::DEFAULT_VERSIONS, TlsVersion::versions);

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(versions)?;

        let verifier: Arc<dyn ServerCertVerifier> =
            if self.resolve_reject_unauthorized(legacy_reject) {
                let roots = Arc::new(self.root_store()?);
                let webpki = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
                    .build()
                    .map_err(|e| TransportError::tls(e.to_string()))?;
                match &self.check_server_identity {
                    Some(check) => Arc::new(IdentityOverride {
                        inner: webpki,
                        check: check.clone(),
                    }),
                    None => webpki,
                }
            } else {
                debug!("TLS certificate verification disabled");
                Arc::new(NoVerifier {
                    schemes: provider
                        .signature_verification_algorithms
                        .supported_schemes(),
                })
            };

        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        if self.pfx.is_some() {
            return Err(TransportError::config(
                "PKCS#12 (pfx) identities are not supported; supply PEM cert and key",
            ));
        }
        if self.passphrase.is_some() {
            return Err(TransportError::config(
                "Encrypted private keys are not supported; supply a decrypted key",
            ));
        }

        let config = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(read_certs(cert)?, read_key(key)?)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::config(
                    "TLS cert and key must be supplied together",
                ));
            }
        };

        Ok(config)
    }

    fn crypto_provider(&self) -> TransportResult<CryptoProvider> {
        let mut provider = rustls::crypto::ring::default_provider();
        if let Some(allowed) = &self.ciphers {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                allowed.iter().any(|a| a.eq_ignore_ascii_case(&name))
            });
            if provider.cipher_suites.is_empty() {
                return Err(TransportError::config(format!(
                    "None of the requested cipher suites are supported: {}",
                    allowed.join(":")
                )));
            }
        }
        Ok(provider)
    }

    fn root_store(&self) -> TransportResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        match &self.ca {
            Some(pem) => {
                let (added, _ignored) = roots.add_parsable_certificates(read_certs(pem)?);
                if added == 0 {
                    return Err(TransportError::config("No usable CA certificate in PEM"));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        Ok(roots)
    }
}

fn read_certs(pem: &[u8]) -> TransportResult<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::config("No certificate found in PEM"));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> TransportResult<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::config("No private key found in PEM"))
}

/// Chain verification from webpki, hostname check delegated to a callback.
#[derive(Debug)]
struct IdentityOverride {
    inner: Arc<WebPkiServerVerifier>,
    check: IdentityCheck,
}

impl ServerCertVerifier for IdentityOverride {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_)
            | Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => {
                let host = server_name.to_str();
                self.check
                    .check(&host, end_entity)
                    .map_err(rustls::Error::General)?;
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate (`reject_unauthorized = false`).
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
