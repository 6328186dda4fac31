//! Browser profiles for client camouflage
//!
//! A profile picks the User-Agent sent on every leg and, with TLS enabled,
//! the cipher suite order of the ClientHello so the outer connection looks
//! like the browser the User-Agent claims to be.
//!
//! ## Limitations
//!
//! rustls doesn't provide full control over ClientHello construction.
//! Extension order and GREASE values still differ from real browsers.

use serde::{Deserialize, Serialize};

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserProfile {
    /// Chrome 120+ on Windows/Mac/Linux
    #[default]
    Chrome,
    /// Firefox 121+ on Windows/Mac/Linux
    Firefox,
    /// Safari 17+ on macOS/iOS
    Safari,
    /// Microsoft Edge (Chromium-based)
    Edge,
    /// Random selection from profiles
    Random,
    /// iOS Safari
    IosSafari,
    /// Android Chrome
    AndroidChrome,
}

impl BrowserProfile {
    /// Get a random profile
    pub fn random() -> Self {
        match crate::crypto::random_below(4) {
            0 => Self::Chrome,
            1 => Self::Firefox,
            2 => Self::Safari,
            _ => Self::Edge,
        }
    }

    /// Resolve `Random` to a concrete profile
    pub fn resolve(self) -> Self {
        match self {
            Self::Random => Self::random(),
            p => p,
        }
    }

    /// Get the User-Agent string for this profile
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            Self::Edge => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0"
            }
            Self::Firefox => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0"
            }
            Self::Safari => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
            }
            Self::IosSafari => {
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1"
            }
            Self::AndroidChrome => {
                "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36"
            }
            Self::Random => Self::random().user_agent(),
        }
    }
}

/// Fingerprint-related errors
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("Failed to load CA certificate: {0}")]
    Ca(String),
}

#[cfg(feature = "tls")]
pub use self::tls::{build_tls_config, RootTrust};

#[cfg(feature = "tls")]
mod tls {
    use super::{BrowserProfile, FingerprintError};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::ring as ring_provider;
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
    use rustls::SupportedCipherSuite;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Which server certificates the client accepts
    #[derive(Debug, Clone, Default)]
    pub enum RootTrust {
        /// Built-in web PKI roots
        #[default]
        WebPki,
        /// Only certificates issued by the CA(s) in this PEM file
        Pinned(PathBuf),
        /// Any certificate; handshake signatures are still checked
        Insecure,
    }

    /// Build a rustls ClientConfig that mimics a browser fingerprint
    pub fn build_tls_config(
        profile: BrowserProfile,
        trust: &RootTrust,
    ) -> Result<ClientConfig, FingerprintError> {
        let provider = Arc::new(CryptoProvider {
            cipher_suites: get_cipher_suites(profile.resolve()),
            ..ring_provider::default_provider()
        });

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| FingerprintError::Config(e.to_string()))?;

        let mut tls_config = match trust {
            RootTrust::WebPki => builder
                .with_root_certificates(RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                })
                .with_no_client_auth(),
            RootTrust::Pinned(path) => {
                let certs = crate::transport::load_certs(path)
                    .map_err(|e| FingerprintError::Ca(e.to_string()))?;
                let mut roots = RootCertStore::empty();
                for cert in certs {
                    roots
                        .add(cert)
                        .map_err(|e| FingerprintError::Ca(e.to_string()))?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            RootTrust::Insecure => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth(),
        };

        // The tunnel speaks HTTP/1.1 only
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        tls_config.resumption = rustls::client::Resumption::default();

        Ok(tls_config)
    }

    /// Get cipher suites ordered to match browser profile
    fn get_cipher_suites(profile: BrowserProfile) -> Vec<SupportedCipherSuite> {
        use rustls::crypto::ring::cipher_suite;

        match profile {
            BrowserProfile::Firefox => vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ],
            BrowserProfile::Safari | BrowserProfile::IosSafari => vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            BrowserProfile::Random => get_cipher_suites(BrowserProfile::random()),
            // Chromium family
            _ => vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
        }
    }

    /// Skips certificate chain and name validation
    #[derive(Debug)]
    struct AcceptAnyCertificate(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCertificate {
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
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_build_chrome_config() {
            let tls_config = build_tls_config(BrowserProfile::Chrome, &RootTrust::WebPki).unwrap();
            assert_eq!(tls_config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }

        #[test]
        fn test_build_insecure_config() {
            let tls_config =
                build_tls_config(BrowserProfile::Firefox, &RootTrust::Insecure).unwrap();
            assert!(!tls_config.alpn_protocols.is_empty());
        }

        #[test]
        fn test_missing_pinned_ca() {
            let trust = RootTrust::Pinned(PathBuf::from("/nonexistent/httptun-ca.pem"));
            assert!(matches!(
                build_tls_config(BrowserProfile::Chrome, &trust),
                Err(FingerprintError::Ca(_))
            ));
        }

        #[test]
        fn test_random_profile() {
            let _ = build_tls_config(BrowserProfile::Random, &RootTrust::WebPki).unwrap();
        }
    }
}
