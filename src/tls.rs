use crate::error::{PhantomError, Result};
use rustls::pki_types::CertificateDer;
use std::sync::{Arc, Once};
use tracing::debug;

/// 隧道客户端协商使用的 ALPN
pub const TUNNEL_ALPN: &str = "specter-tun/1";
/// TCP 转发使用的 ALPN
pub const TCP_ALPN: &str = "specter-tcp/1";

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// 安装 rustls 默认加密提供者（quinn 和 tokio-rustls 共用）
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

/// 构建客户端 TLS 配置
///
/// `skip_verify` 为 true 时不校验服务器证书；否则使用系统 CA 证书。
pub fn client_config(skip_verify: bool, alpn: &[&str]) -> Result<Arc<rustls::ClientConfig>> {
    ensure_crypto_provider();

    let mut config = if skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            root_store.add(cert).ok();
        }
        if root_store.is_empty() {
            return Err(PhantomError::config("no system root certificates available"));
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    Ok(Arc::new(config))
}

/// 不验证证书的验证器
#[derive(Debug)]
struct NoCertificateVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoCertificateVerification {
    fn new() -> Self {
        let schemes = rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_else(|| {
                vec![
                    rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                    rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                    rustls::SignatureScheme::ED25519,
                    rustls::SignatureScheme::RSA_PSS_SHA256,
                    rustls::SignatureScheme::RSA_PKCS1_SHA256,
                ]
            });
        Self { schemes }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
