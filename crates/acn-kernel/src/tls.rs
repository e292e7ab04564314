//! TLS trust bootstrap for the delegate and mailbox services.
//!
//! A Peer generates a throwaway self-signed certificate at startup and signs
//! its public key with the node identity key. Clients accept any certificate
//! during the handshake, then check that signature against the Peer public
//! key they were configured with.

use crate::error::{KernelError, KernelResult};
use acn_types::identity::verify_der;
use acn_types::NodeKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Name presented in client hellos. Certificates are never checked against it.
pub const SERVER_NAME: &str = "acn";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(e: impl std::fmt::Display) -> KernelError {
    KernelError::Tls(e.to_string())
}

/// Session certificate plus the node's signature over its public key.
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key_der: Vec<u8>,
    session_public_key: Vec<u8>,
    signature: Vec<u8>,
}

impl TlsIdentity {
    pub fn generate(node_key: &NodeKey) -> KernelResult<Self> {
        let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
        let params =
            rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()]).map_err(tls_err)?;
        let cert = params.self_signed(&key_pair).map_err(tls_err)?;

        let session_public_key = key_pair.public_key_raw().to_vec();
        let signature = node_key.sign_der(&session_public_key);
        Ok(Self {
            cert: cert.der().clone(),
            key_der: key_pair.serialize_der(),
            session_public_key,
            signature,
        })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    /// Uncompressed public key of the session certificate.
    pub fn session_public_key(&self) -> &[u8] {
        &self.session_public_key
    }

    /// DER signature of the session public key by the node key.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn signature_hex(&self) -> String {
        hex::encode(&self.signature)
    }

    pub fn server_config(&self) -> KernelResult<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], key)
            .map_err(tls_err)
    }

    pub fn acceptor(&self) -> KernelResult<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("signature", &self.signature_hex())
            .finish_non_exhaustive()
    }
}

/// Public key carried by a DER certificate.
pub fn session_key_from_cert(der: &[u8]) -> KernelResult<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(tls_err)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// Check that `signature` binds the certificate's key to `peer_public_key`.
pub fn verify_session(peer_public_key: &str, cert_der: &[u8], signature: &[u8]) -> KernelResult<()> {
    let session_key = session_key_from_cert(cert_der)?;
    if verify_der(peer_public_key, &session_key, signature)? {
        Ok(())
    } else {
        Err(KernelError::Tls(
            "session certificate is not signed by the expected peer".into(),
        ))
    }
}

/// Accepts any certificate; handshake signatures are still verified.
#[derive(Debug)]
struct SessionCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SessionCertVerifier {
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub fn client_connector() -> KernelResult<TlsConnector> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SessionCertVerifier { provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name() -> KernelResult<ServerName<'static>> {
    ServerName::try_from(SERVER_NAME).map_err(tls_err)
}
