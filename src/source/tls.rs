//! HTTP agents shared by the network sources.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

use crate::ImportError;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const REDIRECTS: u32 = 10;

/// Build an HTTP agent.
///
/// Certificates (in PEM format) found in `cert_dir` are trusted in
/// addition to the default roots. If `insecure` is `true`, server
/// certificates are not verified at all.
pub(crate) fn agent(cert_dir: Option<&Path>, insecure: bool) -> Result<ureq::Agent, ImportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ImportError::SourceUnavailable(format!("TLS setup: {e}")))?;

    let config = if insecure {
        tracing::warn!("TLS certificate verification is disabled.");

        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(cert_dir) = cert_dir {
            add_cert_dir(&mut roots, cert_dir)?;
        }

        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(ureq::AgentBuilder::new()
        .tls_config(Arc::new(config))
        .redirects(REDIRECTS)
        .user_agent(USER_AGENT)
        .build())
}

/// Add every certificate from the PEM files in `cert_dir`.
fn add_cert_dir(roots: &mut RootCertStore, cert_dir: &Path) -> Result<(), ImportError> {
    let err = |e: std::io::Error| {
        ImportError::SourceUnavailable(format!("certificates in {}: {e}", cert_dir.display()))
    };

    let mut entries: Vec<_> = std::fs::read_dir(cert_dir)
        .map_err(err)?
        .collect::<Result<_, _>>()
        .map_err(err)?;

    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if !entry.file_type().map_err(err)?.is_file() {
            continue;
        }

        let mut reader = BufReader::new(File::open(entry.path()).map_err(err)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(err)?;
            if let Err(e) = roots.add(cert) {
                tracing::warn!(path = %entry.path().display(), "Ignored certificate: {e}");
            }
        }
    }

    Ok(())
}

/// Accept any server certificate.
#[derive(Debug)]
struct NoVerifier;

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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Map a failed request to an import error.
pub(crate) fn request_error(url: &str, error: ureq::Error) -> ImportError {
    match error {
        ureq::Error::Status(status, _) => {
            ImportError::SourceUnavailable(format!("GET {url}: HTTP status {status}"))
        }

        ureq::Error::Transport(t) => ImportError::SourceUnavailable(format!("GET {url}: {t}")),
    }
}

/// Parse the `Content-Length` header of a response, if any.
pub(crate) fn content_length(response: &ureq::Response) -> Option<u64> {
    response
        .header("Content-Length")
        .and_then(|h| h.trim().parse().ok())
}

#[test]
fn load_certificates_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("README"), "not a certificate").unwrap();

    let mut roots = RootCertStore::empty();
    add_cert_dir(&mut roots, dir.path()).unwrap();
    assert!(roots.is_empty());

    assert!(agent(Some(dir.path()), false).is_ok());
    assert!(agent(None, true).is_ok());

    let missing = dir.path().join("missing");
    assert!(matches!(
        agent(Some(&missing), false),
        Err(ImportError::SourceUnavailable(_))
    ));
}
