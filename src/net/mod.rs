//! Sockets and TLS for the engine.
//!
//! [`TlsNetwork`] resolves names on a helper thread, opens non-blocking
//! `mio` TCP streams and runs a `rustls` client session over them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::transport::{Network, Resolve};
use crate::{Config, Error};

mod resolve;
use resolve::Resolver;

mod tls;
pub use tls::TlsConnection;

pub struct TlsNetwork {
    tls_config: Arc<ClientConfig>,
    resolver: Resolver,
}

impl TlsNetwork {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let tls_config = if config.insecure {
            warn!("Server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            debug!("Loaded {} root certificates", roots.len());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(TlsNetwork {
            tls_config: Arc::new(tls_config),
            resolver: Resolver::default(),
        })
    }
}

impl Network for TlsNetwork {
    type Conn = TlsConnection;

    fn resolve(&mut self, host: &str, port: u16) -> io::Result<Resolve> {
        self.resolver.start(host, port)
    }

    fn poll_resolve(&mut self) -> Option<io::Result<SocketAddr>> {
        self.resolver.poll()
    }

    fn connect(&mut self, addr: SocketAddr, host: &str) -> io::Result<TlsConnection> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let tls = ClientConnection::new(self.tls_config.clone(), name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let stream = TcpStream::connect(addr)?;

        Ok(TlsConnection::new(stream, tls))
    }
}

/// Accepts any server certificate, still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::Connection;

    #[test]
    fn builds_verifying_config() {
        assert!(TlsNetwork::new(&Config::default()).is_ok());
    }

    #[test]
    fn builds_insecure_config() {
        let mut config = Config::default();
        config.insecure = true;
        assert!(TlsNetwork::new(&config).is_ok());
    }

    #[test]
    fn literal_address_resolves_at_once() {
        let mut net = TlsNetwork::new(&Config::default()).unwrap();
        let res = net.resolve("::1", 443).unwrap();
        assert_eq!(res, Resolve::Ready("[::1]:443".parse().unwrap()));
    }

    #[test]
    fn refused_connect_is_reported() {
        // Grab a free port, then close it so nothing listens there.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let mut net = TlsNetwork::new(&Config::default()).unwrap();
        // Loopback may refuse before the connect even returns.
        let mut conn = match net.connect(addr, "localhost") {
            Ok(c) => c,
            Err(_) => return,
        };

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match conn.poll_connect() {
                Ok(true) => panic!("connected to a closed port"),
                Ok(false) => {}
                Err(e) if Error::is_would_block(&e) => {}
                Err(_) => break,
            }
            assert!(std::time::Instant::now() < deadline, "no connect error");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}
