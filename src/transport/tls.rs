//! TLS on top of [TcpIo]. The rustls session is sans-I/O: the event loop feeds it ciphertext when
//!  the socket is readable and drains its records when the socket is writable. Application data
//!  only flows once the handshake is complete and the peer's certificate subject matched the
//!  configured organizational unit and common name.

use std::fmt::{Debug, Formatter};
use std::io;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, ClientConfig, ClientConnection, Connection, DigitallySignedStruct, RootCertStore, ServerConfig, ServerConnection, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;
use crate::config::{StreamConfig, TlsSpec};
use crate::transport::stream::{Acceptor, StreamIo, StreamTransport};
use crate::transport::tcp::TcpIo;
use crate::transport::Transport;

/// Expected subject of the peer certificate, `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub organizational_unit: Option<String>,
    pub common_name: Option<String>,
}

impl PeerIdentity {
    pub fn from_spec(spec: &TlsSpec) -> PeerIdentity {
        PeerIdentity {
            organizational_unit: spec.match_ou.clone(),
            common_name: spec.match_cn.clone(),
        }
    }

    pub fn accepts_anything(&self) -> bool {
        self.organizational_unit.is_none() && self.common_name.is_none()
    }

    pub fn matches(&self, organizational_units: &[&str], common_names: &[&str]) -> bool {
        let ou_ok = self.organizational_unit.as_deref()
            .map(|expected| organizational_units.contains(&expected))
            .unwrap_or(true);
        let cn_ok = self.common_name.as_deref()
            .map(|expected| common_names.contains(&expected))
            .unwrap_or(true);
        ou_ok && cn_ok
    }

    pub fn verify(&self, end_entity: &CertificateDer<'_>) -> anyhow::Result<()> {
        if self.accepts_anything() {
            return Ok(());
        }

        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|e| anyhow!("unparseable peer certificate: {}", e))?;
        let subject = cert.subject();
        let ous = subject.iter_organizational_unit()
            .filter_map(|a| a.as_str().ok())
            .collect::<Vec<_>>();
        let cns = subject.iter_common_name()
            .filter_map(|a| a.as_str().ok())
            .collect::<Vec<_>>();

        if !self.matches(&ous, &cns) {
            bail!("peer certificate subject OU={:?} CN={:?} does not match expected {:?}", ous, cns, self);
        }
        Ok(())
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("reading certificates from {:?}", path))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {:?}", path))?;
    if certs.is_empty() {
        bail!("no certificates in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path)
        .with_context(|| format!("reading private key from {:?}", path))
}

fn load_roots(path: &Path) -> anyhow::Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(Arc::new(roots))
}

/// Server side: clients must present a certificate signed by the configured CA
pub fn server_config(spec: &TlsSpec) -> anyhow::Result<Arc<ServerConfig>> {
    let provider = provider();
    let client_verifier = WebPkiClientVerifier::builder_with_provider(load_roots(&spec.ca_file)?, provider.clone())
        .build()?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(load_certs(&spec.cert_file)?, load_key(&spec.key_file)?)?;
    Ok(Arc::new(config))
}

/// Client side: the server chain is verified against the configured CA, but not its host name -
///  peers are identified by certificate subject instead
pub fn client_config(spec: &TlsSpec) -> anyhow::Result<Arc<ClientConfig>> {
    let provider = provider();
    let chain_verifier = WebPkiServerVerifier::builder_with_provider(load_roots(&spec.ca_file)?, provider.clone())
        .build()?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier { inner: chain_verifier }))
        .with_client_auth_cert(load_certs(&spec.cert_file)?, load_key(&spec.key_file)?)?;
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

fn is_name_mismatch(e: &CertificateError) -> bool {
    matches!(e, CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. })
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(rustls::Error::InvalidCertificate(e)) if is_name_mismatch(&e) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// adapts the non-blocking socket to the `Read` / `Write` that rustls expects
struct SocketAdapter<'a>(&'a TcpStream);

impl Read for SocketAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    NotConnected,
    Handshaking,
    Connected,
}

pub struct TlsIo {
    tcp: TcpIo,
    conn: Connection,
    identity: PeerIdentity,
    identity_verified: bool,
    eof: bool,
}

impl Debug for TlsIo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsIo{{{}, {:?}}}", self.tcp.peer(), self.state())
    }
}

fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, e)
}

impl TlsIo {
    pub fn connect(address: &str, port: u16, spec: &TlsSpec) -> anyhow::Result<TlsIo> {
        let server_name = ServerName::try_from(address.to_string())
            .map_err(|e| anyhow!("invalid server name {:?}: {}", address, e))?;
        let conn = ClientConnection::new(client_config(spec)?, server_name)?;
        Ok(TlsIo::new(TcpIo::connect(address, port), conn.into(), PeerIdentity::from_spec(spec)))
    }

    fn new(tcp: TcpIo, conn: Connection, identity: PeerIdentity) -> TlsIo {
        TlsIo {
            tcp,
            conn,
            identity,
            identity_verified: false,
            eof: false,
        }
    }

    pub fn state(&self) -> TlsState {
        if !self.tcp.is_connected() {
            TlsState::NotConnected
        }
        else if self.conn.is_handshaking() || !self.identity_verified {
            TlsState::Handshaking
        }
        else {
            TlsState::Connected
        }
    }

    fn write_records(&mut self) -> io::Result<()> {
        let Some(stream) = self.tcp.stream() else {
            return Ok(());
        };
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SocketAdapter(stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn check_handshake(&mut self) -> io::Result<()> {
        if self.identity_verified || self.conn.is_handshaking() {
            return Ok(());
        }

        let result = match self.conn.peer_certificates().and_then(|certs| certs.first()) {
            Some(cert) => self.identity.verify(cert),
            None if self.identity.accepts_anything() => Ok(()),
            None => Err(anyhow!("peer presented no certificate")),
        };
        if let Err(e) = result {
            warn!("{}: rejecting peer: {}", self.tcp.peer(), e);
            return Err(io::Error::new(ErrorKind::PermissionDenied, e.to_string()));
        }

        info!("{}: TLS session established", self.tcp.peer());
        self.identity_verified = true;
        Ok(())
    }
}

#[async_trait]
impl StreamIo for TlsIo {
    fn describe(&self) -> String {
        format!("tls {}", self.tcp.peer())
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<Ready> {
        self.tcp.ready(interest).await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if self.eof {
                return Ok(0);
            }

            let Some(stream) = self.tcp.stream() else {
                return Err(ErrorKind::WouldBlock.into());
            };
            // NB: a WouldBlock from the socket ends the loop here
            if self.conn.read_tls(&mut SocketAdapter(stream))? == 0 {
                debug!("{}: end of stream", self.tcp.peer());
                self.eof = true;
            }

            if let Err(e) = self.conn.process_new_packets() {
                // try to get the alert out before giving up
                let _ = self.write_records();
                return Err(tls_error(e));
            }
            self.check_handshake()?;
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state() != TlsState::Connected {
            return Err(ErrorKind::WouldBlock.into());
        }

        let n = self.conn.writer().write(buf)?;
        self.write_records()?;
        if n == 0 {
            // rustls' send buffer is full
            return Err(ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn progress(&mut self) -> io::Result<bool> {
        if !self.tcp.is_connected() {
            return Ok(false);
        }
        self.write_records()?;
        self.check_handshake()?;
        Ok(self.state() == TlsState::Connected)
    }

    fn wants_write(&self) -> bool {
        self.tcp.is_connected() && self.conn.wants_write()
    }
}

pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    identity: PeerIdentity,
    stream_config: StreamConfig,
}

impl Debug for TlsAcceptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsAcceptor{{{:?}}}", self.identity)
    }
}

impl TlsAcceptor {
    pub fn new(spec: &TlsSpec, stream_config: StreamConfig) -> anyhow::Result<TlsAcceptor> {
        Ok(TlsAcceptor {
            config: server_config(spec)?,
            identity: PeerIdentity::from_spec(spec),
            stream_config,
        })
    }
}

impl Acceptor for TlsAcceptor {
    fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<Box<dyn Transport>> {
        stream.set_nodelay(true)?;
        let conn = ServerConnection::new(self.config.clone())?;
        let io = TlsIo::new(TcpIo::accepted(stream, peer), conn.into(), self.identity.clone());
        Ok(Box::new(StreamTransport::new(io, &self.stream_config)))
    }
}
