//! TLS wrapping (feature `tls`).
//!
//! Accepted TLS sockets stay non-blocking while the handshake is staged
//! so the accept pipeline can poll it forward without stalling the loop;
//! once established, payload I/O switches to blocking mode by design —
//! the backend still signals readiness and the blocking call completes
//! inline. Outbound TLS connects are blocking end to end.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig,
    ServerConnection, SignatureScheme,
};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::net::SocketInfo;

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

#[derive(PartialEq, Eq)]
enum Handshake {
    Pending,
    Done,
    Failed,
}

pub(crate) struct TlsStream {
    tcp: TcpStream,
    session: Session,
    handshake: Handshake,
}

fn drive_handshake<D>(
    session: &mut rustls::ConnectionCommon<D>,
    tcp: &mut TcpStream,
) -> io::Result<bool> {
    while session.is_handshaking() {
        match session.complete_io(tcp) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl TlsStream {
    /// Wrap a freshly accepted socket. The handshake is not attempted
    /// here; the accept pipeline polls it via [`TlsStream::poll_connected`].
    pub(crate) fn accept(tcp: TcpStream, config: Arc<ServerConfig>) -> io::Result<Self> {
        tcp.set_nonblocking(true)?;
        let session = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(TlsStream {
            tcp,
            session: Session::Server(session),
            handshake: Handshake::Pending,
        })
    }

    /// Wrap an outbound socket. The socket stays blocking, so the first
    /// connected check completes the handshake inline.
    pub(crate) fn connect(
        tcp: TcpStream,
        host: &str,
        ca_file: Option<&Path>,
        no_verify: bool,
    ) -> Result<Self> {
        let config = client_config(ca_file, no_verify)?;
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Configuration(format!("invalid TLS server name: {}", host)))?;
        let session = ClientConnection::new(config, name)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(TlsStream {
            tcp,
            session: Session::Client(session),
            handshake: Handshake::Pending,
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.tcp.as_raw_fd()
    }

    pub(crate) fn poll_connected(&mut self) -> bool {
        match self.handshake {
            Handshake::Done => return true,
            Handshake::Failed => return false,
            Handshake::Pending => {}
        }
        let progress = match &mut self.session {
            Session::Client(c) => drive_handshake(c, &mut self.tcp),
            Session::Server(s) => drive_handshake(s, &mut self.tcp),
        };
        match progress {
            Ok(true) => {
                self.handshake = Handshake::Done;
                true
            }
            Ok(false) => false,
            Err(e) => {
                // A broken handshake never completes; the accept timeout
                // reaps the staged connection.
                tracing::debug!(error = %e, "TLS handshake failed");
                self.handshake = Handshake::Failed;
                false
            }
        }
    }

    pub(crate) fn set_blocking(&mut self) -> io::Result<()> {
        self.tcp.set_nonblocking(false)
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(c) => rustls::Stream::new(c, &mut self.tcp).read(buf),
            Session::Server(s) => rustls::Stream::new(s, &mut self.tcp).read(buf),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.session {
            Session::Client(c) => rustls::Stream::new(c, &mut self.tcp).write(buf),
            Session::Server(s) => rustls::Stream::new(s, &mut self.tcp).write(buf),
        }
    }

    pub(crate) fn local_info(&self) -> Option<SocketInfo> {
        self.tcp.local_addr().ok().map(SocketInfo::from)
    }

    pub(crate) fn peer_info(&self) -> Option<SocketInfo> {
        self.tcp.peer_addr().ok().map(SocketInfo::from)
    }
}

pub(crate) fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>> {
    let mut cert_reader = BufReader::new(File::open(cert_path).map_err(Error::Io)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(Error::Io)?;
    if certs.is_empty() {
        return Err(Error::Configuration(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(Error::Io)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(Error::Io)?
        .ok_or_else(|| {
            Error::Configuration(format!("no private key in {}", key_path.display()))
        })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Configuration(e.to_string()))?;
    Ok(Arc::new(config))
}

fn client_config(ca_file: Option<&Path>, no_verify: bool) -> Result<Arc<ClientConfig>> {
    if no_verify {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut roots = RootCertStore::empty();
    if let Some(path) = ca_file {
        let mut reader = BufReader::new(File::open(path).map_err(Error::Io)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(Error::Io)?;
            roots
                .add(cert)
                .map_err(|e| Error::Configuration(e.to_string()))?;
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Verifier used when the caller opts out of certificate checks.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
