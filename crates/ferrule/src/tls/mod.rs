//! TLS termination: certificate selection by SNI, the handshake, and a
//! hand-off to whichever protocol handler ALPN settled on.

use std::{fmt, sync::Arc};

use b_x::BX;
use rustls::{ServerConfig, ServerConnection};

use crate::{
    error::ServeError,
    event::{ConnectionFactory, Receiver},
    socket::SharedSocket,
};

mod context;
pub use context::*;

mod layer;
pub use layer::*;

/// Protocol handlers keyed by ALPN id, in order of server preference. The
/// empty id is the fallback for clients that negotiate nothing.
#[derive(Default)]
pub struct Protocols {
    entries: Vec<(String, Arc<dyn ConnectionFactory>)>,
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, _)| id))
            .finish()
    }
}

impl Protocols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `id`, replacing an earlier registration.
    pub fn with(mut self, id: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        let id = id.into();
        match self.entries.iter_mut().find(|(k, _)| *k == id) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((id, factory)),
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ConnectionFactory>> {
        self.entries.iter().find(|(k, _)| k == id).map(|(_, f)| f)
    }

    /// The ids to advertise during the handshake.
    pub fn alpn_ids(&self) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, _)| k.as_bytes().to_vec())
            .collect()
    }
}

pub fn server_config(
    contexts: Arc<ContextSet>,
    protocols: &Protocols,
) -> Result<ServerConfig, TlsSetupError> {
    let mut config = ServerConfig::builder_with_provider(context::provider())
        .with_safe_default_protocol_versions()
        .map_err(TlsSetupError::Config)?
        .with_no_client_auth()
        .with_cert_resolver(contexts);
    config.alpn_protocols = protocols.alpn_ids();
    Ok(config)
}

/// Wraps every accepted connection in a [TlsLayer].
pub fn acceptor_factory(
    contexts: Arc<ContextSet>,
    protocols: Protocols,
) -> Result<impl ConnectionFactory, TlsSetupError> {
    let config = Arc::new(server_config(contexts, &protocols)?);
    let protocols = Arc::new(protocols);

    Ok(move |socket: SharedSocket| -> Result<Box<dyn Receiver>, BX> {
        let conn = ServerConnection::new(config.clone()).map_err(ServeError::from)?;
        Ok(Box::new(TlsLayer::new(socket, conn, protocols.clone())))
    })
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{self, Read, Write},
        rc::Rc,
        sync::Arc,
    };

    use b_x::BX;
    use pretty_assertions::assert_eq;
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme,
    };

    use super::{acceptor_factory, context::tests::self_signed, ContextSet, Protocols};
    use crate::{
        event::{ConnectionFactory, Receiver},
        socket::{mock::MockSocket, SharedSocket},
    };

    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
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
            rustls::crypto::verify_tls12_signature(
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
            rustls::crypto::verify_tls13_signature(
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

    fn client(alpn: &[&[u8]], sni: &'static str) -> ClientConnection {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        ClientConnection::new(Arc::new(config), ServerName::try_from(sni).unwrap()).unwrap()
    }

    /// Reads whatever arrives and writes it back with a tag in front.
    struct Tagged {
        tag: &'static str,
        socket: SharedSocket,
    }

    impl Receiver for Tagged {
        fn read_avail(&mut self) -> Result<(), BX> {
            let mut buf = [0u8; 256];
            loop {
                let res = self.socket.borrow_mut().read(&mut buf);
                match res {
                    Ok(0) => {
                        self.socket.borrow_mut().close();
                        return Ok(());
                    }
                    Ok(n) => {
                        let mut reply = format!("{}:", self.tag).into_bytes();
                        reply.extend_from_slice(&buf[..n]);
                        self.socket.borrow_mut().write(&reply)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(BX::from_err(e)),
                }
            }
        }

        fn write_avail(&mut self) -> Result<(), BX> {
            Ok(())
        }

        fn closed(&mut self) {}
    }

    fn tagged(tag: &'static str) -> Arc<dyn ConnectionFactory> {
        Arc::new(move |socket: SharedSocket| -> Result<Box<dyn Receiver>, BX> {
            Ok(Box::new(Tagged { tag, socket }))
        })
    }

    /// Shuttles records between the client and the server-side receiver
    /// until neither has anything left to say.
    fn pump(
        client: &mut ClientConnection,
        mock: &Rc<RefCell<MockSocket>>,
        server: &mut dyn Receiver,
    ) -> Result<(), BX> {
        for _ in 0..16 {
            let mut out = Vec::new();
            while client.wants_write() {
                client.write_tls(&mut out).unwrap();
            }
            if !out.is_empty() {
                mock.borrow_mut().push_read(out);
            }
            server.read_avail()?;
            server.write_avail()?;

            let written = std::mem::take(&mut mock.borrow_mut().written);
            if written.is_empty() && !client.wants_write() {
                break;
            }
            let mut cursor = &written[..];
            while !cursor.is_empty() {
                client.read_tls(&mut cursor).unwrap();
                client.process_new_packets().unwrap();
            }
        }
        Ok(())
    }

    fn read_plaintext(client: &mut ClientConnection) -> String {
        let mut buf = Vec::new();
        match client.reader().read_to_end(&mut buf) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("{e}"),
        }
        String::from_utf8(buf).unwrap()
    }

    fn contexts() -> (CertificateDer<'static>, CertificateDer<'static>, Arc<ContextSet>) {
        let (a_cert, a) = self_signed(&["a.example"]);
        let (b_cert, b) = self_signed(&["b.example"]);
        let mut set = ContextSet::new();
        set.push(a).push(b);
        (a_cert, b_cert, Arc::new(set))
    }

    #[test]
    fn alpn_picks_the_protocol_handler() {
        let (_, b_cert, contexts) = contexts();
        let protocols = Protocols::new()
            .with("h2", tagged("h2"))
            .with("http/1.1", tagged("h1"))
            .with("", tagged("h1"));
        assert_eq!(protocols.alpn_ids(), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        let factory = acceptor_factory(contexts, protocols).unwrap();

        let mock = MockSocket::shared();
        let mut layer = factory.connect(mock.clone()).unwrap();
        let mut client = client(&[b"h2", b"http/1.1"], "b.example");
        pump(&mut client, &mock, layer.as_mut()).unwrap();
        assert!(!client.is_handshaking());
        assert_eq!(client.alpn_protocol(), Some(&b"h2"[..]));
        assert_eq!(client.peer_certificates().unwrap()[0], b_cert);

        client.writer().write_all(b"ping").unwrap();
        pump(&mut client, &mock, layer.as_mut()).unwrap();
        assert_eq!(read_plaintext(&mut client), "h2:ping");
    }

    #[test]
    fn unknown_names_get_the_default_certificate() {
        let (a_cert, _, contexts) = contexts();
        let protocols = Protocols::new().with("", tagged("plain"));
        let factory = acceptor_factory(contexts, protocols).unwrap();

        let mock = MockSocket::shared();
        let mut layer = factory.connect(mock.clone()).unwrap();
        let mut client = client(&[], "localtest.me");
        pump(&mut client, &mock, layer.as_mut()).unwrap();
        assert_eq!(client.peer_certificates().unwrap()[0], a_cert);
        assert_eq!(client.alpn_protocol(), None);

        client.writer().write_all(b"hi").unwrap();
        pump(&mut client, &mock, layer.as_mut()).unwrap();
        assert_eq!(read_plaintext(&mut client), "plain:hi");
    }

    #[test]
    fn a_protocol_without_a_handler_fails_the_connection() {
        let (_, _, contexts) = contexts();
        // advertised, but nothing handles the negotiated-nothing case
        let protocols = Protocols::new().with("h2", tagged("h2"));
        let factory = acceptor_factory(contexts, protocols).unwrap();

        let mock = MockSocket::shared();
        let mut layer = factory.connect(mock.clone()).unwrap();
        let mut client = client(&[], "a.example");
        let err = pump(&mut client, &mock, layer.as_mut()).unwrap_err();
        assert!(err.to_string().contains("no handler"), "{err}");

        layer.closed();
        assert!(mock.borrow().closed);
    }

    #[test]
    fn garbage_instead_of_a_client_hello_is_an_error() {
        let (_, _, contexts) = contexts();
        let factory = acceptor_factory(contexts, Protocols::new().with("", tagged("x"))).unwrap();

        let mock = MockSocket::shared();
        let mut layer = factory.connect(mock.clone()).unwrap();
        mock.borrow_mut()
            .push_read(&b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n"[..]);
        assert!(layer.read_avail().is_err());
    }
}
