use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use rcgen::{CertificateParams, DnType, DnValue, SanType};
use rustls::{
    crypto::{aws_lc_rs, CryptoProvider},
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TlsSetupError {
    #[error("reading {path}: {source}")]
    Pem {
        path: PathBuf,
        source: rustls::pki_types::pem::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("unusable certificate/key pair: {0}")]
    Key(rustls::Error),

    #[error("building the server config: {0}")]
    Config(rustls::Error),
}

/// The crypto provider every context and server config is built with.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// A certificate chain with its key, plus the hostnames it serves.
pub struct TlsContext {
    hostnames: Vec<String>,
    key: Arc<CertifiedKey>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("hostnames", &self.hostnames)
            .field("chain_len", &self.key.cert.len())
            .finish()
    }
}

impl TlsContext {
    /// Loads a PEM certificate chain and a PEM private key.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsSetupError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let pem_err = |path: &Path| {
            let path = path.to_owned();
            move |source| TlsSetupError::Pem { path, source }
        };

        let certs = CertificateDer::pem_file_iter(cert_path)
            .map_err(pem_err(cert_path))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(pem_err(cert_path))?;
        if certs.is_empty() {
            return Err(TlsSetupError::NoCertificates(cert_path.to_owned()));
        }
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(pem_err(key_path))?;

        debug!(cert = %cert_path.display(), key = %key_path.display(), "loaded tls material");
        Self::from_der(certs, key)
    }

    /// Builds a context from DER material. The hostname list is taken from
    /// the leaf certificate: its subject common name, then its DNS subject
    /// alternative names.
    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsSetupError> {
        let Some(leaf) = certs.first() else {
            return Err(TlsSetupError::NoCertificates(PathBuf::new()));
        };
        let hostnames = hostnames_of(leaf);

        // a throwaway config checks the pair the way a single-cert server
        // would
        ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsSetupError::Config)?
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(TlsSetupError::Key)?;

        let signing_key = aws_lc_rs::sign::any_supported_type(&key).map_err(TlsSetupError::Key)?;
        Ok(Self {
            hostnames,
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }

    /// Adds names this context answers for, beyond those in the certificate.
    pub fn with_hostnames<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hostnames.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// Exact comparison against the certificate's names and any aliases.
    pub fn matches(&self, name: &str) -> bool {
        self.hostnames.iter().any(|h| h == name)
    }

    pub(crate) fn certified_key(&self) -> Arc<CertifiedKey> {
        self.key.clone()
    }
}

fn hostnames_of(cert: &CertificateDer<'_>) -> Vec<String> {
    let params = match CertificateParams::from_ca_cert_der(cert) {
        Ok(params) => params,
        Err(e) => {
            warn!("could not read names from certificate: {e}");
            return Vec::new();
        }
    };

    let mut names = Vec::new();
    if let Some(cn) = params.distinguished_name.get(&DnType::CommonName) {
        let cn = match cn {
            DnValue::Utf8String(s) => Some(s.as_str()),
            DnValue::PrintableString(s) => Some(s.as_str()),
            DnValue::Ia5String(s) => Some(s.as_str()),
            _ => None,
        };
        names.extend(cn.map(str::to_owned));
    }
    for san in &params.subject_alt_names {
        if let SanType::DnsName(name) = san {
            names.push(name.as_str().to_owned());
        }
    }
    names
}

/// Every virtual host's context. The first one is the default, used when
/// the client sends no SNI or a name nobody serves.
#[derive(Debug, Default)]
pub struct ContextSet {
    contexts: Vec<TlsContext>,
}

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, context: TlsContext) -> &mut Self {
        self.contexts.push(context);
        self
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Picks the context for an SNI name. Only an empty set yields `None`.
    pub fn select(&self, sni: Option<&str>) -> Option<&TlsContext> {
        sni.and_then(|name| self.contexts.iter().find(|c| c.matches(name)))
            .or_else(|| self.contexts.first())
    }
}

impl ResolvesServerCert for ContextSet {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        let context = self.select(sni)?;
        if !sni.is_some_and(|name| context.matches(name)) {
            debug!(?sni, "no context for this name, using the default one");
        }
        Some(context.certified_key())
    }
}
