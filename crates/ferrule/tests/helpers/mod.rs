#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    path::Path,
    sync::Arc,
    time::Duration,
};

use eyre::{bail, eyre};
use ferrule::{
    event::ConnectionFactory,
    hosting::{HostingChain, StaticHosting},
    reactor::{Listener, ListenerConf, Shutdown},
};
use tempfile::TempDir;

pub(crate) mod h2_client;
pub(crate) mod tls_client;
pub(crate) mod tracing_common;

pub(crate) const INDEX_HTML: &[u8] = b"<h1>hi</h1>";
pub(crate) const STYLE_CSS: &[u8] = b"body { color: red }";

/// Big enough to fill the kernel's socket buffers several times over.
pub(crate) fn big_body() -> Vec<u8> {
    (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect()
}

/// A running listener serving a throwaway document root.
pub(crate) struct TestServer {
    pub(crate) root: TempDir,
    pub(crate) listener: Listener,
    pub(crate) shutdown: Shutdown,
}

impl TestServer {
    pub(crate) fn addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}

/// Creates a document root, hosts it, and listens on a free local port with
/// whatever connection factory `make` builds on top of the hosting chain.
pub(crate) fn serve(
    make: impl FnOnce(Arc<HostingChain>) -> eyre::Result<Arc<dyn ConnectionFactory>>,
) -> eyre::Result<TestServer> {
    let root = tempfile::tempdir()?;
    std::fs::write(root.path().join("index.html"), INDEX_HTML)?;
    std::fs::write(root.path().join("style.css"), STYLE_CSS)?;
    std::fs::write(root.path().join("big.bin"), big_body())?;

    let factory = make(hosting(root.path())?)?;
    let conf = ListenerConf {
        address: Some("127.0.0.1".into()),
        port: 0,
        workers: Some(2),
        ..Default::default()
    };
    let shutdown = Shutdown::new();
    let listener = Listener::bind(&conf, factory, &shutdown)?;
    Ok(TestServer {
        root,
        listener,
        shutdown,
    })
}

pub(crate) fn hosting(root: &Path) -> eyre::Result<Arc<HostingChain>> {
    let mut chain = HostingChain::new();
    chain.push(StaticHosting::new(root)?);
    Ok(Arc::new(chain))
}

pub(crate) struct Reply {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl Reply {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn tcp_connect(addr: SocketAddr) -> eyre::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// A blocking HTTP/1.1 client, over plain TCP unless told otherwise.
pub(crate) struct Client<S = TcpStream> {
    stream: S,
    buf: Vec<u8>,
}

impl Client {
    pub(crate) fn connect(addr: SocketAddr) -> eyre::Result<Self> {
        Ok(Self::over(tcp_connect(addr)?))
    }
}

impl<S: Read + Write> Client<S> {
    pub(crate) fn over(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub(crate) fn send(&mut self, raw: &[u8]) -> eyre::Result<()> {
        self.stream.write_all(raw)?;
        Ok(())
    }

    pub(crate) fn get(&mut self, path: &str) -> eyre::Result<Reply> {
        self.send(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())?;
        self.read_reply(false)
    }

    fn fill(&mut self) -> eyre::Result<()> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            bail!("connection closed by the server");
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Reads one response. Replies to HEAD announce a length but carry no
    /// body, so pass `head_only` for those.
    pub(crate) fn read_reply(&mut self, head_only: bool) -> eyre::Result<Reply> {
        let (head_len, status, headers) = loop {
            let mut slots = [httparse::EMPTY_HEADER; 32];
            let mut res = httparse::Response::new(&mut slots);
            if let httparse::Status::Complete(n) = res.parse(&self.buf)? {
                let status = res.code.ok_or_else(|| eyre!("no status code"))?;
                let headers = res
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect::<Vec<_>>();
                break (n, status, headers);
            }
            self.fill()?;
        };

        let mut reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };
        let len = if head_only {
            0
        } else {
            reply
                .header("content-length")
                .map(str::parse::<usize>)
                .transpose()?
                .unwrap_or(0)
        };
        while self.buf.len() < head_len + len {
            self.fill()?;
        }
        reply.body = self.buf[head_len..head_len + len].to_vec();
        self.buf.drain(..head_len + len);
        Ok(reply)
    }

    /// Waits for the server to hang up. Fails if it sends anything else.
    pub(crate) fn expect_eof(&mut self) -> eyre::Result<()> {
        if !self.buf.is_empty() {
            bail!("{} unexpected bytes before eof", self.buf.len());
        }
        let mut chunk = [0u8; 64];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
            Ok(n) => bail!("{n} unexpected bytes before eof"),
            Err(e) => Err(e.into()),
        }
    }
}
