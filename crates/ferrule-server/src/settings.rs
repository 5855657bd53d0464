use std::{ffi::OsString, path::PathBuf, str::FromStr};

use eyre::{eyre, WrapErr};
use ferrule::reactor::ListenerConf;

pub const USAGE: &str = "\
Usage: ferrule [options]

Options:
  --root <dir>                 document root (FERRULE_ROOT, default ./www)
  --addr <host>                address to bind (FERRULE_ADDR, default: all)
  --http-port <n>              plaintext port (FERRULE_HTTP_PORT, default 80)
  --https-port <n>             TLS port (FERRULE_HTTPS_PORT, default 443)
  --workers <n>                acceptor threads per port (FERRULE_WORKERS)
  --vhost <cert.pem>:<key.pem> a TLS virtual host, repeatable
                               (FERRULE_VHOSTS, comma separated)
  -h, --help                   print this and exit

The TLS port is only opened when at least one virtual host is given.
The first virtual host answers clients whose server name matches no other.";

/// A certificate chain and its private key, both PEM files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl FromStr for VirtualHost {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((cert, key)) if !cert.is_empty() && !key.is_empty() => Ok(Self {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => Err(eyre!("expected <cert.pem>:<key.pem>, got {s:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub root: PathBuf,
    pub addr: Option<String>,
    pub http_port: u16,
    pub https_port: u16,
    pub workers: Option<usize>,
    pub vhosts: Vec<VirtualHost>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./www"),
            addr: None,
            http_port: 80,
            https_port: 443,
            workers: None,
            vhosts: Vec::new(),
        }
    }
}

impl Settings {
    /// Environment first, then command-line flags on top. Returns `None`
    /// when only the usage was asked for.
    pub fn load() -> eyre::Result<Option<Self>> {
        Self::from_vars(|name| std::env::var(name).ok())?.apply_args(std::env::args_os().skip(1))
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> eyre::Result<Self> {
        let mut settings = Self::default();
        if let Some(root) = var("FERRULE_ROOT") {
            settings.root = root.into();
        }
        settings.addr = var("FERRULE_ADDR").filter(|a| !a.is_empty());
        if let Some(port) = var("FERRULE_HTTP_PORT") {
            settings.http_port = port.parse().wrap_err("FERRULE_HTTP_PORT")?;
        }
        if let Some(port) = var("FERRULE_HTTPS_PORT") {
            settings.https_port = port.parse().wrap_err("FERRULE_HTTPS_PORT")?;
        }
        if let Some(workers) = var("FERRULE_WORKERS") {
            settings.workers = Some(workers.parse().wrap_err("FERRULE_WORKERS")?);
        }
        if let Some(vhosts) = var("FERRULE_VHOSTS") {
            settings.vhosts = vhosts
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(VirtualHost::from_str)
                .collect::<Result<_, _>>()
                .wrap_err("FERRULE_VHOSTS")?;
        }
        Ok(settings)
    }

    pub fn apply_args<I>(mut self, args: I) -> eyre::Result<Option<Self>>
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        // --vhost flags replace the environment's list rather than extend it
        let mut flag_vhosts: Vec<VirtualHost> = Vec::new();
        while let Some(arg) = parser.next()? {
            match arg {
                Long("root") => self.root = parser.value()?.into(),
                Long("addr") => self.addr = Some(parser.value()?.string()?),
                Long("http-port") => self.http_port = parser.value()?.parse()?,
                Long("https-port") => self.https_port = parser.value()?.parse()?,
                Long("workers") => self.workers = Some(parser.value()?.parse()?),
                Long("vhost") => flag_vhosts.push(parser.value()?.string()?.parse::<VirtualHost>()?),
                Short('h') | Long("help") => {
                    println!("{USAGE}");
                    return Ok(None);
                }
                _ => return Err(arg.unexpected().into()),
            }
        }
        if !flag_vhosts.is_empty() {
            self.vhosts = flag_vhosts;
        }
        Ok(Some(self))
    }

    pub fn listener_conf(&self, port: u16) -> ListenerConf {
        ListenerConf {
            address: self.addr.clone(),
            port,
            workers: self.workers,
            ..Default::default()
        }
    }
}
