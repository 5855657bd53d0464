use std::sync::Arc;

use eyre::WrapErr;
use ferrule::{
    event::ConnectionFactory,
    h1, h2,
    hosting::{HostingChain, StaticHosting},
    reactor::{Listener, Shutdown},
    tls::{self, ContextSet, Protocols, TlsContext},
};
use tracing::{info, Level};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

mod settings;
use settings::Settings;

fn main() -> eyre::Result<()> {
    setup_tracing_and_error_reporting()?;

    let Some(settings) = Settings::load()? else {
        return Ok(());
    };
    serve(settings)
}

fn setup_tracing_and_error_reporting() -> eyre::Result<()> {
    color_eyre::install()?;

    let targets = if let Ok(rust_log) = std::env::var("RUST_LOG") {
        rust_log.parse::<Targets>()?
    } else {
        Targets::new()
            .with_default(Level::INFO)
            .with_target("ferrule", Level::DEBUG)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_file(false)
        .with_line_number(false)
        .without_time();

    tracing_subscriber::registry()
        .with(targets)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn serve(settings: Settings) -> eyre::Result<()> {
    let mut chain = HostingChain::new();
    chain.push(
        StaticHosting::new(&settings.root)
            .wrap_err_with(|| format!("cannot serve {}", settings.root.display()))?,
    );
    let hosting = Arc::new(chain);

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutting down");
            shutdown.trigger();
        })?;
    }

    let h1: Arc<dyn ConnectionFactory> = Arc::new(h1::connection_factory(
        hosting.clone(),
        Arc::new(h1::ServerConf::default()),
    ));
    let mut listeners = vec![Listener::bind(
        &settings.listener_conf(settings.http_port),
        h1.clone(),
        &shutdown,
    )?];

    if !settings.vhosts.is_empty() {
        let mut contexts = ContextSet::new();
        for vhost in &settings.vhosts {
            let context = TlsContext::from_pem_files(&vhost.cert, &vhost.key)
                .wrap_err_with(|| format!("virtual host {}", vhost.cert.display()))?;
            info!(hostnames = ?context.hostnames(), "virtual host");
            contexts.push(context);
        }

        let h2: Arc<dyn ConnectionFactory> = Arc::new(h2::connection_factory(
            hosting,
            Arc::new(h2::ServerConf::default()),
        ));
        let protocols = Protocols::new()
            .with("h2", h2)
            .with("http/1.1", h1.clone())
            .with("", h1);
        let factory = Arc::new(tls::acceptor_factory(Arc::new(contexts), protocols)?);
        listeners.push(Listener::bind(
            &settings.listener_conf(settings.https_port),
            factory,
            &shutdown,
        )?);
    }

    for listener in &mut listeners {
        listener.wait();
    }
    Ok(())
}
