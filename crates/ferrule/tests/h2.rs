mod helpers;

use std::sync::Arc;

use ferrule::{event::ConnectionFactory, h2};
use pretty_assertions::assert_eq;

use helpers::{
    big_body, h2_client::H2Client, serve, tcp_connect, tracing_common::setup_tracing, TestServer,
    INDEX_HTML,
};

fn serve_h2() -> eyre::Result<TestServer> {
    setup_tracing();
    serve(|hosting| {
        let factory: Arc<dyn ConnectionFactory> = Arc::new(h2::connection_factory(
            hosting,
            Arc::new(h2::ServerConf::default()),
        ));
        Ok(factory)
    })
}

#[test]
fn prior_knowledge_requests() -> eyre::Result<()> {
    let server = serve_h2()?;
    let mut client = H2Client::handshake(tcp_connect(server.addr())?)?;

    let res = client.get("/index.html")?;
    assert_eq!(res.status(), Some("200"));
    assert_eq!(res.header("content-type"), Some("text/html"));
    assert_eq!(res.header("content-length"), Some("11"));
    assert_eq!(res.body, INDEX_HTML);

    let root = client.get("/")?;
    assert_eq!(root.status(), Some("200"));
    assert_eq!(root.body, INDEX_HTML);

    let stream_id = client.request("HEAD", "/index.html")?;
    let head = client.response(stream_id)?;
    assert_eq!(head.status(), Some("200"));
    assert_eq!(head.header("content-length"), Some("11"));
    assert!(head.body.is_empty());

    let escape = client.get("/../../etc/passwd")?;
    assert_eq!(escape.status(), Some("404"));
    assert_eq!(escape.body, b"Not Found");

    Ok(())
}

#[test]
fn large_bodies_follow_flow_control() -> eyre::Result<()> {
    let server = serve_h2()?;
    let mut client = H2Client::handshake(tcp_connect(server.addr())?)?;

    let res = client.get("/big.bin")?;
    assert_eq!(res.status(), Some("200"));
    assert_eq!(res.header("content-length"), Some("4194304"));
    assert!(res.body == big_body(), "large body came back mangled");

    // the connection is still usable afterwards
    assert_eq!(client.get("/index.html")?.body, INDEX_HTML);

    Ok(())
}
