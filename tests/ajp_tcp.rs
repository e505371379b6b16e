mod common;

use std::{sync::mpsc, thread, time::Duration};

use ajpkit::{
    AjpClient, ConnectorConfig,
    protocol::{Attribute, ForwardRequest, PacketCodec},
};

fn config() -> ConnectorConfig {
    ConnectorConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        max_threads: 4,
        ..Default::default()
    }
}

#[test]
fn serves_pipelined_requests_until_shutdown() {
    let server = common::start(config());
    let addr = server.addr.unwrap();
    let mut client = AjpClient::connect(addr, PacketCodec::default()).unwrap();

    client.ping().unwrap();

    let response = client
        .forward(&ForwardRequest::new("GET", "/hello?x=1", "localhost"), &[])
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.message.as_deref(), Some("OK"));
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(
        response.body,
        b"GET /hello query=x=1 host=localhost user=-\n"
    );
    assert!(response.reuse);

    let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let mut upload = ForwardRequest::new("POST", "/upload", "localhost");
    upload
        .headers
        .push(("Content-Length".to_owned(), body.len().to_string()));
    upload.attributes.push(Attribute::RemoteUser("alice".to_owned()));
    let response = client.forward(&upload, &body).unwrap();
    let summary = b"POST /upload query= host=localhost user=alice\n";
    assert_eq!(&response.body[..summary.len()], summary);
    assert_eq!(&response.body[summary.len()..], &body[..]);
    assert!(response.reuse);

    client.shutdown().unwrap();
    server.join();
}

#[test]
fn connections_are_served_concurrently() {
    let server = common::start(config());
    let addr = server.addr.unwrap();

    let mut first = AjpClient::connect(addr, PacketCodec::default()).unwrap();
    let mut second = AjpClient::connect(addr, PacketCodec::default()).unwrap();
    first.ping().unwrap();
    second.ping().unwrap();
    let response = second
        .forward(&ForwardRequest::new("GET", "/second", "localhost"), &[])
        .unwrap();
    assert_eq!(response.status, 200);
    first.ping().unwrap();

    first.close().unwrap();
    second.close().unwrap();
    server.stop();
}

#[test]
fn secret_guards_requests_and_shutdown() {
    let server = common::start(ConnectorConfig {
        required_secret: Some("s3cret".to_owned()),
        ..config()
    });
    let addr = server.addr.unwrap();

    let mut anonymous = AjpClient::connect(addr, PacketCodec::default()).unwrap();
    assert!(
        anonymous
            .forward(&ForwardRequest::new("GET", "/", "localhost"), &[])
            .is_err()
    );

    let mut intruder = AjpClient::connect(addr, PacketCodec::default()).unwrap();
    intruder.shutdown().unwrap();
    assert!(intruder.ping().is_err());

    let mut trusted = AjpClient::connect(addr, PacketCodec::default()).unwrap();
    let mut request = ForwardRequest::new("GET", "/", "localhost");
    request.attributes.push(Attribute::Secret("s3cret".to_owned()));
    let response = trusted.forward(&request, &[]).unwrap();
    assert_eq!(response.status, 200);

    trusted.shutdown().unwrap();
    server.join();
}

#[test]
fn stop_ends_idle_connections() {
    let server = common::start(config());
    let addr = server.addr.unwrap();
    let mut idle = AjpClient::connect(addr, PacketCodec::default()).unwrap();
    idle.ping().unwrap();

    let (done, stopped) = mpsc::channel();
    thread::spawn(move || {
        server.stop();
        done.send(()).unwrap();
    });
    stopped
        .recv_timeout(Duration::from_secs(5))
        .expect("listener kept waiting on an idle connection");

    assert!(idle.ping().is_err());
}
