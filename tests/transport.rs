use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::PrivateKeyDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use wireline::blocking;
use wireline::net::{connect_async, Socket, SocketIntoBox};
use wireline::{ConnectBudget, ConnectOptions, SslMode, TlsChannel};

fn self_signed(names: Vec<String>) -> (Arc<rustls::ServerConfig>, String) {
    let key = rcgen::generate_simple_self_signed(names).unwrap();
    let ca_pem = key.cert.pem();

    let cert_der = key.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(key.key_pair.serialize_der().into());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();

    (Arc::new(config), ca_pem)
}

#[test]
fn blocking_connect_upgrades_and_round_trips() {
    let (config, ca_pem) = self_signed(vec!["localhost".to_owned()]);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let conn = rustls::ServerConnection::new(config).unwrap();
        let mut stream = rustls::StreamOwned::new(conn, stream);

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });

    let options = ConnectOptions::new()
        .host("localhost")
        .port(port)
        .ssl_mode(SslMode::VerifyIdentity)
        .ssl_ca(&ca_pem);

    let mut stream = blocking::connect(&options).unwrap();
    assert!(!stream.is_tls());

    let mut budget = ConnectBudget::unlimited();
    stream.upgrade(&options, &mut budget).unwrap();
    assert!(stream.is_tls());

    stream.write_all(b"hello").unwrap();
    stream.flush().unwrap();

    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");

    drop(stream);
    server.join().unwrap();
}

#[tokio::test]
async fn async_socket_round_trips_plaintext() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    let options = ConnectOptions::new().host("127.0.0.1").port(port);
    let mut socket = connect_async(&options, SocketIntoBox).await.unwrap();

    socket.write(b"ping").await.unwrap();

    let mut buf = BytesMut::with_capacity(4);
    let n = socket.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn async_channel_round_trips_over_tcp() {
    let (config, ca_pem) = self_signed(vec!["localhost".to_owned()]);
    let acceptor = tokio_rustls::TlsAcceptor::from(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();

        let mut buf = [0u8; 16];
        tls.read_exact(&mut buf).await.unwrap();
        tls.write_all(&buf).await.unwrap();
    });

    let options = ConnectOptions::new()
        .host("localhost")
        .port(port)
        .ssl_mode(SslMode::VerifyIdentity)
        .ssl_ca(&ca_pem);

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let mut channel = TlsChannel::handshake(stream, &options).await.unwrap();

    let sent = channel
        .write(&[Bytes::from_static(b"0123456789"), Bytes::from_static(b"abcdef")])
        .await
        .unwrap();
    assert_eq!(sent, 16);

    let mut reply = [0u8; 16];
    channel.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"0123456789abcdef");

    channel.close().await.unwrap();
}

#[test]
fn url_options_drive_the_blocking_connect() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let url = format!("db://127.0.0.1:{port}?tcp-nodelay=true&connect-timeout=5000");
    let options: ConnectOptions = url.parse().unwrap();

    let mut stream = blocking::connect(&options).unwrap();

    stream.write_all(b"ping").unwrap();

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    server.join().unwrap();
}
