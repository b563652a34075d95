//! End-to-end tests: a SOCKS5 client talking through a local relay and a
//! server relay, both on loopback, to echo targets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ssrelay::socks5::{self, Address};
use ssrelay::{RelayConfig, RelayHandle};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn echo_tcp() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn echo_udp() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], from);
        }
    });
    addr
}

fn hosts_file(entries: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "ssrelay-e2e-hosts-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&path, entries).unwrap();
    path
}

struct Tunnel {
    local: RelayHandle,
    _server: RelayHandle,
}

fn tunnel(method: &str, server_password: &str, local_password: &str) -> Tunnel {
    let mut server = RelayConfig::server("127.0.0.1", 0, server_password, method);
    server.hosts_path = Some(hosts_file("127.0.0.1 echo.test\n"));
    server.resolv_conf_path = None;
    server.dns_servers = vec!["127.0.0.1:9".parse().unwrap()];
    let server = ssrelay::start(server).unwrap();

    let mut local = RelayConfig::local(
        "127.0.0.1",
        server.local_addr().port(),
        local_password,
        method,
    );
    local.local_port = 0;
    local.hosts_path = None;
    local.resolv_conf_path = None;
    local.dns_servers = vec!["127.0.0.1:9".parse().unwrap()];
    let local = ssrelay::start(local).unwrap();

    Tunnel {
        local,
        _server: server,
    }
}

fn socks_connect(proxy: SocketAddr, target: &Address) -> (TcpStream, [u8; 10]) {
    let mut stream = TcpStream::connect(proxy).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, socks5::CMD_CONNECT, 0x00];
    target.write_to(&mut request).unwrap();
    stream.write_all(&request).unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).unwrap();
    (stream, reply)
}

/// Read until EOF or error; true if the peer closed without sending data.
fn closed_without_data(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(stream.read(&mut buf), Ok(0) | Err(_))
}

#[test]
fn test_tcp_echo_through_tunnel() {
    let echo = echo_tcp();
    for method in ["aes-256-gcm", "chacha20-ietf-poly1305", "aes-128-cfb"] {
        let t = tunnel(method, "e2e-secret", "e2e-secret");
        let target = Address::Domain("echo.test".into(), echo.port());
        let (mut stream, reply) = socks_connect(t.local.local_addr(), &target);
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0], "{}", method);

        stream.write_all(b"hello through the tunnel").unwrap();
        let mut buf = [0u8; 24];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello through the tunnel", "{}", method);
    }
}

#[test]
fn test_ip_literal_target() {
    let echo = echo_tcp();
    let t = tunnel("aes-128-gcm", "pw", "pw");
    let (mut stream, reply) = socks_connect(t.local.local_addr(), &Address::Socket(echo));
    assert_eq!(reply[1], 0x00);

    stream.write_all(&[7u8; 100]).unwrap();
    let mut buf = [0u8; 100];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [7u8; 100]);
}

#[test]
fn test_bulk_transfer_preserves_order() {
    let echo = echo_tcp();
    let t = tunnel("aes-256-gcm", "pw", "pw");
    let target = Address::Domain("echo.test".into(), echo.port());
    let (stream, _) = socks_connect(t.local.local_addr(), &target);

    // Larger than the high-water mark, so both directions hit backpressure.
    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mut writer = stream.try_clone().unwrap();
    let sender = thread::spawn(move || writer.write_all(&payload).unwrap());

    let mut reader = stream;
    let mut received = vec![0u8; expected.len()];
    reader.read_exact(&mut received).unwrap();
    sender.join().unwrap();

    assert!(received == expected);
}

#[test]
fn test_wrong_password_closes_connection() {
    let echo = echo_tcp();
    let t = tunnel("aes-256-gcm", "server-password", "local-password");
    let target = Address::Domain("echo.test".into(), echo.port());
    let (mut stream, reply) = socks_connect(t.local.local_addr(), &target);

    // The local side reaches the server, so CONNECT succeeds...
    assert_eq!(reply[1], 0x00);
    // ...but the server rejects the stream and nothing is echoed.
    let _ = stream.write_all(b"ping");
    assert!(closed_without_data(&mut stream));
}

#[test]
fn test_unreachable_server_reports_refused() {
    // Reserve a port, then close it so nothing listens there.
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut local = RelayConfig::local("127.0.0.1", port, "pw", "aes-256-gcm");
    local.local_port = 0;
    local.hosts_path = None;
    local.resolv_conf_path = None;
    local.dns_servers = vec!["127.0.0.1:9".parse().unwrap()];
    let handle = ssrelay::start(local).unwrap();

    let target = Address::Domain("example.com".into(), 80);
    let (mut stream, reply) = socks_connect(handle.local_addr(), &target);
    assert_eq!(reply[1], socks5::Reply::ConnectionRefused as u8);
    assert!(closed_without_data(&mut stream));
}

#[test]
fn test_unresolvable_target_closes_stream() {
    // DNS server that never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut server = RelayConfig::server("127.0.0.1", 0, "pw", "aes-256-gcm");
    server.hosts_path = None;
    server.resolv_conf_path = None;
    server.dns_servers = vec![silent.local_addr().unwrap()];
    server.dns_timeout = Duration::from_millis(200);
    server.dns_retries = 1;
    let server = ssrelay::start(server).unwrap();

    let mut local = RelayConfig::local("127.0.0.1", server.local_addr().port(), "pw", "aes-256-gcm");
    local.local_port = 0;
    local.hosts_path = None;
    local.resolv_conf_path = None;
    local.dns_servers = vec!["127.0.0.1:9".parse().unwrap()];
    let local = ssrelay::start(local).unwrap();

    let target = Address::Domain("nowhere.invalid".into(), 80);
    let (mut stream, reply) = socks_connect(local.local_addr(), &target);
    assert_eq!(reply[1], 0x00);
    assert!(closed_without_data(&mut stream));
}

#[test]
fn test_unresolvable_server_reports_host_unreachable() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut local = RelayConfig::local("relay.test", 8388, "pw", "aes-256-gcm");
    local.local_port = 0;
    local.hosts_path = None;
    local.resolv_conf_path = None;
    local.dns_servers = vec![silent.local_addr().unwrap()];
    local.dns_timeout = Duration::from_millis(200);
    local.dns_retries = 1;
    let handle = ssrelay::start(local).unwrap();

    let target = Address::Domain("example.com".into(), 80);
    let (mut stream, reply) = socks_connect(handle.local_addr(), &target);
    assert_eq!(reply[1], socks5::Reply::HostUnreachable as u8);
    assert!(closed_without_data(&mut stream));
}

#[test]
fn test_udp_associate_round_trip() {
    let echo = echo_udp();
    let t = tunnel("aes-256-gcm", "pw", "pw");

    let mut control = TcpStream::connect(t.local.local_addr()).unwrap();
    control.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut method = [0u8; 2];
    control.read_exact(&mut method).unwrap();
    control
        .write_all(&[0x05, socks5::CMD_UDP_ASSOCIATE, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .unwrap();
    let mut reply = [0u8; 10];
    control.read_exact(&mut reply).unwrap();
    assert_eq!(reply[1], 0x00);
    let (relay_addr, _) = Address::parse(&reply[3..]).unwrap().unwrap();
    let Address::Socket(relay_addr) = relay_addr else {
        panic!("UDP relay address must be an IP");
    };
    assert_eq!(Some(relay_addr), t.local.udp_addr());

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut datagram = vec![0x00, 0x00, 0x00];
    Address::Socket(echo).write_to(&mut datagram).unwrap();
    datagram.extend_from_slice(b"udp ping");
    client.send_to(&datagram, relay_addr).unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    let response = socks5::parse_udp_request(&buf[..n]).unwrap();
    assert_eq!(response.target, Address::Socket(echo));
    assert_eq!(response.payload, b"udp ping");
}

#[test]
fn test_stop_closes_listener() {
    let t = tunnel("aes-256-gcm", "pw", "pw");
    let addr = t.local.local_addr();
    t.local.stop().unwrap();
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}
