//! End-to-end tests driving two `Chirp` instances over loopback TCP.
//!
//! Most scenarios disable encryption so they don't depend on generated
//! certificates; `tls_round_trip_over_loopback` forces encryption with
//! `Config::always_encrypt` (loopback is unencrypted by default) and a
//! self-signed certificate pair generated on the fly with `rcgen`,
//! exercising the accept-side and connect-side TLS handshakes end to
//! end.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use chirp::{Chirp, Config};

fn loopback_config(port: u16) -> Config {
    let mut cfg = Config::default();
    cfg.port = port;
    cfg.disable_encryption = true;
    cfg.disable_signals = true;
    cfg.timeout = Duration::from_millis(200);
    cfg.reuse_time = Duration::from_secs(1);
    cfg
}

async fn settle() {
    tokio::time::delay_for(Duration::from_millis(200)).await;
}

/// Generates a self-signed certificate/key pair and writes it to two
/// PEM files under the OS temp dir, tagged so concurrent tests don't
/// collide.
fn write_tls_material(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();

    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("chirp-test-{}-cert.pem", tag));
    let key_path = dir.join(format!("chirp-test-{}-key.pem", tag));
    std::fs::write(&cert_path, cert_pem).unwrap();
    std::fs::write(&key_path, key_pem).unwrap();
    (cert_path, key_path)
}

#[test]
fn echo_async_unencrypted_loopback() {
    let mut local = tokio::task::LocalSet::new();
    let mut rt = tokio::runtime::Builder::new()
        .basic_scheduler()
        .enable_all()
        .build()
        .unwrap();

    local.block_on(&mut rt, async {
        let server = Rc::new(Chirp::new(loopback_config(32000)).unwrap());
        let client = Chirp::new(loopback_config(32001)).unwrap();

        let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let received_for_server = received.clone();
        let server_for_cb = server.clone();
        server
            .start(move |msg| {
                received_for_server.borrow_mut().push(msg.data.clone());
                let mut echo = chirp::Message::new(msg.address, msg.port);
                echo.data = msg.data.clone();
                server_for_cb.send(echo, Box::new(|_| {}));
            })
            .await
            .unwrap();

        let client_received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let client_received_for_cb = client_received.clone();
        client
            .start(move |msg| {
                client_received_for_cb.borrow_mut().push(msg.data.clone());
            })
            .await
            .unwrap();

        settle().await;

        let mut msg = chirp::Message::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 32000);
        msg.data = b"hello chirp".to_vec();
        let sent = Rc::new(RefCell::new(None));
        let sent_for_cb = sent.clone();
        client.send(msg, Box::new(move |res| *sent_for_cb.borrow_mut() = Some(res)));

        settle().await;

        assert_eq!(sent.borrow().as_ref().unwrap(), &Ok(()));
        assert_eq!(received.borrow().as_slice(), &[b"hello chirp".to_vec()]);
        assert_eq!(
            client_received.borrow().as_slice(),
            &[b"hello chirp".to_vec()],
            "client's own recv callback must fire for replies arriving on its outbound connection"
        );

        client.close();
        server.close();
    });
}

#[test]
fn sync_request_reply_delivers_reply_to_client() {
    let mut local = tokio::task::LocalSet::new();
    let mut rt = tokio::runtime::Builder::new()
        .basic_scheduler()
        .enable_all()
        .build()
        .unwrap();

    local.block_on(&mut rt, async {
        let mut server_cfg = loopback_config(32030);
        server_cfg.synchronous = true;
        let mut client_cfg = loopback_config(32031);
        client_cfg.synchronous = true;

        let server = Rc::new(Chirp::new(server_cfg).unwrap());
        let client = Rc::new(Chirp::new(client_cfg).unwrap());

        let server_for_cb = server.clone();
        server
            .start(move |msg| {
                let mut reply = chirp::Message::new(msg.address, msg.port);
                reply.identity = msg.identity;
                reply.data = b"pong".to_vec();
                server_for_cb.send(reply, Box::new(|_| {}));
                server_for_cb.release_msg_slot(msg);
            })
            .await
            .unwrap();

        let client_for_cb = client.clone();
        let client_received: Rc<RefCell<Vec<chirp::Message>>> = Rc::new(RefCell::new(Vec::new()));
        let client_received_for_cb = client_received.clone();
        client
            .start(move |msg| {
                client_received_for_cb.borrow_mut().push(msg.clone());
                client_for_cb.release_msg_slot(msg);
            })
            .await
            .unwrap();

        settle().await;

        let mut ping = chirp::Message::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 32030);
        ping.identity = [2u8; 16];
        ping.data = b"ping".to_vec();
        let sent = Rc::new(RefCell::new(None));
        let sent_for_cb = sent.clone();
        client.send(ping, Box::new(move |res| *sent_for_cb.borrow_mut() = Some(res)));

        settle().await;

        assert_eq!(sent.borrow().as_ref().unwrap(), &Ok(()));
        let received = client_received.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].identity, [2u8; 16]);
        assert_eq!(received[0].data, b"pong".to_vec());

        client.close();
        server.close();
    });
}

#[test]
fn tls_round_trip_over_loopback() {
    let mut local = tokio::task::LocalSet::new();
    let mut rt = tokio::runtime::Builder::new()
        .basic_scheduler()
        .enable_all()
        .build()
        .unwrap();

    local.block_on(&mut rt, async {
        let (cert_path, key_path) = write_tls_material("round-trip");

        let mut server_cfg = loopback_config(32040);
        server_cfg.disable_encryption = false;
        server_cfg.always_encrypt = true;
        server_cfg.cert_chain_pem = Some(cert_path.clone());
        server_cfg.dh_params_pem = Some(key_path.clone());

        let mut client_cfg = loopback_config(32041);
        client_cfg.disable_encryption = false;
        client_cfg.always_encrypt = true;
        client_cfg.cert_chain_pem = Some(cert_path);
        client_cfg.dh_params_pem = Some(key_path);

        let server = Chirp::new(server_cfg).unwrap();
        let client = Chirp::new(client_cfg).unwrap();

        let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let received_for_server = received.clone();
        server
            .start(move |msg| {
                received_for_server.borrow_mut().push(msg.data.clone());
            })
            .await
            .unwrap();
        client.start(|_msg| {}).await.unwrap();

        settle().await;

        let mut msg = chirp::Message::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 32040);
        msg.data = b"hello over tls".to_vec();
        let sent = Rc::new(RefCell::new(None));
        let sent_for_cb = sent.clone();
        client.send(msg, Box::new(move |res| *sent_for_cb.borrow_mut() = Some(res)));

        settle().await;

        assert_eq!(sent.borrow().as_ref().unwrap(), &Ok(()));
        assert_eq!(received.borrow().as_slice(), &[b"hello over tls".to_vec()]);

        client.close();
        server.close();
    });
}

#[test]
fn send_to_unreachable_peer_fails_with_cannot_connect() {
    let mut local = tokio::task::LocalSet::new();
    let mut rt = tokio::runtime::Builder::new()
        .basic_scheduler()
        .enable_all()
        .build()
        .unwrap();

    local.block_on(&mut rt, async {
        let mut cfg = loopback_config(32010);
        cfg.timeout = Duration::from_millis(100);
        let client = Chirp::new(cfg).unwrap();
        client.start(|_| {}).await.unwrap();

        // Nothing is listening on 32099; the TCP connect attempt itself
        // should fail fast rather than hang for the full timeout.
        let mut msg = chirp::Message::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 32099);
        msg.data = b"noop".to_vec();
        let result = Rc::new(RefCell::new(None));
        let result_cb = result.clone();
        client.send(msg, Box::new(move |res| *result_cb.borrow_mut() = Some(res)));

        tokio::time::delay_for(Duration::from_millis(500)).await;

        assert_eq!(
            result.borrow().as_ref().unwrap(),
            &Err(chirp::ChirpError::CannotConnect)
        );
        client.close();
    });
}

#[test]
fn oversize_message_is_rejected_as_protocol_error() {
    let mut local = tokio::task::LocalSet::new();
    let mut rt = tokio::runtime::Builder::new()
        .basic_scheduler()
        .enable_all()
        .build()
        .unwrap();

    local.block_on(&mut rt, async {
        let mut server_cfg = loopback_config(32020);
        server_cfg.max_msg_size = 64;
        let server = Chirp::new(server_cfg).unwrap();
        let client = Chirp::new(loopback_config(32021)).unwrap();

        let received = Rc::new(RefCell::new(0u32));
        let received_cb = received.clone();
        server
            .start(move |_| *received_cb.borrow_mut() += 1)
            .await
            .unwrap();
        client.start(|_| {}).await.unwrap();
        settle().await;

        let mut msg = chirp::Message::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 32020);
        msg.data = vec![0u8; 4096];
        client.send(msg, Box::new(|_| {}));

        settle().await;

        assert_eq!(*received.borrow(), 0);
        client.close();
        server.close();
    });
}
