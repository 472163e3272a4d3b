//! End-to-end scenarios over real loopback sockets: the secure handshake with
//! a message round trip, version rejection, and a multi-phase relay between
//! two nodes through a lazily-connected service.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use plinth::crypto::{aes_cipher_length, AesBlockCipher, AesKey, RsaPublicKey};
use plinth::logging;
use serde_derive::{Deserialize, Serialize};

use gantry::config::{ListenConfig, LogConfig, NodeConfig, PeerConfig};
use gantry::error::Result;
use gantry::node::Node;
use gantry::package::{PackageHeader, HEADER_LEN};
use gantry::schema::{self, builtin, Message};
use gantry::transaction::{MultiPhaseTransaction, TransState};
use gantry::worker::WorkerCtx;
use gantry::{ConnId, SecuritySetting, ServiceId, PACKAGE_VERSION};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct ReqEcho {
    text: String,
}

impl Message for ReqEcho {
    const NAME: &'static str = "ReqEcho";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct RspEcho {
    text: String,
}

impl Message for RspEcho {
    const NAME: &'static str = "RspEcho";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct ReqPut {
    name: String,
    content: Vec<u8>,
}

impl Message for ReqPut {
    const NAME: &'static str = "ReqPut";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct RspPut {}

impl Message for RspPut {
    const NAME: &'static str = "RspPut";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct ReqStore {
    name: String,
    content: Vec<u8>,
}

impl Message for ReqStore {
    const NAME: &'static str = "ReqStore";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct RspStore {}

impl Message for RspStore {
    const NAME: &'static str = "RspStore";
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn node_config(port: u16, security: SecuritySetting, peers: Vec<PeerConfig>) -> NodeConfig {
    NodeConfig {
        listen: ListenConfig {
            ip: "127.0.0.1".to_string(),
            port,
            security,
        },
        peers,
        root_user: None,
        log: LogConfig::default(),
        data_file: None,
    }
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn write_package(stream: &mut TcpStream, header: &PackageHeader, body: &[u8]) {
    let mut buf = vec![0u8; HEADER_LEN + body.len()];
    header.write_to(&mut buf);
    buf[HEADER_LEN..].copy_from_slice(body);
    stream.write_all(&buf).unwrap();
}

fn read_header(stream: &mut TcpStream) -> PackageHeader {
    let mut buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut buf).unwrap();
    PackageHeader::read_from(&buf)
}

fn read_body(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    body
}

fn request_header(command: i32, self_id: i32, content_length: usize) -> PackageHeader {
    PackageHeader {
        version: PACKAGE_VERSION,
        command,
        self_id,
        trigger_id: 0,
        content_length: content_length as i32,
    }
}

/// Scenario: secure listener, full key exchange by hand, then an encrypted
/// request answered by the registered one-phase handler.
#[test]
fn test_secure_handshake_and_echo_roundtrip() {
    let port = free_port();

    let mut node = Node::new(node_config(port, SecuritySetting::Open, Vec::new()), logging::discard());
    node.register_message::<ReqEcho>().unwrap();
    node.register_message::<RspEcho>().unwrap();
    node.register_one_phase::<ReqEcho>(Box::new(|ctx, conn_id, package| {
        let req: ReqEcho = package.decode()?;
        ctx.net.send_back_message(
            conn_id,
            &RspEcho {
                text: req.text.to_uppercase(),
            },
            &package.get_trigger_source(),
        )?;
        Ok(())
    }))
    .unwrap();

    let echo_cmd = node.commands().command_of::<ReqEcho>().unwrap();
    let echo_rsp_cmd = node.commands().command_of::<RspEcho>().unwrap();

    let running = node.spawn().unwrap();
    let mut client = connect(port);

    // Server speaks first: security setting, then the crypto request.
    let header = read_header(&mut client);
    assert_eq!(header.command, builtin::NTF_SECURITY_SETTING);
    assert_eq!(read_body(&mut client, header.content_length as usize), [1]);

    let header = read_header(&mut client);
    assert_eq!(header.command, builtin::REQ_START_CRYPTO);
    let der = read_body(&mut client, header.content_length as usize);
    let public = RsaPublicKey::from_der(&der).unwrap();

    // Wrap a fresh key and finish the exchange.
    let key = AesKey::random();
    let wrapped = public.encrypt(key.as_bytes()).unwrap();
    write_package(
        &mut client,
        &request_header(builtin::RSP_START_CRYPTO, 0, wrapped.len()),
        &wrapped,
    );

    // Encrypted request.
    let cipher = AesBlockCipher::new(&key);
    let plain = schema::encode(&ReqEcho {
        text: "hello".to_string(),
    })
    .unwrap();
    let mut body = plain.clone();
    body.resize(aes_cipher_length(plain.len()), 0);
    cipher.encrypt_blocks(&mut body);
    write_package(&mut client, &request_header(echo_cmd, 17, plain.len()), &body);

    // Encrypted reply correlates back via the trigger id.
    let header = read_header(&mut client);
    assert_eq!(header.command, echo_rsp_cmd);
    assert_eq!(header.trigger_id, 17);

    let mut body = read_body(&mut client, aes_cipher_length(header.content_length as usize));
    cipher.decrypt_blocks(&mut body);
    let reply: RspEcho = schema::decode(&body[..header.content_length as usize]).unwrap();
    assert_eq!(reply.text, "HELLO");

    running.stop();
    running.join();
}

/// Scenario: a peer with the wrong protocol version is told once and cut off.
#[test]
fn test_version_mismatch_is_rejected() {
    let port = free_port();

    let node = Node::new(node_config(port, SecuritySetting::Close, Vec::new()), logging::discard());
    let running = node.spawn().unwrap();

    let mut client = connect(port);

    let header = read_header(&mut client);
    assert_eq!(header.command, builtin::NTF_SECURITY_SETTING);
    read_body(&mut client, header.content_length as usize);

    // Broken version field.
    write_package(
        &mut client,
        &PackageHeader {
            version: 0,
            command: 77,
            self_id: 0,
            trigger_id: 0,
            content_length: 0,
        },
        &[],
    );

    let header = read_header(&mut client);
    assert_eq!(header.command, builtin::NTF_INVALID_VERSION);
    assert_eq!(header.content_length, 0);

    // The server closes; nothing further arrives.
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => (),
        Ok(read) => panic!("expected the server to close, read {} bytes", read),
    }

    running.stop();
    running.join();
}

/// Relays a put request to the storage service and answers the origin once
/// the storage node confirmed.
struct PutTrans {
    storage: ServiceId,
}

impl MultiPhaseTransaction for PutTrans {
    fn on_init(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        package: &gantry::package::Package,
    ) -> Result<()> {
        let req: ReqPut = package.decode()?;

        state.service_send_bound(
            ctx,
            self.storage,
            &ReqStore {
                name: req.name,
                content: req.content,
            },
        )?;

        let wait_cmd = ctx.net.commands().command_of::<RspStore>()?;
        state.service_wait_next_phase(ctx, self.storage, wait_cmd, 1, Duration::from_secs(30));
        Ok(())
    }

    fn on_active(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        package: &gantry::package::Package,
    ) -> Result<()> {
        let _confirm: RspStore = package.decode()?;
        state.send_back(ctx.net, &RspPut {})?;
        Ok(())
    }
}

fn register_protocol(node: &mut Node) {
    node.register_message::<ReqPut>().unwrap();
    node.register_message::<RspPut>().unwrap();
    node.register_message::<ReqStore>().unwrap();
    node.register_message::<RspStore>().unwrap();
}

/// Scenario: multi-phase transaction across two nodes. The front node's
/// connection to the storage service is created lazily on first send.
#[test]
fn test_multi_phase_relay_over_lazy_service() {
    let storage_port = free_port();
    let front_port = free_port();

    // Storage node: confirms every store request.
    let mut storage = Node::new(
        node_config(storage_port, SecuritySetting::Close, Vec::new()),
        logging::discard(),
    );
    register_protocol(&mut storage);
    storage
        .register_one_phase::<ReqStore>(Box::new(|ctx, conn_id, package| {
            let req: ReqStore = package.decode()?;
            assert_eq!(req.name, "notes.txt");
            ctx.net
                .send_back_message(conn_id, &RspStore {}, &package.get_trigger_source())?;
            Ok(())
        }))
        .unwrap();

    // Front node: relays put requests to the storage peer.
    let mut front = Node::new(
        node_config(
            front_port,
            SecuritySetting::Close,
            vec![PeerConfig {
                ip: "127.0.0.1".to_string(),
                port: storage_port,
            }],
        ),
        logging::discard(),
    );
    register_protocol(&mut front);

    let storage_service = front.find_service("127.0.0.1", storage_port).unwrap();
    front
        .register_multi_phase::<ReqPut>(Box::new(move || {
            Box::new(PutTrans {
                storage: storage_service,
            }) as Box<dyn MultiPhaseTransaction>
        }))
        .unwrap();

    let put_cmd = front.commands().command_of::<ReqPut>().unwrap();
    let put_rsp_cmd = front.commands().command_of::<RspPut>().unwrap();

    let storage_running = storage.spawn().unwrap();
    let front_running = front.spawn().unwrap();

    let mut client = connect(front_port);

    let header = read_header(&mut client);
    assert_eq!(header.command, builtin::NTF_SECURITY_SETTING);
    assert_eq!(read_body(&mut client, header.content_length as usize), [0]);

    let body = schema::encode(&ReqPut {
        name: "notes.txt".to_string(),
        content: b"content".to_vec(),
    })
    .unwrap();
    write_package(&mut client, &request_header(put_cmd, 5, body.len()), &body);

    // The reply arrives only after the relay round trip completed.
    let header = read_header(&mut client);
    assert_eq!(header.command, put_rsp_cmd);
    assert_eq!(header.trigger_id, 5);
    let reply: RspPut = schema::decode(&read_body(&mut client, header.content_length as usize)).unwrap();
    assert_eq!(reply, RspPut {});

    front_running.stop();
    front_running.join();
    storage_running.stop();
    storage_running.join();
}
