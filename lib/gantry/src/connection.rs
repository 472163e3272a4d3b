//! A single TCP connection: non-blocking read state machine producing whole
//! packages, a write queue of package handles drained on writability, and the
//! opening/closing lifecycle around the security handshake.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use plinth::crypto::AES_BLOCK_SIZE;
use plinth::logging::{self, Logger};

use crate::error::Result;
use crate::network::Network;
use crate::package::{Package, PackageHeader, HEADER_BASE_LEN, HEADER_LEN, MAX_CONTENT_LEN};
use crate::schema::builtin;
use crate::secure::{HandshakeStep, SecureChannel};
use crate::{CommandId, ConnId, PackageId, SecuritySetting, PACKAGE_VERSION};

/// Connection tokens start here; lower tokens belong to listeners.
pub(crate) const TOKEN_BASE: usize = 1024;

/// Large enough for the padded form of the largest allowed body.
const RECEIVE_BUF_LEN: usize =
    HEADER_LEN + ((MAX_CONTENT_LEN + AES_BLOCK_SIZE - 1) / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;

#[inline]
pub(crate) fn token_for(conn_id: ConnId) -> Token {
    Token(TOKEN_BASE + conn_id as usize)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpenType {
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    /// Waiting for the security setting to be decided.
    Opening,
    Open,
    /// Close requested, write queue still draining.
    Closing,
    /// Ready for reclamation by the reactor.
    Closed,
}

enum ReadPhase {
    Header,
    Content,
}

pub struct Connection {
    id: ConnId,
    socket: TcpStream,
    open_type: OpenType,
    status: Status,
    read_phase: ReadPhase,
    receive_buf: Box<[u8]>,
    receive_len: usize,
    send_list: VecDeque<PackageId>,
    send_len: usize,
    pending: VecDeque<PackageId>,
    secure: Option<SecureChannel>,
    writable_armed: bool,
    log: Logger,
}

impl Connection {
    fn new(id: ConnId, socket: TcpStream, open_type: OpenType, status: Status, log: Logger) -> Connection {
        Connection {
            id,
            socket,
            open_type,
            status,
            read_phase: ReadPhase::Header,
            receive_buf: vec![0u8; RECEIVE_BUF_LEN].into_boxed_slice(),
            receive_len: 0,
            send_list: VecDeque::new(),
            send_len: 0,
            pending: VecDeque::new(),
            secure: None,
            writable_armed: false,
            log,
        }
    }

    /// Wraps an accepted socket. The server side announces its security
    /// setting immediately and, for secure listeners, opens the key exchange.
    pub(crate) fn accept(
        id: ConnId,
        socket: TcpStream,
        security: SecuritySetting,
        net: &Network,
        registry: &Registry,
        log: &Logger,
    ) -> Connection {
        let conn_log = log.new(logging::o!("conn_id" => id));
        let peer = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let mut conn = Connection::new(id, socket, OpenType::Passive, Status::Open, conn_log);
        logging::info!(conn.log, "creates connection"; "peer" => peer, "open_type" => "passive");

        match net.store().register(1) {
            Ok(package) => {
                package.update_header(|header| header.command = builtin::NTF_SECURITY_SETTING);
                package.write_content(&[security.to_wire()]);
                conn.send_raw(net, registry, package);
            }
            Err(err) => {
                logging::error!(conn.log, "security notification failed"; "error" => ?err);
                conn.close_now();
                return conn;
            }
        }

        if security == SecuritySetting::Open {
            match SecureChannel::new_passive(net) {
                Ok((channel, request)) => {
                    conn.secure = Some(channel);
                    conn.send_raw(net, registry, request);
                }
                Err(err) => {
                    logging::error!(conn.log, "key pair generation failed"; "error" => ?err);
                    conn.close();
                }
            }
        }

        conn
    }

    /// Wraps an actively-opened socket. The connection stays `Opening`, with
    /// sends queued, until the peer announces its security setting.
    pub(crate) fn connect(id: ConnId, socket: TcpStream, peer: &str, log: &Logger) -> Connection {
        let conn_log = log.new(logging::o!("conn_id" => id));
        let conn = Connection::new(id, socket, OpenType::Active, Status::Opening, conn_log);
        logging::info!(conn.log, "creates connection"; "peer" => peer, "open_type" => "active");
        conn
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn open_type(&self) -> OpenType {
        self.open_type
    }

    /// A connection accepts sends while opening (they pend) or open.
    #[inline]
    pub(crate) fn is_send_ready(&self) -> bool {
        matches!(self.status, Status::Opening | Status::Open)
    }

    /// Queues a package for transmission, encrypting it first once the secure
    /// channel is up. Before the channel is decided the package pends.
    pub(crate) fn send(&mut self, net: &Network, registry: &Registry, package: Package) {
        if matches!(self.status, Status::Closing | Status::Closed) {
            let header = package.header();
            logging::error!(self.log, "send while closing";
                            "cmd" => header.command,
                            "trigger_id" => header.trigger_id);
            net.store().remove(package.id());
            return;
        }

        match self.secure.as_mut() {
            Some(channel) if !channel.is_started() => {
                channel.push_pending(package.id());
                return;
            }
            Some(channel) => {
                if let Err(err) = channel.encrypt_in_place(&package) {
                    logging::error!(self.log, "encrypt failed"; "error" => ?err);
                    net.store().remove(package.id());
                    return;
                }
            }
            None => {
                if self.status == Status::Opening {
                    self.pending.push_back(package.id());
                    return;
                }
            }
        }

        self.send_raw(net, registry, package);
    }

    /// Writes a package as-is, queueing the remainder on a partial write.
    pub(crate) fn send_raw(&mut self, net: &Network, registry: &Registry, package: Package) {
        let header = package.header();
        logging::debug!(self.log, "send package";
                        "cmd" => header.command,
                        "trigger_id" => header.trigger_id);

        if !self.send_list.is_empty() {
            self.send_list.push_back(package.id());
            return;
        }

        let len = package.wire_length();
        let result = {
            let socket = &mut self.socket;
            package.with_buf(|buf| socket.write(&buf[..len]))
        };

        match result {
            Ok(written) if written == len => {
                net.store().remove(package.id());
            }
            Ok(written) => {
                self.send_len = written;
                self.send_list.push_back(package.id());
                self.set_writable_interest(registry, true);
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                self.send_len = 0;
                self.send_list.push_back(package.id());
                self.set_writable_interest(registry, true);
            }
            Err(err) => {
                logging::error!(self.log, "send error"; "error" => %err);
                net.store().remove(package.id());
                self.close_now();
            }
        }
    }

    /// Drains the write queue while the socket stays writable. Fully-sent
    /// packages are removed from the store.
    pub(crate) fn on_writable(&mut self, net: &Network, registry: &Registry) {
        if self.status == Status::Closed {
            return;
        }

        loop {
            let package = loop {
                match self.send_list.front().copied() {
                    None => break None,
                    Some(package_id) => match net.store().find(package_id) {
                        Some(package) => break Some(package),
                        None => {
                            self.send_list.pop_front();
                            self.send_len = 0;
                        }
                    },
                }
            };

            let package = match package {
                Some(package) => package,
                None => break,
            };

            let len = package.wire_length();
            let offset = self.send_len;
            let result = {
                let socket = &mut self.socket;
                package.with_buf(|buf| socket.write(&buf[offset..len]))
            };

            match result {
                Ok(written) => {
                    self.send_len += written;
                    if self.send_len == len {
                        self.send_len = 0;
                        self.send_list.pop_front();
                        net.store().remove(package.id());
                        continue;
                    }
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "send error"; "error" => %err);
                    self.close_now();
                    return;
                }
            }
        }

        self.set_writable_interest(registry, false);
        if self.status == Status::Closing {
            self.status = Status::Closed;
        }
    }

    pub(crate) fn on_readable(&mut self, net: &Network, registry: &Registry) {
        if matches!(self.status, Status::Closing | Status::Closed) {
            return;
        }

        self.read_for_state(net, registry);
    }

    fn read_for_state(&mut self, net: &Network, registry: &Registry) {
        loop {
            match self.read_phase {
                ReadPhase::Header => {
                    let result = {
                        let socket = &mut self.socket;
                        socket.read(&mut self.receive_buf[self.receive_len..HEADER_LEN])
                    };
                    let read = match result {
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            logging::error!(self.log, "read error"; "error" => %err);
                            self.close_now();
                            return;
                        }
                        Ok(0) => {
                            logging::info!(self.log, "closed by peer");
                            self.close();
                            return;
                        }
                        Ok(read) => read,
                    };
                    self.receive_len += read;

                    // Validate the version as soon as it is on hand, before
                    // committing to the rest of the header.
                    if self.receive_len >= HEADER_BASE_LEN {
                        let (version, command) = PackageHeader::read_base(&self.receive_buf);
                        if version != PACKAGE_VERSION {
                            self.notify_invalid_version(net, registry, command);
                            return;
                        }
                    }

                    if self.receive_len == HEADER_LEN {
                        self.receive_len = 0;
                        self.read_phase = ReadPhase::Content;
                    }
                }
                ReadPhase::Content => {
                    let header = PackageHeader::read_from(&self.receive_buf);
                    if header.content_length < 0 || header.content_length as usize > MAX_CONTENT_LEN {
                        logging::error!(self.log, "content length out of range";
                                        "cmd" => header.command,
                                        "content_length" => header.content_length);
                        self.close();
                        return;
                    }

                    let content_length = header.content_length as usize;
                    let wire_len = match &self.secure {
                        Some(channel) => channel.wire_body_length(content_length),
                        None => content_length,
                    };

                    if self.receive_len < wire_len {
                        let result = {
                            let socket = &mut self.socket;
                            socket.read(
                                &mut self.receive_buf
                                    [HEADER_LEN + self.receive_len..HEADER_LEN + wire_len],
                            )
                        };
                        let read = match result {
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                            Err(err) => {
                                logging::error!(self.log, "read error"; "error" => %err);
                                self.close_now();
                                return;
                            }
                            Ok(0) => {
                                logging::info!(self.log, "closed by peer");
                                self.close();
                                return;
                            }
                            Ok(read) => read,
                        };
                        self.receive_len += read;
                    }

                    if self.receive_len == wire_len {
                        self.receive_len = 0;
                        self.read_phase = ReadPhase::Header;
                        if !self.on_complete_package(net, registry, header, wire_len) {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handles one fully-received package. Returns false to stop reading.
    fn on_complete_package(
        &mut self,
        net: &Network,
        registry: &Registry,
        header: PackageHeader,
        wire_len: usize,
    ) -> bool {
        logging::debug!(self.log, "receive package";
                        "cmd" => header.command,
                        "trigger_id" => header.trigger_id);

        if header.command == builtin::NTF_SECURITY_SETTING {
            return self.on_security_setting(net, registry, &header);
        }

        if self.status == Status::Opening {
            logging::info!(self.log, "ignore package while opening"; "cmd" => header.command);
            return false;
        }

        enum Step {
            Plain,
            Handshake(Result<HandshakeStep>),
            Decrypt(Result<Package>),
        }

        let step = match self.secure.as_mut() {
            None => Step::Plain,
            Some(channel) if !channel.is_started() => Step::Handshake(channel.on_handshake_package(
                net,
                self.open_type,
                &header,
                &self.receive_buf[HEADER_LEN..HEADER_LEN + wire_len],
            )),
            Some(channel) => Step::Decrypt(channel.decrypt_package(
                net,
                &header,
                &self.receive_buf[HEADER_LEN..HEADER_LEN + wire_len],
            )),
        };

        match step {
            Step::Plain => {
                match net.store().register(header.content_length) {
                    Ok(package) => {
                        package.set_header(&header);
                        package.write_content(&self.receive_buf[HEADER_LEN..HEADER_LEN + wire_len]);
                        net.deliver_inbound(self.id, package.id());
                    }
                    Err(err) => {
                        logging::error!(self.log, "receive package rejected"; "error" => ?err);
                    }
                }
                true
            }
            Step::Handshake(Ok(HandshakeStep::Reply(reply))) => {
                logging::debug!(self.log, "crypto started");
                self.send_raw(net, registry, reply);
                self.drain_secure_pending(net, registry);
                true
            }
            Step::Handshake(Ok(HandshakeStep::Started)) => {
                logging::debug!(self.log, "crypto started");
                self.drain_secure_pending(net, registry);
                true
            }
            Step::Handshake(Ok(HandshakeStep::Ignored)) => {
                logging::info!(self.log, "ignore package during key exchange"; "cmd" => header.command);
                true
            }
            Step::Handshake(Err(err)) => {
                logging::error!(self.log, "key exchange failed"; "error" => ?err);
                self.close_now();
                false
            }
            Step::Decrypt(Ok(package)) => {
                net.deliver_inbound(self.id, package.id());
                true
            }
            Step::Decrypt(Err(err)) => {
                logging::error!(self.log, "decrypt failed"; "error" => ?err);
                self.close_now();
                false
            }
        }
    }

    /// Security setting announcement from the passive peer. Only valid once,
    /// while this side is still opening.
    fn on_security_setting(&mut self, net: &Network, registry: &Registry, header: &PackageHeader) -> bool {
        if self.open_type == OpenType::Passive {
            logging::error!(self.log, "unexpected security notification";
                            "open_type" => "passive");
            self.close();
            return false;
        }

        if self.status != Status::Opening {
            logging::error!(self.log, "security change after open");
            self.close();
            return false;
        }

        if (header.content_length as usize) < 1 {
            logging::error!(self.log, "security setting content too short";
                            "content_length" => header.content_length);
            self.close();
            return false;
        }

        let setting = match SecuritySetting::from_wire(self.receive_buf[HEADER_LEN]) {
            Some(setting) => setting,
            None => {
                logging::error!(self.log, "unknown security setting";
                                "value" => self.receive_buf[HEADER_LEN]);
                self.close();
                return false;
            }
        };

        self.status = Status::Open;
        if setting == SecuritySetting::Open {
            self.secure = Some(SecureChannel::new_active());
        }

        logging::debug!(self.log, "connection open"; "security" => ?setting);
        self.drain_pending(net, registry);
        true
    }

    fn drain_pending(&mut self, net: &Network, registry: &Registry) {
        while let Some(package_id) = self.pending.pop_front() {
            if let Some(package) = net.store().find(package_id) {
                self.send(net, registry, package);
            }
        }
    }

    fn drain_secure_pending(&mut self, net: &Network, registry: &Registry) {
        let pending = match self.secure.as_mut() {
            Some(channel) => channel.take_pending(),
            None => return,
        };

        for package_id in pending {
            if let Some(package) = net.store().find(package_id) {
                self.send(net, registry, package);
            }
        }
    }

    /// Best-effort peer notification, then close. An inbound
    /// `NTF_INVALID_VERSION` is not answered, so two mismatched peers cannot
    /// ping-pong forever.
    fn notify_invalid_version(&mut self, net: &Network, registry: &Registry, command: CommandId) {
        logging::info!(self.log, "package version invalid"; "cmd" => command);

        if command != builtin::NTF_INVALID_VERSION {
            match net.store().register(0) {
                Ok(package) => {
                    package.update_header(|header| header.command = builtin::NTF_INVALID_VERSION);
                    self.send_raw(net, registry, package);
                }
                Err(err) => {
                    logging::error!(self.log, "version notification failed"; "error" => ?err);
                }
            }
        }

        self.close();
    }

    /// Requests closure. The connection is reclaimed once the write queue has
    /// drained, so nothing queued is dropped mid-flight.
    pub(crate) fn close(&mut self) {
        if self.status == Status::Closed {
            return;
        }

        self.status = match self.send_list.is_empty() {
            true => Status::Closed,
            false => Status::Closing,
        };
    }

    /// Immediate closure, dropping whatever is still queued.
    pub(crate) fn close_now(&mut self) {
        self.status = Status::Closed;
    }

    /// Releases everything the connection still owns. Called by the reactor
    /// right before the connection is dropped.
    pub(crate) fn destroy(&mut self, net: &Network, registry: &Registry) {
        logging::info!(self.log, "destroys connection");

        if let Err(err) = registry.deregister(&mut self.socket) {
            logging::debug!(self.log, "deregister failed"; "error" => %err);
        }

        while let Some(package_id) = self.send_list.pop_front() {
            net.store().remove(package_id);
        }
        while let Some(package_id) = self.pending.pop_front() {
            net.store().remove(package_id);
        }
        if let Some(channel) = self.secure.as_mut() {
            for package_id in channel.take_pending() {
                net.store().remove(package_id);
            }
        }

        net.services().uncache_connection(self.id);
    }

    fn set_writable_interest(&mut self, registry: &Registry, armed: bool) {
        if self.writable_armed == armed {
            return;
        }

        let interest = match armed {
            true => Interest::READABLE | Interest::WRITABLE,
            false => Interest::READABLE,
        };

        if let Err(err) = registry.reregister(&mut self.socket, token_for(self.id), interest) {
            logging::error!(self.log, "reregister failed"; "error" => %err);
            return;
        }

        self.writable_armed = armed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InboundEntry, MessageQueues};
    use crate::schema::CommandTable;
    use crate::service::ServiceManager;
    use crate::store::PackageStore;
    use plinth::crypto::{self, aes_cipher_length, AesBlockCipher, AesKey};
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_network() -> Network {
        Network::new(
            Arc::new(PackageStore::new()),
            Arc::new(MessageQueues::new()),
            Arc::new(ServiceManager::new()),
            Arc::new(CommandTable::new()),
            plinth::logging::discard(),
        )
    }

    /// Connected (mio, std) stream pair with the mio end non-blocking and
    /// registered on a live poll.
    fn socket_pair(poll: &mio::Poll, conn_id: ConnId) -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = StdStream::connect(addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut stream = TcpStream::from_std(accepted);

        poll.registry()
            .register(&mut stream, token_for(conn_id), Interest::READABLE)
            .unwrap();

        (stream, peer)
    }

    fn read_header(peer: &mut StdStream) -> PackageHeader {
        let mut buf = [0u8; HEADER_LEN];
        peer.read_exact(&mut buf).unwrap();
        PackageHeader::read_from(&buf)
    }

    fn read_package(peer: &mut StdStream, body_len: usize) -> (PackageHeader, Vec<u8>) {
        let header = read_header(peer);
        let mut body = vec![0u8; body_len];
        peer.read_exact(&mut body).unwrap();
        (header, body)
    }

    fn write_package(peer: &mut StdStream, header: &PackageHeader, body: &[u8]) {
        let mut buf = vec![0u8; HEADER_LEN + body.len()];
        header.write_to(&mut buf);
        buf[HEADER_LEN..].copy_from_slice(body);
        peer.write_all(&buf).unwrap();
    }

    /// Reads until at least one event or the package queue moves on.
    fn pump_readable(conn: &mut Connection, net: &Network, poll: &mio::Poll) {
        // The peer write has already landed by the time tests call this; a
        // short settle keeps slow CI machines honest.
        std::thread::sleep(Duration::from_millis(20));
        conn.on_readable(net, poll.registry());
    }

    #[test]
    fn test_accept_plain_announces_security() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, mut peer) = socket_pair(&poll, 1);

        let conn = Connection::accept(
            1,
            stream,
            SecuritySetting::Close,
            &net,
            poll.registry(),
            &plinth::logging::discard(),
        );

        assert_eq!(conn.status(), Status::Open);

        let (header, body) = read_package(&mut peer, 1);
        assert_eq!(header.version, PACKAGE_VERSION);
        assert_eq!(header.command, builtin::NTF_SECURITY_SETTING);
        assert_eq!(header.content_length, 1);
        assert_eq!(body, [SecuritySetting::Close.to_wire()]);

        // The notification was sent and freed.
        assert_eq!(net.store().size(), 0);
    }

    #[test]
    fn test_accept_secure_sends_crypto_request() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, mut peer) = socket_pair(&poll, 1);

        let conn = Connection::accept(
            1,
            stream,
            SecuritySetting::Open,
            &net,
            poll.registry(),
            &plinth::logging::discard(),
        );
        assert_eq!(conn.status(), Status::Open);

        let (_, body) = read_package(&mut peer, 1);
        assert_eq!(body, [SecuritySetting::Open.to_wire()]);

        let header = read_header(&mut peer);
        assert_eq!(header.command, builtin::REQ_START_CRYPTO);
        assert!(header.content_length > 0);

        let mut der = vec![0u8; header.content_length as usize];
        peer.read_exact(&mut der).unwrap();
        assert!(crypto::RsaPublicKey::from_der(&der).is_ok());
    }

    #[test]
    fn test_plain_package_reaches_inbound_queue() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, mut peer) = socket_pair(&poll, 1);

        let mut conn = Connection::accept(
            1,
            stream,
            SecuritySetting::Close,
            &net,
            poll.registry(),
            &plinth::logging::discard(),
        );
        read_package(&mut peer, 1);

        write_package(
            &mut peer,
            &PackageHeader {
                version: PACKAGE_VERSION,
                command: 1234,
                self_id: 17,
                trigger_id: 0,
                content_length: 5,
            },
            b"hello",
        );

        pump_readable(&mut conn, &net, &poll);

        let msg = match net.queues().inbound.pop() {
            Some(InboundEntry::Network(msg)) => msg,
            _ => panic!("expected an inbound package"),
        };
        assert_eq!(msg.conn_id, 1);

        let package = net.store().get(msg.package_id).unwrap();
        let header = package.header();
        assert_eq!(header.command, 1234);
        assert_eq!(header.self_id, 17);
        package.content(|body| assert_eq!(body, b"hello"));
    }

    #[test]
    fn test_version_mismatch_notifies_once_and_closes() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, mut peer) = socket_pair(&poll, 1);

        let mut conn = Connection::accept(
            1,
            stream,
            SecuritySetting::Close,
            &net,
            poll.registry(),
            &plinth::logging::discard(),
        );
        read_package(&mut peer, 1);

        write_package(
            &mut peer,
            &PackageHeader {
                version: 0,
                command: 77,
                self_id: 0,
                trigger_id: 0,
                content_length: 0,
            },
            &[],
        );

        pump_readable(&mut conn, &net, &poll);

        let header = read_header(&mut peer);
        assert_eq!(header.command, builtin::NTF_INVALID_VERSION);
        assert_eq!(header.content_length, 0);

        assert_eq!(conn.status(), Status::Closed);

        // Closed connections process no further reads.
        write_package(
            &mut peer,
            &PackageHeader {
                version: PACKAGE_VERSION,
                command: 1,
                self_id: 0,
                trigger_id: 0,
                content_length: 0,
            },
            &[],
        );
        pump_readable(&mut conn, &net, &poll);
        assert!(net.queues().inbound.is_empty());
    }

    #[test]
    fn test_send_while_closing_frees_package() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, _peer) = socket_pair(&poll, 1);

        let mut conn = Connection::accept(
            1,
            stream,
            SecuritySetting::Close,
            &net,
            poll.registry(),
            &plinth::logging::discard(),
        );
        conn.close_now();

        let package = net.store().register(4).unwrap();
        let package_id = package.id();
        conn.send(&net, poll.registry(), package);

        assert!(net.store().find(package_id).is_none());
    }

    #[test]
    fn test_active_connection_pends_until_security_decided() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, mut peer) = socket_pair(&poll, 1);

        let mut conn = Connection::connect(1, stream, "peer", &plinth::logging::discard());
        assert_eq!(conn.status(), Status::Opening);

        // Submitted before the security setting arrives: must pend.
        let package = net.store().register(3).unwrap();
        package.update_header(|header| header.command = 1500);
        package.write_content(b"abc");
        conn.send(&net, poll.registry(), package);
        assert_eq!(net.store().size(), 1);

        // Peer announces a plain connection.
        write_package(
            &mut peer,
            &PackageHeader {
                version: PACKAGE_VERSION,
                command: builtin::NTF_SECURITY_SETTING,
                self_id: 0,
                trigger_id: 0,
                content_length: 1,
            },
            &[SecuritySetting::Close.to_wire()],
        );

        pump_readable(&mut conn, &net, &poll);
        assert_eq!(conn.status(), Status::Open);

        // The pending package went out raw.
        let (header, body) = read_package(&mut peer, 3);
        assert_eq!(header.command, 1500);
        assert_eq!(body, b"abc");
        assert_eq!(net.store().size(), 0);
    }

    #[test]
    fn test_active_secure_handshake_and_roundtrip() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, mut peer) = socket_pair(&poll, 1);

        let mut conn = Connection::connect(1, stream, "peer", &plinth::logging::discard());

        // A package submitted while the channel is undecided pends twice:
        // first on the connection, then on the starting channel.
        let package = net.store().register(4).unwrap();
        package.update_header(|header| header.command = 1600);
        package.write_content(b"ping");
        conn.send(&net, poll.registry(), package);

        // Server side of the exchange, driven by hand.
        let pair = crypto::generate_rsa_key_pair().unwrap();
        let der = pair.public.to_der().unwrap();

        write_package(
            &mut peer,
            &PackageHeader {
                version: PACKAGE_VERSION,
                command: builtin::NTF_SECURITY_SETTING,
                self_id: 0,
                trigger_id: 0,
                content_length: 1,
            },
            &[SecuritySetting::Open.to_wire()],
        );
        write_package(
            &mut peer,
            &PackageHeader {
                version: PACKAGE_VERSION,
                command: builtin::REQ_START_CRYPTO,
                self_id: 0,
                trigger_id: 0,
                content_length: der.len() as i32,
            },
            &der,
        );

        pump_readable(&mut conn, &net, &poll);
        assert_eq!(conn.status(), Status::Open);

        // First reply: the wrapped AES key, raw.
        let wrapped_header = read_header(&mut peer);
        assert_eq!(wrapped_header.command, builtin::RSP_START_CRYPTO);
        let mut wrapped = vec![0u8; wrapped_header.content_length as usize];
        peer.read_exact(&mut wrapped).unwrap();

        let key = AesKey::from_slice(&pair.private.decrypt(&wrapped).unwrap()).unwrap();
        let cipher = AesBlockCipher::new(&key);

        // Second: the pending package, now encrypted.
        let (header, mut body) = {
            let header = read_header(&mut peer);
            assert_eq!(header.command, 1600);
            assert_eq!(header.content_length, 4);
            let mut body = vec![0u8; aes_cipher_length(4)];
            peer.read_exact(&mut body).unwrap();
            (header, body)
        };
        cipher.decrypt_blocks(&mut body);
        assert_eq!(&body[..header.content_length as usize], b"ping");

        // Encrypted traffic from the peer decrypts into the inbound queue.
        let mut request = b"pong!".to_vec();
        request.resize(aes_cipher_length(5), 0);
        cipher.encrypt_blocks(&mut request);
        write_package(
            &mut peer,
            &PackageHeader {
                version: PACKAGE_VERSION,
                command: 1601,
                self_id: 9,
                trigger_id: 0,
                content_length: 5,
            },
            &request,
        );

        pump_readable(&mut conn, &net, &poll);

        let msg = match net.queues().inbound.pop() {
            Some(InboundEntry::Network(msg)) => msg,
            _ => panic!("expected an inbound package"),
        };
        let package = net.store().get(msg.package_id).unwrap();
        assert_eq!(package.header().command, 1601);
        package.content(|body| assert_eq!(body, b"pong!"));
    }

    #[test]
    fn test_destroy_frees_queued_packages() {
        let net = test_network();
        let poll = mio::Poll::new().unwrap();
        let (stream, _peer) = socket_pair(&poll, 1);

        let mut conn = Connection::connect(1, stream, "peer", &plinth::logging::discard());

        // Still opening: these pend on the connection.
        for _ in 0..3 {
            let package = net.store().register(1).unwrap();
            conn.send(&net, poll.registry(), package);
        }
        assert_eq!(net.store().size(), 3);

        conn.close_now();
        conn.destroy(&net, poll.registry());
        assert_eq!(net.store().size(), 0);
    }
}
