//! Party-to-party transport: TOML network config, the TLS mesh and an in-memory network.
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fs, thread};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use serde::Deserialize;
use tracing::debug;

use crate::party::error::MpcResult;
use crate::party::{PartyId, ProtocolConfig, Topology};

pub mod local;
pub mod message;
pub mod task;

use self::message::Message;

/// Sends messages to other parties. Delivery is reliable, and in order per sender.
pub trait Transport: Send + Sync {
    fn send(&self, to: PartyId, message: Message) -> MpcResult<()>;

    /// Flushes and closes all connections. Later sends fail.
    fn shutdown(&self) -> MpcResult<()> {
        Ok(())
    }
}

/// What the dispatcher of a party receives.
#[derive(Debug)]
pub enum Inbound {
    Message { from: PartyId, message: Message },
    Shutdown,
}

pub type Inbox = Sender<Inbound>;

pub struct Config {
    /// 0-based index into the party list
    pub party_index: usize,
    pub topology: Topology,
    pub protocol: ProtocolConfig,
    addresses: Vec<(IpAddr, u16)>,
    certificates: Vec<CertificateDer<'static>>,
    my_key: PrivateKeyDer<'static>,
}

impl Config {
    pub fn new(party_index: usize, topology: Topology, protocol: ProtocolConfig, addresses: Vec<(IpAddr, u16)>, certificates: Vec<CertificateDer<'static>>, my_key: PrivateKeyDer<'static>) -> Self {
        Self { party_index, topology, protocol, addresses, certificates, my_key }
    }

    pub fn id(&self) -> PartyId {
        self.topology.id_at(self.party_index)
    }

    fn load_certificate_from_file(config_path: &Path, cert_path: &Path) -> io::Result<CertificateDer<'static>> {
        let mut path = PathBuf::from(config_path);
        path.push(cert_path);
        let mut reader = BufReader::new(File::open(&path)?);
        let cert: io::Result<Vec<_>> = rustls_pemfile::certs(&mut reader).collect();
        let cert = cert?;
        if cert.len() != 1 {
            return Err(io::Error::new(ErrorKind::InvalidData, format!("Found {} certificates in {}, expected 1", cert.len(), path.display())));
        }
        return Ok(cert[0].clone());
    }

    fn load_private_key_from_file(config_path: &Path, key_path: &Path) -> io::Result<PrivateKeyDer<'static>> {
        let mut path = PathBuf::from(config_path);
        path.push(key_path);
        let mut reader = BufReader::new(File::open(&path)?);
        let key = rustls_pemfile::private_key(&mut reader)?;
        return key.ok_or(io::Error::new(ErrorKind::InvalidData, format!("Invalid private key in {}", path.display())));
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file_content = fs::read_to_string(path)?;
        let parsed: SerializedConfig = toml::from_str(&file_content)
            .map_err(|ser| io::Error::new(ErrorKind::InvalidData, format!("{}", ser)))?;
        let default_parent_dir = PathBuf::from("./");
        let parent_dir = path.parent().unwrap_or(&default_parent_dir);
        Self::from_serialized(parsed, parent_dir)
    }

    fn from_serialized(parsed: SerializedConfig, parent_dir: &Path) -> io::Result<Self> {
        let invalid = |msg: String| io::Error::new(ErrorKind::InvalidData, msg);
        let topology = Topology::new(parsed.owners, parsed.replicas)
            .map_err(|err| invalid(err.to_string()))?;
        if parsed.parties.len() != topology.size() {
            return Err(invalid(format!("Expected {} [[parties]] entries for {} owners with {} replicas, found {}", topology.size(), parsed.owners, parsed.replicas, parsed.parties.len())));
        }
        if parsed.party_index < 1 || parsed.party_index > parsed.parties.len() {
            return Err(invalid(format!("Invalid party_index: {}; must be 1 <= party_index <= {}", parsed.party_index, parsed.parties.len())));
        }

        // parties may be listed in any order; store them by flat index
        let mut slots: Vec<Option<&SerializedPartyConfig>> = vec![None; topology.size()];
        for p in &parsed.parties {
            let id = PartyId::new(p.owner, p.replica);
            if !topology.contains(id) {
                return Err(invalid(format!("Party {} is outside of the topology", id)));
            }
            let slot = &mut slots[topology.index_of(id)];
            if slot.is_some() {
                return Err(invalid(format!("Party {} is listed twice", id)));
            }
            *slot = Some(p);
        }
        let parties: Vec<&SerializedPartyConfig> = slots.into_iter().flatten().collect();

        let me = &parsed.parties[parsed.party_index - 1];
        let party_index = topology.index_of(PartyId::new(me.owner, me.replica));
        let addresses = parties.iter().map(|p| (p.address, p.port)).collect();
        let certificates = parties.iter()
            .map(|p| Self::load_certificate_from_file(parent_dir, Path::new(&p.certificate)))
            .collect::<io::Result<Vec<_>>>()?;
        let key_path = me.private_key.as_ref()
            .ok_or(invalid(format!("No \"private_key\" field found for party_index {}", parsed.party_index)))?;
        let my_key = Self::load_private_key_from_file(parent_dir, Path::new(key_path))?;
        let protocol = parsed.protocol.map(ProtocolConfig::from).unwrap_or_default();
        Ok(Self::new(party_index, topology, protocol, addresses, certificates, my_key))
    }
}

#[derive(Deserialize)]
struct SerializedPartyConfig {
    pub owner: usize,
    pub replica: usize,
    pub address: IpAddr,
    pub port: u16,
    pub certificate: String,
    pub private_key: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct SerializedProtocolConfig {
    pub timeout_ms: Option<u64>,
    pub preprocessing_timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct SerializedConfig {
    pub party_index: usize,
    pub owners: usize,
    pub replicas: usize,
    pub parties: Vec<SerializedPartyConfig>,
    pub protocol: Option<SerializedProtocolConfig>,
}

impl From<SerializedProtocolConfig> for ProtocolConfig {
    fn from(c: SerializedProtocolConfig) -> Self {
        let default = ProtocolConfig::default();
        Self {
            timeout: c.timeout_ms.map(Duration::from_millis).unwrap_or(default.timeout),
            preprocessing_timeout: c.preprocessing_timeout_ms.map(Duration::from_millis).unwrap_or(default.preprocessing_timeout),
        }
    }
}

pub struct CommChannel {
    /// flat index of the other party
    pub to: usize,
    stream: Option<Stream>,
}

pub enum Stream {
    Client(rustls::StreamOwned<ClientConnection, TcpStream>),
    Server(rustls::StreamOwned<ServerConnection, TcpStream>),
}

impl Stream {
    pub fn complete_handshake_blocking(&mut self) -> io::Result<()> {
        match self {
            Self::Client(stream) => stream.conn.complete_io(&mut stream.sock).map(|_| ()),
            Self::Server(stream) => stream.conn.complete_io(&mut stream.sock).map(|_| ()),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Client(stream) => stream.sock.set_nonblocking(nonblocking),
            Self::Server(stream) => stream.sock.set_nonblocking(nonblocking),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            Self::Client(stream) => stream.conn.wants_write(),
            Self::Server(stream) => stream.conn.wants_write(),
        }
    }

    /// Writes buffered TLS records to the socket.
    pub fn write_tls(&mut self) -> io::Result<usize> {
        match self {
            Self::Client(stream) => stream.conn.write_tls(&mut stream.sock),
            Self::Server(stream) => stream.conn.write_tls(&mut stream.sock),
        }
    }

    pub fn send_close_notify(&mut self) {
        match self {
            Self::Client(stream) => stream.conn.send_close_notify(),
            Self::Server(stream) => stream.conn.send_close_notify(),
        }
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let certs = match self {
            Self::Client(stream) => stream.conn.peer_certificates(),
            Self::Server(stream) => stream.conn.peer_certificates(),
        };
        certs.and_then(|c| c.first()).map(|c| c.clone().into_owned())
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Client(stream) => stream.read(buf),
            Self::Server(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Client(stream) => stream.write(buf),
            Self::Server(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Client(stream) => stream.flush(),
            Self::Server(stream) => stream.flush(),
        }
    }
}

pub struct CreatedParty {
    i: usize,
    server_socket: TcpListener,
}

pub struct ConnectedParty {
    pub i: usize,
    pub config: Config,
    /// One channel per other party, ordered by flat index
    pub channels: Vec<CommChannel>,
}

impl ConnectedParty {
    pub fn bind_and_connect(config: Config, timeout: Option<Duration>) -> io::Result<Self> {
        let (addr, port) = config.addresses[config.party_index];
        let party = CreatedParty::bind(config.party_index, addr, port)?;
        CreatedParty::connect(party, config, timeout)
    }
}

impl CreatedParty {
    pub fn bind(i: usize, addr: IpAddr, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((addr, port))?;
        Ok(Self { i, server_socket: listener })
    }

    pub fn port(&self) -> io::Result<u16> {
        self.server_socket
            .local_addr()
            .map(|socket_addr| socket_addr.port())
    }

    /// Connects to every party with a lower index, then accepts every party with a higher one.
    pub fn connect(self, config: Config, timeout: Option<Duration>) -> io::Result<ConnectedParty> {
        let n = config.topology.size();
        let mut channels = Vec::with_capacity(n - 1);
        for j in 0..self.i {
            let mut client = CommChannel::new_client(&config, j, timeout)?;
            let stream = client.stream_mut()?;
            stream.complete_handshake_blocking()?;
            stream.write_all(&(self.i as u32).to_le_bytes())?;
            stream.flush()?;
            debug!("P{} connected to P{}", self.i, j);
            channels.push(client);
        }
        let mut accepted: Vec<CommChannel> = Vec::with_capacity(n - 1 - self.i);
        for _ in self.i + 1..n {
            let server = CommChannel::new_server(&config, &self.server_socket)?;
            if server.to <= self.i || accepted.iter().any(|c| c.to == server.to) {
                return Err(io::Error::new(ErrorKind::InvalidData, format!("Unexpected connection from P{}", server.to)));
            }
            debug!("P{} accepted P{}", self.i, server.to);
            accepted.push(server);
        }
        accepted.sort_by_key(|c| c.to);
        channels.extend(accepted);
        Ok(ConnectedParty { i: self.i, config, channels })
    }
}

impl CommChannel {
    fn new_server_config(config: &Config) -> io::Result<ServerConfig> {
        let mut root_store = RootCertStore::empty();
        for cert in &config.certificates {
            root_store.add(cert.clone()).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        }
        let client_verifier = WebPkiClientVerifier::builder(root_store.into())
            .build()
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(vec![config.certificates[config.party_index].clone()], config.my_key.clone_key())
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
    }

    fn new_client_config(config: &Config, to: usize) -> io::Result<ClientConfig> {
        let mut root_store = RootCertStore::empty();
        root_store.add(config.certificates[to].clone()).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(root_store)
            .with_client_auth_cert(vec![config.certificates[config.party_index].clone()], config.my_key.clone_key())
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
    }

    fn new(to: usize, stream: Stream) -> Self {
        Self { to, stream: Some(stream) }
    }

    /// Accepts one connection and learns the peer's index from its hello.
    pub fn new_server(config: &Config, server_socket: &TcpListener) -> io::Result<Self> {
        let (sock, _) = server_socket.accept()?;
        let conn = ServerConnection::new(Arc::new(Self::new_server_config(config)?))
            .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
        let mut stream = Stream::Server(StreamOwned::new(conn, sock));
        stream.complete_handshake_blocking()?;
        let mut hello = [0u8; 4];
        stream.read_exact(&mut hello)?;
        let to = u32::from_le_bytes(hello) as usize;
        if to >= config.certificates.len() || stream.peer_certificate().as_ref() != Some(&config.certificates[to]) {
            return Err(io::Error::new(ErrorKind::PermissionDenied, format!("Peer claiming to be P{} presented a different certificate", to)));
        }
        Ok(Self::new(to, stream))
    }

    pub fn new_client(config: &Config, to: usize, timeout: Option<Duration>) -> io::Result<Self> {
        let (addr, port) = config.addresses[to];
        // try to connect in a loop until timeout is reached (if timeout is None, try forever)
        let start_time = Instant::now();
        let sock = loop {
            match TcpStream::connect((addr, port)) {
                Ok(sock) => break sock,
                Err(io_err) if io_err.kind() == ErrorKind::ConnectionRefused => (),
                Err(io_err) => return Err(io_err),
            }
            if let Some(timeout) = timeout {
                if start_time.elapsed() >= timeout {
                    return Err(io::Error::new(ErrorKind::NotConnected, format!("Cannot connect to {}:{} after {}s", addr, port, timeout.as_secs_f32())));
                }
            }
            thread::sleep(Duration::from_millis(100));
        };
        sock.set_nodelay(true)?;
        let conn = ClientConnection::new(Arc::new(Self::new_client_config(config, to)?), ServerName::IpAddress(addr.into()))
            .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
        Ok(Self::new(to, Stream::Client(StreamOwned::new(conn, sock))))
    }

    fn stream_mut(&mut self) -> io::Result<&mut Stream> {
        self.stream.as_mut().ok_or(io::Error::new(ErrorKind::NotConnected, "Connection was closed"))
    }

    pub fn into_stream(mut self) -> io::Result<Stream> {
        self.stream.take().ok_or(io::Error::new(ErrorKind::NotConnected, "Connection was closed"))
    }

    pub fn teardown(&mut self) {
        self.stream = None // drop the connection; this will close the socket
    }
}


#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::test::localhost_connect;
    use super::Config;
    use crate::party::{PartyId, ProtocolConfig, Topology};

    fn write_config(name: &str, body: &str) -> PathBuf {
        // certificate paths are relative to the config file
        let path = PathBuf::from("./").join(super::test::TEST_KEY_DIR).join(format!("{}-{}.toml", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    const PARTIES: &str = r#"
[[parties]]
owner = 2
replica = 1
address = "127.0.0.1"
port = 9002
certificate = "p2.pem"
private_key = "p2.key"

[[parties]]
owner = 1
replica = 1
address = "127.0.0.1"
port = 9001
certificate = "p1.pem"

[[parties]]
owner = 3
replica = 1
address = "127.0.0.1"
port = 9003
certificate = "p3.pem"
"#;

    #[test]
    fn parse_config() {
        let path = write_config("parse", &format!("party_index = 1\nowners = 3\nreplicas = 1\n\n[protocol]\ntimeout_ms = 250\n{}", PARTIES));
        let config = Config::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();
        // the first listed party is owner 2
        assert_eq!(config.id(), PartyId::new(2, 1));
        assert_eq!(config.party_index, 1);
        assert_eq!(config.addresses[0].1, 9001);
        assert_eq!(config.protocol.timeout, Duration::from_millis(250));
        assert_eq!(config.protocol.preprocessing_timeout, ProtocolConfig::default().preprocessing_timeout);
    }

    #[test]
    fn reject_inconsistent_config() {
        // owner 3 missing
        let path = write_config("wrong-size", &format!("party_index = 1\nowners = 4\nreplicas = 1\n{}", PARTIES));
        assert!(Config::from_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();
        // no private key for the local party
        let path = write_config("no-key", &format!("party_index = 2\nowners = 3\nreplicas = 1\n{}", PARTIES));
        assert!(Config::from_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn tls_mesh_connects_all_pairs() {
        let topology = Topology::new(3, 1).unwrap();
        let handles = localhost_connect(topology, ProtocolConfig::default(), |party| {
            (party.i, party.channels.iter().map(|c| c.to).collect::<Vec<_>>())
        });
        for (i, h) in handles.into_iter().enumerate() {
            let (me, peers) = h.join().unwrap();
            assert_eq!(me, i);
            assert_eq!(peers, (0..3).filter(|j| *j != i).collect::<Vec<_>>());
        }
    }
}
