use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::RwLock;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use super::message::{encode_frame, FrameDecoder, Message};
use super::{ConnectedParty, Inbound, Inbox, Stream, Transport};
use crate::party::error::{MpcError, MpcResult};
use crate::party::{PartyId, Topology};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(2);

pub enum Task {
    Write(Vec<u8>),
    /// flush all pending writes, then close the connection
    Close,
}

struct WriteTask {
    buffer: Vec<u8>,
    offset: usize,
}

impl WriteTask {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self { buffer, offset: 0 }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
}

fn is_transient(io_err: &io::Error) -> bool {
    io_err.kind() == ErrorKind::WouldBlock || io_err.kind() == ErrorKind::Interrupted
}

fn is_disconnect(io_err: &io::Error) -> bool {
    matches!(io_err.kind(), ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe)
}

/// State of the I/O thread serving the connection to one peer.
struct IoThreadContext {
    peer: PartyId,
    stream: Stream,
    tasks: Receiver<Task>,
    write_queue: VecDeque<WriteTask>,
    decoder: FrameDecoder,
    inbox: Inbox,
    state: State,
    peer_open: bool,
    bytes_sent: u64,
    bytes_received: u64,
}

impl IoThreadContext {
    fn new(peer: PartyId, stream: Stream, tasks: Receiver<Task>, inbox: Inbox) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            peer,
            stream,
            tasks,
            write_queue: VecDeque::new(),
            decoder: FrameDecoder::new(),
            inbox,
            state: State::Open,
            peer_open: true,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    fn handle_io(&mut self) -> MpcResult<()> {
        let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut idle_rounds = 0u32;
        loop {
            let mut progress = self.add_new_tasks_non_blocking();
            progress |= self.non_blocking_write()?;
            if self.stream.wants_write() {
                progress |= self.non_blocking_write_tls()?;
            }
            if self.peer_open {
                progress |= self.non_blocking_read(&mut read_buffer)?;
            }

            if self.state == State::Closing && self.write_queue.is_empty() && !self.stream.wants_write() {
                self.close();
                return Ok(());
            }

            if progress {
                idle_rounds = 0;
            } else {
                // nothing to do, back off a little
                idle_rounds = idle_rounds.saturating_add(1);
                thread::sleep(Duration::min(Duration::from_micros(20 * idle_rounds as u64), MAX_IDLE_SLEEP));
            }
        }
    }

    fn add_new_tasks_non_blocking(&mut self) -> bool {
        let mut added = false;
        while self.state == State::Open {
            match self.tasks.try_recv() {
                Ok(Task::Write(data)) => {
                    self.write_queue.push_back(WriteTask::new(data));
                    added = true;
                }
                Ok(Task::Close) | Err(TryRecvError::Disconnected) => self.state = State::Closing,
                Err(TryRecvError::Empty) => break,
            }
        }
        added
    }

    fn non_blocking_write(&mut self) -> io::Result<bool> {
        let Some(write_task) = self.write_queue.front_mut() else {
            return Ok(false);
        };
        match self.stream.write(&write_task.buffer[write_task.offset..]) {
            Ok(n) => {
                write_task.offset += n;
                if write_task.offset >= write_task.buffer.len() {
                    self.bytes_sent += write_task.buffer.len() as u64;
                    self.write_queue.pop_front();
                }
                Ok(n > 0)
            }
            Err(io_err) if is_transient(&io_err) => Ok(false),
            Err(io_err) => Err(io_err),
        }
    }

    fn non_blocking_write_tls(&mut self) -> io::Result<bool> {
        match self.stream.write_tls() {
            Ok(n) => Ok(n > 0),
            Err(io_err) if is_transient(&io_err) => Ok(false),
            Err(io_err) => Err(io_err),
        }
    }

    fn non_blocking_read(&mut self, buffer: &mut [u8]) -> MpcResult<bool> {
        match self.stream.read(buffer) {
            Ok(0) => {
                debug!("{} closed the connection", self.peer);
                self.peer_open = false;
                Ok(true)
            }
            Ok(n) => {
                self.bytes_received += n as u64;
                self.decoder.push(&buffer[..n]);
                while let Some(message) = self.decoder.next_message()? {
                    if self.inbox.send(Inbound::Message { from: self.peer, message }).is_err() {
                        // the party is gone; keep draining the socket until closed
                        debug!("dropping message from {}, inbox closed", self.peer);
                    }
                }
                Ok(true)
            }
            Err(io_err) if is_transient(&io_err) => Ok(false),
            Err(io_err) if is_disconnect(&io_err) => {
                debug!("connection to {} lost: {}", self.peer, io_err);
                self.peer_open = false;
                Ok(true)
            }
            Err(io_err) => Err(io_err.into()),
        }
    }

    /// Best effort: the peer may already be gone.
    fn close(&mut self) {
        self.stream.send_close_notify();
        for _ in 0..100 {
            match self.stream.write_tls() {
                Ok(_) if !self.stream.wants_write() => break,
                Ok(_) => (),
                Err(io_err) if is_transient(&io_err) => thread::sleep(Duration::from_millis(1)),
                Err(_) => break,
            }
        }
        debug!("connection to {} closed: {} bytes sent, {} bytes received", self.peer, self.bytes_sent, self.bytes_received);
    }
}

/// One I/O thread per peer connection.
pub struct IoLayer {
    task_channels: HashMap<usize, Sender<Task>>,
    io_thread_handles: Vec<JoinHandle<()>>,
}

impl IoLayer {
    pub fn spawn_io(party: ConnectedParty, inbox: Inbox) -> io::Result<Self> {
        let topology = party.config.topology;
        let mut task_channels = HashMap::new();
        let mut io_thread_handles = Vec::new();
        for comm in party.channels {
            let to = comm.to;
            let peer = topology.id_at(to);
            let (send, rcv) = channel();
            let mut ctx = IoThreadContext::new(peer, comm.into_stream()?, rcv, inbox.clone())?;
            let handle = thread::Builder::new()
                .name(format!("io-{}", peer))
                .spawn(move || {
                    if let Err(err) = ctx.handle_io() {
                        error!("I/O with {} failed: {}", ctx.peer, err);
                    }
                })?;
            task_channels.insert(to, send);
            io_thread_handles.push(handle);
        }
        Ok(Self { task_channels, io_thread_handles })
    }

    pub fn send(&self, to: usize, bytes: Vec<u8>) -> io::Result<()> {
        let channel = self.task_channels.get(&to)
            .ok_or(io::Error::new(ErrorKind::NotFound, format!("No connection to P{}", to)))?;
        channel.send(Task::Write(bytes))
            .map_err(|_| io::Error::new(ErrorKind::NotConnected, format!("The IO to P{} is already closed", to)))
    }

    /// Flushes pending writes and waits for every I/O thread.
    pub fn shutdown(self) -> io::Result<()> {
        for channel in self.task_channels.values() {
            // a closed channel means the thread already exited
            let _ = channel.send(Task::Close);
        }
        drop(self.task_channels);
        for handle in self.io_thread_handles {
            if handle.join().is_err() {
                return Err(io::Error::new(ErrorKind::Other, "Error when joining an I/O thread"));
            }
        }
        Ok(())
    }
}

/// [Transport] over the TLS mesh.
pub struct TlsTransport {
    me: PartyId,
    topology: Topology,
    io: RwLock<Option<IoLayer>>,
    inbox: Inbox,
}

impl TlsTransport {
    pub fn new(party: ConnectedParty, inbox: Inbox) -> io::Result<Self> {
        let me = party.config.id();
        let topology = party.config.topology;
        let io = IoLayer::spawn_io(party, inbox.clone())?;
        Ok(Self { me, topology, io: RwLock::new(Some(io)), inbox })
    }
}

impl Transport for TlsTransport {
    fn send(&self, to: PartyId, message: Message) -> MpcResult<()> {
        if to == self.me {
            // loopback without touching the network
            return self.inbox.send(Inbound::Message { from: self.me, message })
                .map_err(|_| MpcError::Io(io::Error::new(ErrorKind::NotConnected, "inbox closed")));
        }
        let frame = encode_frame(&message)?;
        let guard = self.io.read().map_err(|_| MpcError::Io(io::Error::new(ErrorKind::Other, "poisoned I/O lock")))?;
        match guard.as_ref() {
            Some(io) => Ok(io.send(self.topology.index_of(to), frame)?),
            None => Err(MpcError::Io(io::Error::new(ErrorKind::NotConnected, "transport was shut down"))),
        }
    }

    fn shutdown(&self) -> MpcResult<()> {
        let io = match self.io.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("I/O lock poisoned during shutdown");
                None
            }
        };
        if let Some(io) = io {
            io.shutdown()?;
        }
        Ok(())
    }
}
