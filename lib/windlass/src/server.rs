use crate::net::convert;
use crate::net::packet::{self, Command, Packet};
use crate::net::reactor::{self, EventHandler, Reactor, Verdict};
use crate::net::session::Session;
use crate::net::socket::Socket;
use crate::net::support::{ErrorUtils, NetworkError, NetworkResult};
use crate::pool::WorkerPool;
use ballast::logging::{self, Logger};
use signal_hook::consts::{SIGABRT, SIGINT, SIGPIPE, SIGTERM};
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

/// Bytes a connection reads per readiness event. Comfortably above the
/// largest chunk plus framing.
const READ_BUF_SIZE: usize = 4096;

/// Accept-and-dispatch engine: owns the listening socket and its root
/// reactor, and hosts one sub-reactor per accepted connection on a worker
/// pool sized to the hardware parallelism.
pub struct Server {
    port: u16,
    save_dir: PathBuf,
    shutdown: Arc<AtomicBool>,
    log: Logger,
}

impl Server {
    /// Server saving received files next to the running executable.
    pub fn new(port: u16, log: &Logger) -> Server {
        let save_dir = ballast::fs::exe_dir().unwrap_or_default();

        Self::with_save_dir(port, save_dir, log)
    }

    /// Server saving received files into an explicit directory.
    pub fn with_save_dir(port: u16, save_dir: PathBuf, log: &Logger) -> Server {
        Server {
            port,
            save_dir,
            shutdown: Arc::new(AtomicBool::new(false)),
            log: log.new(logging::o!("component" => "server")),
        }
    }

    /// Flag that makes `start` return after its current reactor iteration.
    /// Shutdown signals raise the same flag.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Binds the listener and serves until a shutdown signal arrives.
    /// Connections in flight drain on their workers; each ends when its
    /// transfer completes or its peer disconnects.
    pub fn start(&mut self) -> NetworkResult<()> {
        install_signal_handlers(&self.shutdown)?;

        let workers = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let pool = WorkerPool::new(workers);

        let mut listener = Socket::listen(self.port)?;
        listener.set_non_blocking()?;

        logging::info!(self.log, "listening";
                       "port" => self.port,
                       "workers" => workers,
                       "save_dir" => %self.save_dir.display());

        let mut reactor = Reactor::new(
            listener.raw_fd(),
            reactor::accept_interest(),
            self.shutdown.clone(),
        );
        reactor.init()?;

        let mut acceptor = Acceptor {
            listener,
            pool,
            save_dir: self.save_dir.clone(),
            log: self.log.clone(),
        };

        let result = reactor.start(&mut acceptor);

        logging::info!(self.log, "server stopped");
        result
    }
}

/// Shutdown signals only raise the atomic flag; the reactors observe it at
/// the top of their next iteration. SIGPIPE is swallowed so writes to a
/// vanished peer surface as errors instead of killing the process.
fn install_signal_handlers(flag: &Arc<AtomicBool>) -> NetworkResult<()> {
    for &signal in &[SIGINT, SIGTERM, SIGABRT] {
        signal_hook::flag::register(signal, flag.clone())?;
    }

    unsafe { signal_hook::low_level::register(SIGPIPE, || ())? };

    Ok(())
}

/// Root-reactor handler: accepts one connection per readiness event and
/// hands it to the pool.
struct Acceptor {
    listener: Socket,
    pool: WorkerPool,
    save_dir: PathBuf,
    log: Logger,
}

impl EventHandler for Acceptor {
    fn readable(&mut self) -> Verdict {
        let (mut socket, address) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(NetworkError::Wait) => return Verdict::Continue,
            Err(err) => {
                logging::error!(self.log, "accept failed"; "error" => ?err);
                return Verdict::Continue;
            }
        };

        logging::info!(self.log, "connection accepted"; "peer" => %address);

        if let Err(err) = socket.set_non_blocking() {
            logging::error!(self.log, "failed to make the connection non-blocking";
                            "error" => ?err);
            socket.close();
            return Verdict::Continue;
        }

        let save_dir = self.save_dir.clone();
        let log = self.log.new(logging::o!("peer" => address.to_string()));

        if self
            .pool
            .enqueue(move || run_connection(socket, save_dir, log))
            .is_err()
        {
            logging::warn!(self.log, "pool stopped, dropping connection"; "peer" => %address);
        }

        Verdict::Continue
    }
}

/// Worker entry point: one reactor and one session per accepted connection.
fn run_connection(socket: Socket, save_dir: PathBuf, log: Logger) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut reactor = Reactor::new(socket.raw_fd(), reactor::stream_interest(), stop);

    if let Err(err) = reactor.init() {
        logging::error!(log, "failed to initialize the connection reactor"; "error" => ?err);
        return;
    }

    let session = Session::new(save_dir, &log);
    let mut connection = Connection::new(socket, session, log.clone());

    let result = reactor.start(&mut connection);

    if result.has_failed() {
        logging::error!(log, "connection reactor failed"; "result" => ?result);
    }
}

/// Server-side transfer phase for one connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    AwaitFileSize,
    ReceiveFile,
    AwaitFinalMessage,
    Abort,
}

/// Per-connection protocol driver. Each readiness event reads one frame,
/// advances the phase machine and stages at most one response in
/// `pending_send`; a successful write moves it into `last_sent`. The slots
/// only ever exchange packets by move.
struct Connection {
    socket: Socket,
    session: Session,
    phase: Phase,
    scratch: Vec<u8>,
    last_received: Packet,
    pending_send: Packet,
    last_sent: Packet,
    log: Logger,
}

impl Connection {
    fn new(socket: Socket, session: Session, log: Logger) -> Connection {
        Connection {
            socket,
            session,
            phase: Phase::AwaitFileSize,
            scratch: vec![0u8; READ_BUF_SIZE],
            last_received: Packet::new(),
            pending_send: Packet::new(),
            last_sent: Packet::new(),
            log,
        }
    }

    /// Stages an empty-payload response.
    fn respond(&mut self, command: Command) {
        self.pending_send = Packet::with_command(command);
    }

    /// Stages a terminal response and parks the machine in the abort phase;
    /// the write path cleans up once the response is flushed.
    fn abort_with(&mut self, command: Command) {
        self.respond(command);
        self.phase = Phase::Abort;
    }

    /// AWAIT_FILE_SIZE: only a transfer request is meaningful here.
    fn handle_transfer_request(&mut self) -> Verdict {
        if self.last_received.command() != Command::RequestToSend {
            logging::error!(self.log, "unexpected command while awaiting a transfer request";
                            "command" => ?self.last_received.command());
            self.abort_with(Command::Abort);
            return Verdict::Continue;
        }

        let file_size = match convert::u64_from_bytes(self.last_received.data()) {
            Ok(file_size) => file_size,
            Err(err) => {
                logging::warn!(self.log, "malformed transfer request"; "error" => ?err);
                self.respond(Command::ChecksumError);
                return Verdict::Continue;
            }
        };

        if let Err(err) = self.session.can_save(file_size) {
            logging::error!(self.log, "rejecting the transfer";
                            "size" => file_size,
                            "error" => ?err);
            self.abort_with(Command::RequestRejected);
            return Verdict::Continue;
        }

        let chunk_size = self.session.progress_mut().plan(file_size);
        let expected_packets = self.session.progress().expected_packets;

        logging::info!(self.log, "transfer approved";
                       "size" => file_size,
                       "expected_packets" => expected_packets,
                       "chunk_size" => chunk_size,
                       "file" => self.session.file_name());

        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&convert::u64_to_bytes(expected_packets));
        payload[8..].copy_from_slice(&convert::u64_to_bytes(chunk_size));

        let mut approval = Packet::new();
        approval.set_command(Command::RequestApproved);
        approval.set_data(&payload);
        approval.compute_checksum();
        self.pending_send = approval;

        Verdict::Continue
    }

    /// RECEIVE_FILE: append the chunk and acknowledge it.
    fn handle_chunk(&mut self) -> Verdict {
        if self.last_received.command() != Command::DataPackage {
            logging::error!(self.log, "unexpected command while receiving";
                            "command" => ?self.last_received.command());
            self.abort_with(Command::Abort);
            return Verdict::Continue;
        }

        if self.session.progress().is_complete() {
            logging::error!(self.log, "chunk beyond the announced count");
            self.abort_with(Command::Abort);
            return Verdict::Continue;
        }

        if let Err(err) = self.session.open_file() {
            logging::error!(self.log, "failed to open the output file"; "error" => ?err);
            self.abort_with(Command::Abort);
            return Verdict::Continue;
        }

        if let Err(err) = self.session.write_chunk(self.last_received.data()) {
            logging::error!(self.log, "failed to store the chunk"; "error" => ?err);
            self.abort_with(Command::Abort);
            return Verdict::Continue;
        }

        self.session
            .progress_mut()
            .record_packet(self.last_received.data_len() as u64);

        let received_packets = self.session.progress().received_packets;

        logging::debug!(self.log, "chunk stored";
                        "received_packets" => received_packets,
                        "received_bytes" => self.session.progress().received_bytes);

        let mut acceptance = Packet::new();
        acceptance.set_command(Command::PackageAccepted);
        acceptance.set_data_u64(received_packets);
        acceptance.compute_checksum();
        self.pending_send = acceptance;

        Verdict::Continue
    }

    /// AWAIT_FINAL_MESSAGE: the transfer is over either way.
    fn handle_final_message(&mut self) -> Verdict {
        if self.last_received.command() == Command::AllDataSent {
            logging::info!(self.log, "client confirmed the transfer");
        } else {
            logging::warn!(self.log, "expected the final confirmation";
                           "command" => ?self.last_received.command());
        }

        Verdict::Exit
    }

    /// Phase transitions keyed on the response that just left.
    fn after_send(&mut self) -> Verdict {
        if self.phase == Phase::Abort {
            logging::warn!(self.log, "terminal response flushed, dropping the connection");
            self.session.reset();
            return Verdict::Exit;
        }

        match self.last_sent.command() {
            Command::RequestApproved => {
                self.phase = Phase::ReceiveFile;
            }
            Command::PackageAccepted if self.session.progress().is_complete() => {
                self.phase = Phase::AwaitFinalMessage;
            }
            _ => (),
        }

        Verdict::Continue
    }
}

impl EventHandler for Connection {
    fn readable(&mut self) -> Verdict {
        let count = match self.socket.read(&mut self.scratch) {
            Ok(0) => {
                logging::warn!(self.log, "peer closed the connection");
                self.session.reset();
                return Verdict::Exit;
            }
            Ok(count) => count,
            Err(NetworkError::Wait) => return Verdict::Continue,
            Err(err) => {
                logging::error!(self.log, "read failed"; "error" => ?err);
                self.session.reset();
                return Verdict::Exit;
            }
        };

        if count < packet::MIN_SIZE {
            logging::warn!(self.log, "frame below the minimum size"; "bytes" => count);
            self.respond(Command::ChecksumError);
            return Verdict::Continue;
        }

        self.last_received = match Packet::parse(&self.scratch[..count]) {
            Ok(received) => received,
            Err(err) => {
                logging::warn!(self.log, "unparsable frame"; "error" => ?err);
                self.respond(Command::ChecksumError);
                return Verdict::Continue;
            }
        };

        if !self.last_received.verify_checksum() {
            logging::warn!(self.log, "checksum mismatch on a received frame");
            self.respond(Command::ChecksumError);
            return Verdict::Continue;
        }

        if self.last_received.command() == Command::ChecksumError {
            // The peer got our last frame corrupted; stage it again
            logging::warn!(self.log, "peer reported a corrupt frame, resending");
            self.pending_send = mem::replace(&mut self.last_sent, Packet::new());
            return Verdict::Continue;
        }

        match self.phase {
            Phase::AwaitFileSize => self.handle_transfer_request(),
            Phase::ReceiveFile => self.handle_chunk(),
            Phase::AwaitFinalMessage => self.handle_final_message(),
            Phase::Abort => Verdict::Continue,
        }
    }

    fn writable(&mut self) -> Verdict {
        if self.pending_send.command() == Command::Empty {
            return Verdict::Continue;
        }

        match self.socket.write_packet(&self.pending_send) {
            Err(NetworkError::Wait) => Verdict::Continue,
            Ok(0) => {
                logging::error!(self.log, "zero-byte write, dropping the connection");
                self.session.reset();
                Verdict::Exit
            }
            Err(err) => {
                logging::error!(self.log, "write failed"; "error" => ?err);
                self.session.reset();
                Verdict::Exit
            }
            Ok(_) => {
                self.last_sent = mem::replace(&mut self.pending_send, Packet::new());
                self.after_send()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::net::convert::u64_to_bytes;
    use ballast::logging::Discard;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn test_logger() -> Logger {
        Logger::root(Discard, logging::o!())
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        listener.local_addr().unwrap().port()
    }

    /// Starts a server on a fresh port saving into `save_dir` and waits for
    /// it to accept connections. The server thread is left to drain on its
    /// own; the harness tears it down with the process.
    fn start_server(save_dir: &Path) -> u16 {
        let port = free_port();
        let dir = save_dir.to_path_buf();

        thread::spawn(move || {
            let mut server = Server::with_save_dir(port, dir, &test_logger());
            drop(server.start());
        });

        for _ in 0..100 {
            if let Ok(probe) = TcpStream::connect(("127.0.0.1", port)) {
                drop(probe);
                thread::sleep(Duration::from_millis(50));
                return port;
            }

            thread::sleep(Duration::from_millis(20));
        }

        panic!("server did not come up on port {}", port);
    }

    fn transfer_file(port: u16, content: &[u8]) -> NetworkResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        fs::write(&path, content).unwrap();

        let mut client = Client::new("127.0.0.1", port, &test_logger());
        client.send_file(&path)
    }

    /// Newest regular file in `dir`, retrying briefly while the server
    /// finishes its half of the exchange.
    fn wait_for_output(dir: &Path, expected_len: u64) -> PathBuf {
        for _ in 0..100 {
            let found = fs::read_dir(dir)
                .unwrap()
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .find(|path| {
                    fs::metadata(path)
                        .map(|meta| meta.len() == expected_len)
                        .unwrap_or(false)
                });

            if let Some(path) = found {
                return path;
            }

            thread::sleep(Duration::from_millis(20));
        }

        panic!("no output of {} bytes appeared in {:?}", expected_len, dir);
    }

    fn assert_dir_empties(dir: &Path) {
        for _ in 0..100 {
            if fs::read_dir(dir).unwrap().next().is_none() {
                return;
            }

            thread::sleep(Duration::from_millis(20));
        }

        panic!("directory {:?} still has entries", dir);
    }

    #[test]
    fn test_transfer_empty_file() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        assert_eq!(transfer_file(port, &[]), Ok(()));

        let output = wait_for_output(save.path(), 0);
        assert_eq!(fs::read(&output).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_transfer_small_file() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let content: Vec<u8> = (0..512u32).map(|value| value as u8).collect();
        assert_eq!(transfer_file(port, &content), Ok(()));

        let output = wait_for_output(save.path(), 512);
        assert_eq!(fs::read(&output).unwrap(), content);
    }

    #[test]
    fn test_transfer_chunked_file() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let content: Vec<u8> = (0..3000u32).map(|value| (value * 7) as u8).collect();
        assert_eq!(transfer_file(port, &content), Ok(()));

        let output = wait_for_output(save.path(), 3000);
        assert_eq!(fs::read(&output).unwrap(), content);
    }

    #[test]
    fn test_concurrent_transfers_land_separately() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let first: Vec<u8> = vec![0xAB; 2000];
        let second: Vec<u8> = vec![0xCD; 600];

        let first_clone = first.clone();
        let uploader = thread::spawn(move || transfer_file(port, &first_clone));

        assert_eq!(transfer_file(port, &second), Ok(()));
        assert_eq!(uploader.join().unwrap(), Ok(()));

        let big = wait_for_output(save.path(), 2000);
        let small = wait_for_output(save.path(), 600);

        assert_eq!(fs::read(&big).unwrap(), first);
        assert_eq!(fs::read(&small).unwrap(), second);
    }

    #[test]
    fn test_shutdown_flag_stops_the_server() {
        use std::sync::atomic::Ordering;

        let save = tempfile::tempdir().unwrap();
        let port = free_port();

        let mut server = Server::with_save_dir(port, save.path().to_path_buf(), &test_logger());
        let shutdown = server.shutdown_handle();

        let handle = thread::spawn(move || server.start());

        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }

            thread::sleep(Duration::from_millis(20));
        }

        shutdown.store(true, Ordering::Relaxed);

        // The root reactor notices the flag within one poll timeout
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    fn raw_request(file_size: u64) -> Vec<u8> {
        let mut request = Packet::new();
        request.set_command(Command::RequestToSend);
        request.set_data(&u64_to_bytes(file_size));
        request.compute_checksum();
        request.serialize()
    }

    fn read_raw_frame(stream: &mut TcpStream) -> Packet {
        let mut buffer = [0u8; 4096];
        let count = stream.read(&mut buffer).unwrap();
        assert!(count >= packet::MIN_SIZE, "short frame: {} bytes", count);

        Packet::parse(&buffer[..count]).unwrap()
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&raw_request(u64::max_value())).unwrap();

        let reply = read_raw_frame(&mut stream);
        assert_eq!(reply.command(), Command::RequestRejected);
        assert!(reply.verify_checksum());

        // The server drops the connection after flushing the rejection
        let mut probe = [0u8; 16];
        assert_eq!(stream.read(&mut probe).unwrap(), 0);

        assert_dir_empties(save.path());
    }

    #[test]
    fn test_wrong_command_mid_transfer_aborts() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&raw_request(3000)).unwrap();

        let approval = read_raw_frame(&mut stream);
        assert_eq!(approval.command(), Command::RequestApproved);

        // A transfer request where a chunk belongs is a protocol violation
        stream.write_all(&raw_request(3000)).unwrap();

        let reply = read_raw_frame(&mut stream);
        assert_eq!(reply.command(), Command::Abort);

        assert_dir_empties(save.path());
    }

    #[test]
    fn test_corrupt_chunk_triggers_checksum_complaint() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&raw_request(100)).unwrap();

        let approval = read_raw_frame(&mut stream);
        assert_eq!(approval.command(), Command::RequestApproved);

        let mut chunk = Packet::new();
        chunk.set_command(Command::DataPackage);
        chunk.set_data(&[9u8; 100]);
        chunk.compute_checksum();

        let mut corrupt = chunk.serialize();
        corrupt[10] ^= 0x01;
        stream.write_all(&corrupt).unwrap();

        let complaint = read_raw_frame(&mut stream);
        assert_eq!(complaint.command(), Command::ChecksumError);

        // The clean resend is accepted
        stream.write_all(&chunk.serialize()).unwrap();

        let acceptance = read_raw_frame(&mut stream);
        assert_eq!(acceptance.command(), Command::PackageAccepted);
    }

    #[test]
    fn test_disconnect_mid_transfer_removes_the_partial_file() {
        let save = tempfile::tempdir().unwrap();
        let port = start_server(save.path());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&raw_request(3000)).unwrap();

        let approval = read_raw_frame(&mut stream);
        assert_eq!(approval.command(), Command::RequestApproved);

        let mut chunk = Packet::new();
        chunk.set_command(Command::DataPackage);
        chunk.set_data(&[5u8; 1024]);
        chunk.compute_checksum();
        stream.write_all(&chunk.serialize()).unwrap();

        let acceptance = read_raw_frame(&mut stream);
        assert_eq!(acceptance.command(), Command::PackageAccepted);
        assert_eq!(acceptance.data(), &u64_to_bytes(1));

        // Walk away after one of three chunks
        drop(stream);

        assert_dir_empties(save.path());
    }
}
