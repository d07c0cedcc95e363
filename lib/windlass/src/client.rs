use crate::net::convert;
use crate::net::packet::{self, Command, Packet};
use crate::net::socket::Socket;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::RETRY_BUDGET;
use ballast::logging::{self, Logger};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Reply buffer floor. Server replies are small control frames, but the
/// buffer also absorbs whatever a confused peer sends back.
const REPLY_BUF_SIZE: usize = 1024;

/// Blocking engine delivering a single file to a server: announce the size,
/// stream chunks of the size the server chose, resend on checksum
/// complaints, confirm at the end.
pub struct Client {
    address: String,
    port: u16,
    log: Logger,
}

impl Client {
    pub fn new(address: &str, port: u16, log: &Logger) -> Client {
        Client {
            address: address.to_string(),
            port,
            log: log.new(logging::o!("peer" => format!("{}:{}", address, port))),
        }
    }

    /// Sends `path` to the server. Any error aborts the transfer; the
    /// server removes whatever partial output it accumulated.
    pub fn send_file(&mut self, path: &Path) -> NetworkResult<()> {
        let file_size = ballast::fs::file_size(path)?;
        let mut socket = Socket::connect(&self.address, self.port)?;

        logging::info!(self.log, "sending file";
                       "path" => %path.display(),
                       "size" => file_size);

        let (total_packets, chunk_size) = self.request_transfer(&mut socket, file_size)?;

        if total_packets == 0 || (chunk_size == 0 && file_size > 0) {
            logging::error!(self.log, "server does not await data";
                            "total_packets" => total_packets,
                            "chunk_size" => chunk_size);
            socket.close();
            return Err(NetworkError::Fatal(ErrorType::Rejected));
        }

        logging::info!(self.log, "transfer approved";
                       "total_packets" => total_packets,
                       "chunk_size" => chunk_size);

        let uploaded_packets = self.stream_chunks(&mut socket, path, file_size, chunk_size)?;
        self.confirm_completion(&mut socket)?;
        socket.close();

        logging::info!(self.log, "transfer complete"; "uploaded_packets" => uploaded_packets);
        Ok(())
    }

    /// First exchange: announce the file size, then read the server's
    /// verdict and the transfer geometry it chose, payload split at offset 8
    /// into two 8-byte fields.
    fn request_transfer(
        &mut self,
        socket: &mut Socket,
        file_size: u64,
    ) -> NetworkResult<(u64, u64)> {
        let mut request = Packet::new();
        request.set_command(Command::RequestToSend);
        request.set_data_u64(file_size);
        request.compute_checksum();

        socket.write_packet(&request)?;

        let mut buffer = vec![0u8; REPLY_BUF_SIZE];
        let mut reply = self.read_reply(socket, &mut buffer)?;

        if !reply.verify_checksum() {
            reply = self.renegotiate_reply(socket, &mut buffer)?;
        }

        if reply.command() != Command::RequestApproved {
            logging::error!(self.log, "unexpected reply to transfer request";
                            "command" => ?reply.command());
        }

        let payload = reply.data();
        let total_packets = convert::u64_from_bytes(payload)?;
        let chunk_size = convert::u64_from_bytes(&payload[8..])?;

        Ok((total_packets, chunk_size))
    }

    /// Streams the file in server-sized chunks, resending on checksum
    /// complaints. An empty file still travels as one empty chunk so the
    /// server sees the packet count it announced.
    fn stream_chunks(
        &mut self,
        socket: &mut Socket,
        path: &Path,
        file_size: u64,
        chunk_size: u64,
    ) -> NetworkResult<u64> {
        let mut file = File::open(path)?;
        let mut chunk = vec![0u8; chunk_size as usize];
        let mut buffer = vec![0u8; (chunk_size as usize + packet::MIN_SIZE).max(REPLY_BUF_SIZE)];

        let mut uploaded: u64 = 0;
        let mut uploaded_packets: u64 = 0;
        let mut retries: u32 = 0;

        loop {
            if retries >= RETRY_BUDGET {
                logging::error!(self.log, "retry budget exhausted"; "uploaded" => uploaded);
                return Err(NetworkError::Fatal(ErrorType::RetryExhausted));
            }

            file.seek(SeekFrom::Start(uploaded))?;
            let read = file.read(&mut chunk)?;

            let mut request = Packet::new();
            request.set_command(Command::DataPackage);
            request.set_data_sized(&chunk, read);
            request.compute_checksum();

            socket.write_packet(&request)?;
            logging::debug!(self.log, "chunk sent"; "bytes" => read);

            let count = socket.read(&mut buffer)?;

            if count == 0 {
                logging::error!(self.log, "server closed the connection mid-transfer");
                return Err(NetworkError::Fatal(ErrorType::Closed));
            }

            if count < packet::MIN_SIZE {
                logging::error!(self.log, "reply below the minimum frame size"; "bytes" => count);
                return Err(NetworkError::Fatal(ErrorType::Truncated));
            }

            let mut reply =
                Packet::parse(&buffer[..count]).unwrap_or_else(|_| Packet::unusable());

            // A reply that both fails verification and claims CHECKSUM_ERROR
            // is handled as the latter: the server is asking for a resend.
            if !reply.verify_checksum() && reply.command() != Command::ChecksumError {
                reply = self.renegotiate_reply(socket, &mut buffer)?;
            }

            match reply.command() {
                Command::PackageAccepted => {
                    uploaded += read as u64;
                    uploaded_packets += 1;
                    retries = 0;

                    logging::info!(self.log, "chunk accepted";
                                   "uploaded" => uploaded,
                                   "total" => file_size);

                    if uploaded >= file_size {
                        return Ok(uploaded_packets);
                    }
                }
                Command::ChecksumError => {
                    retries += 1;
                    logging::warn!(self.log, "server rejected the chunk, resending";
                                   "retries" => retries);
                }
                Command::Abort => {
                    logging::error!(self.log, "server aborted the transfer");
                    return Err(NetworkError::Fatal(ErrorType::Aborted));
                }
                other => {
                    retries += 1;
                    logging::warn!(self.log, "unhandled reply";
                                   "command" => ?other,
                                   "retries" => retries);
                }
            }
        }
    }

    fn confirm_completion(&mut self, socket: &mut Socket) -> NetworkResult<()> {
        let done = Packet::with_command(Command::AllDataSent);
        socket.write_packet(&done)?;

        Ok(())
    }

    /// Retry micro-protocol: tell the server its last frame arrived corrupt
    /// and wait for a clean replacement. Succeeds only on a well-formed,
    /// verified reply that is neither CHECKSUM_ERROR nor UNKNOWN.
    fn renegotiate_reply(
        &mut self,
        socket: &mut Socket,
        buffer: &mut [u8],
    ) -> NetworkResult<Packet> {
        for attempt in 0..RETRY_BUDGET {
            logging::warn!(self.log, "reply failed verification, requesting resend";
                           "attempt" => attempt + 1);

            let complaint = Packet::with_command(Command::ChecksumError);

            if socket.write_packet(&complaint)? == 0 {
                return Err(NetworkError::Fatal(ErrorType::Closed));
            }

            let reply = self.read_reply(socket, buffer)?;

            if reply.verify_checksum()
                && reply.command() != Command::ChecksumError
                && reply.command() != Command::Unknown
            {
                return Ok(reply);
            }
        }

        logging::error!(self.log, "no valid reply after repeated resend requests");
        Err(NetworkError::Fatal(ErrorType::RetryExhausted))
    }

    /// Reads one reply frame. Input that cannot be framed comes back as the
    /// unusable sentinel so the caller's verification path deals with it.
    fn read_reply(&mut self, socket: &mut Socket, buffer: &mut [u8]) -> NetworkResult<Packet> {
        let count = socket.read(buffer)?;

        if count == 0 {
            logging::error!(self.log, "server closed the connection");
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        if count < packet::MIN_SIZE {
            return Ok(Packet::unusable());
        }

        Ok(Packet::parse(&buffer[..count]).unwrap_or_else(|_| Packet::unusable()))
    }
}
