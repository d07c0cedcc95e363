use crate::net::convert;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crc::{Crc, CRC_32_ISO_HDLC};

/// Leading byte marking the start of every frame.
pub const FRAME_HEADER: u8 = 0xAA;

/// Frame size with an empty payload: header, command, length and checksum.
pub const MIN_SIZE: usize = 8;

/// Payload bytes a single frame can carry.
pub const MAX_DATA_SIZE: usize = u16::max_value() as usize;

/// Largest possible frame.
pub const MAX_SIZE: usize = MAX_DATA_SIZE + MIN_SIZE;

/// CRC-32 covering the header bytes and the payload of a frame. The lookup
/// table is built at compile time and shared read-only by every thread.
pub const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One-byte tag identifying the intent of a frame. The numeric values are
/// fixed on the wire; `Empty` and `Unknown` never travel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Empty = 0,
    RequestToSend = 1,
    RequestApproved = 2,
    RequestRejected = 3,
    PackageAccepted = 5,
    AllDataSent = 6,
    DataPackage = 7,
    ChecksumError = 8,
    Abort = 244,
    Unknown = 255,
}

impl From<u8> for Command {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => Command::Empty,
            1 => Command::RequestToSend,
            2 => Command::RequestApproved,
            3 => Command::RequestRejected,
            5 => Command::PackageAccepted,
            6 => Command::AllDataSent,
            7 => Command::DataPackage,
            8 => Command::ChecksumError,
            244 => Command::Abort,
            _ => Command::Unknown,
        }
    }
}

impl From<Command> for u8 {
    #[inline]
    fn from(command: Command) -> Self {
        command as u8
    }
}

/// The sole on-the-wire unit:
///
/// ```text
/// +------+-------+-----------+-------------------+-----------+
/// | 0xAA | cmd:1 | dlen:2 BE | data: dlen bytes  | crc32: 4  |
/// +------+-------+-----------+-------------------+-----------+
/// ```
///
/// Packets are plain values; the transfer engines move them between their
/// slots instead of sharing them.
#[derive(Debug, Eq, PartialEq)]
pub struct Packet {
    command: Command,
    data: Vec<u8>,
    crc: [u8; 4],
}

impl Packet {
    #[inline]
    pub fn new() -> Packet {
        Packet {
            command: Command::Empty,
            data: Vec::new(),
            crc: [0; 4],
        }
    }

    /// Fresh packet carrying `command` with its checksum already computed.
    pub fn with_command(command: Command) -> Packet {
        let mut packet = Packet::new();
        packet.set_command(command);
        packet.compute_checksum();
        packet
    }

    /// Sentinel for input that could not be framed: command `Unknown` and a
    /// checksum that never verifies.
    pub fn unusable() -> Packet {
        let mut packet = Packet::new();
        packet.command = Command::Unknown;
        packet
    }

    #[inline]
    pub fn command(&self) -> Command {
        self.command
    }

    #[inline]
    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Replaces the payload. Anything beyond the frame's capacity is dropped.
    pub fn set_data(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(MAX_DATA_SIZE);
        self.data.clear();
        self.data.extend_from_slice(&bytes[..take]);
    }

    /// Replaces the payload with the first `count` bytes of `bytes`.
    pub fn set_data_sized(&mut self, bytes: &[u8], count: usize) {
        let take = count.min(bytes.len());
        self.set_data(&bytes[..take]);
    }

    /// Stores an integer payload in its natural width, big-endian.
    pub fn set_data_u64(&mut self, value: u64) {
        self.set_data(&convert::u64_to_bytes(value));
    }

    /// Computes the checksum over the header bytes and the payload and
    /// stores it.
    pub fn compute_checksum(&mut self) {
        self.crc = self.current_checksum();
    }

    /// Recomputes the checksum and compares it to the stored one. The stored
    /// value is left untouched.
    pub fn verify_checksum(&self) -> bool {
        self.current_checksum() == self.crc
    }

    fn current_checksum(&self) -> [u8; 4] {
        let length = convert::u16_to_bytes(self.data.len() as u16);

        let mut digest = FRAME_CRC.digest();
        digest.update(&[FRAME_HEADER, self.command.into(), length[0], length[1]]);
        digest.update(&self.data);
        digest.finalize().to_be_bytes()
    }

    /// Emits the full frame: header, command, payload length, payload and
    /// checksum.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MIN_SIZE + self.data.len());

        frame.push(FRAME_HEADER);
        frame.push(self.command.into());
        frame.extend_from_slice(&convert::u16_to_bytes(self.data.len() as u16));
        frame.extend_from_slice(&self.data);
        frame.extend_from_slice(&self.crc);
        frame
    }

    /// Parses the first frame found in `bytes`, ignoring any noise before
    /// the header byte. A missing header or a remainder below the minimum
    /// frame size is a parse failure. A declared payload length running past
    /// the end of the input yields a packet that fails verification instead
    /// of an error.
    pub fn parse(bytes: &[u8]) -> NetworkResult<Packet> {
        let start = match bytes.iter().position(|&byte| byte == FRAME_HEADER) {
            Some(start) => start,
            None => return Err(NetworkError::Fatal(ErrorType::NoHeader)),
        };

        let frame = &bytes[start..];

        if frame.len() < MIN_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Truncated));
        }

        let declared = convert::u16_from_bytes(&frame[2..4])? as usize;
        let available = declared.min(frame.len() - MIN_SIZE);

        let mut packet = Packet::new();
        packet.command = Command::from(frame[1]);
        packet.data.extend_from_slice(&frame[4..4 + available]);
        packet.crc.copy_from_slice(&frame[4 + available..4 + available + 4]);

        Ok(packet)
    }
}
