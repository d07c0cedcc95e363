use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use ballast::fs::{free_disk_space, remove_file};
use ballast::logging::{self, Logger};
use ballast::time::{timestamp_millis, Timer};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sequence folded into generated file names so concurrent sessions never
/// share an output path.
static SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Running totals for one transfer. Counters only ever grow while a
/// transfer is in flight; `reset` starts a new accounting period.
#[derive(Debug)]
pub struct Progress {
    pub chunk_size: u64,
    pub expected_packets: u64,
    pub expected_bytes: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
}

impl Progress {
    const SMALL_FILE_LIMIT: u64 = 1024;
    const LARGE_FILE_LIMIT: u64 = 1024 * 1024;
    const SMALL_CHUNK: u64 = 1024;
    const LARGE_CHUNK: u64 = 2048;

    #[inline]
    pub fn new() -> Progress {
        Progress {
            chunk_size: 0,
            expected_packets: 0,
            expected_bytes: 0,
            received_packets: 0,
            received_bytes: 0,
        }
    }

    /// Derives the chunk size and expected packet count from the announced
    /// file size. Files below 1 KiB travel whole in a single packet.
    pub fn plan(&mut self, file_size: u64) -> u64 {
        self.expected_bytes = file_size;

        if file_size < Self::SMALL_FILE_LIMIT {
            self.chunk_size = file_size;
            self.expected_packets = 1;
            return self.chunk_size;
        }

        self.chunk_size = if file_size < Self::LARGE_FILE_LIMIT {
            Self::SMALL_CHUNK
        } else {
            Self::LARGE_CHUNK
        };

        self.expected_packets = (file_size + self.chunk_size - 1) / self.chunk_size;
        self.chunk_size
    }

    /// Accounts for one accepted chunk.
    #[inline]
    pub fn record_packet(&mut self, size: u64) {
        self.received_packets += 1;
        self.received_bytes += size;
    }

    /// True once every expected packet has arrived.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.expected_packets > 0 && self.received_packets >= self.expected_packets
    }

    pub fn reset(&mut self) {
        *self = Progress::new();
    }
}

/// Server-side per-connection transfer state: the protocol counters plus
/// the single output file the session owns. An incomplete output never
/// outlives its session.
pub struct Session {
    save_dir: PathBuf,
    file_name: String,
    file: Option<File>,
    progress: Progress,
    started_at: u64,
    timer: Timer,
    log: Logger,
}

impl Session {
    pub fn new(save_dir: PathBuf, log: &Logger) -> Session {
        let file_name = Self::generate_name();
        let log = log.new(logging::o!("file" => file_name.clone()));

        Session {
            save_dir,
            file_name,
            file: None,
            progress: Progress::new(),
            started_at: timestamp_millis(),
            timer: Timer::start(),
            log,
        }
    }

    #[inline]
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    #[inline]
    pub fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }

    #[inline]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Full path of the output file.
    pub fn output_path(&self) -> PathBuf {
        self.save_dir.join(&self.file_name)
    }

    /// Checks that a file of `size` bytes can land in the save directory.
    pub fn can_save(&self, size: u64) -> NetworkResult<()> {
        if self.save_dir.as_os_str().is_empty() {
            return Err(NetworkError::Fatal(ErrorType::NoSavePath));
        }

        if free_disk_space(&self.save_dir) < size {
            return Err(NetworkError::Fatal(ErrorType::DiskFull));
        }

        Ok(())
    }

    /// Creates the output file on first use, truncating whatever the final
    /// name points at. An existing file under the generated name makes the
    /// session pick a fresh name once.
    pub fn open_file(&mut self) -> NetworkResult<()> {
        if self.file.is_some() {
            return Ok(());
        }

        if self.output_path().exists() {
            logging::warn!(self.log, "output name collision, regenerating");
            self.file_name = Self::generate_name();
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.output_path())?;

        self.file = Some(file);
        Ok(())
    }

    /// Appends one chunk to the output file.
    pub fn write_chunk(&mut self, buffer: &[u8]) -> NetworkResult<()> {
        if free_disk_space(&self.save_dir) < buffer.len() as u64 {
            return Err(NetworkError::Fatal(ErrorType::DiskFull));
        }

        match &mut self.file {
            Some(file) => {
                file.write_all(buffer)?;
                Ok(())
            }
            None => Err(NetworkError::Fatal(ErrorType::FileNotOpen)),
        }
    }

    /// Drops the counters and the output file. A partial output is removed;
    /// a fully received one stays on disk.
    pub fn reset(&mut self) {
        self.log_summary("reset");

        let remove_partial = self.file.take().is_some() && !self.progress.is_complete();
        self.progress.reset();

        if remove_partial && !remove_file(&self.output_path()) {
            logging::warn!(self.log, "failed to remove partial output";
                           "path" => %self.output_path().display());
        }
    }

    fn log_summary(&self, outcome: &str) {
        logging::info!(self.log, "session summary";
                       "outcome" => outcome,
                       "started_at_ms" => self.started_at,
                       "duration_ms" => self.timer.elapsed_millis(),
                       "received_packets" => self.progress.received_packets,
                       "received_bytes" => self.progress.received_bytes);
    }

    fn generate_name() -> String {
        let sequence = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);

        format!("{}-{}.hex", timestamp_millis(), sequence)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.file.is_some() && !self.progress.is_complete() {
            self.reset();
        } else {
            self.log_summary("closed");
        }
    }
}
