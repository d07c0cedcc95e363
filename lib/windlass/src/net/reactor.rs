use crate::net::support::NetworkResult;
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Events drained per readiness wait.
const MAX_EVENTS: usize = 10;

/// Upper bound on a single readiness wait. The stop flag is re-checked at
/// this cadence even on a silent descriptor.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

const REACTOR_TOKEN: Token = Token(0);

/// Handler outcome deciding whether the reactor keeps running.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    Continue,
    Exit,
}

/// Readiness callbacks for the single descriptor a reactor drives. The
/// default for either event kind keeps the loop running.
pub trait EventHandler {
    fn readable(&mut self) -> Verdict {
        Verdict::Continue
    }

    fn writable(&mut self) -> Verdict {
        Verdict::Continue
    }
}

/// Interest mask for a listening socket: incoming connections plus error
/// conditions.
pub fn accept_interest() -> Ready {
    Ready::readable() | Ready::from(UnixReady::priority() | UnixReady::hup() | UnixReady::error())
}

/// Interest mask for a connected transfer socket.
pub fn stream_interest() -> Ready {
    Ready::readable()
        | Ready::writable()
        | Ready::from(UnixReady::hup() | UnixReady::error())
}

/// Level-triggered readiness loop pinned to one file descriptor and one
/// interest mask. Handlers run on the thread that called `start`, one event
/// at a time.
pub struct Reactor {
    fd: RawFd,
    interest: Ready,
    poll: Option<Poll>,
    events: Events,
    stop: Arc<AtomicBool>,
}

impl Reactor {
    /// Creates a reactor for `fd`. The `stop` flag is observed at the top of
    /// every iteration, so it may be raised from other threads or from
    /// signal context.
    pub fn new(fd: RawFd, interest: Ready, stop: Arc<AtomicBool>) -> Reactor {
        Reactor {
            fd,
            interest,
            poll: None,
            events: Events::with_capacity(MAX_EVENTS),
            stop,
        }
    }

    /// Registers the descriptor with the readiness facility.
    pub fn init(&mut self) -> NetworkResult<()> {
        let poll = Poll::new()?;

        poll.register(
            &EventedFd(&self.fd),
            REACTOR_TOKEN,
            self.interest,
            PollOpt::level(),
        )?;

        self.poll = Some(poll);
        Ok(())
    }

    /// Flag that makes the loop exit at the top of its next iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs the loop until the stop flag is raised, the wait is interrupted
    /// by a signal, the descriptor reports an error or hangup, or a handler
    /// votes to exit.
    pub fn start<H: EventHandler>(&mut self, handler: &mut H) -> NetworkResult<()> {
        let poll = self
            .poll
            .as_ref()
            .expect("Reactor must be initialized before starting");

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            let count = match poll.poll_interruptible(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            if count == 0 {
                continue;
            }

            for event in self.events.iter() {
                let readiness = event.readiness();
                let unix_readiness = UnixReady::from(readiness);

                if unix_readiness.is_hup() || unix_readiness.is_error() {
                    return Ok(());
                }

                if readiness.is_readable() && self.interest.is_readable() {
                    if let Verdict::Exit = handler.readable() {
                        return Ok(());
                    }
                }

                if readiness.is_writable() && self.interest.is_writable() {
                    if let Verdict::Exit = handler.writable() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(poll) = &self.poll {
            drop(poll.deregister(&EventedFd(&self.fd)));
        }
    }
}
