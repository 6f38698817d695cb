//! Relay of "needs translation" messages from forked children to the fork
//! server, so that the next child inherits the translation from its parent.
//!
//! Everything here is advisory. A request that cannot be delivered is simply
//! dropped, the only cost is that the next child translates the block again.

use crate::pipe;

use serde_derive::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::{
    fs::File,
    io::{self, Read},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    result,
};

/// Size of a serialized [`TranslationRequest`] on the wire.
pub const REQUEST_SIZE: usize = 24;

/// A block the engine had to translate because no cached translation existed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationRequest {
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u64,
}

impl TranslationRequest {
    pub fn new(pc: u64, cs_base: u64, flags: u64) -> Self {
        Self { pc, cs_base, flags }
    }

    pub fn encode(&self) -> Result<[u8; REQUEST_SIZE]> {
        let mut buf = [0u8; REQUEST_SIZE];
        bincode::serialize_into(&mut buf[..], self).context(EncodeFailed)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> Result<Self> {
        bincode::deserialize(buf).context(DecodeFailed)
    }
}

/// Request side, used by forked children.
#[derive(Debug, Clone, Copy)]
pub struct RelaySender {
    fd: RawFd,
}

impl RelaySender {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Sends `request` to the fork server without ever blocking on a full
    /// pipe. Returns whether the whole record was written.
    pub fn send(&self, request: &TranslationRequest) -> bool {
        let buf = match request.encode() {
            Ok(buf) => buf,
            Err(_) => return false,
        };

        // Records are smaller than PIPE_BUF, so the write is all or nothing.
        let written = unsafe { libc::write(self.fd, buf.as_ptr().cast(), REQUEST_SIZE) };
        if written != REQUEST_SIZE as isize {
            log::trace!("Dropped translation request for {:#x}", request.pc);
            return false;
        }

        true
    }
}

/// Per-child relay channel, created right before `fork`.
///
/// The write end lives on the fixed relay descriptor so that the child can
/// find it without any further setup.
#[derive(Debug)]
pub struct RelayPipe {
    reader: File,
    relay_fd: RawFd,
}

impl RelayPipe {
    pub fn open(relay_fd: RawFd) -> Result<Self> {
        let (mut reader, writer) = pipe::pipe().context(PipeFailed)?;
        if reader.as_raw_fd() == relay_fd {
            // Make room for the write end.
            reader = reader.try_clone().context(PipeFailed)?;
        }
        if writer.as_raw_fd() == relay_fd {
            // Already in place, keep it open.
            let _ = writer.into_raw_fd();
        } else {
            if unsafe { libc::dup2(writer.as_raw_fd(), relay_fd) } < 0 {
                return Err(io::Error::last_os_error()).context(DupFailed { fd: relay_fd });
            }
            drop(writer);
        }

        Ok(Self { reader, relay_fd })
    }

    /// Child side: only the write end survives and it never blocks.
    pub fn into_child(self) -> RelaySender {
        let RelayPipe { reader, relay_fd } = self;
        drop(reader);

        unsafe {
            let flags = libc::fcntl(relay_fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(relay_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        RelaySender::new(relay_fd)
    }

    /// Parent side: the write end must be closed here, otherwise the reader
    /// never sees the end of the stream when the child dies.
    pub fn into_parent(self) -> File {
        unsafe { libc::close(self.relay_fd) };
        self.reader
    }
}

/// Reads requests until the writing side goes away, handing each one to
/// `on_request`. Returns the number of requests seen.
pub fn drain_requests<R, F>(mut reader: R, mut on_request: F) -> usize
where
    R: Read,
    F: FnMut(&TranslationRequest),
{
    let mut count = 0;
    let mut buf = [0u8; REQUEST_SIZE];

    // A broken pipe means the child is gone, back to the fork server loop.
    while reader.read_exact(&mut buf).is_ok() {
        match TranslationRequest::decode(&buf) {
            Ok(request) => {
                on_request(&request);
                count += 1;
            },
            Err(error) => log::warn!("Skipping malformed translation request: {}", error),
        }
    }

    count
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not create relay pipe: {}", source))]
    PipeFailed { source: io::Error },
    #[snafu(display("Could not move relay pipe to descriptor {}: {}", fd, source))]
    DupFailed { fd: RawFd, source: io::Error },
    #[snafu(display("Could not encode translation request: {}", source))]
    EncodeFailed { source: bincode::Error },
    #[snafu(display("Could not decode translation request: {}", source))]
    DecodeFailed { source: bincode::Error },
}
