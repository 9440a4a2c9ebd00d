//! Supervisor/container handoff channel.
//!
//! Two close-on-exec pipes, one per direction, carrying length-prefixed JSON
//! [`HandoffMessage`]s. Every receive is bounded by a timeout. End of file
//! means the peer is gone; once the container has been told to proceed, end
//! of file on its pipe is also how a successful `exec` shows up.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::{Deserialize, Serialize};
use skiff_common::error::{Result, SkiffError};

/// Largest frame accepted from the peer.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Width of the big-endian length prefix.
const LEN_PREFIX: usize = 4;

/// Container-side setup step that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupStage {
    /// Waiting on or writing to the channel.
    Handoff,
    /// Setting the UTS hostname.
    Hostname,
    /// Pivoting into the root filesystem.
    RootSwitch,
    /// Executing the entry point.
    Exec,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Handoff => "handoff",
            Self::Hostname => "hostname",
            Self::RootSwitch => "root switch",
            Self::Exec => "exec",
        })
    }
}

impl SetupStage {
    /// Converts a failure reported by the container into the supervisor's error.
    #[must_use]
    pub fn into_error(self, message: String) -> SkiffError {
        match self {
            Self::RootSwitch => SkiffError::RootSwitch { message },
            other => SkiffError::Handoff {
                message: format!("container {other} failed: {message}"),
            },
        }
    }
}

/// A message on the handoff channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoffMessage {
    /// Supervisor to container: the network interface is in place.
    NetworkReady,
    /// Container to supervisor: the root filesystem has been switched.
    RootSwitched,
    /// Supervisor to container: confinement is done, exec the entry point.
    Proceed,
    /// Container to supervisor: a setup step failed and the container exits.
    Failed {
        /// Step that failed.
        stage: SetupStage,
        /// Description of the failure.
        message: String,
    },
}

/// One end of the handoff channel: a read pipe and a write pipe.
#[derive(Debug)]
pub struct HandoffChannel {
    reader: File,
    writer: File,
}

impl HandoffChannel {
    /// Creates a connected pair of ends: `(supervisor, container)`.
    ///
    /// All four descriptors are close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Handoff`] if a pipe cannot be created.
    #[cfg(target_os = "linux")]
    pub fn pair() -> Result<(Self, Self)> {
        use nix::fcntl::OFlag;
        use nix::unistd::pipe2;

        let pipe = || {
            pipe2(OFlag::O_CLOEXEC).map_err(|e| SkiffError::Handoff {
                message: format!("pipe2: {e}"),
            })
        };
        let (to_supervisor_read, to_supervisor_write) = pipe()?;
        let (to_container_read, to_container_write) = pipe()?;

        let supervisor = Self {
            reader: File::from(to_supervisor_read),
            writer: File::from(to_container_write),
        };
        let container = Self {
            reader: File::from(to_container_read),
            writer: File::from(to_supervisor_write),
        };
        Ok((supervisor, container))
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error.
    #[cfg(not(target_os = "linux"))]
    pub fn pair() -> Result<(Self, Self)> {
        Err(SkiffError::Handoff {
            message: "handoff channel requires Linux".into(),
        })
    }

    /// Raw descriptors of this end, reader first.
    #[must_use]
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.reader.as_raw_fd(), self.writer.as_raw_fd()]
    }

    /// Writes one message as a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Handoff`] if the peer has closed its end or the
    /// write fails.
    pub fn send(&mut self, message: &HandoffMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= MAX_FRAME_LEN)
            .ok_or_else(|| handoff_error(format!("message of {} bytes too large", payload.len())))?;

        let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        self.writer
            .write_all(&frame)
            .map_err(|e| handoff_error(format!("send {message:?}: {e}")))
    }

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` if the peer closed its end before sending anything.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Handoff`] on timeout, a truncated or oversized
    /// frame, or a read failure, and [`SkiffError::Serialization`] if the
    /// frame is not a valid message.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<HandoffMessage>> {
        let deadline = Instant::now() + timeout;
        wait_readable(&self.reader, deadline, timeout)?;

        let mut len = [0_u8; LEN_PREFIX];
        if !read_full(&mut self.reader, &mut len)? {
            return Ok(None);
        }
        let len = usize::try_from(u32::from_be_bytes(len)).unwrap_or(usize::MAX);
        if len > MAX_FRAME_LEN {
            return Err(handoff_error(format!("frame of {len} bytes exceeds limit")));
        }

        let mut payload = vec![0_u8; len];
        if !read_full(&mut self.reader, &mut payload)? {
            return Err(handoff_error("peer closed the channel mid-frame"));
        }
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

/// Blocks until `file` is readable (data or hang-up) or `deadline` passes.
fn wait_readable(file: &File, deadline: Instant, timeout: Duration) -> Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(handoff_error(format!("timed out after {timeout:?}")));
        }
        let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => {}
            Ok(_) => return Ok(()),
            Err(e) => return Err(handoff_error(format!("poll: {e}"))),
        }
    }
}

/// Fills `buf`; `false` if end of file came before the first byte.
fn read_full(reader: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(handoff_error("peer closed the channel mid-frame")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(handoff_error(format!("read: {e}"))),
        }
    }
    Ok(true)
}

fn handoff_error(message: impl Into<String>) -> SkiffError {
    SkiffError::Handoff {
        message: message.into(),
    }
}
