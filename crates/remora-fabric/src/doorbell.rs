//! Socketpair doorbell backing the completion notification channel.
//!
//! A doorbell is a nonblocking SOCK_DGRAM socketpair: one end is written
//! with a 1-byte datagram to signal, the other end is wrapped in
//! [`AsyncFd`] and drained to wait. Signals coalesce — several datagrams
//! are drained by a single wait, and a full socket buffer means the
//! waiter is already signaled, so a dropped datagram loses nothing.

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// A one-process doorbell: signal from any thread, await on the waiter side.
pub struct Doorbell {
    wait_fd: AsyncFd<OwnedFd>,
    signal_fd: OwnedFd,
}

impl Doorbell {
    /// Create a doorbell. Must be called within a tokio runtime.
    pub fn new() -> io::Result<Self> {
        let (wait_end, signal_end) = create_socketpair()?;
        set_nonblocking(wait_end.as_raw_fd())?;
        set_nonblocking(signal_end.as_raw_fd())?;

        Ok(Self {
            wait_fd: AsyncFd::new(wait_end)?,
            signal_fd: signal_end,
        })
    }

    /// Ring the doorbell. Never blocks.
    pub fn signal(&self) {
        let buf = [1u8];
        let ret = unsafe {
            libc::send(
                self.signal_fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            // WouldBlock: the buffer is full, so the waiter is already
            // signaled and will drain everything in one pass.
            if err.kind() != ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "doorbell signal failed");
            }
        }
    }

    /// Wait until the doorbell has been rung, then drain all pending signals.
    pub async fn wait(&self) -> io::Result<()> {
        if drain_fd(self.wait_fd.get_ref().as_raw_fd())? {
            return Ok(());
        }

        loop {
            let mut guard = self.wait_fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| {
                let drained = drain_fd(inner.get_ref().as_raw_fd())?;
                if drained {
                    Ok(())
                } else {
                    Err(io::Error::from(ErrorKind::WouldBlock))
                }
            }) {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

}

/// Drain every pending datagram. Returns whether anything was read.
fn drain_fd(fd: RawFd) -> io::Result<bool> {
    let mut buf = [0u8; 64];
    let mut drained = false;

    loop {
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };

        if ret > 0 {
            drained = true;
            continue;
        }
        if ret == 0 {
            return Ok(drained);
        }

        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock {
            return Ok(drained);
        }
        return Err(err);
    }
}

fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    #[cfg(target_os = "linux")]
    let sock_type = libc::SOCK_DGRAM | libc::SOCK_NONBLOCK;
    #[cfg(not(target_os = "linux"))]
    let sock_type = libc::SOCK_DGRAM;

    let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd0 = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let fd1 = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((fd0, fd1))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_then_wait() {
        let bell = Doorbell::new().unwrap();
        bell.signal();
        bell.wait().await.unwrap();
    }

    #[tokio::test]
    async fn signals_coalesce() {
        let bell = Doorbell::new().unwrap();
        for _ in 0..10 {
            bell.signal();
        }
        // One wait drains everything; a follow-up wait must block.
        bell.wait().await.unwrap();

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), bell.wait()).await;
        assert!(blocked.is_err(), "wait returned without a fresh signal");
    }

    #[tokio::test]
    async fn wait_before_signal() {
        let bell = std::sync::Arc::new(Doorbell::new().unwrap());
        let ringer = bell.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            ringer.signal();
        });
        bell.wait().await.unwrap();
        handle.await.unwrap();
    }
}
