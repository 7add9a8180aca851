//! The endpoint socket: a local socketpair whose far end is surrendered to
//! the kernel through the VHCI attach attribute.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::os::unix::prelude::{AsRawFd, RawFd};

/// Scoped socketpair. The bridge reads and writes USB/IP packets on its end;
/// the kernel end's file descriptor goes into the `attach` string and must
/// stay open in this process until the attach write has happened.
#[derive(Debug)]
pub struct EndpointSocket {
    bridge_end: UnixStream,
    kernel_end: Option<UnixStream>,
}

impl EndpointSocket {
    pub fn new() -> io::Result<Self> {
        let (bridge_end, kernel_end) = UnixStream::pair()?;
        Ok(Self {
            bridge_end,
            kernel_end: Some(kernel_end),
        })
    }

    /// File descriptor of the kernel end, for the VHCI attach string.
    pub fn kernel_fd(&self) -> Option<RawFd> {
        self.kernel_end.as_ref().map(|s| s.as_raw_fd())
    }

    /// Takes ownership of the kernel end. Used by tests and tooling that play
    /// the kernel's role; after a successful VHCI attach the kernel holds its
    /// own reference and this end may simply be dropped.
    pub fn take_kernel_end(&mut self) -> Option<UnixStream> {
        self.kernel_end.take()
    }

    /// An independent handle onto the bridge end for the reader or writer
    /// thread.
    pub fn bridge_end(&self) -> io::Result<UnixStream> {
        self.bridge_end.try_clone()
    }

    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        (&self.bridge_end).read_exact(buf)
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.bridge_end).write_all(buf)
    }

    /// Ordered close: shut down both directions on both ends so a blocked
    /// reader observes EOF, then let drop close the descriptors.
    pub fn shutdown(&self) {
        let _ = self.bridge_end.shutdown(Shutdown::Both);
        if let Some(kernel_end) = &self.kernel_end {
            let _ = kernel_end.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for EndpointSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}
