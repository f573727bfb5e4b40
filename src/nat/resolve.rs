//! Original destination recovery
//!
//! A connection redirected by a `REDIRECT` rule appears to target the
//! proxy's own listening port. The kernel's connection tracking still knows
//! where the client meant to go; `getsockopt(SOL_IP, SO_ORIGINAL_DST)`
//! returns it as a `sockaddr_in`:
//!
//! ```text
//! offset  0..2   sin_family  (native endian, AF_INET)
//! offset  2..4   sin_port    (big endian)
//! offset  4..8   sin_addr    (network order octets)
//! offset  8..16  padding
//! ```
//!
//! Only IPv4 is supported. Any other family is reported as
//! [`ResolveError::UnsupportedFamily`].

use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;

use bytes::BufMut;
use tracing::debug;

use crate::error::ResolveError;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Size of the `sockaddr_in` the kernel fills in
pub const SOCKADDR_IN_LEN: usize = 16;

/// Address-type tag for IPv4 in the raw form (SOCKS5 `ATYP`)
pub const ADDR_TYPE_IPV4: u8 = 0x01;

/// Length of [`OriginalDestination::raw`]
pub const RAW_ADDR_LEN: usize = 7;

/// Kernel query for a socket's pre-redirection destination.
///
/// Production code uses [`KernelQuery`]; tests substitute canned results.
pub trait OriginalDstQuery: Send + Sync {
    /// Fill a raw `sockaddr_in` for the socket.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by the query.
    fn query(&self, fd: BorrowedFd<'_>) -> io::Result<[u8; SOCKADDR_IN_LEN]>;
}

/// `getsockopt(SOL_IP, SO_ORIGINAL_DST)`
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelQuery;

impl OriginalDstQuery for KernelQuery {
    fn query(&self, fd: BorrowedFd<'_>) -> io::Result<[u8; SOCKADDR_IN_LEN]> {
        let mut buf = [0u8; SOCKADDR_IN_LEN];
        let mut len = SOCKADDR_IN_LEN as libc::socklen_t;

        // SAFETY: This is safe because:
        // 1. `fd` is borrowed, so the descriptor stays open for the call
        // 2. `buf` is a writable stack buffer of `SOCKADDR_IN_LEN` bytes
        // 3. `len` is initialised to the buffer size; the kernel writes at most that much
        let ret = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                &raw mut len,
            )
        };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        if (len as usize) < SOCKADDR_IN_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("SO_ORIGINAL_DST returned {len} bytes, expected {SOCKADDR_IN_LEN}"),
            ));
        }
        Ok(buf)
    }
}

/// Where a redirected client originally connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginalDestination {
    addr: SocketAddrV4,
}

impl OriginalDestination {
    /// Wrap a known destination
    #[must_use]
    pub const fn new(addr: SocketAddrV4) -> Self {
        Self { addr }
    }

    /// Decode a raw `sockaddr_in` returned by the kernel.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::UnsupportedFamily` if the family is not
    /// `AF_INET`.
    pub fn from_sockaddr(raw: &[u8; SOCKADDR_IN_LEN]) -> Result<Self, ResolveError> {
        let family = u16::from_ne_bytes([raw[0], raw[1]]);
        if libc::c_int::from(family) != libc::AF_INET {
            return Err(ResolveError::UnsupportedFamily(family));
        }

        let port = u16::from_be_bytes([raw[2], raw[3]]);
        let ip = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
        Ok(Self::new(SocketAddrV4::new(ip, port)))
    }

    /// Destination as a socket address
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// Destination IP
    #[must_use]
    pub const fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    /// Destination port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Self-describing wire form: type tag, 4 address octets, 2 port bytes
    #[must_use]
    pub fn raw(&self) -> [u8; RAW_ADDR_LEN] {
        let [a, b, c, d] = self.ip().octets();
        let [hi, lo] = self.port().to_be_bytes();
        [ADDR_TYPE_IPV4, a, b, c, d, hi, lo]
    }

    /// Write the wire form into a buffer
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.raw());
    }

    /// `"a.b.c.d:port"`
    #[must_use]
    pub fn host_port(&self) -> String {
        self.addr.to_string()
    }
}

impl fmt::Display for OriginalDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

impl From<OriginalDestination> for std::net::SocketAddr {
    fn from(dst: OriginalDestination) -> Self {
        Self::V4(dst.addr)
    }
}

/// Recovers original destinations of accepted connections.
///
/// Stateless apart from the query implementation; share it freely between
/// connection tasks.
#[derive(Clone)]
pub struct DestinationResolver {
    query: Arc<dyn OriginalDstQuery>,
}

impl DestinationResolver {
    /// Resolver backed by the kernel
    #[must_use]
    pub fn kernel() -> Self {
        Self::with_query(Arc::new(KernelQuery))
    }

    /// Resolver backed by a custom query
    #[must_use]
    pub fn with_query(query: Arc<dyn OriginalDstQuery>) -> Self {
        Self { query }
    }

    /// Resolve the pre-redirection destination of `conn`.
    ///
    /// The connection is borrowed for the whole call, so its descriptor
    /// cannot be closed or reused underneath the query.
    ///
    /// # Errors
    ///
    /// - `ResolveError::Descriptor` if the descriptor is not a socket
    /// - `ResolveError::Query` if the kernel has no redirect record for it
    /// - `ResolveError::UnsupportedFamily` for non-IPv4 destinations
    pub fn resolve<S: AsFd>(&self, conn: &S) -> Result<OriginalDestination, ResolveError> {
        let fd = conn.as_fd();
        let raw = self.query.query(fd).map_err(|e| match e.raw_os_error() {
            Some(libc::EBADF | libc::ENOTSOCK) => ResolveError::Descriptor(e),
            _ => ResolveError::Query(e),
        })?;

        let dst = OriginalDestination::from_sockaddr(&raw)?;
        debug!("NAT: fd {} original destination {}", fd.as_raw_fd(), dst);
        Ok(dst)
    }
}

impl Default for DestinationResolver {
    fn default() -> Self {
        Self::kernel()
    }
}

impl fmt::Debug for DestinationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationResolver").finish_non_exhaustive()
    }
}

/// Resolve with the kernel query.
///
/// # Errors
///
/// See [`DestinationResolver::resolve`].
pub fn resolve<S: AsFd>(conn: &S) -> Result<OriginalDestination, ResolveError> {
    DestinationResolver::kernel().resolve(conn)
}

const _: () = assert!(mem::size_of::<libc::sockaddr_in>() == SOCKADDR_IN_LEN);
