//! TCP fast open as a platform capability.
//!
//! Kernels with support get the socket option set between bind and
//! listen. Everything else is a no-op, so a fast-open listener constructs
//! on every platform; an error is surfaced only when the platform claims
//! support and the system call itself fails.

use std::io;

use socket2::Socket;

/// Pending fast-open handshakes queued by the kernel.
#[cfg(any(target_os = "linux", target_os = "android"))]
const FASTOPEN_QUEUE: libc::c_int = 256;

/// Enable fast open for the listening socket.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn enable(socket: &Socket) -> io::Result<()> {
    set_fastopen(socket, FASTOPEN_QUEUE)
}

/// Enable fast open for the listening socket. On these kernels the option
/// is a boolean toggle rather than a queue length.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) fn enable(socket: &Socket) -> io::Result<()> {
    set_fastopen(socket, 1)
}

/// Enable fast open for the listening socket. Not supported on this
/// platform.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
pub(crate) fn enable(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
))]
fn set_fastopen(socket: &Socket, value: libc::c_int) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
