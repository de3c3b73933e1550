use std::io::{self, Read, Write};
use std::mem::{size_of, size_of_val, zeroed};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::credentials::Credentials;
use crate::error::{Error, ErrorKind, Result};
use crate::fd_list::FdList;

use super::{Ancillary, Transport};

/// The maximum number of file descriptors received with a single read.
const MAX_FDS: usize = 1024;

/// A transport over a local unix domain socket.
///
/// This supports passing credentials with the leading NUL byte of the
/// authentication handshake and passing file descriptors alongside messages.
///
/// The socket is registered with the reactor of the shared worker runtime, so
/// it can be driven from any runtime.
pub struct UnixTransport {
    stream: AsyncFd<UnixStream>,
}

impl UnixTransport {
    /// Construct a transport from a standard library stream.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let _guard = crate::worker::runtime::handle()?.enter();

        Ok(Self {
            stream: AsyncFd::new(stream)?,
        })
    }

    /// Construct a transport from a tokio stream.
    pub fn from_tokio(stream: tokio::net::UnixStream) -> io::Result<Self> {
        Self::new(stream.into_std()?)
    }

    /// Construct a connected pair of transports.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    fn fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    /// Perform a non-blocking operation once the socket is ready for the given
    /// interest.
    async fn io<F, R>(&self, interest: Interest, mut f: F) -> Result<R>
    where
        F: FnMut(&UnixStream) -> io::Result<R>,
    {
        loop {
            let mut guard = self.stream.ready(interest).await?;

            match guard.try_io(|inner| f(inner.get_ref())) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }
}

impl Transport for UnixTransport {
    #[inline]
    fn stream_type(&self) -> &'static str {
        "UnixStream"
    }

    async fn read<'a>(&'a self, buf: &'a mut [u8]) -> Result<usize> {
        let n = self
            .io(Interest::READABLE, |mut stream| stream.read(buf))
            .await?;
        transport_debug!(bytes = n, "read");
        Ok(n)
    }

    async fn read_with_ancillary<'a>(
        &'a self,
        buf: &'a mut [u8],
        ancillary: &'a mut Vec<Ancillary>,
    ) -> Result<usize> {
        let n = self
            .io(Interest::READABLE, |stream| {
                recvmsg(stream.as_raw_fd(), buf, ancillary)
            })
            .await?;
        transport_debug!(bytes = n, ancillary = ancillary.len(), "read");
        Ok(n)
    }

    async fn write<'a>(&'a self, buf: &'a [u8]) -> Result<usize> {
        let n = self
            .io(Interest::WRITABLE, |mut stream| stream.write(buf))
            .await?;
        transport_debug!(bytes = n, "wrote");
        Ok(n)
    }

    #[inline]
    fn supports_fd_passing(&self) -> bool {
        true
    }

    async fn send_with_fds<'a>(&'a self, byte: u8, fds: &'a FdList) -> Result<()> {
        let raw = fds.raw_fds();

        if raw.is_empty() {
            return super::write_all(self, &[byte]).await;
        }

        let n = self
            .io(Interest::WRITABLE, |stream| {
                sendmsg_rights(stream.as_raw_fd(), byte, &raw)
            })
            .await?;

        if n != 1 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }

        transport_debug!(fds = raw.len(), "wrote first byte with file descriptors");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        match self.stream.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn send_credentials(&self) -> Result<Option<Credentials>> {
        send_credentials(self).await
    }

    async fn receive_credentials(&self) -> Result<Option<Credentials>> {
        receive_credentials(self).await
    }

    fn peer_credentials(&self) -> Result<Credentials> {
        peer_credentials(self.fd())
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
async fn send_credentials(transport: &UnixTransport) -> Result<Option<Credentials>> {
    let n = transport
        .io(Interest::WRITABLE, |stream| {
            sendmsg_credentials(stream.as_raw_fd())
        })
        .await?;

    if n != 1 {
        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
    }

    Ok(Some(Credentials::current()))
}

/// Without a credentials message the peer asks the socket who we are, so our
/// own credentials are still what the peer sees.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
async fn send_credentials(transport: &UnixTransport) -> Result<Option<Credentials>> {
    super::write_all(transport, &[0]).await?;

    let credentials = Credentials::current();

    if credentials.unix_user().is_err() {
        return Ok(None);
    }

    Ok(Some(credentials))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
async fn receive_credentials(transport: &UnixTransport) -> Result<Option<Credentials>> {
    let fd = transport.fd();
    set_passcred(fd, true)?;

    let mut byte = [0u8];
    let mut ancillary = Vec::new();

    let result = transport
        .io(Interest::READABLE, |stream| {
            recvmsg(stream.as_raw_fd(), &mut byte, &mut ancillary)
        })
        .await;

    let restore = set_passcred(fd, false);
    let n = result?;
    restore?;

    if n == 0 {
        return Err(Error::new(ErrorKind::ZeroRead));
    }

    let mut credentials = None;

    for message in ancillary {
        match message {
            Ancillary::Credentials(received) if credentials.is_none() => {
                credentials = Some(received);
            }
            _ => {
                return Err(Error::new(ErrorKind::CredentialsMessage));
            }
        }
    }

    Ok(credentials)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
async fn receive_credentials(transport: &UnixTransport) -> Result<Option<Credentials>> {
    let mut byte = [0u8];

    if transport.read(&mut byte).await? == 0 {
        return Err(Error::new(ErrorKind::ZeroRead));
    }

    Ok(None)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_passcred(fd: RawFd, enabled: bool) -> io::Result<()> {
    let value: libc::c_int = enabled.into();

    // SAFETY: The option value is a valid c_int of the advertised size.
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            ptr::addr_of!(value).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// `SCM_CREDS` is attached by the sender, so there is nothing to enable.
#[cfg(target_os = "freebsd")]
fn set_passcred(_: RawFd, _: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_credentials(fd: RawFd) -> Result<Credentials> {
    use crate::credentials::{Native, UnixCred};

    // SAFETY: ucred is plain old data.
    let mut ucred: libc::ucred = unsafe { zeroed() };
    let mut len = size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: The buffer is a valid ucred of the advertised size.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            ptr::addr_of_mut!(ucred).cast(),
            &mut len,
        )
    };

    if result == -1 {
        return Err(io::Error::last_os_error().into());
    }

    if len as usize != size_of::<libc::ucred>() {
        return Err(Error::new(ErrorKind::CredentialsUnsupported));
    }

    Ok(Credentials::from_native(Native::LinuxUcred(UnixCred {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
))]
fn peer_credentials(fd: RawFd) -> Result<Credentials> {
    use crate::credentials::{AppleXucred, Native, NativeKind, UnixCred};

    let mut uid = 0;
    let mut gid = 0;

    // SAFETY: Both out pointers are valid.
    if unsafe { libc::getpeereid(fd, &mut uid, &mut gid) } == -1 {
        return Err(io::Error::last_os_error().into());
    }

    let cred = UnixCred {
        pid: -1,
        uid: uid as u32,
        gid: gid as u32,
    };

    let native = match NativeKind::PLATFORM {
        Some(NativeKind::AppleXucred) => Native::AppleXucred(AppleXucred {
            version: 0,
            uid: cred.uid,
            groups: vec![cred.gid],
        }),
        Some(NativeKind::NetbsdUnpcbid) => Native::NetbsdUnpcbid(cred),
        Some(NativeKind::OpenbsdSockpeercred) => Native::OpenbsdSockpeercred(cred),
        _ => Native::FreebsdCmsgcred(cred),
    };

    Ok(Credentials::from_native(native))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
fn peer_credentials(_: RawFd) -> Result<Credentials> {
    Err(Error::new(ErrorKind::CredentialsUnsupported))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Allocate a zeroed control buffer with the alignment of `cmsghdr`.
fn control_buffer(len: usize) -> Vec<u64> {
    vec![0u64; len.div_ceil(size_of::<u64>())]
}

/// Receive data and ancillary messages from a socket.
fn recvmsg(fd: RawFd, buf: &mut [u8], ancillary: &mut Vec<Ancillary>) -> io::Result<usize> {
    // SAFETY: CMSG_SPACE only performs arithmetic.
    let space = unsafe {
        libc::CMSG_SPACE((MAX_FDS * size_of::<libc::c_int>()) as u32) as usize
            + libc::CMSG_SPACE(128) as usize
    };

    let mut control = control_buffer(space);

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is plain old data.
    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = size_of_val(control.as_slice()) as _;

    // SAFETY: Every pointer in msg refers to a live buffer of the advertised
    // size.
    let n = unsafe { libc::recvmsg(fd, &mut msg, RECV_FLAGS) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        tracing::warn!("Ancillary data was truncated while reading from socket");
    }

    // SAFETY: msg was filled in by recvmsg and the control buffer is alive.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);

        while !cmsg.is_null() {
            let header = &*cmsg;
            let data = libc::CMSG_DATA(cmsg);
            let len = header.cmsg_len as usize - libc::CMSG_LEN(0) as usize;

            ancillary.extend(parse_cmsg(header.cmsg_level, header.cmsg_type, data, len));
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(n as usize)
}

/// Parse a single control message.
///
/// # Safety
///
/// `data` must point to `len` readable bytes.
unsafe fn parse_cmsg(level: libc::c_int, ty: libc::c_int, data: *const u8, len: usize) -> Option<Ancillary> {
    if level == libc::SOL_SOCKET && ty == libc::SCM_RIGHTS {
        let count = len / size_of::<libc::c_int>();
        let mut fds = FdList::new();

        for n in 0..count {
            let fd = ptr::read_unaligned(data.cast::<libc::c_int>().add(n));
            fds.push(OwnedFd::from_raw_fd(fd));
        }

        return Some(Ancillary::Fds(fds));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if level == libc::SOL_SOCKET && ty == libc::SCM_CREDENTIALS {
        use crate::credentials::{Native, UnixCred};

        if len != size_of::<libc::ucred>() {
            tracing::warn!(len, "Discarding credentials message of unexpected size");
            return None;
        }

        let ucred = ptr::read_unaligned(data.cast::<libc::ucred>());

        return Some(Ancillary::Credentials(Credentials::from_native(
            Native::LinuxUcred(UnixCred {
                pid: ucred.pid,
                uid: ucred.uid,
                gid: ucred.gid,
            }),
        )));
    }

    #[cfg(target_os = "freebsd")]
    if level == libc::SOL_SOCKET && ty == libc::SCM_CREDS {
        use crate::credentials::{Native, UnixCred};

        if len < size_of::<libc::cmsgcred>() {
            tracing::warn!(len, "Discarding credentials message of unexpected size");
            return None;
        }

        let cmsgcred = ptr::read_unaligned(data.cast::<libc::cmsgcred>());

        return Some(Ancillary::Credentials(Credentials::from_native(
            Native::FreebsdCmsgcred(UnixCred {
                pid: cmsgcred.cmcred_pid as i32,
                uid: cmsgcred.cmcred_euid as u32,
                gid: cmsgcred.cmcred_gid as u32,
            }),
        )));
    }

    Some(Ancillary::Unknown { level, ty })
}

/// Send a single byte with a single control message attached.
///
/// # Safety
///
/// `payload` must point to `len` readable bytes.
unsafe fn sendmsg_with(
    fd: RawFd,
    byte: u8,
    level: libc::c_int,
    ty: libc::c_int,
    payload: *const u8,
    len: usize,
) -> io::Result<usize> {
    let space = libc::CMSG_SPACE(len as u32) as usize;
    let mut control = control_buffer(space);

    let mut byte = [byte];

    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: 1,
    };

    let mut msg: libc::msghdr = zeroed();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    (*cmsg).cmsg_level = level;
    (*cmsg).cmsg_type = ty;
    (*cmsg).cmsg_len = libc::CMSG_LEN(len as u32) as _;
    ptr::copy_nonoverlapping(payload, libc::CMSG_DATA(cmsg), len);

    let n = libc::sendmsg(fd, &msg, SEND_FLAGS);

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn sendmsg_rights(fd: RawFd, byte: u8, fds: &[RawFd]) -> io::Result<usize> {
    // SAFETY: The payload is the raw contents of the fd slice.
    unsafe {
        sendmsg_with(
            fd,
            byte,
            libc::SOL_SOCKET,
            libc::SCM_RIGHTS,
            fds.as_ptr().cast(),
            size_of_val(fds),
        )
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn sendmsg_credentials(fd: RawFd) -> io::Result<usize> {
    // SAFETY: These calls have no preconditions and cannot fail.
    let ucred = unsafe {
        libc::ucred {
            pid: libc::getpid(),
            uid: libc::geteuid(),
            gid: libc::getegid(),
        }
    };

    // SAFETY: The payload is a ucred structure.
    unsafe {
        sendmsg_with(
            fd,
            0,
            libc::SOL_SOCKET,
            libc::SCM_CREDENTIALS,
            ptr::addr_of!(ucred).cast(),
            size_of::<libc::ucred>(),
        )
    }
}

/// The kernel fills in the zeroed `cmsgcred` on its way to the peer.
#[cfg(target_os = "freebsd")]
fn sendmsg_credentials(fd: RawFd) -> io::Result<usize> {
    // SAFETY: cmsgcred is plain old data.
    let cmsgcred: libc::cmsgcred = unsafe { zeroed() };

    // SAFETY: The payload is a cmsgcred structure.
    unsafe {
        sendmsg_with(
            fd,
            0,
            libc::SOL_SOCKET,
            libc::SCM_CREDS,
            ptr::addr_of!(cmsgcred).cast(),
            size_of::<libc::cmsgcred>(),
        )
    }
}
