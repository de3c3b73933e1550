//! Credentials of a local peer.
//!
//! A [`Credentials`] record wraps exactly one OS-native credential layout. The
//! layout in use is selected by the platform, see [`NativeKind::PLATFORM`].
//! On platforms without support the record is still representable, but every
//! accessor fails with [`Category::NotSupported`].
//!
//! [`Category::NotSupported`]: crate::error::Category::NotSupported


use std::fmt;

use crate::error::{ErrorKind, Result};

/// Process, user and group identifiers as carried by most unix flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixCred {
    /// The process identifier.
    pub pid: i32,
    /// The (effective) user identifier.
    pub uid: u32,
    /// The (effective) group identifier.
    pub gid: u32,
}

/// The `xucred` structure used on Apple platforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppleXucred {
    /// Structure version.
    pub version: u32,
    /// Effective user identifier.
    pub uid: u32,
    /// Group identifiers.
    pub groups: Vec<u32>,
}

/// The OS-native credential layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Native {
    /// `struct ucred` on Linux.
    LinuxUcred(UnixCred),
    /// `struct xucred` on Apple platforms.
    AppleXucred(AppleXucred),
    /// `struct cmsgcred` on FreeBSD.
    FreebsdCmsgcred(UnixCred),
    /// `struct unpcbid` on NetBSD.
    NetbsdUnpcbid(UnixCred),
    /// `struct sockpeercred` on OpenBSD.
    OpenbsdSockpeercred(UnixCred),
    /// `ucred_t` on Solaris.
    SolarisUcred(UnixCred),
    /// A process identifier on Windows.
    Win32Pid(u32),
}

impl Native {
    /// The kind of this native layout.
    pub fn kind(&self) -> NativeKind {
        match self {
            Native::LinuxUcred(..) => NativeKind::LinuxUcred,
            Native::AppleXucred(..) => NativeKind::AppleXucred,
            Native::FreebsdCmsgcred(..) => NativeKind::FreebsdCmsgcred,
            Native::NetbsdUnpcbid(..) => NativeKind::NetbsdUnpcbid,
            Native::OpenbsdSockpeercred(..) => NativeKind::OpenbsdSockpeercred,
            Native::SolarisUcred(..) => NativeKind::SolarisUcred,
            Native::Win32Pid(..) => NativeKind::Win32Pid,
        }
    }

    fn uid(&self) -> Option<u32> {
        match self {
            Native::LinuxUcred(cred)
            | Native::FreebsdCmsgcred(cred)
            | Native::NetbsdUnpcbid(cred)
            | Native::OpenbsdSockpeercred(cred)
            | Native::SolarisUcred(cred) => Some(cred.uid),
            Native::AppleXucred(cred) => Some(cred.uid),
            Native::Win32Pid(..) => None,
        }
    }

    fn pid(&self) -> Option<i32> {
        match self {
            Native::LinuxUcred(cred)
            | Native::FreebsdCmsgcred(cred)
            | Native::NetbsdUnpcbid(cred)
            | Native::OpenbsdSockpeercred(cred)
            | Native::SolarisUcred(cred) => Some(cred.pid),
            Native::Win32Pid(pid) => i32::try_from(*pid).ok(),
            Native::AppleXucred(..) => None,
        }
    }
}

/// The kind of a native credentials layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeKind {
    /// `struct ucred` on Linux.
    LinuxUcred,
    /// `struct xucred` on Apple platforms.
    AppleXucred,
    /// `struct cmsgcred` on FreeBSD.
    FreebsdCmsgcred,
    /// `struct unpcbid` on NetBSD.
    NetbsdUnpcbid,
    /// `struct sockpeercred` on OpenBSD.
    OpenbsdSockpeercred,
    /// `ucred_t` on Solaris.
    SolarisUcred,
    /// A process identifier on Windows.
    Win32Pid,
}

impl NativeKind {
    /// The native layout used on the current platform.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::LinuxUcred);
    /// The native layout used on the current platform.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::AppleXucred);
    /// The native layout used on the current platform.
    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::FreebsdCmsgcred);
    /// The native layout used on the current platform.
    #[cfg(target_os = "netbsd")]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::NetbsdUnpcbid);
    /// The native layout used on the current platform.
    #[cfg(target_os = "openbsd")]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::OpenbsdSockpeercred);
    /// The native layout used on the current platform.
    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::SolarisUcred);
    /// The native layout used on the current platform.
    #[cfg(windows)]
    pub const PLATFORM: Option<NativeKind> = Some(NativeKind::Win32Pid);
    /// The native layout used on the current platform.
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "solaris",
        target_os = "illumos",
        windows
    )))]
    pub const PLATFORM: Option<NativeKind> = None;

    /// Test if the uid of this layout can be overwritten.
    ///
    /// Solaris does not allow forging credentials over a socket, and Windows
    /// only carries a process identifier.
    fn supports_spoofing(self) -> Result<()> {
        match self {
            NativeKind::SolarisUcred => Err(ErrorKind::CredentialsSpoofing.into()),
            NativeKind::Win32Pid => Err(ErrorKind::CredentialsUnsupported.into()),
            _ => Ok(()),
        }
    }
}

/// Credentials of a local process.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::credentials::{Credentials, Native, UnixCred};
///
/// let a = Credentials::from_native(Native::LinuxUcred(UnixCred { pid: 10, uid: 1000, gid: 1000 }));
/// let b = Credentials::from_native(Native::LinuxUcred(UnixCred { pid: 20, uid: 1000, gid: 100 }));
///
/// assert_eq!(a.to_string(), "Credentials:linux-ucred:pid=10,uid=1000,gid=1000");
/// assert!(a.is_same_user(&b)?);
/// # Ok::<_, tokio_dbus_peer::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    native: Option<Native>,
}

impl Credentials {
    /// Capture the effective credentials of the calling process.
    ///
    /// On platforms without credentials support this produces a record for
    /// which every accessor fails.
    pub fn current() -> Self {
        Self {
            native: current_native(),
        }
    }

    /// Construct credentials from a native layout.
    pub fn from_native(native: Native) -> Self {
        Self {
            native: Some(native),
        }
    }

    /// Construct a record which is unsupported on every platform.
    pub fn unsupported() -> Self {
        Self { native: None }
    }

    /// Access the native layout if it is of the given kind.
    ///
    /// Requesting a kind which does not match logs a warning and returns
    /// `None`.
    pub fn native(&self, kind: NativeKind) -> Option<&Native> {
        let native = self.native.as_ref()?;

        if native.kind() != kind {
            tracing::warn!(
                ?kind,
                actual = ?native.kind(),
                "Credentials::native: requested native type does not match the record"
            );
            return None;
        }

        Some(native)
    }

    /// Overwrite the native layout.
    ///
    /// Setting a layout of a different kind than the one currently held logs a
    /// warning and has no effect.
    pub fn set_native(&mut self, native: Native) {
        let expected = match &self.native {
            Some(current) => Some(current.kind()),
            None => NativeKind::PLATFORM,
        };

        if expected != Some(native.kind()) {
            tracing::warn!(
                kind = ?native.kind(),
                ?expected,
                "Credentials::set_native: native type does not match the record"
            );
            return;
        }

        self.native = Some(native);
    }

    /// Test if the record carries Linux credentials known to be bogus.
    ///
    /// The kernel produces `pid == 0`, `uid == -1` or `gid == -1` when the
    /// sending side did not actually pass credentials.
    fn check_valid(&self) -> Result<&Native> {
        let Some(native) = &self.native else {
            return Err(ErrorKind::CredentialsUnsupported.into());
        };

        if let Native::LinuxUcred(cred) = native {
            if cred.pid == 0 || cred.uid == u32::MAX || cred.gid == u32::MAX {
                return Err(ErrorKind::CredentialsInvalid.into());
            }
        }

        Ok(native)
    }

    /// The effective user identifier of the process.
    pub fn unix_user(&self) -> Result<u32> {
        let native = self.check_valid()?;

        match native.uid() {
            Some(uid) => Ok(uid),
            None => Err(ErrorKind::CredentialsUnsupported.into()),
        }
    }

    /// The process identifier.
    pub fn unix_pid(&self) -> Result<i32> {
        let native = self.check_valid()?;

        match native.pid() {
            Some(pid) => Ok(pid),
            None => Err(ErrorKind::CredentialsNoPid.into()),
        }
    }

    /// Overwrite the user identifier.
    ///
    /// This is only possible on platforms which permit forging credentials
    /// over a socket.
    pub fn set_unix_user(&mut self, uid: u32) -> Result<()> {
        let Some(native) = &mut self.native else {
            return Err(ErrorKind::CredentialsUnsupported.into());
        };

        native.kind().supports_spoofing()?;

        match native {
            Native::LinuxUcred(cred)
            | Native::FreebsdCmsgcred(cred)
            | Native::NetbsdUnpcbid(cred)
            | Native::OpenbsdSockpeercred(cred) => {
                cred.uid = uid;
            }
            Native::AppleXucred(cred) => {
                cred.uid = uid;
            }
            Native::SolarisUcred(..) | Native::Win32Pid(..) => {
                return Err(ErrorKind::CredentialsUnsupported.into());
            }
        }

        Ok(())
    }

    /// Test if two records refer to the same user.
    ///
    /// Fails if this record is invalid or unsupported. If the other record is
    /// invalid, they are not considered to be the same user.
    pub fn is_same_user(&self, other: &Credentials) -> Result<bool> {
        let this = self.check_valid()?;

        let Ok(other) = other.check_valid() else {
            return Ok(false);
        };

        let same = match (this, other) {
            (Native::AppleXucred(a), Native::AppleXucred(b)) => {
                a.version == b.version && a.uid == b.uid
            }
            (Native::Win32Pid(..), _) => {
                return Err(ErrorKind::CredentialsUnsupported.into());
            }
            (a, b) if a.kind() == b.kind() => a.uid() == b.uid(),
            _ => false,
        };

        Ok(same)
    }
}

impl Default for Credentials {
    #[inline]
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn unix(f: &mut fmt::Formatter<'_>, name: &str, cred: &UnixCred) -> fmt::Result {
            let mut fields = Vec::new();

            if cred.pid != -1 {
                fields.push(format!("pid={}", cred.pid));
            }

            if cred.uid != u32::MAX {
                fields.push(format!("uid={}", cred.uid));
            }

            if cred.gid != u32::MAX {
                fields.push(format!("gid={}", cred.gid));
            }

            write!(f, "{name}:{}", fields.join(","))
        }

        write!(f, "Credentials:")?;

        match &self.native {
            Some(Native::LinuxUcred(cred)) => unix(f, "linux-ucred", cred),
            Some(Native::FreebsdCmsgcred(cred)) => unix(f, "freebsd-cmsgcred", cred),
            Some(Native::NetbsdUnpcbid(cred)) => unix(f, "netbsd-unpcbid", cred),
            Some(Native::OpenbsdSockpeercred(cred)) => unix(f, "openbsd-sockpeercred", cred),
            Some(Native::SolarisUcred(cred)) => unix(f, "solaris-ucred", cred),
            Some(Native::AppleXucred(cred)) => {
                write!(f, "apple-xucred:version={}", cred.version)?;

                if cred.uid != u32::MAX {
                    write!(f, ",uid={}", cred.uid)?;
                }

                for gid in &cred.groups {
                    write!(f, ",gid={gid}")?;
                }

                Ok(())
            }
            Some(Native::Win32Pid(pid)) => write!(f, "win32-pid:pid={pid}"),
            None => write!(f, "unknown"),
        }
    }
}

impl fmt::Debug for Credentials {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(all(unix, feature = "libc"))]
fn current_native() -> Option<Native> {
    // SAFETY: These calls have no preconditions and cannot fail.
    let (pid, uid, gid) = unsafe { (libc::getpid(), libc::geteuid(), libc::getegid()) };

    let cred = UnixCred {
        pid: pid as i32,
        uid: uid as u32,
        gid: gid as u32,
    };

    match NativeKind::PLATFORM? {
        NativeKind::LinuxUcred => Some(Native::LinuxUcred(cred)),
        NativeKind::AppleXucred => Some(Native::AppleXucred(AppleXucred {
            version: 0,
            uid: cred.uid,
            groups: vec![cred.gid],
        })),
        NativeKind::FreebsdCmsgcred => Some(Native::FreebsdCmsgcred(cred)),
        NativeKind::NetbsdUnpcbid => Some(Native::NetbsdUnpcbid(cred)),
        NativeKind::OpenbsdSockpeercred => Some(Native::OpenbsdSockpeercred(cred)),
        NativeKind::SolarisUcred => Some(Native::SolarisUcred(cred)),
        NativeKind::Win32Pid => None,
    }
}

#[cfg(windows)]
fn current_native() -> Option<Native> {
    Some(Native::Win32Pid(std::process::id()))
}

#[cfg(not(any(all(unix, feature = "libc"), windows)))]
fn current_native() -> Option<Native> {
    None
}
