#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// An owned list of file descriptors attached to a message.
///
/// File descriptors are closed when the list is dropped.
#[derive(Debug, Default)]
pub struct FdList {
    #[cfg(unix)]
    fds: Vec<OwnedFd>,
}

impl FdList {
    /// Construct a new empty list.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of file descriptors in the list.
    #[inline]
    pub fn len(&self) -> usize {
        #[cfg(unix)]
        {
            self.fds.len()
        }

        #[cfg(not(unix))]
        {
            0
        }
    }

    /// Test if the list is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append all file descriptors from `other`.
    pub fn append(&mut self, other: FdList) {
        #[cfg(unix)]
        {
            self.fds.extend(other.fds);
        }

        #[cfg(not(unix))]
        {
            let _ = other;
        }
    }
}

#[cfg(unix)]
impl FdList {
    /// Push a file descriptor onto the list.
    #[inline]
    pub fn push(&mut self, fd: OwnedFd) {
        self.fds.push(fd);
    }

    /// Iterate over the file descriptors in the list.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &OwnedFd> {
        self.fds.iter()
    }

    /// Collect the raw file descriptors of the list.
    pub(crate) fn raw_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(AsRawFd::as_raw_fd).collect()
    }

    /// Convert into the owned file descriptors.
    #[inline]
    pub fn into_vec(self) -> Vec<OwnedFd> {
        self.fds
    }
}

#[cfg(unix)]
impl From<Vec<OwnedFd>> for FdList {
    #[inline]
    fn from(fds: Vec<OwnedFd>) -> Self {
        Self { fds }
    }
}

#[cfg(unix)]
impl FromIterator<OwnedFd> for FdList {
    #[inline]
    fn from_iter<I: IntoIterator<Item = OwnedFd>>(iter: I) -> Self {
        Self {
            fds: iter.into_iter().collect(),
        }
    }
}
