//! The cookie keyring used by the `DBUS_COOKIE_SHA1` mechanism.
//!
//! A keyring is a directory holding one file per cookie context. Every line
//! of a file is `<id> <unix-seconds> <hex-cookie>`. Rewrites are guarded by a
//! `<file>.lock` lock file so that servers sharing a home directory can
//! cooperate.


use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, ErrorKind, KeyringAction, KeyringToken, Result};

/// Environment variable overriding the keyring directory.
pub const ENV_DIRECTORY: &str = "G_DBUS_COOKIE_SHA1_KEYRING_DIR";

/// Environment variable which when set disables the permission check of the
/// keyring directory.
pub const ENV_IGNORE_PERMISSION: &str = "G_DBUS_COOKIE_SHA1_KEYRING_DIR_IGNORE_PERMISSION";

/// Cookies older than this are not handed out for new challenges.
pub const NEW_KEY_TIMEOUT_SECONDS: i64 = 60 * 5;

/// Cookies older than this are pruned.
pub const EXPIRE_KEYS_TIMEOUT_SECONDS: i64 = NEW_KEY_TIMEOUT_SECONDS + 60 * 2;

/// Cookies further than this in the future are pruned.
pub const MAX_TIME_TRAVEL_SECONDS: i64 = 60 * 5;

const LOCK_MAX_TRIES: u32 = 50;
const LOCK_TIMEOUT: Duration = Duration::from_millis(10);
const COOKIE_BYTES: usize = 32;

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn is_valid_context(context: &str) -> bool {
    !context.is_empty()
        && !context.starts_with('.')
        && !context
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_whitespace() || c.is_control())
}

#[derive(Clone)]
enum Directory {
    Env,
    Fixed(PathBuf),
}

/// A cookie keyring.
///
/// # Examples
///
/// ```no_run
/// use tokio_dbus_peer::sasl::Keyring;
///
/// let keyring = Keyring::from_env();
/// let (id, cookie) = keyring.generate("org_gtk_gdbus_general")?;
/// assert_eq!(keyring.lookup("org_gtk_gdbus_general", id)?, cookie);
/// # Ok::<_, tokio_dbus_peer::Error>(())
/// ```
#[derive(Clone)]
pub struct Keyring {
    directory: Directory,
    clock: Clock,
}

impl Keyring {
    /// A keyring in the directory named by `G_DBUS_COOKIE_SHA1_KEYRING_DIR`,
    /// or `~/.dbus-keyrings` if it is not set.
    ///
    /// The environment is consulted each time the keyring is used.
    pub fn from_env() -> Self {
        Self {
            directory: Directory::Env,
            clock: Arc::new(unix_now),
        }
    }

    /// A keyring in the given directory.
    pub fn with_directory<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            directory: Directory::Fixed(path.into()),
            clock: Arc::new(unix_now),
        }
    }

    /// Replace the source of the current time, in seconds since the unix
    /// epoch.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Resolve the keyring directory, creating it if needed.
    pub fn directory(&self) -> Result<PathBuf> {
        let path = match &self.directory {
            Directory::Fixed(path) => path.clone(),
            Directory::Env => match env::var_os(ENV_DIRECTORY) {
                Some(path) => PathBuf::from(path),
                None => home_dir().join(".dbus-keyrings"),
            },
        };

        ensure_directory(&path)?;
        Ok(path)
    }

    /// The path of the file holding the given context.
    ///
    /// Contexts name a file directly inside the keyring directory, so they
    /// may not contain path separators, whitespace or control characters and
    /// may not start with a `.`.
    fn context_path(&self, context: &str) -> Result<PathBuf> {
        if !is_valid_context(context) {
            return Err(Error::new(ErrorKind::KeyringContext(context.into())));
        }

        Ok(self.directory()?.join(context))
    }

    /// Look up the cookie with the given id.
    pub fn lookup(&self, context: &str, id: u32) -> Result<String> {
        let path = self.context_path(context)?;

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) => {
                return Err(ErrorKind::keyring_io(KeyringAction::OpenForReading, &path, error).into());
            }
        };

        for entry in parse(&path, &contents) {
            let entry = entry?;

            if entry.id == id {
                return Ok(entry.cookie.to_owned());
            }
        }

        Err(Error::new(ErrorKind::CookieNotFound {
            id,
            path: path.into(),
        }))
    }

    /// Hand out a cookie which is fresh enough to be used for a new challenge,
    /// generating one if necessary.
    ///
    /// Returns the id and the hex encoded cookie.
    pub fn generate(&self, context: &str) -> Result<(u32, String)> {
        let path = self.context_path(context)?;
        let lock = Lock::acquire(&path)?;

        let result = self.generate_locked(&path);
        let release = lock.release();

        match (result, release) {
            (Ok(entry), Ok(())) => Ok(entry),
            (Ok(..), Err(error)) => Err(error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(release)) => Err(error.with_lock_release(&path, release)),
        }
    }

    fn generate_locked(&self, path: &Path) -> Result<(u32, String)> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
            Err(error) => {
                return Err(ErrorKind::keyring_io(KeyringAction::OpenForWriting, path, error).into());
            }
        };

        let now = (self.clock)();

        let mut new_contents = String::new();
        let mut changed = false;
        let mut max_id = 0;
        let mut reuse = None;

        for entry in parse(path, &contents) {
            let entry = entry?;

            let keep = if entry.when > now {
                let ahead = entry.when - now;

                if ahead > MAX_TIME_TRAVEL_SECONDS {
                    tracing::warn!(
                        path = %path.display(),
                        "Deleted SHA1 cookie from {ahead} seconds in the future"
                    );
                    false
                } else {
                    true
                }
            } else {
                now - entry.when <= EXPIRE_KEYS_TIMEOUT_SECONDS
            };

            if !keep {
                changed = true;
                continue;
            }

            new_contents.push_str(&format!("{} {} {}\n", entry.id, entry.when, entry.cookie));
            max_id = max_id.max(entry.id);

            if reuse.is_none() && now - entry.when < NEW_KEY_TIMEOUT_SECONDS {
                reuse = Some((entry.id, entry.cookie.to_owned()));
            }
        }

        let entry = match reuse {
            Some(entry) => entry,
            None => {
                let mut raw = [0u8; COOKIE_BYTES];
                OsRng.fill_bytes(&mut raw);

                let id = max_id + 1;
                let cookie = hex::encode(raw);
                new_contents.push_str(&format!("{id} {now} {cookie}\n"));
                changed = true;
                (id, cookie)
            }
        };

        if changed {
            write_atomic(path, new_contents.as_bytes())?;
        }

        Ok(entry)
    }
}

impl Default for Keyring {
    #[inline]
    fn default() -> Self {
        Self::from_env()
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("Keyring");

        match &self.directory {
            Directory::Env => f.field("directory", &ENV_DIRECTORY),
            Directory::Fixed(path) => f.field("directory", path),
        };

        f.finish_non_exhaustive()
    }
}

struct Entry<'a> {
    id: u32,
    when: i64,
    cookie: &'a str,
}

fn parse<'a>(path: &'a Path, contents: &'a str) -> impl Iterator<Item = Result<Entry<'a>>> + 'a {
    contents
        .split('\n')
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .map(move |(n, line)| {
            let malformed = |token| {
                Error::new(ErrorKind::KeyringMalformed {
                    line: n + 1,
                    path: path.into(),
                    content: line.into(),
                    token,
                })
            };

            let tokens = line.split(' ').collect::<Vec<_>>();

            let [id, when, cookie] = tokens[..] else {
                return Err(malformed(KeyringToken::Line));
            };

            let Ok(id) = id.parse::<u32>() else {
                return Err(malformed(KeyringToken::First));
            };

            let Ok(when) = when.parse::<i64>() else {
                return Err(malformed(KeyringToken::Second));
            };

            Ok(Entry { id, when, cookie })
        })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn home_dir() -> PathBuf {
    if let Some(home) = env::var_os("HOME").filter(|home| !home.is_empty()) {
        return PathBuf::from(home);
    }

    passwd_home().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(all(unix, feature = "libc"))]
fn passwd_home() -> Option<OsString> {
    use std::ffi::CStr;
    use std::os::unix::ffi::OsStrExt;

    // SAFETY: getpwuid returns either null or a pointer to a static record
    // which is copied out before any other call could overwrite it.
    unsafe {
        let passwd = libc::getpwuid(libc::geteuid());

        if passwd.is_null() || (*passwd).pw_dir.is_null() {
            return None;
        }

        let dir = CStr::from_ptr((*passwd).pw_dir);
        Some(std::ffi::OsStr::from_bytes(dir.to_bytes()).to_owned())
    }
}

#[cfg(not(all(unix, feature = "libc")))]
fn passwd_home() -> Option<OsString> {
    None
}

/// Test if the process runs with elevated privileges.
#[cfg(all(any(target_os = "linux", target_os = "android"), feature = "libc"))]
fn is_setuid() -> bool {
    // SAFETY: getauxval has no preconditions.
    unsafe { libc::getauxval(libc::AT_SECURE) != 0 }
}

#[cfg(all(
    unix,
    not(any(target_os = "linux", target_os = "android")),
    feature = "libc"
))]
fn is_setuid() -> bool {
    // SAFETY: These calls have no preconditions and cannot fail.
    unsafe { libc::getuid() != libc::geteuid() || libc::getgid() != libc::getegid() }
}

#[cfg(not(all(unix, feature = "libc")))]
fn is_setuid() -> bool {
    false
}

fn ensure_directory(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            check_permissions(path, &metadata)?;
            return Ok(());
        }
        Ok(..) => {
            return Err(Error::new(ErrorKind::KeyringNotDirectory(path.into())));
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(ErrorKind::keyring_io(KeyringAction::StatDirectory, path, error).into());
        }
    }

    if is_setuid() {
        return Err(Error::new(ErrorKind::KeyringSetuid(path.into())));
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    if let Err(error) = builder.create(path) {
        return Err(ErrorKind::keyring_io(KeyringAction::CreateDirectory, path, error).into());
    }

    Ok(())
}

#[cfg(unix)]
fn check_permissions(path: &Path, metadata: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if env::var_os(ENV_IGNORE_PERMISSION).is_some() {
        return Ok(());
    }

    let mode = metadata.permissions().mode() & 0o777;

    if mode != 0o700 {
        return Err(Error::new(ErrorKind::KeyringPermissions {
            path: path.into(),
            mode,
        }));
    }

    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_: &Path, _: &fs::Metadata) -> Result<()> {
    Ok(())
}

/// Write the file by writing to a temporary file in the same directory and
/// renaming it over the original.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{:08x}.tmp", OsRng.next_u32()));
    let temp = PathBuf::from(temp);

    let result = (|| {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&temp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, path)
    })();

    if let Err(error) = result {
        let _ = fs::remove_file(&temp);
        return Err(ErrorKind::keyring_io(KeyringAction::Write, path, error).into());
    }

    Ok(())
}

/// A held `<file>.lock` lock file.
struct Lock {
    path: PathBuf,
    file: File,
}

impl Lock {
    fn acquire(keyring: &Path) -> Result<Self> {
        let mut path = OsString::from(keyring.as_os_str());
        path.push(".lock");
        let path = PathBuf::from(path);

        let mut mtime = None;
        let mut tries = 0;

        while tries < LOCK_MAX_TRIES {
            let previous = mtime;

            match create_exclusive(&path) {
                Ok(file) => return Ok(Self { path, file }),
                Err(..) => {
                    mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
                }
            }

            thread::sleep(LOCK_TIMEOUT);

            // A lock file which keeps changing is contended rather than stale.
            if tries > 0 && mtime != previous {
                continue;
            }

            tries += 1;
        }

        if let Err(error) = fs::remove_file(&path) {
            return Err(ErrorKind::keyring_io(KeyringAction::DeleteStaleLock, &path, error).into());
        }

        tracing::warn!(path = %path.display(), "Deleted stale lock file");

        match create_exclusive(&path) {
            Ok(file) => Ok(Self { path, file }),
            Err(error) => Err(ErrorKind::keyring_io(KeyringAction::CreateLock, &path, error).into()),
        }
    }

    fn release(self) -> Result<()> {
        close(self.file).map_err(|error| {
            Error::from(ErrorKind::keyring_io(KeyringAction::CloseLock, &self.path, error))
        })?;

        if let Err(error) = fs::remove_file(&self.path) {
            return Err(ErrorKind::keyring_io(KeyringAction::UnlinkLock, &self.path, error).into());
        }

        Ok(())
    }
}

fn create_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(path)
}

#[cfg(all(unix, feature = "libc"))]
fn close(file: File) -> io::Result<()> {
    use std::os::fd::IntoRawFd;

    // SAFETY: The descriptor is owned and not used again.
    if unsafe { libc::close(file.into_raw_fd()) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(all(unix, feature = "libc")))]
fn close(file: File) -> io::Result<()> {
    drop(file);
    Ok(())
}
