//! Filesystem access for certificate material and the on-disk scaffold.

use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::SystemTime,
};

/// The filesystem operations the controller needs.
pub trait Filesystem: fmt::Debug + Send + Sync + 'static {
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Creates or truncates `path` and writes `contents` to it.
    fn create(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_all(&self, path: &Path) -> io::Result<()>;

    fn chtimes(&self, path: &Path, accessed: SystemTime, modified: SystemTime) -> io::Result<()>;
}

/// The directories the controller writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directories {
    pub ssl: PathBuf,
    pub auth: PathBuf,
    pub temp: PathBuf,
    pub logs: PathBuf,
    pub conf: PathBuf,
}

#[derive(Debug, Default)]
pub struct OsFilesystem(());

/// An in-memory filesystem.
#[derive(Debug, Default)]
pub struct MemFilesystem {
    state: Mutex<MemState>,
    read_only: AtomicBool,
    read_only_paths: Mutex<BTreeSet<PathBuf>>,
}

#[derive(Debug, Default)]
struct MemState {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, MemFile>,
}

#[derive(Clone, Debug)]
struct MemFile {
    contents: Vec<u8>,
    accessed: SystemTime,
    modified: SystemTime,
}

const DEFAULT_PROXY_CONF: &str = "# placeholder, replaced by the renderer on first reload\n\
events {}\n\
http {\n    include mime.types;\n    default_type application/octet-stream;\n}\n";

const DEFAULT_MIME_TYPES: &str = "types {\n    text/html html htm;\n    text/css css;\n    \
application/javascript js;\n    application/json json;\n    image/png png;\n    image/svg+xml svg;\n}\n";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `contents` to `path` so that readers only ever observe the old or the
/// complete new contents.
///
/// The data is written to a temporary file in the same directory and then
/// renamed into place. The temporary file is removed if the rename fails.
pub fn write_atomic(fs: &dyn Filesystem, path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = dir.join(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

    fs.create(&tmp, contents)?;
    if let Err(error) = fs.rename(&tmp, path) {
        let _ = fs.remove_all(&tmp);
        return Err(error);
    }
    Ok(())
}

// === impl Directories ===

impl Directories {
    /// Lays out the controller's directories next to the certificate root.
    pub fn from_ssl_dir(ssl: impl Into<PathBuf>) -> Self {
        let ssl = ssl.into();
        let root = ssl
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ssl.clone());
        Self {
            auth: root.join("auth"),
            temp: root.join("tmp"),
            logs: root.join("logs"),
            conf: root.join("conf"),
            ssl,
        }
    }

    fn all(&self) -> [&Path; 5] {
        [&self.ssl, &self.auth, &self.temp, &self.logs, &self.conf]
    }

    /// Creates every required directory.
    pub fn create(&self, fs: &dyn Filesystem) -> io::Result<()> {
        for dir in self.all() {
            fs.mkdir_all(dir)?;
        }
        Ok(())
    }
}

// === impl OsFilesystem ===

impl Filesystem for OsFilesystem {
    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn create(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn chtimes(&self, path: &Path, accessed: SystemTime, modified: SystemTime) -> io::Result<()> {
        let file = std::fs::File::options().write(true).open(path)?;
        file.set_times(
            std::fs::FileTimes::new()
                .set_accessed(accessed)
                .set_modified(modified),
        )
    }
}

// === impl MemFilesystem ===

impl MemFilesystem {
    /// An in-memory filesystem holding the scaffold and the bundled default
    /// proxy assets.
    pub fn with_default_assets(dirs: &Directories) -> io::Result<Self> {
        let fs = Self::default();
        dirs.create(&fs)?;
        fs.create(&dirs.conf.join("nginx.conf"), DEFAULT_PROXY_CONF.as_bytes())?;
        fs.create(&dirs.conf.join("mime.types"), DEFAULT_MIME_TYPES.as_bytes())?;
        Ok(fs)
    }

    /// Makes every subsequent mutation fail.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Makes every subsequent mutation of `path` fail.
    pub fn set_path_read_only(&self, path: impl Into<PathBuf>, read_only: bool) {
        let mut paths = self.read_only_paths.lock();
        if read_only {
            paths.insert(path.into());
        } else {
            paths.remove(&path.into());
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    /// Lists the files directly under `dir`.
    pub fn list(&self, dir: &Path) -> Vec<PathBuf> {
        self.state
            .lock()
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect()
    }

    pub fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.state.lock().files.get(path).map(|f| f.modified)
    }

    fn check_writable(&self, path: &Path) -> io::Result<()> {
        if self.read_only.load(Ordering::Acquire) || self.read_only_paths.lock().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is on a read-only filesystem", path.display()),
            ));
        }
        Ok(())
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

impl Filesystem for MemFilesystem {
    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        self.check_writable(path)?;
        let mut state = self.state.lock();
        for dir in path.ancestors() {
            if state.files.contains_key(dir) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is a file", dir.display()),
                ));
            }
            if !dir.as_os_str().is_empty() {
                state.dirs.insert(dir.to_path_buf());
            }
        }
        Ok(())
    }

    fn create(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.check_writable(path)?;
        let mut state = self.state.lock();
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) => {
                return Err(not_found(parent));
            }
            _ => {}
        }
        if state.dirs.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", path.display()),
            ));
        }
        let now = SystemTime::now();
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                contents: contents.to_vec(),
                accessed: now,
                modified: now,
            },
        );
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.accessed = SystemTime::now();
        Ok(file.contents.clone())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check_writable(to)?;
        let mut state = self.state.lock();
        let file = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.check_writable(path)?;
        let mut state = self.state.lock();
        state.files.retain(|p, _| !p.starts_with(path));
        state.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn chtimes(&self, path: &Path, accessed: SystemTime, modified: SystemTime) -> io::Result<()> {
        self.check_writable(path)?;
        let mut state = self.state.lock();
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.accessed = accessed;
        file.modified = modified;
        Ok(())
    }
}
