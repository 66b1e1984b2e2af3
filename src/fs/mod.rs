use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::bail;

pub trait DirFile: std::fmt::Debug + Read + Write + Send {
    fn sync(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A directory that datasets are read from and published into.
///
/// Engines only ever see this trait, so the same code runs against the real
/// filesystem and against [`MockDir`], which can simulate crashes.
pub trait Dir: Clone + std::fmt::Debug + Send + Sync {
    type File: DirFile;

    fn path(&self) -> PathBuf;

    fn cd<P>(&self, dir_name: &P) -> Self
    where
        P: AsRef<Path>;

    fn exists(&self) -> anyhow::Result<bool>;

    // Creates this directory and all of its ancestors. Succeeds if it
    // already exists.
    fn mkdir(&self) -> anyhow::Result<()>;

    // Entries directly under this directory, sorted by name.
    fn ls(&self) -> anyhow::Result<Vec<DirEntry>>;

    // Returns None if the file already exists.
    fn create<P>(&self, fname: &P) -> anyhow::Result<Option<Self::File>>
    where
        P: AsRef<Path>;

    fn open<P>(&self, fname: &P) -> anyhow::Result<Option<Self::File>>
    where
        P: AsRef<Path>;

    // Atomically replaces `to` if it exists.
    fn rename<P, Q>(&self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>;

    fn unlink<P>(&self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>;

    // Makes renames and unlinks in this directory durable.
    fn sync(&self) -> anyhow::Result<()>;
}

// OS Implementation
#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new<P>(root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        OsDir { root: root.into() }
    }
}

#[derive(Debug)]
pub struct OsFile {
    file: File,
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl DirFile for OsFile {
    fn sync(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Dir for OsDir {
    type File = OsFile;

    fn path(&self) -> PathBuf {
        self.root.clone()
    }

    fn cd<P>(&self, dir_name: &P) -> Self
    where
        P: AsRef<Path>,
    {
        OsDir {
            root: self.root.join(dir_name),
        }
    }

    fn exists(&self) -> anyhow::Result<bool> {
        match fs::metadata(&self.root) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn mkdir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn ls(&self) -> anyhow::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => bail!("non UTF-8 name {:?} in {}", name, self.root.display()),
            };
            entries.push(DirEntry {
                name,
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort();
        Ok(entries)
    }

    fn create<P>(&self, fname: &P) -> anyhow::Result<Option<Self::File>>
    where
        P: AsRef<Path>,
    {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.root.join(fname))
        {
            Ok(file) => Ok(Some(OsFile { file })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open<P>(&self, fname: &P) -> anyhow::Result<Option<Self::File>>
    where
        P: AsRef<Path>,
    {
        match File::open(self.root.join(fname)) {
            Ok(file) => Ok(Some(OsFile { file })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn rename<P, Q>(&self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        fs::rename(self.root.join(from), self.root.join(to))?;
        Ok(())
    }

    fn unlink<P>(&self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        match fs::remove_file(self.root.join(fname)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&self) -> anyhow::Result<()> {
        // Directories can't be opened for syncing on windows.
        #[cfg(unix)]
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

// Mock Implementation
#[derive(Default, Debug)]
struct MockData {
    synced: Vec<u8>,
    unsynced: Vec<u8>,
}

fn lock(fs: &Mutex<MockFs>) -> MutexGuard<'_, MockFs> {
    // A worker that panicked mid-operation leaves the mock in a state that is
    // still safe to inspect.
    fs.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct MockFile {
    idx: usize,
    pub file_id: FileId,
    fs: Arc<Mutex<MockFs>>,
}

impl MockFile {
    #[cfg(test)]
    fn read_all_synced(&self) -> Vec<u8> {
        lock(&self.fs).data[self.file_id].synced.clone()
    }
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fs = lock(&self.fs);
        let data = &fs.data[self.file_id].unsynced;
        if self.idx >= data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(data.len() - self.idx, buf.len());
        buf[..n].copy_from_slice(&data[self.idx..self.idx + n]);
        self.idx += n;
        Ok(n)
    }
}

impl Write for MockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.fs)
            .write(self.file_id, self.idx, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.idx += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DirFile for MockFile {
    fn sync(&mut self) -> anyhow::Result<()> {
        lock(&self.fs).sync(self.file_id)
    }
}

#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Arc<Mutex<MockFs>>,
    prefix: Vec<String>,
}

impl Default for MockDir {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDir {
    pub fn new() -> Self {
        MockDir {
            fs: Arc::new(Mutex::new(MockFs::new())),
            prefix: Vec::new(),
        }
    }

    pub fn fs(&self) -> MutexGuard<'_, MockFs> {
        lock(&self.fs)
    }

    fn full_path<P>(&self, p: &P) -> String
    where
        P: AsRef<Path>,
    {
        self.prefix
            .iter()
            .cloned()
            .chain(
                p.as_ref()
                    .iter()
                    .map(|s| s.to_string_lossy().into_owned()),
            )
            .collect::<Vec<_>>()
            .join("/")
    }

    fn file(&self, file_id: FileId) -> MockFile {
        MockFile {
            fs: self.fs.clone(),
            file_id,
            idx: 0,
        }
    }
}

impl Dir for MockDir {
    type File = MockFile;

    fn path(&self) -> PathBuf {
        self.prefix.join("/").into()
    }

    fn cd<P>(&self, dir_name: &P) -> Self
    where
        P: AsRef<Path>,
    {
        MockDir {
            fs: self.fs.clone(),
            prefix: self
                .prefix
                .iter()
                .cloned()
                .chain(
                    dir_name
                        .as_ref()
                        .iter()
                        .map(|s| s.to_string_lossy().into_owned()),
                )
                .collect(),
        }
    }

    fn exists(&self) -> anyhow::Result<bool> {
        Ok(self.fs().dir_exists(&self.prefix.join("/")))
    }

    fn mkdir(&self) -> anyhow::Result<()> {
        self.fs().mkdir(&self.prefix)
    }

    fn ls(&self) -> anyhow::Result<Vec<DirEntry>> {
        let mut fs = self.fs();
        let entries = fs.children(&self.prefix.join("/"));
        fs.record(Event::Ls(
            entries.iter().map(|e| e.name.clone()).collect(),
        ));
        Ok(entries)
    }

    fn create<P>(&self, fname: &P) -> anyhow::Result<Option<Self::File>>
    where
        P: AsRef<Path>,
    {
        let id = self.fs().create(&self.full_path(fname))?;
        Ok(id.map(|file_id| self.file(file_id)))
    }

    fn open<P>(&self, fname: &P) -> anyhow::Result<Option<Self::File>>
    where
        P: AsRef<Path>,
    {
        let id = self.fs().open(&self.full_path(fname));
        Ok(id.map(|file_id| self.file(file_id)))
    }

    fn rename<P, Q>(&self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        self.fs()
            .rename(&self.full_path(from), &self.full_path(to))
    }

    fn unlink<P>(&self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        self.fs().unlink(&self.full_path(fname))
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.fs().sync_dir(&self.prefix.join("/"))
    }
}

pub type FileId = usize;

#[derive(Debug, Clone)]
pub enum Event {
    Create(String, FileId),
    Write(FileId, usize, usize),
    Sync(FileId),
    SyncDir(String),
    Mkdir(String),
    Rename(String, String),
    Unlink(String),
    Open(String),
    Ls(Vec<String>),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name, file_id) => write!(w, "Create({}, {})", name, file_id),
            Event::Write(file_id, idx, len) => {
                write!(w, "Write({}, {}, {} bytes)", file_id, idx, len)
            }
            Event::Sync(file_id) => write!(w, "Sync({})", file_id),
            Event::SyncDir(name) => write!(w, "SyncDir({})", name),
            Event::Mkdir(name) => write!(w, "Mkdir({})", name),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Unlink(name) => write!(w, "Unlink({})", name),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Ls(names) => write!(w, "Ls() -> {:?}", names),
        }
    }
}

#[derive(Debug)]
pub struct MockFs {
    names: BTreeMap<String, FileId>,
    dirs: BTreeSet<String>,
    data: Vec<MockData>,
    events: Vec<Event>,

    // After this many "things happen," "crash" the FS, meaning stop accepting
    // writes and discard any unsynced data.
    time_to_crash: Option<usize>,
}

impl MockFs {
    fn new() -> Self {
        MockFs {
            names: BTreeMap::new(),
            dirs: BTreeSet::new(),
            data: Vec::new(),
            events: Vec::new(),
            time_to_crash: None,
        }
    }

    fn check_crashed(&self) -> anyhow::Result<()> {
        if self.time_to_crash == Some(0) {
            bail!("filesystem is down")
        } else {
            Ok(())
        }
    }

    pub fn schedule_crash(&mut self, ops: usize) {
        self.time_to_crash = Some(ops);
    }

    pub fn is_crashed(&self) -> bool {
        self.time_to_crash == Some(0)
    }

    // Discard all unsynced state, become uncrashed.
    pub fn reboot(&mut self) {
        for f in self.data.iter_mut() {
            f.unsynced.clear();
            f.unsynced.extend(&f.synced);
        }
        self.time_to_crash = None;
    }

    fn perform_op(&mut self) -> anyhow::Result<()> {
        self.check_crashed()?;
        if let Some(x) = self.time_to_crash {
            self.time_to_crash = Some(x - 1);
        }
        Ok(())
    }

    fn record(&mut self, e: Event) {
        self.events.push(e);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // Every file name currently visible, sorted.
    pub fn file_names(&self) -> Vec<String> {
        self.names.keys().cloned().collect()
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.names
            .get(path)
            .map(|id| self.data[*id].unsynced.as_slice())
    }

    // Replaces a file's durable contents in place, bypassing the event log.
    // Used to simulate on-disk corruption.
    pub fn overwrite(&mut self, path: &str, contents: Vec<u8>) -> bool {
        match self.names.get(path) {
            Some(id) => {
                let d = &mut self.data[*id];
                d.synced = contents.clone();
                d.unsynced = contents;
                true
            }
            None => false,
        }
    }

    fn dir_exists(&self, path: &str) -> bool {
        if path.is_empty() || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path);
        self.names.keys().any(|n| n.starts_with(&prefix))
    }

    fn children(&self, path: &str) -> Vec<DirEntry> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        let files = self.names.keys().map(|n| (n, false));
        let dirs = self.dirs.iter().map(|d| (d, true));
        for (name, is_dir) in files.chain(dirs) {
            let rest = match name.strip_prefix(&prefix) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };
            match rest.split_once('/') {
                Some((first, _)) => {
                    children.insert(first.to_owned(), true);
                }
                None => {
                    let entry = children.entry(rest.to_owned()).or_insert(is_dir);
                    *entry |= is_dir;
                }
            }
        }
        children
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect()
    }
}

impl MockFs {
    fn mkdir(&mut self, components: &[String]) -> anyhow::Result<()> {
        self.perform_op()?;

        let path = components.join("/");
        self.record(Event::Mkdir(path));
        for i in 1..=components.len() {
            self.dirs.insert(components[..i].join("/"));
        }
        Ok(())
    }

    fn create(&mut self, path: &str) -> anyhow::Result<Option<FileId>> {
        self.perform_op()?;

        if self.names.contains_key(path) {
            return Ok(None);
        }
        let id = self.data.len();
        self.record(Event::Create(path.to_owned(), id));
        self.names.insert(path.to_owned(), id);
        self.data.push(MockData::default());
        Ok(Some(id))
    }

    fn unlink(&mut self, path: &str) -> anyhow::Result<bool> {
        self.perform_op()?;

        self.record(Event::Unlink(path.to_owned()));
        Ok(self.names.remove(path).is_some())
    }

    fn open(&mut self, path: &str) -> Option<FileId> {
        self.record(Event::Open(path.to_owned()));
        self.names.get(path).cloned()
    }

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Rename(from.to_owned(), to.to_owned()));
        match self.names.remove(from) {
            Some(d) => {
                self.names.insert(to.to_owned(), d);
                Ok(())
            }
            None => bail!("cannot rename {}: no such file", from),
        }
    }

    fn write(&mut self, file: FileId, idx: usize, data: &[u8]) -> anyhow::Result<()> {
        self.perform_op()?;

        let unsynced = &mut self.data[file].unsynced;
        if unsynced.len() < idx + data.len() {
            unsynced.resize(idx + data.len(), 0);
        }
        unsynced[idx..idx + data.len()].copy_from_slice(data);

        self.record(Event::Write(file, idx, data.len()));
        Ok(())
    }

    fn sync(&mut self, file: FileId) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Sync(file));
        let d = &mut self.data[file];
        d.synced = d.unsynced.clone();

        Ok(())
    }

    fn sync_dir(&mut self, path: &str) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::SyncDir(path.to_owned()));
        Ok(())
    }
}
