pub mod walkdir_globset;

use crate::backup::atomic_file::parent_dir;
use crate::backup::finish::Finish;
use crate::backup::hasher::CHUNK_SIZE;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, IntoInnerError, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use zip::write::FileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

pub static ARCHIVE_FILE_EXT: &str = "zip";

/// A file to be stored in an archive under its source-relative name.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Source file on the filesystem
    pub src: Arc<Path>,
    /// Member name inside the archive, never an absolute path
    pub dst: Arc<str>,
}

impl ArchiveEntry {
    pub fn new<A: Into<Arc<Path>>, B: Into<Arc<str>>>(src: A, dst: B) -> ArchiveEntry {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

/// Streams files into a deflate-compressed zip, AES-256 encrypting every member when a password
/// is set.
///
/// Content goes to a hidden temp file in the destination directory; `close` moves it to its final
/// name. Dropping the writer without closing removes the temp file, so a failed run leaves no
/// partial archive behind.
pub struct ArchiveWriter {
    zip: ZipWriter<BufWriter<NamedTempFile>>,
    archive_path: PathBuf,
    password: Option<RedactedString>,
    compression_level: Option<i64>,
    entry_count: usize,
}

impl ArchiveWriter {
    pub fn open<P: Into<PathBuf>>(
        archive_path: P,
        password: Option<&RedactedString>,
        compression_level: Option<i64>,
    ) -> Result<Self> {
        let archive_path = archive_path.into();
        let dir = parent_dir(&archive_path);
        std::fs::create_dir_all(dir)
            .map_err(Error::from)
            .with_msg(format!("Create archive directory {:?} failed", dir))?;
        let tmp = tempfile::Builder::new()
            .prefix(".backup-")
            .suffix(".zip.tmp")
            .tempfile_in(dir)
            .map_err(Error::from)
            .with_msg(format!("Create temp archive in {:?} failed", dir))?;

        match password {
            Some(_) => tracing::debug!("Opening AES-256 encrypted archive {:?}", archive_path),
            None => tracing::debug!("Opening unencrypted archive {:?}", archive_path),
        }

        Ok(Self {
            zip: ZipWriter::new(BufWriter::new(tmp)),
            archive_path,
            password: password.cloned(),
            compression_level,
            entry_count: 0,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Streams `entry.src` into the archive and returns the digest of the bytes actually stored.
    ///
    /// When the source cannot be opened nothing is written; when it fails mid-read the partial
    /// member is dropped from the archive.
    pub fn write_entry(&mut self, entry: &ArchiveEntry) -> Result<String> {
        let mut file = File::open(&entry.src)
            .map_err(Error::from)
            .with_msg(format!("Open {:?} for archiving failed", entry.src))?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);

        let mut options: FileOptions<'_, ()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(self.compression_level)
            .large_file(len >= u32::MAX as u64);
        if let Some(password) = &self.password {
            options = options.with_aes_encryption(AesMode::Aes256, password.inner().as_str());
        }

        self.zip.start_file(&*entry.dst, options)?;
        match copy_and_hash(&mut file, &mut self.zip) {
            Ok(digest) => {
                self.entry_count += 1;
                tracing::trace!("Archived {:?} as {:?}", entry.src, entry.dst);
                Ok(digest)
            }
            Err(e) => {
                if let Err(abort) = self.zip.abort_file() {
                    return Err(e.chain(abort.into()));
                }
                Err(e.with_msg(format!("Archiving {:?} failed", entry.src)))
            }
        }
    }

    /// Finalizes the archive and publishes it without overwriting anything.
    ///
    /// When the target name is taken, a `_001`, `_002`, ... suffix is appended to the stem. Returns
    /// the path the archive ended up at.
    pub fn close(self) -> Result<PathBuf> {
        let tmp = Finish::finish(self.zip)?
            .into_inner()
            .map_err(IntoInnerError::into_error)?;
        tmp.as_file().sync_all()?;

        let mut tmp = tmp;
        let mut counter = 0usize;
        loop {
            let candidate = tiebreak_path(&self.archive_path, counter);
            match tmp.persist_noclobber(&candidate) {
                Ok(_) => {
                    tracing::debug!(
                        "Archive {:?} closed with {} entries",
                        candidate,
                        self.entry_count
                    );
                    return Ok(candidate);
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::debug!("{:?} already exists, trying next name", candidate);
                    tmp = e.file;
                    counter += 1;
                }
                Err(e) => {
                    return Err(Error::from(e.error)
                        .with_msg(format!("Publish archive {:?} failed", candidate)))
                }
            }
        }
    }
}

fn copy_and_hash<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// `dir/name.zip` for 0, `dir/name_NNN.zip` otherwise. The suffix sorts after the plain name.
pub fn tiebreak_path(path: &Path, counter: usize) -> PathBuf {
    if counter == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{counter:03}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{counter:03}"),
    };
    path.with_file_name(name)
}

/// Archives in a destination directory, sorted by name (which sorts by creation time).
pub fn list_archives<P: AsRef<Path>>(destination_dir: P) -> Result<Vec<PathBuf>> {
    let destination_dir = destination_dir.as_ref();
    let entries = std::fs::read_dir(destination_dir)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(destination_dir.to_path_buf()),
            _ => Error::from(e),
        })?
        .filter_map(|r| r.ok())
        .map(|r| r.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().is_some_and(|ext| ext == ARCHIVE_FILE_EXT))
        .filter(|p| {
            !p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        })
        .sorted()
        .collect();
    Ok(entries)
}
