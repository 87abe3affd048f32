//! Archive extraction.
//!
//! Every restore verifies the whole archive first: each member is opened (decrypted when needed),
//! read to the end so its checksum or authentication code is checked, and its name is checked to
//! stay inside the destination. Only an archive that passes every check is extracted.

use crate::backup::metadata::BackupRecord;
use crate::backup::redacted::{non_empty, RedactedString};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

type Archive = ZipArchive<BufReader<File>>;

/// A member that passed verification, with the path it extracts to relative to the destination.
#[derive(Debug, Clone)]
struct VerifiedMember {
    index: usize,
    name: String,
    relative: PathBuf,
    is_dir: bool,
}

fn open_archive(archive_path: &Path) -> Result<Archive> {
    let file = File::open(archive_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(archive_path.to_path_buf()),
        _ => Error::from(e).with_msg(format!("Open archive {:?} failed", archive_path)),
    })?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| Error::CorruptArchive {
        path: archive_path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn member_error(archive_path: &Path, entry: &str, error: ZipError) -> Error {
    match error {
        ZipError::InvalidPassword => Error::Authentication {
            path: archive_path.to_path_buf(),
            entry: entry.to_string(),
            reason: "wrong password".to_string(),
        },
        ZipError::UnsupportedArchive(msg) if msg == ZipError::PASSWORD_REQUIRED => {
            Error::Authentication {
                path: archive_path.to_path_buf(),
                entry: entry.to_string(),
                reason: "password required".to_string(),
            }
        }
        e => Error::CorruptArchive {
            path: archive_path.to_path_buf(),
            reason: format!("entry {entry:?}: {e}"),
        },
    }
}

fn open_member<'a, R: Read + Seek>(
    archive: &'a mut ZipArchive<R>,
    archive_path: &Path,
    index: usize,
    name: &str,
    password: Option<&RedactedString>,
) -> Result<impl Read + 'a> {
    match password {
        Some(password) => archive.by_index_decrypt(index, password.as_bytes()),
        None => archive.by_index(index),
    }
    .map_err(|e| member_error(archive_path, name, e))
}

/// Checks every member without writing anything. Returns the members in archive order.
fn verify_members(
    archive: &mut Archive,
    archive_path: &Path,
    password: Option<&RedactedString>,
) -> Result<Vec<VerifiedMember>> {
    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let (name, enclosed, is_dir) = {
            let raw = archive
                .by_index_raw(index)
                .map_err(|e| member_error(archive_path, &format!("#{index}"), e))?;
            (raw.name().to_string(), raw.enclosed_name().map(PathBuf::from), raw.is_dir())
        };

        let relative = enclosed.ok_or_else(|| Error::PathTraversal {
            path: archive_path.to_path_buf(),
            entry: name.clone(),
        })?;

        let mut member = open_member(archive, archive_path, index, &name, password)?;
        std::io::copy(&mut member, &mut std::io::sink()).map_err(|e| Error::CorruptArchive {
            path: archive_path.to_path_buf(),
            reason: format!("entry {name:?}: {e}"),
        })?;

        members.push(VerifiedMember {
            index,
            name,
            relative,
            is_dir,
        });
    }
    Ok(members)
}

fn extract_member(
    archive: &mut Archive,
    archive_path: &Path,
    member: &VerifiedMember,
    destination_dir: &Path,
    password: Option<&RedactedString>,
) -> Result<()> {
    let out_path = destination_dir.join(&member.relative);
    if member.is_dir {
        std::fs::create_dir_all(&out_path)?;
        return Ok(());
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut source = open_member(archive, archive_path, member.index, &member.name, password)?;
    let mut out = BufWriter::new(
        File::create(&out_path)
            .map_err(Error::from)
            .with_msg(format!("Create {:?} failed", out_path))?,
    );
    std::io::copy(&mut source, &mut out)
        .map_err(Error::from)
        .with_msg(format!("Extract {:?} to {:?} failed", member.name, out_path))?;
    out.flush()?;
    tracing::trace!("Restored {:?}", out_path);
    Ok(())
}

/// Verifies the archive without extracting it and returns the number of members.
pub fn verify<P: AsRef<Path>>(archive_path: P, password: Option<&RedactedString>) -> Result<usize> {
    let archive_path = archive_path.as_ref();
    let mut archive = open_archive(archive_path)?;
    Ok(verify_members(&mut archive, archive_path, non_empty(password))?.len())
}

/// Member names in archive order. Reading names needs no password.
pub fn list_entries<P: AsRef<Path>>(archive_path: P) -> Result<Vec<String>> {
    let archive_path = archive_path.as_ref();
    let archive = open_archive(archive_path)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Extracts every member of `archive_path` under `destination_dir`, overwriting existing files.
///
/// Nothing is written unless the whole archive verifies. Returns the number of members restored.
pub fn restore<P1: AsRef<Path>, P2: AsRef<Path>>(
    archive_path: P1,
    destination_dir: P2,
    password: Option<&RedactedString>,
) -> Result<usize> {
    restore_filtered(
        archive_path.as_ref(),
        destination_dir.as_ref(),
        non_empty(password),
        |_| true,
    )
}

fn restore_filtered<F: Fn(&str) -> bool>(
    archive_path: &Path,
    destination_dir: &Path,
    password: Option<&RedactedString>,
    keep: F,
) -> Result<usize> {
    let mut archive = open_archive(archive_path)?;
    let members = verify_members(&mut archive, archive_path, password)?;

    std::fs::create_dir_all(destination_dir)?;
    let mut restored = 0usize;
    for member in members.iter().filter(|m| m.is_dir || keep(&m.name)) {
        extract_member(&mut archive, archive_path, member, destination_dir, password)?;
        restored += 1;
    }
    tracing::info!(
        archive = ?archive_path,
        destination = ?destination_dir,
        restored,
        "Restore completed"
    );
    Ok(restored)
}

/// Rebuilds the full tree recorded by `record` by replaying its archive history oldest first.
///
/// Only members still present in the record's digest map are written, so files deleted since an
/// older archive stay deleted. All archives are verified before the first one is extracted.
pub fn restore_snapshot<P: AsRef<Path>>(
    record: &BackupRecord,
    destination_dir: P,
    password: Option<&RedactedString>,
) -> Result<usize> {
    let destination_dir = destination_dir.as_ref();
    let password = non_empty(password);
    let archives: Vec<PathBuf> = if record.history().is_empty() {
        vec![record.last_archive_path().clone()]
    } else {
        record.history().clone()
    };

    for archive_path in &archives {
        let mut archive = open_archive(archive_path)?;
        verify_members(&mut archive, archive_path, password)?;
    }

    let wanted = record.file_records();
    let mut restored = 0usize;
    for archive_path in &archives {
        restored += restore_filtered(archive_path, destination_dir, password, |name| {
            wanted.contains_key(name)
        })?;
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{ArchiveEntry, ArchiveWriter};
    use crate::backup::result_error::error::ErrorCategory;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn make_archive(dir: &Path, name: &str, files: &[(&str, &str)], password: Option<&str>) -> PathBuf {
        let src_dir = dir.join(format!("{name}-src"));
        std::fs::create_dir_all(&src_dir).unwrap();
        let password = password.map(RedactedString::from);
        let mut writer = ArchiveWriter::open(dir.join(name), password.as_ref(), None).unwrap();
        for (relative, content) in files {
            let src = src_dir.join(relative.replace('/', "_"));
            std::fs::write(&src, content).unwrap();
            writer
                .write_entry(&ArchiveEntry::new(src.as_path(), *relative))
                .unwrap();
        }
        writer.close().unwrap()
    }

    #[test]
    fn test_restore_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_archive(
            temp_dir.path(),
            "a.zip",
            &[("a.txt", "X"), ("nested/b.txt", "Y")],
            None,
        );
        let out = temp_dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("a.txt"), "stale").unwrap();

        assert_eq!(restore(&archive, &out, None).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "X");
        assert_eq!(std::fs::read_to_string(out.join("nested/b.txt")).unwrap(), "Y");
    }

    #[test]
    fn test_restore_missing_archive_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = restore(temp_dir.path().join("none.zip"), temp_dir.path(), None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_encrypted_restore_needs_right_password() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_archive(temp_dir.path(), "e.zip", &[("a.txt", "secret")], Some("right"));
        let out = temp_dir.path().join("out");

        let err = restore(&archive, &out, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Authentication);
        let err = restore(&archive, &out, Some(&RedactedString::from("wrong"))).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert!(!out.exists());

        restore(&archive, &out, Some(&RedactedString::from("right"))).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "secret");
    }

    #[test]
    fn test_truncated_archive_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_archive(temp_dir.path(), "t.zip", &[("a.txt", "X")], None);
        let bytes = std::fs::read(&archive).unwrap();
        std::fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        let out = temp_dir.path().join("out");
        let err = restore(&archive, &out, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CorruptArchive);
        assert!(!out.exists());
    }

    #[test]
    fn test_flipped_byte_is_corrupt_and_nothing_extracted() {
        let temp_dir = TempDir::new().unwrap();
        let content = (0..20_000u32)
            .map(|i| char::from(b'a' + ((i * 7 + i / 13) % 26) as u8))
            .collect::<String>();
        let archive = make_archive(
            temp_dir.path(),
            "c.zip",
            &[("first.txt", "fine"), ("second.txt", &content)],
            None,
        );

        // Locate the second member's data through the central directory and damage its middle.
        let (offset, size) = {
            let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
            let member = zip.by_name("second.txt").unwrap();
            (member.data_start(), member.compressed_size())
        };
        let mut bytes = std::fs::read(&archive).unwrap();
        bytes[(offset + size / 2) as usize] ^= 0xff;
        std::fs::write(&archive, &bytes).unwrap();

        let out = temp_dir.path().join("out");
        let err = restore(&archive, &out, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CorruptArchive);
        assert!(!out.join("first.txt").exists());
    }

    #[test]
    fn test_path_traversal_rejected_before_writing() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("evil.zip");
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("ok.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"fine").unwrap();
        zip.start_file("../escape.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"bad").unwrap();
        zip.finish().unwrap();

        let out = temp_dir.path().join("out");
        let err = restore(&archive, &out, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::PathTraversal);
        assert!(!out.join("ok.txt").exists());
        assert!(!temp_dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_list_entries_without_password() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_archive(temp_dir.path(), "l.zip", &[("x/y.txt", "1")], Some("pw"));
        assert_eq!(list_entries(&archive).unwrap(), vec!["x/y.txt"]);
        assert_eq!(verify(&archive, Some(&RedactedString::from("pw"))).unwrap(), 1);
    }

    #[test]
    fn test_restore_snapshot_replays_history() {
        let temp_dir = TempDir::new().unwrap();
        let full = make_archive(
            temp_dir.path(),
            "1.zip",
            &[("a.txt", "X"), ("b.txt", "Y"), ("gone.txt", "G")],
            None,
        );
        let delta = make_archive(temp_dir.path(), "2.zip", &[("a.txt", "Z")], None);

        let mut files = BTreeMap::new();
        files.insert("a.txt".to_string(), "h1".to_string());
        files.insert("b.txt".to_string(), "h2".to_string());
        let record = BackupRecord::builder()
            .source_directory("/src")
            .last_archive_path(delta.clone())
            .file_records(files)
            .archive_size_bytes(0)
            .last_run_timestamp("t")
            .history(vec![full, delta])
            .build();

        let out = temp_dir.path().join("out");
        restore_snapshot(&record, &out, None).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "Z");
        assert_eq!(std::fs::read_to_string(out.join("b.txt")).unwrap(), "Y");
        assert!(!out.join("gone.txt").exists());
    }

    #[test]
    fn test_restore_snapshot_verifies_every_archive_first() {
        let temp_dir = TempDir::new().unwrap();
        let full = make_archive(temp_dir.path(), "1.zip", &[("a.txt", "X")], None);
        let missing = temp_dir.path().join("2.zip");

        let mut files = BTreeMap::new();
        files.insert("a.txt".to_string(), "h1".to_string());
        let record = BackupRecord::builder()
            .source_directory("/src")
            .last_archive_path(missing.clone())
            .file_records(files)
            .archive_size_bytes(0)
            .last_run_timestamp("t")
            .history(vec![full, missing])
            .build();

        let out = temp_dir.path().join("out");
        let err = restore_snapshot(&record, &out, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(!out.exists());
    }
}
