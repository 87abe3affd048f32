use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use serde::Serialize;
use std::io::{BufWriter, IntoInnerError, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Directory a sibling temp file must live in so the final rename stays on one filesystem.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Serializes `value` as pretty JSON into a temp file next to `path`, syncs it, then renames it
/// over `path`. Readers see either the previous document or the new one, never a mix.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;
    let tmp = NamedTempFile::new_in(dir)?;
    let mut writer = BufWriter::new(tmp);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    let tmp = writer.into_inner().map_err(IntoInnerError::into_error)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::from(e.error))
        .with_msg(format!("Replace {:?} failed", path))?;
    Ok(())
}
