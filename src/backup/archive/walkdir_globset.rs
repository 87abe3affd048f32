use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};

use bon::Builder;
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use walkdir::{DirEntry, WalkDir};

use std::path::{Path, PathBuf};

/// A regular file found under a source directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute (or caller-relative) path on disk.
    pub path: PathBuf,
    /// Path relative to the source root, `/`-separated. Used as digest key and archive member name.
    pub relative: String,
}

/// Recursively walks a source directory, yielding regular files that are not excluded.
///
/// Symbolic links are never followed, so the walk always terminates.
#[derive(Clone, Debug, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SourceTree {
    #[builder(into)]
    src_dir: PathBuf,
    #[builder(default, into)]
    exclude: Vec<String>,
}

impl SourceTree {
    #[named]
    pub fn files<'a>(&self) -> Result<DynIter<'a, Result<SourceFile>>> {
        if !self.src_dir.is_dir() {
            tracing::error!(
                "Source directory does not exist or is not a directory: {:?}",
                self.src_dir
            );
            return Err(Error::NotFound(self.src_dir.clone()));
        }

        tracing::debug!(
            "Scanning directory {:?} with {} exclude patterns",
            self.src_dir,
            self.exclude.len()
        );

        let exclude = build_globset(&self.exclude)
            .with_debug_object_and_fn_name(self.clone(), function_path!())?;
        let src_dir = self.src_dir.clone();

        let entries = WalkDir::new(&self.src_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |res| match res {
                Ok(de) => process_dir_entry(de, &src_dir, &exclude),
                Err(e) => Some(Err(e.into())),
            });

        Ok(entries.into_dyn_iter())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    Ok(builder.build()?)
}

/// Archive member names are always `/`-separated regardless of platform.
pub fn relative_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .join("/")
}

fn process_dir_entry(de: DirEntry, base_src_dir: &Path, exclude: &GlobSet) -> Option<Result<SourceFile>> {
    if !de.file_type().is_file() {
        tracing::trace!("Skipping {:?}, not a regular file", de.path());
        return None;
    }

    let p = de.into_path();
    let res = match p.strip_prefix(base_src_dir) {
        Ok(stripped_path) => {
            if exclude.is_match(stripped_path) {
                tracing::trace!("Skipping {:?}, excluded", p);
                return None;
            }
            Ok(relative_name(stripped_path))
        }
        Err(e) => Err(Error::from(e).with_msg(format!(
            "Stripping {:?} from {:?} failed",
            base_src_dir, p
        ))),
    };

    Some(res.map(|relative| {
        tracing::trace!("Including file: {:?} -> {:?}", p, relative);
        SourceFile { path: p, relative }
    }))
}
