//! Validation functions for configuration values.
//!
//! Provides custom validation functions for directories, archive base names and glob patterns.

use globset::GlobBuilder;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

pub fn validate_valid_archive_base_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || !is_sanitized(name) {
        return Err(ValidationError::new("InvalidArchiveBaseName").with_message(
            format!(
                "Invalid file name, try sanitizing like {:?}",
                sanitize(name)
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access destination path {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_globs(globs: &[String]) -> Result<(), ValidationError> {
    for glob in globs {
        if let Err(e) = GlobBuilder::new(glob).literal_separator(true).build() {
            return Err(ValidationError::new("InvalidGlob")
                .with_message(format!("invalid exclude pattern {glob:?}: {e}").into()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_archive_base_name() {
        assert!(validate_valid_archive_base_name("backup").is_ok());
        assert!(validate_valid_archive_base_name("a/b").is_err());
        assert!(validate_valid_archive_base_name("").is_err());
    }

    #[test]
    fn test_dir_exist() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("f");
        std::fs::write(&file, "x").unwrap();

        assert!(validate_dir_exist(temp_dir.path()).is_ok());
        assert!(validate_dir_exist(&file).is_err());
        assert!(validate_dir_exist(temp_dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_dir_exist_or_created_creates() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("a/b");
        assert!(validate_dir_exist_or_created(&dir).is_ok());
        assert!(dir.is_dir());
    }

    #[test]
    fn test_globs() {
        assert!(validate_globs(&["**/*.tmp".to_string()]).is_ok());
        assert!(validate_globs(&["[oops".to_string()]).is_err());
    }
}
