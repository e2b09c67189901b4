use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing::info;

use crate::error::{Error, Result};
use crate::state::STATUS_FILE;

/// Write `body` next to `path` first, then rename over it.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

/// Archive a non-empty output directory as `<dir>-<YYYYMMDD-HHMMSS>`.
///
/// The stamp is the local mtime of the previous run's status file, falling
/// back to the directory's own mtime. Returns the archive path when a rename
/// happened. Nothing is ever deleted.
pub fn rotate_existing_output_dir(dir: &Path) -> Result<Option<PathBuf>> {
    if dir.as_os_str().is_empty() {
        return Ok(None);
    }
    let meta = match fs::metadata(dir) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::msg(format!(
                "failed to stat output dir {}: {e}",
                dir.display()
            )));
        }
    };
    if !meta.is_dir() {
        return Err(Error::msg(format!(
            "output path is not a directory: {}",
            dir.display()
        )));
    }
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?;
    if entries.next().is_none() {
        return Ok(None);
    }

    let stamp_time = fs::metadata(dir.join(STATUS_FILE))
        .and_then(|m| m.modified())
        .or_else(|_| meta.modified())
        .unwrap_or_else(|_| SystemTime::now());
    let stamp = DateTime::<Local>::from(stamp_time).format("%Y%m%d-%H%M%S");

    let archived = PathBuf::from(format!("{}-{stamp}", dir.display()));
    if archived.exists() {
        return Err(Error::msg(format!(
            "cannot archive {}: {} already exists",
            dir.display(),
            archived.display()
        )));
    }
    fs::rename(dir, &archived).map_err(|e| {
        Error::msg(format!(
            "failed to archive output dir {} -> {}: {e}",
            dir.display(),
            archived.display()
        ))
    })?;
    info!(from = %dir.display(), to = %archived.display(), "archived previous output");
    Ok(Some(archived))
}

pub fn ensure_dir(dir: &Path, what: &str) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::msg(format!("failed to create {what} {}: {e}", dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use filetime::FileTime;

    #[test]
    fn missing_or_empty_dir_is_left_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("output");
        assert_eq!(rotate_existing_output_dir(&missing).expect("rotate"), None);

        fs::create_dir(&missing).expect("mkdir");
        assert_eq!(rotate_existing_output_dir(&missing).expect("rotate"), None);
        assert!(missing.is_dir());
    }

    #[test]
    fn rotation_uses_status_file_mtime() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("output");
        fs::create_dir(&out).expect("mkdir");
        let status = out.join(STATUS_FILE);
        fs::write(&status, "[]").expect("write status");

        let when = Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("local time");
        filetime::set_file_mtime(&status, FileTime::from_unix_time(when.timestamp(), 0))
            .expect("set mtime");

        let archived = rotate_existing_output_dir(&out)
            .expect("rotate")
            .expect("archived");
        assert_eq!(archived, tmp.path().join("output-20240309-140507"));
        assert!(!out.exists());
        assert!(archived.join(STATUS_FILE).is_file());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().join("nested").join("servers.json");
        atomic_write_text(&target, "[1]").expect("write");
        atomic_write_text(&target, "[2]").expect("overwrite");
        assert_eq!(fs::read_to_string(&target).expect("read"), "[2]");
        let names: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
