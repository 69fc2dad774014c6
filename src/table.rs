use std::fs::File;
use std::path::Path;

use csv::{Reader, ReaderBuilder, StringRecord, Writer, WriterBuilder};
use tempfile::NamedTempFile;

use crate::errors::{AppError, AppResult};

pub fn open_reader(path: &Path, delimiter: u8) -> AppResult<Reader<File>> {
    if !path.exists() {
        return Err(AppError::MissingInput(path.to_path_buf()));
    }
    let reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;
    Ok(reader)
}

pub fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|header| header.trim() == name)
}

/// Resolves every required column or fails with the full header list.
pub fn require_columns(
    path: &Path,
    headers: &StringRecord,
    required: &[&str],
) -> AppResult<Vec<usize>> {
    let mut indices = Vec::with_capacity(required.len());
    let mut missing = Vec::new();
    for name in required {
        match column_index(headers, name) {
            Some(idx) => indices.push(idx),
            None => missing.push((*name).to_string()),
        }
    }
    if missing.is_empty() {
        Ok(indices)
    } else {
        Err(AppError::missing_columns(
            path.display().to_string(),
            missing,
            headers,
        ))
    }
}

pub fn field<'r>(record: &'r StringRecord, idx: Option<usize>) -> &'r str {
    idx.and_then(|i| record.get(i)).unwrap_or("")
}

/// Writes `path` through a sibling temp file and renames it into place, so a
/// crash mid-write never leaves a truncated table behind.
pub fn write_atomic<F>(path: &Path, delimiter: u8, write: F) -> AppResult<()>
where
    F: FnOnce(&mut Writer<&mut NamedTempFile>) -> AppResult<()>,
{
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&parent)?;
    let mut temp = NamedTempFile::new_in(&parent)?;
    {
        let mut writer = WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(&mut temp);
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.as_file_mut().sync_all()?;
    temp.persist(path)?;
    Ok(())
}
