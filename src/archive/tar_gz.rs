use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};

use super::extract::write_entry;
use super::path::{destination_for, detect_common_top_dir, parse_entry_rel_path};

fn open_archive(archive_path: &Path) -> Result<tar::Archive<flate2::read::GzDecoder<fs::File>>> {
    let file = fs::File::open(archive_path).map_err(|e| AppError::io(e.to_string()))?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

fn entry_path_string<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let entry_path = entry.path().map_err(|e| AppError::io(e.to_string()))?;
    entry_path
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::io(format!("archive entry path is not valid UTF-8: {entry_path:?}")))
}

/// Extract tar.gz archive to dest_dir, stripping the top-level directory from the archive.
///
/// Gzip streams are not seekable, so the top-level folder is found in a first pass.
pub(crate) fn extract_tar_gz_flat(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let mut names = Vec::new();
    let mut archive = open_archive(archive_path)?;
    for entry in archive.entries().map_err(|e| AppError::io(e.to_string()))? {
        let entry = entry.map_err(|e| AppError::io(e.to_string()))?;
        names.push(entry_path_string(&entry)?);
    }
    let top_dir = detect_common_top_dir(names.iter().map(String::as_str));

    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let mut archive = open_archive(archive_path)?;
    for entry in archive.entries().map_err(|e| AppError::io(e.to_string()))? {
        let mut entry = entry.map_err(|e| AppError::io(e.to_string()))?;
        let raw_path = entry_path_string(&entry)?;

        if parse_entry_rel_path(&raw_path).is_none() && !raw_path.trim_matches('/').is_empty() {
            return Err(AppError::io(format!(
                "archive contains unsafe entry path: {raw_path:?}"
            )));
        }

        let entry_type = entry.header().entry_type();
        if !entry_type.is_dir() && !entry_type.is_file() {
            log::warn!("Skipping {entry_type:?} entry in template archive: {raw_path}");
            continue;
        }

        let Some(out_path) = destination_for(dest_dir, &raw_path, top_dir.as_deref()) else {
            continue;
        };

        let unix_mode = entry.header().mode().ok();
        write_entry(&out_path, entry_type.is_dir(), &mut entry, unix_mode)?;
    }

    Ok(())
}
