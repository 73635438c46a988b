use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};

use super::extract::write_entry;
use super::path::{destination_for, detect_common_top_dir, parse_entry_rel_path};

/// Extract zip archive to dest_dir, stripping the top-level directory from the archive.
///
/// Symlink entries are skipped; a template has no business pointing outside itself.
pub(crate) fn extract_zip_flat(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let file = fs::File::open(archive_path).map_err(|e| AppError::io(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let top_dir = detect_common_top_dir(archive.file_names());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().to_string();

        if parse_entry_rel_path(&raw_name).is_none() && !raw_name.trim_matches('/').is_empty() {
            return Err(AppError::io(format!(
                "archive contains unsafe zip path: {raw_name:?}"
            )));
        }

        if entry.is_symlink() {
            log::warn!("Skipping symlink entry in template archive: {raw_name}");
            continue;
        }

        let Some(out_path) = destination_for(dest_dir, &raw_name, top_dir.as_deref()) else {
            continue;
        };

        let is_dir = entry.is_dir();
        let unix_mode = entry.unix_mode();
        write_entry(&out_path, is_dir, &mut entry, unix_mode)?;
    }

    Ok(())
}
