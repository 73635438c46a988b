//! Template archive extraction into instance workspaces.

mod extract;
mod path;
mod tar_gz;
mod zip_ops;

use std::fs;
use std::io::Read as _;
use std::path::Path;

use crate::error::{AppError, Result};

pub(crate) use tar_gz::extract_tar_gz_flat;
pub(crate) use zip_ops::extract_zip_flat;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveFormat {
    Zip,
    TarGz,
}

/// Sniff the archive format from its leading bytes; download URLs
/// (e.g. GitHub zipballs) rarely carry a usable extension.
pub(crate) fn detect_format(archive_path: &Path) -> Result<ArchiveFormat> {
    let mut header = [0u8; 4];
    let mut file = fs::File::open(archive_path).map_err(|e| AppError::io(e.to_string()))?;
    let read = file
        .read(&mut header)
        .map_err(|e| AppError::io(e.to_string()))?;

    if read >= 4 && header == ZIP_MAGIC {
        Ok(ArchiveFormat::Zip)
    } else if read >= 2 && header[..2] == GZIP_MAGIC {
        Ok(ArchiveFormat::TarGz)
    } else {
        Err(AppError::provision(format!(
            "unrecognized template archive format: {}",
            archive_path.display()
        )))
    }
}

/// Extract a template archive into `dest_dir`, dropping the archive's
/// single top-level folder if it has one.
pub(crate) fn extract_template(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    match detect_format(archive_path)? {
        ArchiveFormat::Zip => extract_zip_flat(archive_path, dest_dir),
        ArchiveFormat::TarGz => extract_tar_gz_flat(archive_path, dest_dir),
    }
}
