use std::fs;
use std::io;
use std::path::Path;

use crate::error::{AppError, Result};

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| AppError::io(format!("failed to set permissions on {path:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_unix_permissions(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Write one archive entry (directory or regular file) to `out_path`.
pub(super) fn write_entry<R>(
    out_path: &Path,
    is_dir: bool,
    reader: &mut R,
    unix_mode: Option<u32>,
) -> Result<()>
where
    R: io::Read,
{
    if is_dir {
        fs::create_dir_all(out_path)
            .map_err(|e| AppError::io(format!("failed to create directory {out_path:?}: {e}")))?;
        return Ok(());
    }

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("failed to create directory {parent:?}: {e}")))?;
    }

    let mut outfile = fs::File::create(out_path).map_err(|e| AppError::io(e.to_string()))?;
    io::copy(reader, &mut outfile).map_err(|e| AppError::io(e.to_string()))?;
    // Only the permission bits; zip and tar modes may carry file-type bits too.
    set_unix_permissions(out_path, unix_mode.map(|mode| mode & 0o7777))?;
    Ok(())
}
