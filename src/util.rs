use std::io;
use std::path::Path;

/// Atomic file write: writes data to a temporary sibling file, then renames
/// into place. Rename is atomic on POSIX when src and dst are on the same
/// filesystem (guaranteed here: sibling file).
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> crate::error::SysgateResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data)?;
    Ok(())
}
