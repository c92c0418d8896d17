//! Stable device naming.
//!
//! Kernel names like /dev/vdb are not stable across attach cycles; anything
//! that embeds them breaks on the first detach+reattach. The daemon instead
//! derives a deterministic short name from the cloud volume id and keeps a
//! symlink from the stable path to whatever kernel device currently backs
//! the volume. Downstream consumers only ever see the stable path.

use crate::volume_daemon::error::VolumeDaemonError;
use std::path::{Path, PathBuf};

/// Pure function of the volume id: "vol" + first 8 hex characters.
pub fn stable_name_for(volume_id: &str) -> String {
    let hex_prefix: String = volume_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(8)
        .collect::<String>()
        .to_lowercase();
    format!("vol{}", hex_prefix)
}

pub fn symlink_path_for(symlink_dir: &str, stable_name: &str) -> PathBuf {
    Path::new(symlink_dir).join(stable_name)
}

/// Points the stable path at `kernel_path`, atomically replacing any
/// previous target: the new link is created under a temporary name and
/// renamed over the old one, so readers never observe a missing link.
pub fn install_symlink(
    symlink_dir: &str,
    stable_name: &str,
    kernel_path: &str,
) -> Result<PathBuf, VolumeDaemonError> {
    let final_path = symlink_path_for(symlink_dir, stable_name);
    let staging_path = Path::new(symlink_dir).join(format!(".{}.staging", stable_name));

    if staging_path.exists() {
        std::fs::remove_file(&staging_path)?;
    }
    std::os::unix::fs::symlink(kernel_path, &staging_path)?;
    std::fs::rename(&staging_path, &final_path)?;

    Ok(final_path)
}

/// Removes the symlink on detach. The mapping row stays behind so reattach
/// reuses the same stable name.
pub fn remove_symlink(symlink_dir: &str, stable_name: &str) -> Result<(), VolumeDaemonError> {
    let path = symlink_path_for(symlink_dir, stable_name);
    match std::fs::remove_file(&path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Where the symlink currently points, if it exists.
pub fn resolve_symlink(symlink_dir: &str, stable_name: &str) -> Option<PathBuf> {
    std::fs::read_link(symlink_path_for(symlink_dir, stable_name)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_dir() -> String {
        let dir = std::env::temp_dir().join(format!("stable-names-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn name_is_a_pure_function_of_the_volume_id() {
        let id = "b3f1c2d4-5678-90ab-cdef-1234567890ab";
        assert_eq!(stable_name_for(id), stable_name_for(id));
        assert_eq!(stable_name_for(id), "volb3f1c2d4");
    }

    #[test]
    fn name_skips_non_hex_separators() {
        assert_eq!(stable_name_for("ab-cd-ef-01-23"), "volabcdef01");
    }

    #[test]
    fn install_then_reinstall_repoints_atomically() {
        let dir = scratch_dir();
        let name = stable_name_for("deadbeef-0000");

        install_symlink(&dir, &name, "/dev/vdb").unwrap();
        assert_eq!(resolve_symlink(&dir, &name).unwrap(), PathBuf::from("/dev/vdb"));

        // Reattach lands on a different kernel device; the link must follow.
        install_symlink(&dir, &name, "/dev/vdc").unwrap();
        assert_eq!(resolve_symlink(&dir, &name).unwrap(), PathBuf::from("/dev/vdc"));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = scratch_dir();
        let name = stable_name_for("cafe0001");
        install_symlink(&dir, &name, "/dev/vdz").unwrap();
        remove_symlink(&dir, &name).unwrap();
        remove_symlink(&dir, &name).unwrap();
        assert!(resolve_symlink(&dir, &name).is_none());
    }
}
