//! Correlation of cloud volumes to kernel block devices.
//!
//! The cloud attach response names the volume; the kernel names the device.
//! Nothing ties the two together directly, so the daemon snapshots the
//! device set before the attach and matches the newly-appeared device by
//! size. Two candidates of the same size is a hard failure, never a guess.

use crate::volume_daemon::error::VolumeDaemonError;
use log::debug;
use std::collections::HashMap;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Watches the sysfs block-device tree. The root is configurable so tests
/// can point it at a scratch directory.
#[derive(Clone)]
pub struct DeviceWatcher {
    sys_block_dir: String,
}

impl DeviceWatcher {
    pub fn new(sys_block_dir: String) -> Self {
        Self { sys_block_dir }
    }

    /// Current set of interesting block devices and their sizes in bytes.
    /// Virtual devices (loop, ram, device-mapper) are excluded; only
    /// hotplug-capable disk names can belong to a cloud attach.
    pub fn snapshot(&self) -> Result<HashMap<String, u64>, VolumeDaemonError> {
        let mut devices = HashMap::new();

        let entries = match std::fs::read_dir(&self.sys_block_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(devices),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_attachable_device(&name) {
                continue;
            }

            let size_path = entry.path().join("size");
            if let Ok(sectors) = std::fs::read_to_string(&size_path) {
                if let Ok(sectors) = sectors.trim().parse::<u64>() {
                    // sysfs reports 512-byte sectors regardless of the
                    // device's logical block size
                    devices.insert(name, sectors * 512);
                }
            }
        }

        Ok(devices)
    }

    /// Waits for exactly one new device of `expected_size` bytes to appear
    /// after a cloud attach, returning its /dev path.
    pub async fn wait_for_new_device(
        &self,
        volume_id: &str,
        before: &HashMap<String, u64>,
        expected_size: u64,
        timeout: Duration,
    ) -> Result<String, VolumeDaemonError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let now = self.snapshot()?;
            let candidates = correlate_new_devices(before, &now, expected_size);

            match candidates.len() {
                0 => {}
                1 => {
                    let name = &candidates[0];
                    debug!("Volume {} correlated to /dev/{}", volume_id, name);
                    return Ok(format!("/dev/{}", name));
                }
                n => {
                    return Err(VolumeDaemonError::AmbiguousDevice {
                        volume_id: volume_id.to_string(),
                        candidates: n,
                    });
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(VolumeDaemonError::DeviceTimeout {
                    volume_id: volume_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn is_attachable_device(name: &str) -> bool {
    (name.starts_with("vd") || name.starts_with("sd") || name.starts_with("xvd"))
        && !name.chars().any(|c| c.is_ascii_digit())
}

/// Devices present now but not before, with exactly the expected size.
/// Sorted for deterministic reporting.
pub fn correlate_new_devices(
    before: &HashMap<String, u64>,
    now: &HashMap<String, u64>,
    expected_size: u64,
) -> Vec<String> {
    let mut candidates: Vec<String> = now
        .iter()
        .filter(|(name, size)| !before.contains_key(*name) && **size == expected_size)
        .map(|(name, _)| name.clone())
        .collect();
    candidates.sort();
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    const GIB: u64 = 1 << 30;

    #[test]
    fn single_new_device_of_matching_size_wins() {
        let before = devices(&[("vda", 100 * GIB)]);
        let now = devices(&[("vda", 100 * GIB), ("vdb", 40 * GIB)]);
        assert_eq!(correlate_new_devices(&before, &now, 40 * GIB), vec!["vdb"]);
    }

    #[test]
    fn size_mismatch_is_not_a_candidate() {
        let before = devices(&[("vda", 100 * GIB)]);
        let now = devices(&[("vda", 100 * GIB), ("vdb", 41 * GIB)]);
        assert!(correlate_new_devices(&before, &now, 40 * GIB).is_empty());
    }

    #[test]
    fn two_same_size_devices_are_ambiguous() {
        let before = devices(&[("vda", 100 * GIB)]);
        let now = devices(&[("vda", 100 * GIB), ("vdb", 40 * GIB), ("vdc", 40 * GIB)]);
        let candidates = correlate_new_devices(&before, &now, 40 * GIB);
        assert_eq!(candidates.len(), 2, "must be reported, never guessed");
    }

    #[test]
    fn preexisting_devices_are_never_candidates() {
        let before = devices(&[("vda", 40 * GIB)]);
        let now = devices(&[("vda", 40 * GIB)]);
        assert!(correlate_new_devices(&before, &now, 40 * GIB).is_empty());
    }

    #[test]
    fn partitions_and_virtual_devices_are_filtered() {
        assert!(is_attachable_device("vdb"));
        assert!(is_attachable_device("sdc"));
        assert!(is_attachable_device("xvdf"));
        assert!(!is_attachable_device("vdb1"));
        assert!(!is_attachable_device("loop0"));
        assert!(!is_attachable_device("dm-0"));
        assert!(!is_attachable_device("ram1"));
    }
}
