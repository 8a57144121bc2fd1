//! Capture device discovery.

use std::{collections::BTreeMap, fs, path::Path};

use tracing::{debug, info};

/// Sysfs directory listing V4L2 devices on Linux.
pub const V4L_SYSFS_ROOT: &str = "/sys/class/video4linux";

/// Attached capture devices keyed by index, valued by their reported name.
///
/// Only Linux exposes a dependency-free listing; elsewhere the map is empty
/// and callers fall back to trying indices directly.
pub fn list_cameras() -> BTreeMap<i32, String> {
    let cameras = if cfg!(target_os = "linux") {
        list_cameras_in(Path::new(V4L_SYSFS_ROOT))
    } else {
        debug!("camera enumeration is not available on this platform");
        BTreeMap::new()
    };
    info!("Available cameras: {cameras:?}");
    cameras
}

/// Scan a `video4linux`-style directory of `videoN/name` entries.
pub fn list_cameras_in(root: &Path) -> BTreeMap<i32, String> {
    let mut cameras = BTreeMap::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("cannot read {}: {err}", root.display());
            return cameras;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(index) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix("video"))
            .and_then(|suffix| suffix.parse::<i32>().ok())
        else {
            continue;
        };
        let name = fs::read_to_string(entry.path().join("name"))
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|_| format!("video{index}"));
        cameras.insert(index, name);
    }

    cameras
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_names_and_skips_unrelated_entries() {
        let root = tempfile::tempdir().unwrap();
        for (dir, name) in [("video0", "HD USB Camera\n"), ("video2", "Integrated Camera")] {
            let path = root.path().join(dir);
            fs::create_dir(&path).unwrap();
            fs::write(path.join("name"), name).unwrap();
        }
        fs::create_dir(root.path().join("video3")).unwrap();
        fs::create_dir(root.path().join("v4l-subdev0")).unwrap();

        let cameras = list_cameras_in(root.path());

        assert_eq!(cameras.len(), 3);
        assert_eq!(cameras[&0], "HD USB Camera");
        assert_eq!(cameras[&2], "Integrated Camera");
        assert_eq!(cameras[&3], "video3");
    }

    #[test]
    fn missing_root_yields_empty_listing() {
        let root = tempfile::tempdir().unwrap();
        assert!(list_cameras_in(&root.path().join("absent")).is_empty());
    }
}
