//! Picking the link root that lives on the same volume as the content.

use std::path::{Component, Path, PathBuf};

use super::LinkMode;
use crate::error::{Error, Result};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Mount points, longest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    points: Vec<PathBuf>,
}

/// `/proc/mounts` escapes spaces, tabs, newlines and backslashes as `\ooo`.
fn decode_octal_escapes(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

impl MountTable {
    /// Reads the system mount table. Empty when there is none (e.g. macOS, Windows).
    pub fn load() -> Self {
        match std::fs::read_to_string(PROC_MOUNTS) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                tracing::debug!(error = %e, "no mount table available");
                MountTable::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut points: Vec<PathBuf> = text
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(|field| PathBuf::from(decode_octal_escapes(field)))
            .collect();
        points.sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));
        points.dedup();
        MountTable { points }
    }

    /// Most specific mount point containing `path`.
    pub fn mount_of(&self, path: &Path) -> Option<&Path> {
        self.points.iter().map(PathBuf::as_path).find(|point| path.starts_with(point))
    }
}

fn drive_prefix(path: &Path) -> Option<String> {
    match path.components().next()? {
        Component::Prefix(prefix) => Some(prefix.as_os_str().to_string_lossy().to_uppercase()),
        _ => None,
    }
}

/// Chooses the configured link root for `source`.
///
/// On Windows roots on the same drive qualify. Elsewhere a root qualifies when it contains
/// the source or sits on the same mount. Symlinks can cross volumes, so they fall back to
/// the first root.
pub fn resolve_root(source: &Path, roots: &[PathBuf], mode: LinkMode, mounts: &MountTable) -> Result<PathBuf> {
    let found = if cfg!(windows) {
        let drive = drive_prefix(source);
        roots.iter().find(|root| drive.is_some() && drive_prefix(root) == drive)
    } else {
        let source_mount = mounts.mount_of(source);
        roots.iter().find(|root| {
            source.starts_with(root) || (source_mount.is_some() && mounts.mount_of(root) == source_mount)
        })
    };

    match found {
        Some(root) => Ok(root.clone()),
        None if mode == LinkMode::Symlink && !roots.is_empty() => Ok(roots[0].clone()),
        None => Err(Error::Configuration(format!(
            "no linked folder is on the same volume as {}",
            source.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /mnt/media ext4 rw 0 0
/dev/sdc1 /mnt/media\\040disk xfs rw 0 0
/dev/sdd1 /srv/links ext4 rw 0 0
";

    #[test]
    fn parses_and_decodes_mount_points() {
        let table = MountTable::parse(MOUNTS);
        assert_eq!(
            table.mount_of(Path::new("/mnt/media disk/Movie")),
            Some(Path::new("/mnt/media disk"))
        );
        assert_eq!(table.mount_of(Path::new("/mnt/media/Movie")), Some(Path::new("/mnt/media")));
        assert_eq!(table.mount_of(Path::new("/home/user")), Some(Path::new("/")));
    }

    #[cfg(not(windows))]
    #[test]
    fn picks_a_root_on_the_same_mount() {
        let table = MountTable::parse(MOUNTS);
        let roots = vec![PathBuf::from("/srv/links/seed"), PathBuf::from("/mnt/media/seed")];

        let root = resolve_root(Path::new("/mnt/media/Movie"), &roots, LinkMode::Hardlink, &table)
            .expect("a root shares the mount");
        assert_eq!(root, PathBuf::from("/mnt/media/seed"));

        let err = resolve_root(Path::new("/mnt/media disk/Movie"), &roots, LinkMode::Hardlink, &table)
            .expect_err("no root on that disk");
        assert!(matches!(err, Error::Configuration(_)));

        let root = resolve_root(Path::new("/mnt/media disk/Movie"), &roots, LinkMode::Symlink, &table)
            .expect("symlinks fall back to the first root");
        assert_eq!(root, PathBuf::from("/srv/links/seed"));
    }

    #[cfg(not(windows))]
    #[test]
    fn containment_works_without_a_mount_table() {
        let roots = vec![PathBuf::from("/data")];
        let root = resolve_root(Path::new("/data/Movie"), &roots, LinkMode::Hardlink, &MountTable::default())
            .expect("the root contains the source");
        assert_eq!(root, PathBuf::from("/data"));
    }
}
