use log::warn;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Reports free capacity on the volume holding a directory.
pub trait SpaceProbe: Send + Sync {
    /// Free bytes, or `None` when the capacity cannot be determined.
    fn available_bytes(&self, dir: &Path) -> io::Result<Option<u64>>;
}

/// Asks `df` for the free space of the volume containing `dir`.
#[derive(Default, Clone, Copy, Debug)]
pub struct DfSpaceProbe;

impl SpaceProbe for DfSpaceProbe {
    fn available_bytes(&self, dir: &Path) -> io::Result<Option<u64>> {
        let target = existing_ancestor(dir);
        let output = Command::new("df").arg("-Pk").arg(&target).output()?;
        if !output.status.success() {
            warn!("df exited with {} for {:?}", output.status, target);
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_df_available_kb(&stdout).map(|kb| kb * 1024);
        if parsed.is_none() {
            warn!("Could not parse df output, skipping disk space check");
        }
        Ok(parsed)
    }
}

/// A fixed capacity, for hosts that enforce their own storage quota.
#[derive(Clone, Copy, Debug)]
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self, _dir: &Path) -> io::Result<Option<u64>> {
        Ok(Some(self.0))
    }
}

// df reports on a path only once it exists
fn existing_ancestor(dir: &Path) -> PathBuf {
    dir.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Fourth column of the first data line, in KiB.
fn parse_df_available_kb(output: &str) -> Option<u64> {
    let line = output.lines().nth(1)?;
    line.split_whitespace().nth(3)?.parse().ok()
}
