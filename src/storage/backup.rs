//! Whole-store snapshots.
//!
//! Backups are tar.gz archives of the sled data directory, named by UTC
//! timestamp. The master-key salt lives inside the `settings` tree, so a
//! snapshot always carries the salt together with the user rows it
//! protects. Retention keeps the newest N archives.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use tar::Builder;

/// Create a snapshot of `data_dir` under `backup_dir`, then prune old
/// archives down to `keep`. Returns the new archive path.
pub fn create_snapshot(data_dir: &Path, backup_dir: &Path, keep: usize) -> io::Result<PathBuf> {
    fs::create_dir_all(backup_dir)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let archive_path = backup_dir.join(format!("advbbs-{}.tar.gz", stamp));

    let file = File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all("advbbs-data", data_dir)?;
    builder.into_inner()?.finish()?;

    let pruned = prune(backup_dir, keep)?;
    info!(
        "store snapshot written to {:?} ({} old archive(s) pruned)",
        archive_path, pruned
    );
    Ok(archive_path)
}

/// Remove the oldest archives beyond `keep`. Archive names sort
/// chronologically, so lexicographic order is age order.
fn prune(backup_dir: &Path, keep: usize) -> io::Result<usize> {
    let mut archives: Vec<PathBuf> = fs::read_dir(backup_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("advbbs-") && n.ends_with(".tar.gz"))
        })
        .collect();
    archives.sort();
    let mut removed = 0;
    while archives.len() > keep {
        let victim = archives.remove(0);
        fs::remove_file(&victim)?;
        removed += 1;
    }
    Ok(removed)
}
