//! Random IO utilities

use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};

/// Replace the contents of `path` with `contents`, creating the file if needed.
pub async fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    tokio::fs::write(path, contents).await
}

/// Open `path` for a streamed write, truncating any previous contents.
pub async fn create_truncated(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

/// Make sure a regular file exists at `path` without touching its contents if it already does.
pub async fn touch(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map(drop)
}

/// Close `file`, waiting until the descriptor has really been released.
///
/// Dropping a tokio [`File`] only schedules the close; this waits for any in-flight operation and
/// then closes on the blocking pool.
pub async fn close_file(file: File) -> io::Result<()> {
    let std_file = file.into_std().await;
    tokio::task::spawn_blocking(move || drop(std_file))
        .await
        .map_err(io::Error::other)
}

/// Remove all files and directories in the given directory, but not the directory itself.
pub async fn remove_dir_contents(path: &Path) -> io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}
