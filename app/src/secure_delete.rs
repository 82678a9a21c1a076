// ==============================================================================
// secure_delete.rs - Overwrite-then-unlink File Deletion
// ==============================================================================
// Description: Scrubs stored lab documents before removing them from disk
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Number of overwrite passes before unlinking
pub const OVERWRITE_PASSES: usize = 3;

/// Overwrite a file with zeros, random bytes, then zeros, and unlink it
///
/// The blocking I/O runs on the blocking pool so request and worker tasks are
/// not stalled by large documents.
pub async fn secure_delete_file(path: &Path) -> Result<()> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || overwrite_and_unlink(&path))
        .await
        .context("Secure delete task panicked")?
}

fn overwrite_and_unlink(path: &Path) -> Result<()> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to get metadata for {:?}", path))?
        .len() as usize;

    debug!(?path, size, passes = OVERWRITE_PASSES, "Overwriting file before unlink");

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .context("Failed to open file for writing")?;

    let mut buffer = vec![0u8; size];
    for pass in 0..OVERWRITE_PASSES {
        if pass == OVERWRITE_PASSES / 2 {
            rand::thread_rng().fill_bytes(&mut buffer);
        } else {
            buffer.fill(0x00);
        }

        file.seek(SeekFrom::Start(0))
            .context("Failed to seek to file start")?;
        file.write_all(&buffer)
            .context("Failed to write overwrite pattern")?;
        file.sync_all()
            .context("Failed to sync file to disk")?;
    }

    drop(file);

    std::fs::remove_file(path)
        .context("Failed to remove file after overwrite")?;

    Ok(())
}
