//! Local filesystem helpers shared by backends and the sync engine

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::cancel::{cancellable, ensure_active};
use crate::error::{Error, Result};
use crate::traits::ObjectReader;

const COMPARE_CHUNK: usize = 64 * 1024;

/// List the regular files under `root`, relative to it
///
/// Symlinks are followed, so files reachable through them are included. An
/// empty root yields nothing.
pub async fn walk_local_tree(ctx: &CancellationToken, root: &Path) -> Result<Vec<PathBuf>> {
    ensure_active(ctx)?;
    if root.as_os_str().is_empty() {
        return Ok(Vec::new());
    }

    let root = root.to_path_buf();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(true) {
            ensure_active(&ctx)?;
            let entry = entry.map_err(|e| {
                let msg = format!("walking '{}': {e}", root.display());
                match e.into_io_error() {
                    Some(io) => Error::Io(std::io::Error::new(io.kind(), msg)),
                    None => Error::InvalidKey(msg),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
            files.push(rel.to_path_buf());
        }
        files.sort();
        Ok(files)
    })
    .await
    .map_err(|e| Error::Transfer(format!("directory walk task failed: {e}")))?
}

/// Write `reader` to `dest` unless `dest` already holds the same bytes
///
/// Data goes to a temporary sibling first and is renamed into place, so a
/// failed download never leaves a truncated file behind. Returns whether
/// `dest` was (re)written.
pub async fn write_file_if_changed(
    ctx: &CancellationToken,
    mut reader: ObjectReader,
    dest: &Path,
) -> Result<bool> {
    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_sibling(dest);
    let written: Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        cancellable(ctx, async {
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok(())
        })
        .await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    if same_contents(&tmp, dest).await? {
        tokio::fs::remove_file(&tmp).await?;
        tracing::trace!(path = %dest.display(), "content unchanged, keeping existing file");
        return Ok(false);
    }

    tokio::fs::rename(&tmp, dest).await?;
    Ok(true)
}

/// Temporary file next to `path`, unique per call
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{nanos}.partial"))
}

/// Compare two files byte by byte; a missing file never matches
pub async fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    let (meta_a, meta_b) = match (tokio::fs::metadata(a).await, tokio::fs::metadata(b).await) {
        (Ok(ma), Ok(mb)) => (ma, mb),
        (Err(e), _) | (_, Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(false);
        }
        (Err(e), _) | (_, Err(e)) => return Err(e.into()),
    };
    if !meta_b.is_file() || meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut fa = tokio::fs::File::open(a).await?;
    let mut fb = tokio::fs::File::open(b).await?;
    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    loop {
        let n = fa.read(&mut buf_a).await?;
        if n == 0 {
            return Ok(true);
        }
        fb.read_exact(&mut buf_b[..n]).await?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}
