//! Zip archive production
//!
//! Multi-file downloads are delivered as deflate zip archives. The
//! archive is staged to a temp file and handed out as a lazy chunk
//! stream with backpressure: a cancelled receiver drops the stream,
//! which closes the staged file without leaking handles.

use crate::vfs::{Fs as _, FsRead as _, VirtualFs};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use wharf_common::{Error, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const STREAM_CHUNK: usize = 64 * 1024;

fn zip_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Build an in-memory archive from named byte blobs, used by the
/// filesystem compress action.
pub fn build_archive(sources: HashMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let mut names: Vec<&String> = sources.keys().collect();
    names.sort();
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for name in names {
        writer
            .start_file(name.as_str(), zip_options())
            .map_err(zip_err)?;
        writer.write_all(&sources[name]).map_err(io_err)?;
    }
    let cursor = writer.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}

/// Stage an archive of the given virtual paths and return a receiver of
/// its bytes. Directories are walked; entry names are the virtual paths
/// without the leading slash.
pub async fn stream_paths(
    vfs: Arc<VirtualFs>,
    paths: Vec<String>,
) -> Result<mpsc::Receiver<Result<Bytes>>> {
    let staged = stage_archive(vfs, paths).await?;
    let (tx, rx) = mpsc::channel(4);
    tokio::task::spawn_blocking(move || {
        let mut file = staged;
        if file.rewind().is_err() {
            return;
        }
        loop {
            let mut buf = vec![0u8; STREAM_CHUNK];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    // A dropped receiver means the client went away;
                    // stop producing.
                    if tx.blocking_send(Ok(Bytes::from(buf))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(Error::Internal(format!(
                        "archive read failed: {}",
                        e
                    ))));
                    break;
                }
            }
        }
    });
    Ok(rx)
}

/// Write the archive for `paths` into an unlinked temp file.
async fn stage_archive(vfs: Arc<VirtualFs>, paths: Vec<String>) -> Result<std::fs::File> {
    let staged = tempfile::tempfile()
        .map_err(|e| Error::Internal(format!("unable to stage archive: {}", e)))?;
    let mut writer = ZipWriter::new(staged);
    for path in paths {
        let resolved = vfs.resolve(&path);
        let info = resolved.fs.stat(&resolved.fs_path).await?;
        if info.is_dir {
            for (child_fs_path, child_info) in resolved.fs.walk(&resolved.fs_path).await? {
                let entry_name = entry_name_for(&path, &resolved.fs_path, &child_fs_path);
                if child_info.is_dir {
                    writer
                        .add_directory(entry_name, zip_options())
                        .map_err(zip_err)?;
                    continue;
                }
                copy_file_into(&mut writer, &resolved.fs, &child_fs_path, &entry_name).await?;
            }
        } else {
            let entry_name = path.trim_start_matches('/').to_string();
            copy_file_into(&mut writer, &resolved.fs, &resolved.fs_path, &entry_name).await?;
        }
    }
    writer.finish().map_err(zip_err)
}

fn entry_name_for(virtual_base: &str, fs_base: &str, fs_path: &str) -> String {
    let relative = fs_path.strip_prefix(fs_base).unwrap_or(fs_path);
    crate::util::join_path(virtual_base, relative.trim_start_matches('/'))
        .trim_start_matches('/')
        .to_string()
}

async fn copy_file_into<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    fs: &Arc<dyn crate::vfs::Fs>,
    fs_path: &str,
    entry_name: &str,
) -> Result<()> {
    writer
        .start_file(entry_name, zip_options())
        .map_err(zip_err)?;
    let mut reader = fs.open_read(fs_path, 0).await?;
    loop {
        let chunk = reader.read_chunk(STREAM_CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        writer.write_all(&chunk).map_err(io_err)?;
    }
    reader.close().await
}

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Internal(format!("zip write failed: {}", e))
}

fn io_err(e: std::io::Error) -> Error {
    Error::Internal(format!("zip write failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_roundtrip() {
        let mut sources = HashMap::new();
        sources.insert("a.txt".to_string(), b"alpha".to_vec());
        sources.insert("dir/b.txt".to_string(), b"beta".to_vec());
        let archive = build_archive(sources).unwrap();

        let mut reader = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(reader.len(), 2);
        let mut contents = String::new();
        reader
            .by_name("a.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "alpha");
        contents.clear();
        reader
            .by_name("dir/b.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "beta");
    }

    #[test]
    fn deterministic_entry_order() {
        let mut sources = HashMap::new();
        sources.insert("z.txt".to_string(), b"z".to_vec());
        sources.insert("a.txt".to_string(), b"a".to_vec());
        let first = build_archive(sources.clone()).unwrap();
        let second = build_archive(sources).unwrap();
        assert_eq!(first, second);
    }
}
