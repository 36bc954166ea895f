use std::io::{self, Read};
use std::path::Path;

use md5::Context;
use tokio::io::AsyncReadExt;

/// Checksum placeholder for content that has never been hashed.
pub const UNKNOWN_CHECKSUM: &str = "-";
/// Checksum placeholder for content that was requested but unreadable.
pub const UNREADABLE_CHECKSUM: &str = "<unknown>";

const CHUNK: usize = 64 * 1024;

pub fn bytes_md5(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Streaming MD5 of a file, blocking. Used by the startup scan.
pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Streaming MD5 of a file from async context.
pub async fn file_md5_async(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// MD5 of a file for the scan path: `<unknown>` when the file exists but
/// cannot be read.
pub fn file_md5_or_unreadable(path: &Path) -> String {
    file_md5(path).unwrap_or_else(|_| UNREADABLE_CHECKSUM.to_string())
}

/// MD5 of a file for the watcher path: `-` when the file is already gone.
pub async fn file_md5_or_unknown(path: &Path) -> String {
    match file_md5_async(path).await {
        Ok(checksum) => checksum,
        Err(_) => UNKNOWN_CHECKSUM.to_string(),
    }
}
