//! Backward reader for the last lines of a log file.
//!
//! Log files grow to tens of megabytes over a session, so the tail is found
//! by reading fixed-size chunks from the end until enough line breaks have
//! been seen.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Size of each backward read.
pub const CHUNK_SIZE: u64 = 4096;

/// Read the last `n` lines of a file, oldest first.
///
/// A final line break does not start an extra empty line, and a trailing
/// `\r` is stripped from every line. Returns `min(n, total lines)` lines;
/// an empty file yields an empty vector.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn read_last_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // Chunks in reverse file order.
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut offset = len;
    let mut breaks = 0usize;
    let mut ends_with_newline = None;

    while offset > 0 {
        let size = CHUNK_SIZE.min(offset);
        offset -= size;
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = vec![0u8; usize::try_from(size).map_err(io::Error::other)?];
        file.read_exact(&mut chunk)?;

        let trailing = *ends_with_newline.get_or_insert(chunk.last() == Some(&b'\n'));
        breaks += chunk.iter().filter(|&&b| b == b'\n').count();
        chunks.push(chunk);

        // Every break except a final one closes off a line that started
        // inside the buffer, so the buffer holds that many complete lines
        // even if its first segment was cut by the chunk boundary.
        let complete = breaks - usize::from(trailing);
        if complete >= n {
            break;
        }
    }

    let mut buf = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks.iter().rev() {
        buf.extend_from_slice(chunk);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }

    let mut segments: Vec<&[u8]> = buf.split(|&b| b == b'\n').collect();
    if offset > 0 {
        // First segment is the tail of a line that started before the buffer.
        segments.remove(0);
    }

    let skip = segments.len().saturating_sub(n);
    Ok(segments[skip..]
        .iter()
        .map(|&segment| {
            let segment = segment.strip_suffix(b"\r").unwrap_or(segment);
            String::from_utf8_lossy(segment).into_owned()
        })
        .collect())
}
