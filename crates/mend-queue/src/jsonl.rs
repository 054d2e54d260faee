//! JSON-lines file helpers shared by the queue and the ledger

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Append one encoded line and sync it to disk
///
/// The line and its terminator go out in a single write so a concurrent
/// reader sees at most one torn line at the tail. An unterminated tail left
/// by a crash or a foreign writer is closed off first so the new line stays
/// on a line of its own. Callers hold the file's lock.
pub(crate) fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let mut buf = String::with_capacity(line.len() + 2);
    if !ends_with_newline(&mut file)? {
        buf.push('\n');
    }
    buf.push_str(line);
    buf.push('\n');

    file.write_all(buf.as_bytes())?;
    file.sync_data()
}

/// Whether `file` is empty or its last byte is a line terminator
fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Read every line of `path`; a missing file reads as empty
pub(crate) fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_owned).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Replace `path` with `lines` in one rename
///
/// The new content is written and synced to a temp file in the same
/// directory before the rename, so readers see either the old or the new
/// file, never a truncated one.
pub(crate) fn replace_lines<'a>(
    path: &Path,
    lines: impl IntoIterator<Item = &'a str>,
) -> io::Result<()> {
    let dir = parent_dir(path);
    let mut tmp = NamedTempFile::new_in(dir)?;
    for line in lines {
        tmp.write_all(line.as_bytes())?;
        tmp.write_all(b"\n")?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

/// Replace `path` with a single text value, same guarantees as [`replace_lines`]
pub(crate) fn replace_text(path: &Path, text: &str) -> io::Result<()> {
    replace_lines(path, std::iter::once(text))
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Best-effort fsync of a directory so a rename is durable
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line(&path, r#"{"a":1}"#).unwrap();
        append_line(&path, r#"{"a":2}"#).unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec![r#"{"a":1}"#, r#"{"a":2}"#]);
    }

    #[test]
    fn unterminated_tail_keeps_its_own_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, r#"{"a":1}"#).unwrap();
        append_line(&path, r#"{"a":2}"#).unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec![r#"{"a":1}"#, r#"{"a":2}"#]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"a\":1}\n{\"a\":2}\n"
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_lines(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn replace_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "old\nlines\n").unwrap();
        replace_lines(&path, ["new"]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }
}
