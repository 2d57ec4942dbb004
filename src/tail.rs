// =============================================================================
// Reverse tail reader — last N lines of a file without a full scan
// =============================================================================
//
// Both the signal log and the bar CSV grow unbounded; bootstrap and trailing
// reads only ever need the most recent lines. This reader walks fixed-size
// blocks backwards from EOF and stops as soon as enough newlines were seen.
// =============================================================================

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

/// Block size for the backwards scan.
const BLOCK_SIZE: u64 = 8192;

/// Read the last `n` lines of the file at `path`, oldest first.
///
/// Returns an empty vector for an empty file. Errors propagate for a missing
/// or unreadable file; callers decide whether that is fatal.
pub fn tail_lines(path: impl AsRef<Path>, n: usize) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    if n == 0 || len == 0 {
        return Ok(Vec::new());
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut pos = len;

    // Accumulate blocks from the end until enough newlines are present or
    // the file start is reached. One extra newline covers a missing trailing
    // terminator on the last line.
    while pos > 0 {
        let read_len = BLOCK_SIZE.min(pos);
        pos -= read_len;

        let mut block = vec![0u8; read_len as usize];
        file.seek(SeekFrom::Start(pos))
            .with_context(|| format!("seek failed in {}", path.display()))?;
        file.read_exact(&mut block)
            .with_context(|| format!("read failed in {}", path.display()))?;

        block.extend_from_slice(&buf);
        buf = block;

        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        if newlines > n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect();

    // The first accumulated line may be a partial one cut at a block
    // boundary; drop it unless we consumed the whole file.
    if pos > 0 && lines.len() > n {
        lines.remove(0);
    }

    let start = lines.len().saturating_sub(n);
    Ok(lines.split_off(start))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn tail_of_small_file_returns_all() {
        let f = write_lines(&["a", "b", "c"]);
        let got = tail_lines(f.path(), 10).unwrap();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn tail_returns_last_n_in_order() {
        let f = write_lines(&["1", "2", "3", "4", "5"]);
        let got = tail_lines(f.path(), 2).unwrap();
        assert_eq!(got, vec!["4", "5"]);
    }

    #[test]
    fn tail_of_empty_file_is_empty() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let got = tail_lines(f.path(), 5).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn tail_spanning_multiple_blocks() {
        // Lines long enough that 300 of them exceed one 8 KiB block.
        let lines: Vec<String> = (0..500)
            .map(|i| format!("{{\"action\":\"PEAK\",\"seq\":{i},\"pad\":\"{}\"}}", "x".repeat(60)))
            .collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let f = write_lines(&refs);

        let got = tail_lines(f.path(), 300).unwrap();
        assert_eq!(got.len(), 300);
        assert_eq!(got[0], lines[200]);
        assert_eq!(got[299], lines[499]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(tail_lines("/nonexistent/definitely-not-here.log", 5).is_err());
    }

    #[test]
    fn file_without_trailing_newline() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "first\nsecond\nthird").unwrap();
        f.flush().unwrap();
        let got = tail_lines(f.path(), 2).unwrap();
        assert_eq!(got, vec!["second", "third"]);
    }
}
