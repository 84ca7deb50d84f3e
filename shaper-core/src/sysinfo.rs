//! Host memory probing via procfs.

use std::path::Path;

/// Canonical location of the kernel's memory summary.
pub const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Debug, thiserror::Error)]
pub enum SysinfoError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid MemTotal line: {0}")]
    InvalidLine(String),
    #[error("MemTotal not found in {0}")]
    Missing(String),
    #[error("MemTotal is zero")]
    Zero,
}

/// Reads total system memory in kilobytes from a meminfo-format file.
pub fn read_memory_kb(path: impl AsRef<Path>) -> Result<u64, SysinfoError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|source| SysinfoError::Io {
        path: path.display().to_string(),
        source,
    })?;

    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let value = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| SysinfoError::InvalidLine(line.to_string()))?;
            let kb: u64 =
                value.parse().map_err(|_| SysinfoError::InvalidLine(line.to_string()))?;
            if kb == 0 {
                return Err(SysinfoError::Zero);
            }
            return Ok(kb);
        }
    }

    Err(SysinfoError::Missing(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn meminfo(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_mem_total() {
        let file = meminfo("MemTotal:       8388608 kB\nMemFree:        123456 kB\n");
        assert_eq!(read_memory_kb(file.path()).unwrap(), 8_388_608);
    }

    #[test]
    fn missing_line_errors() {
        let file = meminfo("MemFree: 42 kB\n");
        assert!(matches!(read_memory_kb(file.path()), Err(SysinfoError::Missing(_))));
    }

    #[test]
    fn zero_total_errors() {
        let file = meminfo("MemTotal: 0 kB\n");
        assert!(matches!(read_memory_kb(file.path()), Err(SysinfoError::Zero)));
    }
}
