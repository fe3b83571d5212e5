//! Follow worker log files and hand back the lines appended since the last look.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

struct Followed {
    label: String,
    path: PathBuf,
    offset: u64,
    partial: String,
}

/// Offset-tracking reader over a set of growing files.
///
/// A file that is not there yet is skipped until it appears. A file that
/// shrinks is treated as rewritten and read again from the start. A trailing
/// line without a newline is held back until it is finished.
#[derive(Default)]
pub struct LogFollower {
    files: Vec<Followed>,
}

impl LogFollower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start following `path`; its lines are reported under `label`.
    pub fn follow(&mut self, label: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.push(Followed {
            label: label.into(),
            path: path.into(),
            offset: 0,
            partial: String::new(),
        });
    }

    /// Complete lines appended since the previous call, as `(label, line)`.
    pub fn drain(&mut self) -> Result<Vec<(String, String)>> {
        let mut lines = Vec::new();
        for followed in &mut self.files {
            let Some(chunk) = read_from(&followed.path, &mut followed.offset)? else {
                continue;
            };
            if chunk.rewound {
                followed.partial.clear();
            }
            let text = String::from_utf8_lossy(&chunk.bytes);
            followed.partial.push_str(&text);
            while let Some(end) = followed.partial.find('\n') {
                let line: String = followed.partial.drain(..=end).collect();
                let line = line.trim_end_matches(['\n', '\r']);
                lines.push((followed.label.clone(), line.to_string()));
            }
        }
        Ok(lines)
    }
}

struct Chunk {
    bytes: Vec<u8>,
    rewound: bool,
}

fn read_from(path: &Path, offset: &mut u64) -> Result<Option<Chunk>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let rewound = len < *offset;
    if rewound {
        *offset = 0;
    }
    file.seek(SeekFrom::Start(*offset))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut bytes = Vec::new();
    let n = file
        .read_to_end(&mut bytes)
        .with_context(|| format!("read {}", path.display()))?;
    *offset += n as u64;
    Ok(Some(Chunk { bytes, rewound }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        file.write_all(text.as_bytes()).expect("write");
    }

    #[test]
    fn reports_only_new_complete_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("ralph-1.log");
        let mut follower = LogFollower::new();
        follower.follow("ralph-1", &log);

        assert!(follower.drain().expect("missing file").is_empty());

        append(&log, "one\ntw");
        assert_eq!(
            follower.drain().expect("drain"),
            vec![("ralph-1".to_string(), "one".to_string())]
        );

        append(&log, "o\r\nthree\n");
        let labelled: Vec<String> = follower
            .drain()
            .expect("drain")
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        assert_eq!(labelled, vec!["two", "three"]);
        assert!(follower.drain().expect("drain").is_empty());
    }

    #[test]
    fn rewritten_file_is_read_from_the_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("ralph-2.log");
        append(&log, "a long first line\nhalf");
        let mut follower = LogFollower::new();
        follower.follow("ralph-2", &log);
        assert_eq!(follower.drain().expect("drain").len(), 1);

        fs::write(&log, "fresh\n").expect("truncate");
        assert_eq!(
            follower.drain().expect("drain"),
            vec![("ralph-2".to_string(), "fresh".to_string())]
        );
    }

    #[test]
    fn keeps_files_apart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("ralph-1.log");
        let second = temp.path().join("ralph-2.log");
        let mut follower = LogFollower::new();
        follower.follow("ralph-1", &first);
        follower.follow("ralph-2", &second);

        append(&first, "from one, ");
        append(&second, "from two\n");
        append(&first, "done\n");
        assert_eq!(
            follower.drain().expect("drain"),
            vec![
                ("ralph-1".to_string(), "from one, done".to_string()),
                ("ralph-2".to_string(), "from two".to_string()),
            ]
        );
    }
}
