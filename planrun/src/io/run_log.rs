//! Per-run product log.
//!
//! Unlike tracing diagnostics, these lines are always written to `log.txt`
//! in the run workdir, independent of `RUST_LOG`. This file is the one
//! `planrun run --follow` tails.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

/// Name of the product log inside a run workdir.
pub const LOG_FILENAME: &str = "log.txt";

/// How many already existing lines `follow` shows for context.
const FOLLOW_LINES: usize = 10;

/// Append-only writer for the run product log.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(workdir: &Path) -> RunLog {
        RunLog {
            path: workdir.join(LOG_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; also echoed to stdout for interactive runs.
    pub fn line(&self, message: &str) -> Result<()> {
        println!("{message}");
        self.append(message)
    }

    /// Append one line to the file only.
    pub fn append(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open run log {}", self.path.display()))?;
        writeln!(file, "{message}")
            .with_context(|| format!("write run log {}", self.path.display()))?;
        Ok(())
    }
}

/// Periodically check for new lines in the run log and print them.
///
/// Shows the last few existing lines for context, then polls forever; this
/// function never returns under normal operation.
pub fn follow(workdir: &Path) -> Result<()> {
    let path = workdir.join(LOG_FILENAME);
    let file =
        File::open(&path).with_context(|| format!("open run log {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let tail_start = tail_position(&mut reader, FOLLOW_LINES)?;
    reader.seek(SeekFrom::Start(tail_start)).context("seek run log")?;

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).context("read run log")?;
        if read > 0 {
            print!("{line}");
        } else {
            thread::sleep(Duration::from_millis(500));
        }
    }
}

/// Byte offset from which the last `lines` lines start.
fn tail_position(reader: &mut BufReader<File>, lines: usize) -> Result<u64> {
    let end = reader.seek(SeekFrom::End(0)).context("seek run log")?;
    reader.seek(SeekFrom::Start(0)).context("seek run log")?;

    let mut offsets = Vec::new();
    let mut position = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).context("read run log")?;
        if read == 0 {
            break;
        }
        offsets.push(position);
        position += read as u64;
    }

    if offsets.len() <= lines {
        return Ok(0);
    }
    Ok(*offsets.get(offsets.len() - lines).unwrap_or(&end))
}
