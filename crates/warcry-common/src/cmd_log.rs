// cmd_log.rs — human-readable command log
//
// Every issued command is offered to the log collaborator before it is
// dispatched or queued; the collaborator decides whether to persist. The
// file format is one s-expression per command, which a later session can
// replay to recover a crashed game.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use parking_lot::Mutex;

/// How the x/y pair of a record is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPosition {
    /// No positional argument.
    None,
    /// x/y are map coordinates.
    Location(u16, u16),
    /// x carries a plain value (queue slot, upgrade index).
    Value(u16),
}

/// One command as offered to the log.
#[derive(Debug, Clone, Copy)]
pub struct CommandRecord<'a> {
    pub frame: u32,
    pub unit: u16,
    pub name: &'a str,
    pub flush: bool,
    pub position: LogPosition,
    pub dest: Option<u16>,
    pub extra: Option<u16>,
}

pub trait CommandLog {
    fn log(&self, record: &CommandRecord);
}

/// Discards every record. Default when logging is off.
pub struct NullCommandLog;

impl CommandLog for NullCommandLog {
    fn log(&self, _record: &CommandRecord) {}
}

/// Appends records to a file, opened lazily on the first record so that a
/// session that never issues a command leaves no file behind.
pub struct FileCommandLog {
    path: PathBuf,
    map_description: String,
    file: Mutex<Option<File>>,
}

impl FileCommandLog {
    pub fn new(path: impl Into<PathBuf>, map_description: &str) -> Self {
        Self {
            path: path.into(),
            map_description: map_description.to_string(),
            file: Mutex::new(None),
        }
    }

    fn open(&self) -> Option<File> {
        let mut file = match File::create(&self.path) {
            Ok(f) => f,
            Err(err) => {
                warn!("command log: can't create {}: {err}", self.path.display());
                return None;
            }
        };
        let date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let header = format!(
            ";;; Log file generated by warcry {}\n;;;\tDate: {date}\n;;;\tMap: {}\n\n",
            env!("CARGO_PKG_VERSION"),
            self.map_description,
        );
        if let Err(err) = file.write_all(header.as_bytes()) {
            warn!("command log: write failed: {err}");
            return None;
        }
        Some(file)
    }
}

impl CommandLog for FileCommandLog {
    fn log(&self, record: &CommandRecord) {
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = self.open();
        }
        let Some(file) = guard.as_mut() else { return };

        let mut line = format!(
            "(log {} 'U{} '{} '{}",
            record.frame,
            record.unit,
            record.name,
            if record.flush { "flush" } else { "append" },
        );
        match record.position {
            LogPosition::None => {}
            LogPosition::Location(x, y) => line.push_str(&format!(" ({x} {y})")),
            LogPosition::Value(v) => line.push_str(&format!(" {v}")),
        }
        if let Some(dest) = record.dest {
            line.push_str(&format!(" 'U{dest}"));
        }
        if let Some(extra) = record.extra {
            line.push_str(&format!(" '{extra}"));
        }
        line.push_str(")\n");

        if let Err(err) = file.write_all(line.as_bytes()) {
            warn!("command log: write failed: {err}");
        }
        let _ = file.flush();
    }
}
