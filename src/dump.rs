//! Diagnostic dumps.
//!
//! A [`DumpScope`] names a directory; nested scopes are subdirectories.
//! Writing is best-effort: callers log failures and carry on.

use crate::error::ScheduleResult;
use serde::Serialize;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Directory that dumps are written into, or nowhere.
#[derive(Debug, Clone, Default)]
pub struct DumpScope {
    dir: Option<PathBuf>,
}

impl DumpScope {
    pub fn new(dir: Option<&Path>) -> Self {
        Self {
            dir: dir.map(Path::to_path_buf),
        }
    }

    /// Scope that writes nothing.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Subdirectory scope.
    pub fn nested(&self, name: &str) -> DumpScope {
        Self {
            dir: self.dir.as_ref().map(|d| d.join(name)),
        }
    }

    fn open(&self, file: &str) -> ScheduleResult<Option<fs::File>> {
        let Some(dir) = &self.dir else { return Ok(None) };
        fs::create_dir_all(dir)?;
        Ok(Some(fs::File::create(dir.join(file))?))
    }

    /// Write `value` as pretty JSON to `file`.
    pub fn write_json<T: Serialize>(&self, file: &str, value: &T) -> ScheduleResult<()> {
        if let Some(f) = self.open(file)? {
            serde_json::to_writer_pretty(BufWriter::new(f), value)?;
        }
        Ok(())
    }

    /// Write plain text to `file`.
    pub fn write_text(&self, file: &str, text: &str) -> ScheduleResult<()> {
        if let Some(dir) = &self.dir {
            fs::create_dir_all(dir)?;
            fs::write(dir.join(file), text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_writes_nothing() {
        let scope = DumpScope::disabled().nested("RollOut.1");
        assert!(!scope.is_enabled());
        scope.write_text("tree.txt", "x").unwrap();
    }

    #[test]
    fn test_nested_json() {
        let tmp = tempfile::tempdir().unwrap();
        let scope = DumpScope::new(Some(tmp.path())).nested("RollOut.0");
        scope.write_json("value.json", &vec![1, 2, 3]).unwrap();
        let text = fs::read_to_string(tmp.path().join("RollOut.0").join("value.json")).unwrap();
        let back: Vec<i32> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
