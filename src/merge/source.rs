use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db;
use crate::AppResult;

/// Which of the two input snapshots a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The reference database. Wins timestamp ties.
    Main,
    Copy,
}

impl Origin {
    pub const ALL: [Origin; 2] = [Origin::Main, Origin::Copy];

    pub fn other(self) -> Origin {
        match self {
            Origin::Main => Origin::Copy,
            Origin::Copy => Origin::Main,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Main => "main",
            Origin::Copy => "copy",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Read-only connections to both snapshots, closed together.
pub struct Sources {
    main: Connection,
    main_path: PathBuf,
    copy: Connection,
    copy_path: PathBuf,
}

impl Sources {
    pub fn open(main: &Path, copy: &Path) -> AppResult<Self> {
        let main_conn = db::open_source(main)?;
        let copy_conn = db::open_source(copy)?;
        Ok(Self {
            main: main_conn,
            main_path: main.to_path_buf(),
            copy: copy_conn,
            copy_path: copy.to_path_buf(),
        })
    }

    pub fn get(&self, origin: Origin) -> &Connection {
        match origin {
            Origin::Main => &self.main,
            Origin::Copy => &self.copy,
        }
    }

    pub fn path(&self, origin: Origin) -> &Path {
        match origin {
            Origin::Main => &self.main_path,
            Origin::Copy => &self.copy_path,
        }
    }

    /// Both connections, main first.
    pub fn each(&self) -> [(Origin, &Connection); 2] {
        [(Origin::Main, &self.main), (Origin::Copy, &self.copy)]
    }

    pub fn close(self) -> AppResult<()> {
        let main_result = db::close_connection(self.main, &self.main_path);
        let copy_result = db::close_connection(self.copy, &self.copy_path);
        main_result.and(copy_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_swaps_sides() {
        assert_eq!(Origin::Main.other(), Origin::Copy);
        assert_eq!(Origin::Copy.other(), Origin::Main);
    }

    #[test]
    fn origin_serializes_lowercase() {
        let json = serde_json::to_string(&Origin::Copy).expect("serialize");
        assert_eq!(json, "\"copy\"");
        assert_eq!(Origin::Main.to_string(), "main");
    }
}
