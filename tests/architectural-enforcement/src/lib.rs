//! Architectural Enforcement Integration Tests
//!
//! Static checks over the production sources of the relay crates:
//! - No sleep() calls outside timers, backoff and scripted pacing
//! - No unwrap()/expect() outside test code
//!
//! These tests are designed to catch violations early in the development cycle.
//! This library holds the source scanning shared by the checks in `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: [&str; 2] = ["relay/core/src", "relay/daemon/src"];

/// A matched line in a production source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// The line, trimmed
    pub text: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.text)
    }
}

/// A production source file with its test module cut off
#[derive(Debug, Clone)]
pub struct ProductionFile {
    /// Path on disk
    pub path: PathBuf,
    /// Lines before the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl ProductionFile {
    /// Lines whose code part (comments stripped) satisfies `matches`
    pub fn find(&self, matches: impl Fn(&str) -> bool) -> Vec<SourceLine> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                let trimmed = line.trim_start();
                !trimmed.starts_with("//") && matches(code_part(line))
            })
            .map(|(idx, line)| SourceLine {
                path: self.path.clone(),
                number: idx + 1,
                text: line.trim().to_string(),
            })
            .collect()
    }

    /// Lines around `number` (1-based), lowercased
    pub fn context(&self, number: usize, before: usize, after: usize) -> String {
        let idx = number.saturating_sub(1);
        let start = idx.saturating_sub(before);
        let end = (idx + after + 1).min(self.lines.len());
        self.lines[start..end].join("\n").to_lowercase()
    }
}

/// Strip a trailing `//` comment
fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Workspace root, from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under the production directories
pub fn production_files() -> Vec<ProductionFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let lines = content
                .lines()
                .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
                .map(str::to_string)
                .collect();
            files.push(ProductionFile {
                path: entry.path().to_path_buf(),
                lines,
            });
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_sees_relay_sources() {
        let files = production_files();
        assert!(files.iter().any(|f| f.path.ends_with("relay/core/src/lib.rs")));
        assert!(files.iter().all(|f| f
            .lines
            .iter()
            .all(|l| !l.trim_start().starts_with("#[cfg(test)]"))));
    }

    #[test]
    fn test_comments_are_ignored() {
        let file = ProductionFile {
            path: PathBuf::from("x.rs"),
            lines: vec![
                "// call sleep() here".to_string(),
                "let a = 1; // then sleep()".to_string(),
                "sleep();".to_string(),
            ],
        };
        let hits = file.find(|code| code.contains("sleep("));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].number, 3);
    }
}
