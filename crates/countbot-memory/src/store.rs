//! Line-oriented long-term memory.
//!
//! A single `MEMORY.md` file, one entry per line:
//! `YYYY-MM-DD|source|内容事项1；事项2；事项3`
//!
//! Lines are 1-indexed everywhere in this module. Appends normalise away
//! CR/LF and collapse runs of whitespace so an entry can never span lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{MemoryError, Result};

const EMPTY_PLACEHOLDER: &str = "记忆为空";

/// Keyword match logic for [`MemoryStore::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Any keyword matches.
    Or,
    /// Every keyword must match.
    And,
}

/// Summary counters returned by [`MemoryStore::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub sources: HashMap<String, usize>,
    pub date_range: String,
}

/// Append-only line memory backed by a single UTF-8 file.
///
/// All mutation happens under one `Mutex` so concurrent appends never
/// interleave and line numbers stay consistent within a call.
pub struct MemoryStore {
    memory_file: PathBuf,
    lock: Mutex<()>,
}

impl MemoryStore {
    /// `memory_dir` is created if missing; the file itself is created lazily
    /// on first append.
    pub fn new(memory_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(memory_dir)?;
        let memory_file = memory_dir.join("MEMORY.md");
        debug!(file = %memory_file.display(), "memory store initialised");
        Ok(Self {
            memory_file,
            lock: Mutex::new(()),
        })
    }

    fn read_raw_lines(&self) -> Result<Vec<String>> {
        if !self.memory_file.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.memory_file)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(content.trim().lines().map(|l| l.to_string()).collect())
    }

    fn write_raw_lines(&self, lines: &[String]) -> Result<()> {
        let mut body = lines.join("\n");
        body.push('\n');
        std::fs::write(&self.memory_file, body)?;
        Ok(())
    }

    /// Append one entry, returning its 1-based line number.
    pub fn append(&self, source: &str, content: &str) -> Result<usize> {
        // Strip CR/LF, then collapse whitespace runs so the entry is one line.
        let normalized = content
            .replace(['\n', '\r'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let date = chrono::Local::now().format("%Y-%m-%d");
        let entry = format!("{date}|{source}|{normalized}");

        let _guard = self.lock.lock().map_err(|_| MemoryError::LockPoisoned)?;
        let mut lines = self.read_raw_lines()?;
        lines.push(entry.clone());
        self.write_raw_lines(&lines)?;

        let line_no = lines.len();
        info!(line = line_no, entry = %truncate(&entry, 80), "memory appended");
        Ok(line_no)
    }

    /// Read lines `[start, end]` (1-based, inclusive), clamped to the file.
    /// `end = None` reads just the `start` line.
    pub fn read_lines(&self, start: usize, end: Option<usize>) -> Result<String> {
        let lines = self.read_raw_lines()?;
        let total = lines.len();
        if total == 0 {
            return Ok(EMPTY_PLACEHOLDER.to_string());
        }

        let start = start.clamp(1, total);
        let end = end.unwrap_or(start).clamp(start, total);

        let out: Vec<String> = (start..=end)
            .map(|i| format!("[{}] {}", i, lines[i - 1]))
            .collect();
        Ok(out.join("\n"))
    }

    /// Case-insensitive substring search, OR or AND over the keywords.
    /// Results carry their line numbers; overflow past `max_results` is
    /// reported in a trailing total-count line.
    pub fn search(
        &self,
        keywords: &[String],
        max_results: usize,
        mode: MatchMode,
    ) -> Result<String> {
        let lines = self.read_raw_lines()?;
        if lines.is_empty() {
            return Ok("记忆为空，无搜索结果".to_string());
        }

        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Ok("请提供搜索关键词".to_string());
        }

        let mut results: Vec<String> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let lower = line.to_lowercase();
            let hit = match mode {
                MatchMode::And => keywords.iter().all(|kw| lower.contains(kw.as_str())),
                MatchMode::Or => keywords.iter().any(|kw| lower.contains(kw.as_str())),
            };
            if hit {
                results.push(format!("[{}] {}", i + 1, line));
            }
        }

        if results.is_empty() {
            let mode_text = match mode {
                MatchMode::Or => "任意",
                MatchMode::And => "全部",
            };
            return Ok(format!(
                "未找到包含{}关键词 {} 的记忆",
                mode_text,
                keywords.join(", ")
            ));
        }

        if results.len() > max_results {
            let total_found = results.len();
            results.truncate(max_results);
            results.push(format!(
                "... 共 {total_found} 条匹配，仅显示前 {max_results} 条"
            ));
        }

        Ok(results.join("\n"))
    }

    /// Last `count` lines with line-number prefixes.
    pub fn get_recent(&self, count: usize) -> Result<String> {
        let lines = self.read_raw_lines()?;
        if lines.is_empty() {
            return Ok(EMPTY_PLACEHOLDER.to_string());
        }
        let start = lines.len().saturating_sub(count);
        let out: Vec<String> = lines[start..]
            .iter()
            .enumerate()
            .map(|(off, line)| format!("[{}] {}", start + off + 1, line))
            .collect();
        Ok(out.join("\n"))
    }

    /// Delete the given 1-based line numbers, returning how many were removed.
    /// Surviving lines are renumbered by the rewrite.
    pub fn delete_lines(&self, line_numbers: &[usize]) -> Result<usize> {
        let _guard = self.lock.lock().map_err(|_| MemoryError::LockPoisoned)?;
        let lines = self.read_raw_lines()?;
        if lines.is_empty() {
            return Ok(0);
        }

        let to_delete: std::collections::HashSet<usize> = line_numbers.iter().copied().collect();
        let kept: Vec<String> = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| !to_delete.contains(&(i + 1)))
            .map(|(_, l)| l.clone())
            .collect();

        let deleted = lines.len() - kept.len();
        if deleted > 0 {
            self.write_raw_lines(&kept)?;
            info!(deleted, ?line_numbers, "memory lines deleted");
        }
        Ok(deleted)
    }

    pub fn line_count(&self) -> Result<usize> {
        Ok(self.read_raw_lines()?.len())
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let lines = self.read_raw_lines()?;
        let total = lines.len();

        let mut sources: HashMap<String, usize> = HashMap::new();
        let mut dates: Vec<&str> = Vec::new();
        for line in &lines {
            let mut parts = line.splitn(3, '|');
            if let (Some(date), Some(src)) = (parts.next(), parts.next()) {
                dates.push(date);
                *sources.entry(src.to_string()).or_insert(0) += 1;
            }
        }

        let date_range = match (dates.first(), dates.last()) {
            (Some(first), Some(last)) => format!("{first} ~ {last}"),
            _ => String::new(),
        };

        Ok(MemoryStats {
            total,
            sources,
            date_range,
        })
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
