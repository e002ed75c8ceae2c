//! Typed tool contracts and their parsers.
//!
//! Each external tool is represented to the sandbox as a function returning
//! a structured result. Parsers never fail on malformed input; they set
//! `success = false` and populate `parse_error` instead, so the surface the
//! model is taught to call stays stable across tool-implementation changes.

use serde::{Deserialize, Serialize};

/// Structured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome<T> {
    /// Whether the tool ran and its output parsed cleanly.
    pub success: bool,
    /// Explanation when output could not be parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    /// Tool-specific structured data. Best-effort on parse failure.
    pub data: T,
}

impl<T> ToolOutcome<T> {
    /// Successful outcome.
    #[must_use]
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            parse_error: None,
            data,
        }
    }

    /// Failed outcome with whatever data was salvaged.
    #[must_use]
    pub fn failed(reason: impl Into<String>, data: T) -> Self {
        Self {
            success: false,
            parse_error: Some(reason.into()),
            data,
        }
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// One diagnostic from the type checker or linter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

/// One failed test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub name: String,
    pub detail: String,
}

/// Summary of a test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunSummary {
    pub passed: u32,
    pub failed: u32,
    pub ignored: u32,
    pub failures: Vec<TestFailure>,
}

/// One code-navigation hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolHit {
    pub name: String,
    pub kind: String,
    pub file: String,
    pub line: u32,
}

/// One entry from the version-control log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub hash: String,
    pub author: String,
    pub summary: String,
}

/// The external tool collaborators, behind their typed contracts.
///
/// Implementations run actual tools; the relay only cares about the result
/// shapes. Methods are synchronous because they are invoked from the
/// sandbox's blocking worker.
pub trait ToolSuite: Send + Sync {
    fn check_types(&self, path: &str) -> ToolOutcome<Vec<Diagnostic>>;
    fn lint(&self, path: &str) -> ToolOutcome<Vec<Diagnostic>>;
    fn run_tests(&self, filter: &str) -> ToolOutcome<TestRunSummary>;
    fn find_symbols(&self, query: &str) -> ToolOutcome<Vec<SymbolHit>>;
    fn recent_commits(&self, limit: u32) -> ToolOutcome<Vec<CommitEntry>>;
}

/// Parse `file:line:col: severity: message` diagnostics.
///
/// Lines that do not match are counted and reported through `parse_error`;
/// matching lines are still returned.
#[must_use]
pub fn parse_diagnostics(raw: &str) -> ToolOutcome<Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let mut bad_lines = 0usize;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_diagnostic_line(line) {
            Some(d) => diagnostics.push(d),
            None => bad_lines += 1,
        }
    }

    if bad_lines > 0 {
        ToolOutcome::failed(
            format!("{bad_lines} line(s) did not match file:line:col: severity: message"),
            diagnostics,
        )
    } else {
        ToolOutcome::ok(diagnostics)
    }
}

fn parse_diagnostic_line(line: &str) -> Option<Diagnostic> {
    let (file, rest) = line.split_once(':')?;
    let (line_no, rest) = rest.split_once(':')?;
    let line_no: u32 = line_no.trim().parse().ok()?;

    // Column is optional: "file:12: error: msg" is accepted too.
    let (column, rest) = match rest.split_once(':') {
        Some((maybe_col, tail)) => match maybe_col.trim().parse::<u32>() {
            Ok(col) => (Some(col), tail),
            Err(_) => (None, rest),
        },
        None => (None, rest),
    };

    let (severity, message) = rest.split_once(':')?;
    let severity = match severity.trim() {
        "error" => Severity::Error,
        "warning" => Severity::Warning,
        "note" => Severity::Note,
        _ => return None,
    };

    Some(Diagnostic {
        file: file.trim().to_string(),
        line: line_no,
        column,
        severity,
        message: message.trim().to_string(),
    })
}

/// Parse libtest-style output (`test name ... ok|FAILED|ignored` plus the
/// trailing `test result:` line).
#[must_use]
pub fn parse_test_summary(raw: &str) -> ToolOutcome<TestRunSummary> {
    let mut summary = TestRunSummary::default();
    let mut saw_result_line = false;

    for line in raw.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("test ") {
            if rest.starts_with("result:") {
                saw_result_line = true;
                continue;
            }
            let Some((name, status)) = rest.rsplit_once("... ") else {
                continue;
            };
            let name = name.trim_end_matches(' ').to_string();
            match status.trim() {
                "ok" => summary.passed += 1,
                "FAILED" => {
                    summary.failed += 1;
                    summary.failures.push(TestFailure {
                        name,
                        detail: String::new(),
                    });
                }
                "ignored" => summary.ignored += 1,
                _ => {}
            }
        } else if let Some(rest) = line.strip_prefix("---- ") {
            // "---- name stdout ----" blocks attach detail to failures.
            if let Some(name) = rest.strip_suffix(" stdout ----") {
                if let Some(failure) = summary.failures.iter_mut().find(|f| f.name == name) {
                    failure.detail.clear();
                }
            }
        } else if !line.is_empty() && !saw_result_line {
            if let Some(failure) = summary.failures.last_mut() {
                if !failure.detail.is_empty() {
                    failure.detail.push('\n');
                }
                failure.detail.push_str(line);
            }
        }
    }

    if !saw_result_line && summary.passed == 0 && summary.failed == 0 && summary.ignored == 0 {
        return ToolOutcome::failed("no test output recognized", summary);
    }
    ToolOutcome::ok(summary)
}

/// Parse `file:line:kind:name` symbol listings.
#[must_use]
pub fn parse_symbols(raw: &str) -> ToolOutcome<Vec<SymbolHit>> {
    let mut hits = Vec::new();
    let mut bad_lines = 0usize;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, ':');
        let parsed = (|| {
            let file = parts.next()?.to_string();
            let line_no: u32 = parts.next()?.trim().parse().ok()?;
            let kind = parts.next()?.trim().to_string();
            let name = parts.next()?.trim().to_string();
            Some(SymbolHit {
                name,
                kind,
                file,
                line: line_no,
            })
        })();
        match parsed {
            Some(hit) => hits.push(hit),
            None => bad_lines += 1,
        }
    }

    if bad_lines > 0 {
        ToolOutcome::failed(
            format!("{bad_lines} line(s) did not match file:line:kind:name"),
            hits,
        )
    } else {
        ToolOutcome::ok(hits)
    }
}

/// Parse `hash|author|summary` commit log lines.
#[must_use]
pub fn parse_commit_log(raw: &str) -> ToolOutcome<Vec<CommitEntry>> {
    let mut entries = Vec::new();
    let mut bad_lines = 0usize;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(hash), Some(author), Some(summary)) if !hash.is_empty() => {
                entries.push(CommitEntry {
                    hash: hash.to_string(),
                    author: author.to_string(),
                    summary: summary.to_string(),
                });
            }
            _ => bad_lines += 1,
        }
    }

    if bad_lines > 0 {
        ToolOutcome::failed(format!("{bad_lines} line(s) did not match hash|author|summary"), entries)
    } else {
        ToolOutcome::ok(entries)
    }
}

/// Tool suite backed by canned raw output, run through the real parsers.
///
/// Used in tests and the demo server; collaborating tools are out of scope.
#[derive(Debug, Default)]
pub struct StubToolSuite {
    pub typecheck_output: String,
    pub lint_output: String,
    pub test_output: String,
    pub symbols_output: String,
    pub log_output: String,
}

impl ToolSuite for StubToolSuite {
    fn check_types(&self, _path: &str) -> ToolOutcome<Vec<Diagnostic>> {
        parse_diagnostics(&self.typecheck_output)
    }

    fn lint(&self, _path: &str) -> ToolOutcome<Vec<Diagnostic>> {
        parse_diagnostics(&self.lint_output)
    }

    fn run_tests(&self, _filter: &str) -> ToolOutcome<TestRunSummary> {
        parse_test_summary(&self.test_output)
    }

    fn find_symbols(&self, _query: &str) -> ToolOutcome<Vec<SymbolHit>> {
        parse_symbols(&self.symbols_output)
    }

    fn recent_commits(&self, limit: u32) -> ToolOutcome<Vec<CommitEntry>> {
        let mut outcome = parse_commit_log(&self.log_output);
        outcome.data.truncate(limit as usize);
        outcome
    }
}
