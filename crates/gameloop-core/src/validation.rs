//! Test summaries parsed from game loop output.
//!
//! A game loop run only tells whether the app reached the end; whether the
//! tests it ran passed is in the log it leaves behind. Two runners are
//! understood:
//!
//! - **Cpp** (gtest): complete once `Global test environment tear-down` is
//!   printed; counts come from the `[  PASSED  ]`, `[  FAILED  ]` and
//!   `[  SKIPPED ]` lines after it.
//! - **Unity**: complete once a `PASS: n, FAIL: m` line is printed.
//!
//! An incomplete log keeps its last lines as the summary, to show where a
//! crash or timeout happened.
//!
//! The Android harness reports through `am instrument` output instead; a run
//! whose output carries [`HARNESS_FAILURE_MARKERS`] did not finish cleanly
//! even though the instrumentation process exited.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker printed by gtest after all tests ran.
pub const GTEST_END_MARKER: &str = "Global test environment tear-down";

/// Lines kept from an incomplete log.
const TAIL_LINES: usize = 15;

/// Instrumentation output lines that mean the harness run failed.
pub const HARNESS_FAILURE_MARKERS: &[&str] = &["FAILURES!!!", "INSTRUMENTATION_FAILED"];

/// Which test runner produced a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFlavor {
    /// gtest output from a C++ test app.
    #[default]
    Cpp,
    /// The Unity test runner.
    Unity,
}

impl fmt::Display for LogFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFlavor::Cpp => write!(f, "cpp"),
            LogFlavor::Unity => write!(f, "unity"),
        }
    }
}

impl FromStr for LogFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpp" | "gtest" => Ok(LogFlavor::Cpp),
            "unity" => Ok(LogFlavor::Unity),
            other => Err(format!("unknown log flavor '{}'", other)),
        }
    }
}

/// Results a test runner reported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestSummary {
    /// Whether the runner reached its end-of-run summary.
    pub complete: bool,
    pub passes: u32,
    pub fails: u32,
    pub skips: u32,
    /// The runner's summary, or the tail of the log when incomplete.
    pub summary: String,
}

/// Overall reading of a [`TestSummary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Complete with no failures.
    Success,
    /// Complete with at least one failure.
    Failure,
    /// The runner did not finish.
    Error,
}

impl TestSummary {
    pub fn verdict(&self) -> Verdict {
        if !self.complete {
            Verdict::Error
        } else if self.fails > 0 {
            Verdict::Failure
        } else {
            Verdict::Success
        }
    }

    /// Names of failed tests (`Suite.Test`) listed in a gtest summary.
    pub fn failed_tests(&self) -> Vec<String> {
        failed_re()
            .captures_iter(&self.summary)
            .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
            .collect()
    }
}

fn passed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[  PASSED  \] (?P<count>[0-9]+) test").expect("regex for gtest passes"))
}

fn failed_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[  FAILED  \] (?P<count>[0-9]+) test").expect("regex for gtest failures"))
}

fn skipped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[  SKIPPED \] (?P<count>[0-9]+) test").expect("regex for gtest skips"))
}

fn failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\[  FAILED  \] ([A-Za-z_][\w/]*\.[\w/]+)").expect("regex for gtest failed test names")
    })
}

fn unity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"PASS: (?P<pass>[0-9]+), FAIL: (?P<fail>[0-9]+)").expect("regex for unity results")
    })
}

fn count(re: &Regex, text: &str) -> u32 {
    re.captures(text)
        .and_then(|cap| cap.name("count"))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Last lines of a runner's output, as kept for diagnostics.
pub fn output_tail(output: &str) -> String {
    tail(output, TAIL_LINES)
}

/// First line of harness output that reports a failed run, if any.
pub fn harness_failure(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| HARNESS_FAILURE_MARKERS.iter().any(|marker| line.contains(marker)))
        .map(str::to_string)
}

/// Parses a runner log. An empty log is incomplete.
pub fn validate(log: &str, flavor: LogFlavor) -> TestSummary {
    if log.trim().is_empty() {
        return TestSummary::default();
    }
    match flavor {
        LogFlavor::Cpp => validate_cpp(log),
        LogFlavor::Unity => validate_unity(log),
    }
}

fn validate_cpp(log: &str) -> TestSummary {
    match log.rfind(GTEST_END_MARKER) {
        Some(index) => {
            let summary = log[index + GTEST_END_MARKER.len()..].trim_start().to_string();
            TestSummary {
                complete: true,
                passes: count(passed_re(), &summary),
                fails: count(failed_count_re(), &summary),
                skips: count(skipped_re(), &summary),
                summary,
            }
        }
        None => TestSummary {
            summary: tail(log, TAIL_LINES),
            ..TestSummary::default()
        },
    }
}

fn validate_unity(log: &str) -> TestSummary {
    match unity_re().captures(log) {
        Some(cap) => {
            let parse = |name: &str| -> u32 {
                cap.name(name)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0)
            };
            let start = cap.get(0).map_or(0, |m| m.start());
            TestSummary {
                complete: true,
                passes: parse("pass"),
                fails: parse("fail"),
                skips: 0,
                summary: log[start..].to_string(),
            }
        }
        None => TestSummary {
            summary: tail(log, TAIL_LINES),
            ..TestSummary::default()
        },
    }
}

/// Finds a runner summary in free-form text (a sentinel file, a pasteboard).
///
/// Returns `None` when the text shows neither runner's output.
pub fn detect_summary(text: &str) -> Option<TestSummary> {
    if text.contains(GTEST_END_MARKER) || text.contains("[==========]") {
        Some(validate(text, LogFlavor::Cpp))
    } else if unity_re().is_match(text) {
        Some(validate(text, LogFlavor::Unity))
    } else {
        None
    }
}
