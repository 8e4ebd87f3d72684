//! Crash-log diagnosis.
//!
//! Scans raw device log text (as copied from a serial console) for known
//! ESP32 failure signatures. Every check runs independently, so one log can
//! raise several issues. Fixes are deduplicated and sorted so the same log
//! always renders the same report.
//!
//! Device logs carry no usable timestamps. Crash timeline entries are stamped
//! with the time the analysis ran.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Local};
use log::debug;
use serde::Serialize;

/// Rendered in place of a report when nothing was found.
pub const NO_FINDINGS: &str = "No known issues or crash patterns found.";

/// More than this many reboots in one log is treated as a crash loop.
const CRASH_LOOP_THRESHOLD: usize = 2;

/// Pins inspected by the wiring check. Only the boot-strap prefix is checked.
const WIRING_CHECK_PINS: usize = 5;

const TIMELINE_MARKERS: [&str; 4] = ["Guru Meditation", "Backtrace", "rebooting", "Brownout"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum IssueKind {
    MemoryFault,
    WatchdogReset,
    PowerInstability,
    CrashLoop,
    BootWiring,
}

impl IssueKind {
    pub fn label(self) -> &'static str {
        match self {
            IssueKind::MemoryFault => "Memory Fault",
            IssueKind::WatchdogReset => "Watchdog Reset",
            IssueKind::PowerInstability => "Power Instability",
            IssueKind::CrashLoop => "Crash Loop",
            IssueKind::BootWiring => "Wiring / Boot Mode",
        }
    }

    pub fn explanation(self) -> &'static str {
        match self {
            IssueKind::MemoryFault => {
                "Guru Meditation Error: the CPU hit an illegal memory access or invalid pointer."
            }
            IssueKind::WatchdogReset => {
                "Watchdog reset: a task blocked for too long without yielding."
            }
            IssueKind::PowerInstability => {
                "Brownout detected: the supply voltage dropped below the safe threshold."
            }
            IssueKind::CrashLoop => {
                "Crash loop: the device rebooted repeatedly during this log."
            }
            IssueKind::BootWiring => {
                "Pins P0-P4 all read LOW: possible wiring fault or wrong boot mode strapping."
            }
        }
    }

    fn fixes(self) -> &'static [&'static str] {
        match self {
            IssueKind::MemoryFault => &[
                "Check for null or dangling pointer dereferences and out-of-bounds array access.",
                "Increase the stack size of the task that crashed.",
            ],
            IssueKind::WatchdogReset => &[
                "Avoid long blocking loops; call delay() or yield() inside busy loops.",
                "Feed the task watchdog or raise its timeout for long-running work.",
            ],
            IssueKind::PowerInstability => &[
                "Use a stable 5V supply rated for at least 500mA.",
                "Add a bulk capacitor (100-470uF) across the supply rails.",
            ],
            IssueKind::CrashLoop => &[
                "Check for null or dangling pointer dereferences and out-of-bounds array access.",
                "Inspect setup() for code that fails on every boot.",
            ],
            IssueKind::BootWiring => &[
                "Verify the strapping pins are not held LOW at power-up.",
                "Check the first I/O pins for shorts to ground.",
            ],
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub explanation: &'static str,
}

impl From<IssueKind> for Issue {
    fn from(kind: IssueKind) -> Self {
        Self {
            kind,
            explanation: kind.explanation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashEvent {
    pub timestamp: DateTime<Local>,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Report {
    pub issues: Vec<Issue>,
    pub fixes: BTreeSet<String>,
    pub timeline: Vec<CrashEvent>,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty() && self.fixes.is_empty() && self.timeline.is_empty()
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str(NO_FINDINGS);
        }

        let mut sections = Vec::new();
        if !self.issues.is_empty() {
            let mut s = String::from("Detected issues:");
            for issue in &self.issues {
                s.push_str(&format!("\n- [{}] {}", issue.kind, issue.explanation));
            }
            sections.push(s);
        }
        if !self.fixes.is_empty() {
            let mut s = String::from("Suggested fixes:");
            for fix in &self.fixes {
                s.push_str(&format!("\n- {fix}"));
            }
            sections.push(s);
        }
        if !self.timeline.is_empty() {
            let mut s = String::from("Crash timeline:");
            for event in &self.timeline {
                s.push_str(&format!(
                    "\n[{}] {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.line
                ));
            }
            sections.push(s);
        }
        f.write_str(&sections.join("\n\n"))
    }
}

/// Run every signature check over `text`, in a fixed order.
pub fn detect_issues(text: &str) -> Vec<Issue> {
    let lower = text.to_lowercase();
    let checks: [(IssueKind, bool); 5] = [
        (IssueKind::MemoryFault, text.contains("Guru Meditation Error")),
        (
            IssueKind::WatchdogReset,
            text.contains("WDT reset") || lower.contains("watchdog"),
        ),
        (IssueKind::PowerInstability, text.contains("Brownout detector")),
        (
            IssueKind::CrashLoop,
            lower.matches("rebooting").count() > CRASH_LOOP_THRESHOLD,
        ),
        (
            IssueKind::BootWiring,
            (0..WIRING_CHECK_PINS).all(|i| text.contains(&format!("P{i}=LOW"))),
        ),
    ];

    checks
        .into_iter()
        .filter(|(_, fired)| *fired)
        .map(|(kind, _)| Issue::from(kind))
        .collect()
}

/// Crash-related lines in order, stamped with the current local time.
pub fn extract_crash_timeline(text: &str) -> Vec<CrashEvent> {
    extract_crash_timeline_at(text, Local::now())
}

pub fn extract_crash_timeline_at(text: &str, timestamp: DateTime<Local>) -> Vec<CrashEvent> {
    text.lines()
        .filter(|line| TIMELINE_MARKERS.iter().any(|m| line.contains(m)))
        .map(|line| CrashEvent {
            timestamp,
            line: line.trim_end().to_string(),
        })
        .collect()
}

pub fn suggest_fixes(issues: &[Issue]) -> BTreeSet<String> {
    issues
        .iter()
        .flat_map(|issue| issue.kind.fixes())
        .map(|fix| fix.to_string())
        .collect()
}

pub fn run_diagnosis(text: &str) -> Report {
    let issues = detect_issues(text);
    let fixes = suggest_fixes(&issues);
    let timeline = extract_crash_timeline(text);
    debug!(
        "diagnosis: {} issues, {} fixes, {} timeline events",
        issues.len(),
        fixes.len(),
        timeline.len()
    );
    Report {
        issues,
        fixes,
        timeline,
    }
}
