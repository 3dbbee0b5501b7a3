//! Build log classification
//!
//! Turns raw build output into categorized findings with a remediation
//! suggestion each. Pure and stateless: the same log text always yields the
//! same findings, in table order.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::defaults;

/// A categorized diagnosis derived from build log text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Category label, e.g. "Missing Python Modules"
    pub category: String,
    /// Human-readable summary
    pub message: String,
    /// Remediation hint
    pub suggestion: String,
    /// Distinct matched items, first-seen order
    #[serde(default)]
    pub items: Vec<String>,
}

/// (category, pattern, suggestion)
///
/// Where a pattern has a capture group, the first participating group is the
/// reported item; otherwise the whole match is.
const PATTERNS: &[(&str, &str, &str)] = &[
    (
        "Missing Dependencies",
        r"nothing provides requested (.+)",
        "Add missing dependencies to spec file Requires/BuildRequires",
    ),
    (
        "Missing Packages",
        r"No matching package to install: (.+)",
        "Package not available in repositories, may need to be built first",
    ),
    (
        "Missing Python Modules",
        r#"No module named ['"]([^'"]+)['"]"#,
        "Add Python module as BuildRequires (python3-{module})",
    ),
    (
        "Missing Header Files",
        r"fatal error: (.+): No such file or directory",
        "Install development packages for required libraries",
    ),
    (
        "Ambiguous Python Shebang",
        r"ambiguous python shebang",
        "Run fixpythonshebangs to correct Python shebangs",
    ),
    (
        "Empty Debug Info",
        r"Empty %files file.*debugsourcefiles\.list",
        "Remove debug package generation (add %global debug_package %{nil})",
    ),
    (
        "Missing Rust/Cargo",
        r"Cargo, the Rust package manager, is not installed",
        "Add rust and cargo as BuildRequires",
    ),
    (
        "Missing Python Wheel",
        r"error: invalid command 'bdist_wheel'",
        "Add python3-wheel as BuildRequires",
    ),
    (
        "Missing GCC",
        r"error: command 'gcc' failed: No such file or directory",
        "Add gcc as BuildRequires",
    ),
    (
        "Architecture Mismatch",
        r"Arch dependent binaries in noarch package",
        "Remove BuildArch: noarch from spec file (package contains binaries)",
    ),
    (
        "Bad Interpreter",
        r"bad interpreter: No such file or directory",
        "Fix shebang lines in scripts",
    ),
    (
        "Permission Denied",
        r"Permission denied",
        "Check file permissions and build directory access",
    ),
    (
        "Disk Space",
        r"No space left on device",
        "Free up disk space on build server",
    ),
    (
        "Network Error",
        r"(Connection refused|Connection timed out|Network is unreachable)",
        "Check network connectivity and repository availability",
    ),
    (
        "Source File Missing",
        r"Bad file: .+: No such file or directory",
        "Run fetch_source to download source files, or check Source0 URL in spec",
    ),
    (
        "RPM Macro Error",
        r"Macro .+ has illegal name",
        "Fix macro syntax in spec file",
    ),
    (
        "Python Syntax Error",
        r"((?:SyntaxError|IndentationError): .+)",
        "Fix Python code syntax errors in package",
    ),
    (
        "Python Import Error",
        r"ImportError: .+",
        "Ensure all required Python dependencies are installed",
    ),
    (
        "Test Failures",
        r"(?:FAILED|ERROR) .+ test",
        "Fix failing tests or disable tests with --nocheck",
    ),
    (
        "File Conflicts",
        r"file .+ conflicts between attempted installs",
        "Resolve file conflicts between packages",
    ),
    (
        "Unpackaged Files",
        r"Installed .*but unpackaged.*:\s+(\S.*)",
        "Add missing files to %files section in spec",
    ),
    (
        "Scriptlet Error",
        r"(Bad exit status from|error: %[a-z]+ scriptlet failed)",
        "Fix errors in %pre, %post, %preun, or %postun scripts",
    ),
];

struct Rule {
    category: &'static str,
    suggestion: &'static str,
    pattern: Regex,
}

/// Pattern-table build log classifier
pub struct ErrorClassifier {
    rules: Vec<Rule>,
    max_items: usize,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Compile the built-in pattern table
    pub fn new() -> Self {
        let rules = PATTERNS
            .iter()
            .map(|(category, pattern, suggestion)| Rule {
                category,
                suggestion,
                pattern: RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()
                    .expect("built-in pattern is valid"),
            })
            .collect();

        Self {
            rules,
            max_items: defaults::CLASSIFIER_MAX_ITEMS,
        }
    }

    /// Classify `log` into findings, one per matching category
    pub fn analyze(&self, log: &str) -> Vec<ClassifiedError> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let mut seen = HashSet::new();
                let unique: Vec<String> = rule
                    .pattern
                    .captures_iter(log)
                    .filter_map(|caps| {
                        let m = caps.iter().skip(1).flatten().next().or_else(|| caps.get(0))?;
                        let item = m.as_str().trim();
                        (!item.is_empty()).then(|| item.to_string())
                    })
                    .filter(|item| seen.insert(item.clone()))
                    .collect();

                if unique.is_empty() {
                    return None;
                }

                Some(ClassifiedError {
                    category: rule.category.to_string(),
                    message: format!("Found {} occurrence(s)", unique.len()),
                    suggestion: rule.suggestion.to_string(),
                    items: unique.into_iter().take(self.max_items).collect(),
                })
            })
            .collect()
    }
}

/// Render findings as a plain-text report
pub fn format_text(findings: &[ClassifiedError]) -> String {
    if findings.is_empty() {
        return "No specific errors detected in build log.".to_string();
    }

    let preview = defaults::REPORT_PREVIEW_ITEMS;
    let mut lines = vec!["Build Error Analysis:".to_string(), "=".repeat(50), String::new()];

    for (i, finding) in findings.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, finding.category));
        lines.push(format!("   {}", finding.message));

        if !finding.items.is_empty() {
            lines.push("   Items:".to_string());
            for item in finding.items.iter().take(preview) {
                lines.push(format!("     - {item}"));
            }
            if finding.items.len() > preview {
                lines.push(format!("     ... and {} more", finding.items.len() - preview));
            }
        }

        lines.push(format!("   Suggestion: {}", finding.suggestion));
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Render findings as pretty JSON
pub fn format_json(findings: &[ClassifiedError]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(findings)
}

/// One-line summary of the categories found
pub fn summary(findings: &[ClassifiedError]) -> String {
    match findings {
        [] => "No errors detected".to_string(),
        [only] => only.category.clone(),
        [first, second] => format!("{}, {}", first.category, second.category),
        [first, second, rest @ ..] => {
            format!("{}, {}, +{} more", first.category, second.category, rest.len())
        }
    }
}
