//! Python requirements parsing
//!
//! Understands `name[extras]<specs> ; markers` lines. URL, VCS and editable
//! requirements are skipped with a warning, as are lines that do not parse.

use std::fmt;

use regex::Regex;

/// One parsed requirement line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    /// `(operator, version)` pairs, e.g. `(">=", "2.0")`
    pub specs: Vec<(String, String)>,
    pub markers: Option<String>,
    /// Line as written, without its inline comment
    pub line: String,
}

impl Requirement {
    /// Comma-joined version specification, empty when unconstrained
    pub fn version_spec(&self) -> String {
        self.specs
            .iter()
            .map(|(op, version)| format!("{op}{version}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Version of an exact `==` pin
    pub fn pinned_version(&self) -> Option<&str> {
        match self.specs.as_slice() {
            [(op, version)] if op == "==" => Some(version),
            _ => None,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        f.write_str(&self.version_spec())
    }
}

const SKIPPED_PREFIXES: [&str; 6] = ["http://", "https://", "git+", "hg+", "svn+", "bzr+"];

/// Parser for requirements files
#[derive(Debug, Clone)]
pub struct RequirementParser {
    requirement: Regex,
    spec: Regex,
}

impl Default for RequirementParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequirementParser {
    pub fn new() -> Self {
        Self {
            requirement: Regex::new(concat!(
                r"^([a-zA-Z0-9][a-zA-Z0-9._-]*)",
                r"(?:\[([a-zA-Z0-9,._ -]+)\])?",
                r"\s*((?:[<>=!~]+\s*[0-9a-zA-Z.*+!]+(?:\s*,\s*[<>=!~]+\s*[0-9a-zA-Z.*+!]+)*)?)",
                r"\s*(?:;\s*(.*))?$",
            ))
            .expect("requirement pattern is valid"),
            spec: Regex::new(r"([<>=!~]+)\s*([0-9a-zA-Z.*+!]+)").expect("spec pattern is valid"),
        }
    }

    /// Parse a single line; `None` for blank, comment or unparseable lines
    pub fn parse_line(&self, line: &str) -> Option<Requirement> {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            return None;
        }

        let caps = self.requirement.captures(line)?;
        let name = caps.get(1)?.as_str().to_string();
        let extras = caps
            .get(2)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let specs = caps
            .get(3)
            .map(|m| {
                self.spec
                    .captures_iter(m.as_str())
                    .map(|c| (c[1].to_string(), c[2].to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let markers = caps
            .get(4)
            .map(|m| m.as_str().trim().to_string())
            .filter(|m| !m.is_empty());

        Some(Requirement {
            name,
            extras,
            specs,
            markers,
            line: line.to_string(),
        })
    }

    /// Parse a whole requirements file
    pub fn parse(&self, text: &str) -> Vec<Requirement> {
        let mut requirements = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if SKIPPED_PREFIXES.iter().any(|p| line.starts_with(p)) {
                tracing::warn!("Skipping URL/VCS requirement: {line}");
                continue;
            }
            if line.starts_with('-') {
                tracing::warn!("Skipping option line: {line}");
                continue;
            }

            match self.parse_line(line) {
                Some(requirement) => requirements.push(requirement),
                None => tracing::warn!("Could not parse requirement on line {}: {line}", index + 1),
            }
        }
        requirements
    }
}
