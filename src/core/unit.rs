//! Package units and their build state machine
//!
//! A [`PackageUnit`] is one buildable (package, target platform) pair. Its
//! [`BuildStatus`] only moves through [`PackageUnit::transition`], which
//! checks every move against a closed transition table.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::defaults;
use crate::core::classifier::ClassifiedError;
use crate::error::TransitionError;

/// Identity of a package unit, derived from `(name, target)`.
///
/// The name part is canonical, so `PyYAML`, `pyyaml` and `py_yaml` on one
/// target are the same unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Build the identity of `name` on `target`
    pub fn new(name: &str, target: &str) -> Self {
        Self(format!("{}@{target}", canonical_name(name)))
    }

    /// Parse `name@target`, or `name` on `default_target`
    pub fn parse(raw: &str, default_target: &str) -> Self {
        match raw.split_once('@') {
            Some((name, target)) => Self::new(name, target),
            None => Self::new(raw, default_target),
        }
    }

    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Job identifier used for gate admission and task-runner introspection
    pub fn job_id(&self) -> JobId {
        JobId(format!("{}{}", defaults::JOB_PREFIX, self.0))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job identifier shared by the concurrency gate and the task runner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap a raw job identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unit this job builds, if the id follows the build job scheme
    pub fn unit_id(&self) -> Option<UnitId> {
        self.0
            .strip_prefix(defaults::JOB_PREFIX)
            .map(|rest| UnitId::from(rest.to_string()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Never built, or reset after a restart
    #[default]
    NotBuilt,
    /// Requested, blocked on unbuilt dependencies
    WaitingForDeps,
    /// Ready and dispatched, not yet admitted by the gate
    Pending,
    /// Holding a slot, external builder running
    Building,
    /// Final artifact produced
    Completed,
    /// A stage failed
    Failed,
    /// Cancelled before it started building
    Cancelled,
    /// Explicitly marked as not needing a build
    NotRequired,
}

impl BuildStatus {
    /// Every status, in declaration order
    pub const ALL: [BuildStatus; 8] = [
        BuildStatus::NotBuilt,
        BuildStatus::WaitingForDeps,
        BuildStatus::Pending,
        BuildStatus::Building,
        BuildStatus::Completed,
        BuildStatus::Failed,
        BuildStatus::Cancelled,
        BuildStatus::NotRequired,
    ];

    /// Statuses that represent in-flight work which does not survive a restart
    pub const IN_FLIGHT: [BuildStatus; 3] = [
        BuildStatus::WaitingForDeps,
        BuildStatus::Pending,
        BuildStatus::Building,
    ];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotBuilt => "not_built",
            Self::WaitingForDeps => "waiting_for_deps",
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::NotRequired => "not_required",
        }
    }

    /// Whether a dependency in this status lets its dependents build
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::NotRequired)
    }

    /// Whether the status is in-flight (lost on restart)
    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Re-entering the current status is always allowed and is a no-op
    /// - Forward progression: NotBuilt -> WaitingForDeps -> Pending -> Building -> Completed | Failed
    /// - WaitingForDeps and Pending can be cancelled; Building cannot
    /// - Every in-flight status can be reset to NotBuilt (restart recovery)
    /// - An interrupted build goes back to Pending
    /// - Finished units (Completed, Failed, Cancelled) can be requested again
    pub fn can_transition_to(&self, to: BuildStatus) -> bool {
        use BuildStatus::{Building, Cancelled, Completed, Failed, NotBuilt, NotRequired, Pending, WaitingForDeps};

        if *self == to {
            return true;
        }

        matches!(
            (self, to),
            (NotBuilt, WaitingForDeps | Pending | NotRequired)
                | (WaitingForDeps, Pending | Cancelled | NotBuilt)
                | (Pending, Building | Cancelled | NotBuilt | WaitingForDeps)
                | (Building, Completed | Failed | NotBuilt | Pending)
                | (
                    Completed | Failed | Cancelled,
                    WaitingForDeps | Pending | NotBuilt | NotRequired
                )
                | (NotRequired, NotBuilt | WaitingForDeps | Pending)
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .copied()
            .ok_or_else(|| format!("Invalid build status '{s}'"))
    }
}

/// Kind of dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Needed to build
    Build,
    /// Needed at run time
    #[default]
    Runtime,
    /// Needed for both
    Both,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Runtime => write!(f, "runtime"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Directed edge `unit -> depends_on`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Dependent unit
    pub unit: UnitId,
    /// Unit it depends on
    pub depends_on: UnitId,
    /// Kind of dependency
    #[serde(default)]
    pub dep_type: DependencyType,
    /// Optional version constraint, e.g. `>=1.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
}

impl DependencyEdge {
    /// Create an edge with no version constraint
    pub fn new(unit: UnitId, depends_on: UnitId, dep_type: DependencyType) -> Self {
        Self {
            unit,
            depends_on,
            dep_type,
            version_constraint: None,
        }
    }

    /// Attach a version constraint
    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.version_constraint = Some(constraint.into());
        self
    }
}

/// One buildable (package, target platform) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageUnit {
    pub id: UnitId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub target: String,
    pub architecture: String,
    #[serde(default)]
    pub status: BuildStatus,
    /// Original requirement line, e.g. `requests>=2.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    /// Listed directly in the requirements, rather than discovered
    #[serde(default)]
    pub is_direct: bool,
    /// Build descriptor (spec file text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub build_log: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub classified_errors: Vec<ClassifiedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_artifact: Option<PathBuf>,
    #[serde(default)]
    pub final_artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub retry_count: u32,
    /// Set when a cancel arrives while building; blocks automatic retries
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PackageUnit {
    /// Create a unit for `name` on `target` with the default architecture
    pub fn new(name: &str, target: &str) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::new(name, target),
            name: name.to_string(),
            version: None,
            target: target.to_string(),
            architecture: defaults::DEFAULT_ARCH.to_string(),
            status: BuildStatus::NotBuilt,
            requirement: None,
            is_direct: false,
            descriptor: None,
            build_order: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
            build_log: String::new(),
            error_message: String::new(),
            classified_errors: Vec::new(),
            intermediate_artifact: None,
            final_artifacts: Vec::new(),
            retry_count: 0,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the build descriptor
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = Some(descriptor.into());
        self
    }

    /// Set the architecture
    #[must_use]
    pub fn with_architecture(mut self, arch: impl Into<String>) -> Self {
        self.architecture = arch.into();
        self
    }

    /// Mark the unit as listed directly in the requirements
    #[must_use]
    pub fn direct(mut self, requirement: impl Into<String>) -> Self {
        self.is_direct = true;
        self.requirement = Some(requirement.into());
        self
    }

    /// Job identifier for this unit
    pub fn job_id(&self) -> JobId {
        self.id.job_id()
    }

    /// Move to `to`, applying the entry effects of the new status.
    ///
    /// Returns `Ok(false)` when the unit is already in `to`; nothing is
    /// touched in that case, so racing workers can re-enter a status safely.
    pub fn transition(
        &mut self,
        to: BuildStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                unit: self.id.clone(),
                from: self.status,
                to,
            });
        }
        if self.status == to {
            return Ok(false);
        }

        match to {
            BuildStatus::WaitingForDeps | BuildStatus::Pending => {
                self.clear_build_output();
                self.queued_at = Some(now);
                self.started_at = None;
                self.completed_at = None;
                self.cancel_requested = false;
            }
            BuildStatus::Building => {
                self.clear_build_output();
                self.started_at = Some(now);
                self.completed_at = None;
            }
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            BuildStatus::NotBuilt => {
                self.queued_at = None;
                self.started_at = None;
                self.completed_at = None;
                self.cancel_requested = false;
            }
            BuildStatus::NotRequired => {}
        }

        tracing::debug!(unit = %self.id, from = %self.status, to = %to, "status transition");
        self.status = to;
        self.updated_at = now;
        Ok(true)
    }

    /// Drop log, error, findings and artifacts of the previous run
    fn clear_build_output(&mut self) {
        self.build_log.clear();
        self.error_message.clear();
        self.classified_errors.clear();
        self.intermediate_artifact = None;
        self.final_artifacts.clear();
    }

    /// Spec file name used when staging the descriptor
    pub fn descriptor_file_name(&self) -> String {
        format!("{}.spec", normalize_package_name(&self.name))
    }
}

/// Canonical Python project name: lowercase, with every run of `-`, `_`
/// and `.` collapsed into a single `-`
pub fn canonical_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            separator = true;
            continue;
        }
        if separator && !canonical.is_empty() {
            canonical.push('-');
        }
        separator = false;
        canonical.extend(c.to_lowercase());
    }
    canonical
}

/// Normalize a Python package name to its native package name.
///
/// Canonicalizes the name and adds the `python3-` prefix.
pub fn normalize_package_name(name: &str) -> String {
    let normalized = canonical_name(name);
    if normalized.starts_with("python3-") {
        normalized
    } else {
        format!("python3-{normalized}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = BuildStatus> {
        proptest::sample::select(BuildStatus::ALL.to_vec())
    }

    #[test]
    fn test_unit_id_and_job_id() {
        let id = UnitId::new("requests", "rhel-9");
        assert_eq!(id.as_str(), "requests@rhel-9");
        let job = id.job_id();
        assert_eq!(job.as_str(), "build_requests@rhel-9");
        assert_eq!(job.unit_id(), Some(id));
        assert_eq!(JobId::new("spec_requests").unit_id(), None);
    }

    #[test]
    fn test_unit_ids_use_canonical_names() {
        assert_eq!(UnitId::new("PyYAML", "rhel-9"), UnitId::new("pyyaml", "rhel-9"));
        assert_eq!(UnitId::new("zope.Interface", "rhel-9").as_str(), "zope-interface@rhel-9");
        assert_eq!(UnitId::new("typing__extensions", "rhel-9").as_str(), "typing-extensions@rhel-9");
        assert_eq!(UnitId::parse("PyYAML@fedora-40", "rhel-9").as_str(), "pyyaml@fedora-40");
        assert_eq!(UnitId::parse("Six", "rhel-9").as_str(), "six@rhel-9");

        let unit = PackageUnit::new("PyYAML", "rhel-9");
        assert_eq!(unit.name, "PyYAML");
        assert_eq!(unit.descriptor_file_name(), "python3-pyyaml.spec");
    }

    #[test]
    fn test_interrupted_build_returns_to_pending() {
        let mut unit = PackageUnit::new("six", "rhel-9");
        let now = Utc::now();
        unit.transition(BuildStatus::Pending, now).unwrap();
        unit.transition(BuildStatus::Building, now).unwrap();

        assert!(unit.transition(BuildStatus::Pending, now).unwrap());
        assert!(unit.started_at.is_none());
        assert!(unit.queued_at.is_some());
    }

    #[test]
    fn test_forward_progression() {
        let mut unit = PackageUnit::new("six", "rhel-9");
        let now = Utc::now();
        assert!(unit.transition(BuildStatus::WaitingForDeps, now).unwrap());
        assert!(unit.transition(BuildStatus::Pending, now).unwrap());
        assert!(unit.transition(BuildStatus::Building, now).unwrap());
        assert!(unit.transition(BuildStatus::Completed, now).unwrap());
        assert_eq!(unit.status, BuildStatus::Completed);
        assert!(unit.completed_at.is_some());
    }

    #[test]
    fn test_building_cannot_be_cancelled() {
        let mut unit = PackageUnit::new("six", "rhel-9");
        let now = Utc::now();
        unit.transition(BuildStatus::Pending, now).unwrap();
        unit.transition(BuildStatus::Building, now).unwrap();

        let err = unit.transition(BuildStatus::Cancelled, now).unwrap_err();
        assert_eq!(err.from, BuildStatus::Building);
        assert_eq!(err.to, BuildStatus::Cancelled);
        assert_eq!(unit.status, BuildStatus::Building);
    }

    #[test]
    fn test_completed_cannot_jump_to_building() {
        let mut unit = PackageUnit::new("six", "rhel-9");
        unit.status = BuildStatus::Completed;
        assert!(unit.transition(BuildStatus::Building, Utc::now()).is_err());
    }

    #[test]
    fn test_entering_pending_clears_previous_run() {
        let mut unit = PackageUnit::new("lxml", "rhel-9");
        unit.status = BuildStatus::Failed;
        unit.build_log = "old log".to_string();
        unit.error_message = "old error".to_string();
        unit.classified_errors.push(ClassifiedError {
            category: "Disk Space".to_string(),
            message: "Found 1 occurrence(s)".to_string(),
            suggestion: "Free up disk space on build server".to_string(),
            items: vec!["No space left on device".to_string()],
        });
        unit.final_artifacts.push(PathBuf::from("/tmp/old.rpm"));

        unit.transition(BuildStatus::Pending, Utc::now()).unwrap();

        assert!(unit.build_log.is_empty());
        assert!(unit.error_message.is_empty());
        assert!(unit.classified_errors.is_empty());
        assert!(unit.final_artifacts.is_empty());
        assert!(unit.queued_at.is_some());
        assert!(unit.started_at.is_none());
    }

    #[test]
    fn test_pending_reentry_is_noop() {
        let mut unit = PackageUnit::new("lxml", "rhel-9");
        unit.transition(BuildStatus::Pending, Utc::now()).unwrap();
        unit.build_log = "still here".to_string();
        unit.error_message = "kept".to_string();
        let before = unit.clone();

        let changed = unit.transition(BuildStatus::Pending, Utc::now()).unwrap();

        assert!(!changed);
        assert_eq!(unit, before);
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in BuildStatus::ALL {
            assert_eq!(status.to_string().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("running".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_normalize_package_name() {
        assert_eq!(normalize_package_name("Django_Rest.Framework"), "python3-django-rest-framework");
        assert_eq!(normalize_package_name("python3-six"), "python3-six");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_same_status_is_always_a_noop(status in status_strategy()) {
            let mut unit = PackageUnit::new("pkg", "rhel-9");
            unit.status = status;
            let before = unit.clone();
            prop_assert_eq!(unit.transition(status, Utc::now()), Ok(false));
            prop_assert_eq!(unit, before);
        }

        #[test]
        fn prop_rejected_transition_leaves_unit_untouched(
            from in status_strategy(),
            to in status_strategy(),
        ) {
            let mut unit = PackageUnit::new("pkg", "rhel-9");
            unit.status = from;
            let before = unit.clone();
            match unit.transition(to, Utc::now()) {
                Ok(_) => prop_assert_eq!(unit.status, to),
                Err(err) => {
                    prop_assert_eq!(err.from, from);
                    prop_assert_eq!(unit, before);
                }
            }
        }

        #[test]
        fn prop_every_in_flight_status_can_reset(status in status_strategy()) {
            if status.is_in_flight() {
                prop_assert!(status.can_transition_to(BuildStatus::NotBuilt));
            }
        }
    }
}
