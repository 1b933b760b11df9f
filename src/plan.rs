//! Plan definition and JSON loading.
//!
//! A plan is the already-resolved input of a run: an ordered list of phases,
//! each with an ordered list of tasks, and the dependencies between them.
//! How the plan was produced is not the engine's concern.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::state::UnitId;

/// A single task inside a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Task id, unique within its phase
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ids of sibling tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Opaque payload handed to the executor
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new(id: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            depends_on,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A phase: a coarse unit that groups tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Phase id (e.g., "01", "build")
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ids of phases that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tasks in declaration order. A phase without tasks is executed as a unit itself.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    /// Opaque payload handed to the executor for leaf phases
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl PhaseSpec {
    pub fn new(id: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            depends_on,
            tasks: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskSpec>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// A phase without tasks is dispatched to the executor directly.
    pub fn is_leaf(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Unit id of one of this phase's tasks.
    pub fn task_unit_id(&self, task_id: &str) -> UnitId {
        UnitId::task(&self.id, task_id)
    }
}

/// The full plan file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// Optional plan name, shown in status output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Phases in declaration order
    pub phases: Vec<PhaseSpec>,
}

impl Plan {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { name: None, phases }
    }

    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let plan: Plan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;

        Ok(plan)
    }

    /// Save the plan to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;

        Ok(())
    }

    /// Get a phase by id.
    pub fn get_phase(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Total number of schedulable units (phases plus tasks).
    pub fn unit_count(&self) -> usize {
        self.phases.iter().map(|p| 1 + p.tasks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_plan() -> Plan {
        Plan::new(vec![
            PhaseSpec::new("setup", vec![]),
            PhaseSpec::new("build", vec!["setup".into()]).with_tasks(vec![
                TaskSpec::new("compile", vec![]),
                TaskSpec::new("link", vec!["compile".into()]),
            ]),
        ])
    }

    #[test]
    fn test_unit_count_includes_phases_and_tasks() {
        assert_eq!(sample_plan().unit_count(), 4);
    }

    #[test]
    fn test_leaf_phase_detection() {
        let plan = sample_plan();
        assert!(plan.get_phase("setup").unwrap().is_leaf());
        assert!(!plan.get_phase("build").unwrap().is_leaf());
    }

    #[test]
    fn test_task_unit_id_is_dotted() {
        let plan = sample_plan();
        let build = plan.get_phase("build").unwrap();
        assert_eq!(build.task_unit_id("link").as_str(), "build.link");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        let plan = sample_plan().phases[1].clone();
        let plan = Plan::new(vec![
            plan.with_payload(serde_json::json!({"command": "make"})),
        ]);

        plan.save(&path).unwrap();
        let loaded = Plan::load(&path).unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_minimal_json_defaults() {
        let json = r#"{"phases": [{"id": "01"}, {"id": "02", "depends_on": ["01"]}]}"#;
        let plan: Plan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.phases.len(), 2);
        assert!(plan.phases[0].tasks.is_empty());
        assert!(plan.phases[0].payload.is_null());
        assert_eq!(plan.phases[1].depends_on, vec!["01"]);
    }

    #[test]
    fn test_load_missing_file_mentions_path() {
        let err = Plan::load(Path::new("/nonexistent/plan.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/plan.json"));
    }
}
