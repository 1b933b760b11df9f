//! Dependency graph resolution for phases and tasks.
//!
//! ## Architecture
//!
//! 1. **Builder** - Validates a flat list of units and produces a `UnitGraph`
//!    with a deterministic topological order and execution waves
//! 2. **Resolver** - Applies the builder twice: once over phases and once over
//!    each phase's tasks, producing a `PlanGraph`
//!
//! ## Example
//!
//! ```
//! use stagehand::dag::Resolver;
//! use stagehand::plan::{PhaseSpec, Plan};
//!
//! let plan = Plan::new(vec![
//!     PhaseSpec::new("01", vec![]),
//!     PhaseSpec::new("02", vec!["01".to_string()]),
//!     PhaseSpec::new("03", vec!["01".to_string()]),
//!     PhaseSpec::new("04", vec!["02".to_string(), "03".to_string()]),
//! ]);
//!
//! let graph = Resolver::resolve(&plan).unwrap();
//! let waves = graph.phase_graph().waves();
//! assert_eq!(waves, vec![vec!["01"], vec!["02", "03"], vec!["04"]]);
//! ```

mod builder;
mod resolver;

pub use builder::{DagBuilder, UnitGraph, UnitIndex, UnitNode};
pub use resolver::{PlanGraph, Resolver, UnitRef};
