//! Plan inspection - `stagehand graph`.

use anyhow::{Context, Result};
use console::style;
use stagehand::Plan;
use stagehand::dag::Resolver;
use std::path::Path;

pub fn cmd_graph(plan_path: &Path) -> Result<()> {
    let plan = Plan::load(plan_path)?;
    let graph = Resolver::resolve(&plan)
        .with_context(|| format!("Invalid plan: {}", plan_path.display()))?;

    println!();
    println!(
        "{}",
        style(plan.name.as_deref().unwrap_or("Execution Plan")).bold().cyan()
    );
    println!("─────────────────────────");
    println!("Phases: {}", plan.phases.len());
    println!("Units: {}", graph.unit_count());
    println!();

    println!("Phase waves:");
    for (i, wave) in graph.phase_graph().waves().iter().enumerate() {
        println!("  Wave {}: {}", i, wave.join(", "));
    }
    println!();

    println!("Schedule order:");
    for id in graph.schedule() {
        let indent = if id.as_str().contains('.') { "    " } else { "  " };
        let deps = graph.dependencies(id);
        if deps.is_empty() {
            println!("{}{}", indent, id);
        } else {
            let deps: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
            println!("{}{} <- {}", indent, id, deps.join(", "));
        }
    }

    Ok(())
}
