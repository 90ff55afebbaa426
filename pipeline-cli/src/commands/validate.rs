// Validate command
// Resolution-only pass: templates, structure and the stage graph

use super::{exit, PipelineArgs};
use crate::output;

use clap::Args;
use color_eyre::Result;

/// Expand templates and build the dependency graph without running anything
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    output::status("Validating", &args.pipeline.pipeline.display().to_string());

    let Some(plan) = args.pipeline.load()? else {
        return Ok(exit::RESOLUTION);
    };

    output::check("Templates expanded");
    output::check(&format!(
        "Structure: {} stages, {} jobs, {} steps",
        plan.graph.stages.len(),
        plan.graph.job_count(),
        plan.graph.step_count()
    ));

    let order: Vec<&str> = plan
        .graph
        .topological_order()
        .into_iter()
        .map(|stage| stage.name.as_str())
        .collect();
    output::check(&format!("Stage order: {}", order.join(" -> ")));

    for (name, value) in &plan.parameters {
        let rendered = serde_json::to_string(value).unwrap_or_default();
        output::dim(&format!("    parameter {} = {}", name, rendered));
    }

    println!("{} is valid", args.pipeline.pipeline_name(&plan));
    Ok(exit::SUCCESS)
}
