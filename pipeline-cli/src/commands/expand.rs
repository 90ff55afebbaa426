// Expand command
// Print the fully expanded pipeline document

use super::{exit, PipelineArgs};

use clap::Args;
use color_eyre::Result;

/// Print the pipeline after parameter binding and template expansion
#[derive(Args, Debug)]
pub struct ExpandArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

pub fn execute(args: ExpandArgs) -> Result<i32> {
    let Some(plan) = args.pipeline.load()? else {
        return Ok(exit::RESOLUTION);
    };
    print!("{}", serde_yaml::to_string(&plan.pipeline)?);
    Ok(exit::SUCCESS)
}
