use super::{load_workflow, print_json};
use crate::cli::FrameArgs;
use crate::error::CliResult;
use crate::exit_codes::EXIT_SUCCESS;
use std::path::{Path, PathBuf};
use volterra_plugins::{
    ArgumentCompiler, CompiledInvocation, InvocationBuilder, SchedulerConfig, Workflow,
    WorkflowValidator,
};

/// Print the invocation a workflow compiles to for one frame
pub fn run_compile(
    workflow: &Path,
    frame: &FrameArgs,
    plugins_dir: Option<PathBuf>,
    strict: bool,
) -> CliResult<i32> {
    let workflow = load_workflow(workflow)?;
    let invocation = compile_frame(&workflow, frame, plugins_dir, strict)?;

    for dropped in &invocation.arguments.dropped {
        tracing::warn!("Dropped argument '{}': {}", dropped.key, dropped.reason);
    }
    tracing::info!("{}", invocation.command_line());
    print_json(&invocation)?;
    Ok(EXIT_SUCCESS)
}

fn compile_frame(
    workflow: &Workflow,
    frame: &FrameArgs,
    plugins_dir: Option<PathBuf>,
    strict: bool,
) -> volterra_plugins::Result<CompiledInvocation> {
    WorkflowValidator::new().ensure_valid(workflow)?;

    let plugins_dir = match plugins_dir {
        Some(dir) => dir,
        None => SchedulerConfig::load()?.plugins_dir,
    };
    let compiler = if strict {
        ArgumentCompiler::strict()
    } else {
        ArgumentCompiler::new()
    };

    let invocation = InvocationBuilder::new(plugins_dir)
        .with_compiler(compiler)
        .build(workflow, &frame.frame(), &frame.value_map(), None)?;
    Ok(invocation)
}
