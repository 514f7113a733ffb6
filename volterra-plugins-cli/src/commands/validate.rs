use super::{load_workflow, print_json};
use crate::error::CliResult;
use crate::exit_codes::{EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use volterra_plugins::WorkflowValidator;

/// Print the validation report; exit 1 when the workflow is invalid
pub fn run_validate(workflow: &Path) -> CliResult<i32> {
    let workflow = load_workflow(workflow)?;
    let report = WorkflowValidator::new().validate(&workflow);

    for error in &report.errors {
        tracing::warn!("{}", error);
    }
    print_json(&report)?;

    Ok(if report.valid {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
