//! Validation of task runner calls.
//!
//! Every check here runs before any file, process or SLURM job is created.

use std::collections::HashSet;

use super::MultisubmitRequest;
use super::SubmitRequest;
use crate::error::ValidationError;
use crate::models::JsonMap;
use crate::models::TaskType;

/// The parameter holding the image list of a non-parallel invocation.
pub const ZARR_URLS_KEY: &str = "zarr_urls";

/// The parameter holding the image of a parallel invocation.
pub const ZARR_URL_KEY: &str = "zarr_url";

/// Validates the parameters of a `submit` call.
pub fn validate_submit_parameters(
    parameters: &JsonMap,
    task_type: TaskType,
) -> Result<(), ValidationError> {
    match task_type {
        TaskType::Parallel => Err(ValidationError::new(
            "a `parallel` task cannot be run with `submit`",
        )),
        TaskType::NonParallel | TaskType::Compound => match parameters.get(ZARR_URLS_KEY) {
            Some(serde_json::Value::Array(_)) => Ok(()),
            Some(_) => Err(ValidationError::new(format!(
                "the `{ZARR_URLS_KEY}` parameter of a `{task_type}` task must be a list"
            ))),
            None => Err(ValidationError::new(format!(
                "a `{task_type}` task requires the `{ZARR_URLS_KEY}` parameter"
            ))),
        },
        TaskType::ConverterNonParallel | TaskType::ConverterCompound => {
            if parameters.contains_key(ZARR_URLS_KEY) {
                return Err(ValidationError::new(format!(
                    "a `{task_type}` task cannot have the `{ZARR_URLS_KEY}` parameter"
                )));
            }

            Ok(())
        }
    }
}

/// Validates a `submit` call.
pub fn validate_submit(request: &SubmitRequest) -> Result<(), ValidationError> {
    if request.command.trim().is_empty() {
        return Err(ValidationError::new("the task command cannot be empty"));
    }

    validate_submit_parameters(&request.parameters, request.task_type)
}

/// Validates a `multisubmit` call.
pub fn validate_multisubmit(request: &MultisubmitRequest) -> Result<(), ValidationError> {
    if !request.task_type.has_parallel_component() {
        return Err(ValidationError::new(format!(
            "a `{task_type}` task cannot be run with `multisubmit`",
            task_type = request.task_type
        )));
    }

    if request.command.trim().is_empty() {
        return Err(ValidationError::new("the task command cannot be empty"));
    }

    let count = request.list_parameters.len();
    if count == 0 {
        return Err(ValidationError::new("`multisubmit` requires at least one task"));
    }

    if request.list_history_unit_ids.len() != count || request.list_task_files.len() != count {
        return Err(ValidationError::new(format!(
            "`multisubmit` received {count} parameter sets, {units} history units and {files} \
             task files",
            units = request.list_history_unit_ids.len(),
            files = request.list_task_files.len()
        )));
    }

    let mut seen = HashSet::with_capacity(count);
    for (index, parameters) in request.list_parameters.iter().enumerate() {
        let Some(zarr_url) = parameters.get(ZARR_URL_KEY).and_then(|v| v.as_str()) else {
            return Err(ValidationError::new(format!(
                "parameter set {index} is missing the `{ZARR_URL_KEY}` string"
            )));
        };

        if !seen.insert(zarr_url) {
            return Err(ValidationError::new(format!(
                "`{ZARR_URL_KEY}` `{zarr_url}` appears in more than one parameter set"
            )));
        }
    }

    let subfolders: HashSet<_> = request
        .list_task_files
        .iter()
        .map(|f| f.wftask_subfolder_local())
        .collect();
    if subfolders.len() != 1 {
        return Err(ValidationError::new(format!(
            "the tasks of a `multisubmit` call must share one subfolder, found {count}",
            count = subfolders.len()
        )));
    }

    let components: HashSet<_> = request.list_task_files.iter().map(|f| f.prefix()).collect();
    if components.len() != count {
        return Err(ValidationError::new(
            "the tasks of a `multisubmit` call must have distinct components",
        ));
    }

    Ok(())
}
