//! Image list filtering and merging of task outputs.
//!
//! A workflow task selects its input images from the dataset image list with
//! its type filters. Once the task ran, the image list updates and removals
//! of its outputs are applied to the dataset image list.

use std::collections::HashSet;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::models::JsonMap;
use crate::models::SingleImage;

/// An error raised while interpreting task outputs or updating an image list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// A task output does not have the expected shape.
    #[error("invalid task output: {0}")]
    InvalidOutput(String),
    /// The same image is updated more than once by the outputs of a task.
    #[error("image `{0}` is updated more than once")]
    DuplicateUpdate(String),
    /// A new image lies outside of the dataset directory.
    #[error("image `{zarr_url}` is not inside the dataset directory `{zarr_dir}`")]
    OutsideZarrDir {
        /// The URL of the image.
        zarr_url: String,
        /// The dataset directory.
        zarr_dir: String,
    },
    /// An attribute value is not a scalar.
    #[error("attribute `{name}` of image `{zarr_url}` must be a string, number or boolean")]
    InvalidAttribute {
        /// The URL of the image.
        zarr_url: String,
        /// The name of the attribute.
        name: String,
    },
    /// A removed image is not part of the image list.
    #[error("cannot remove image `{0}`: it is not part of the dataset")]
    MissingImage(String),
}

/// An image added or updated by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageUpdate {
    /// The URL of the image.
    pub zarr_url: String,
    /// The URL of the image this one was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// The attributes to set.
    #[serde(default)]
    pub attributes: IndexMap<String, JsonValue>,
    /// The types to set.
    #[serde(default)]
    pub types: IndexMap<String, bool>,
}

/// The output of a non-parallel or parallel task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskOutput {
    /// The images added or updated by the task.
    pub image_list_updates: Vec<ImageUpdate>,
    /// The URLs of the images removed by the task.
    pub image_list_removals: Vec<String>,
}

impl TaskOutput {
    /// Interprets the output of an invocation; `null` is an empty output.
    pub fn from_value(value: JsonValue) -> Result<Self, ImageError> {
        if value.is_null() {
            return Ok(Self::default());
        }

        serde_json::from_value(value).map_err(|e| ImageError::InvalidOutput(e.to_string()))
    }

    /// Merges the outputs of the invocations of a task.
    ///
    /// An image may be updated by at most one invocation.
    pub fn merge(outputs: impl IntoIterator<Item = Self>) -> Result<Self, ImageError> {
        let mut updates = Vec::new();
        let mut updated = HashSet::new();
        let mut removals = IndexSet::new();
        for output in outputs {
            for update in output.image_list_updates {
                if !updated.insert(normalize_zarr_url(&update.zarr_url).to_string()) {
                    return Err(ImageError::DuplicateUpdate(update.zarr_url));
                }

                updates.push(update);
            }

            removals.extend(output.image_list_removals);
        }

        Ok(Self {
            image_list_updates: updates,
            image_list_removals: removals.into_iter().collect(),
        })
    }

    /// Returns `true` if the output changes nothing.
    pub fn is_empty(&self) -> bool {
        self.image_list_updates.is_empty() && self.image_list_removals.is_empty()
    }
}

/// An item of the parallelization list of a compound task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelizationItem {
    /// The image processed by the compute invocation.
    pub zarr_url: String,
    /// Additional arguments of the compute invocation.
    #[serde(default)]
    pub init_args: JsonMap,
}

/// The output of the initialization invocation of a compound task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitTaskOutput {
    /// The compute invocations to run.
    pub parallelization_list: Vec<ParallelizationItem>,
}

impl InitTaskOutput {
    /// Interprets the output of an initialization invocation; `null` is an
    /// empty output.
    pub fn from_value(value: JsonValue) -> Result<Self, ImageError> {
        if value.is_null() {
            return Ok(Self::default());
        }

        serde_json::from_value(value).map_err(|e| ImageError::InvalidOutput(e.to_string()))
    }
}

/// Removes trailing slashes from an image URL.
pub fn normalize_zarr_url(zarr_url: &str) -> &str {
    let trimmed = zarr_url.trim_end_matches('/');
    if trimmed.is_empty() { zarr_url } else { trimmed }
}

/// Returns `true` if an image has every type of the filters with the
/// required value; a missing type counts as `false`.
pub fn matches_type_filters(image: &SingleImage, type_filters: &IndexMap<String, bool>) -> bool {
    type_filters
        .iter()
        .all(|(name, value)| image.types.get(name).copied().unwrap_or(false) == *value)
}

/// Selects the images matching the type filters of a workflow task.
pub fn filter_images(
    images: &[SingleImage],
    type_filters: &IndexMap<String, bool>,
) -> Vec<SingleImage> {
    images
        .iter()
        .filter(|image| matches_type_filters(image, type_filters))
        .cloned()
        .collect()
}

/// Checks that every attribute of an update is a scalar.
fn check_attributes(update: &ImageUpdate) -> Result<(), ImageError> {
    for (name, value) in &update.attributes {
        if !(value.is_string() || value.is_number() || value.is_boolean()) {
            return Err(ImageError::InvalidAttribute {
                zarr_url: update.zarr_url.clone(),
                name: name.clone(),
            });
        }
    }

    Ok(())
}

/// Applies the output of a task to an image list.
///
/// Updates of known images merge their attributes and types into the image.
/// New images must lie inside `zarr_dir`; they inherit the attributes and
/// types of their origin image, if it is known, before the update is applied.
/// Removals of unknown images are errors.
pub fn apply_task_output(
    images: &mut Vec<SingleImage>,
    output: &TaskOutput,
    zarr_dir: &str,
) -> Result<(), ImageError> {
    let zarr_dir = normalize_zarr_url(zarr_dir);

    for update in &output.image_list_updates {
        check_attributes(update)?;
        let zarr_url = normalize_zarr_url(&update.zarr_url);

        if let Some(image) = images.iter_mut().find(|i| i.zarr_url == zarr_url) {
            image.attributes.extend(update.attributes.clone());
            image.types.extend(update.types.clone());
            continue;
        }

        let inside = zarr_url
            .strip_prefix(zarr_dir)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1);
        if !inside {
            return Err(ImageError::OutsideZarrDir {
                zarr_url: zarr_url.to_string(),
                zarr_dir: zarr_dir.to_string(),
            });
        }

        let mut image = SingleImage::new(zarr_url);
        if let Some(origin) = &update.origin {
            let origin = normalize_zarr_url(origin);
            image.origin = Some(origin.to_string());
            if let Some(parent) = images.iter().find(|i| i.zarr_url == origin) {
                image.attributes = parent.attributes.clone();
                image.types = parent.types.clone();
            }
        }

        image.attributes.extend(update.attributes.clone());
        image.types.extend(update.types.clone());
        images.push(image);
    }

    for removal in &output.image_list_removals {
        let zarr_url = normalize_zarr_url(removal);
        let Some(position) = images.iter().position(|i| i.zarr_url == zarr_url) else {
            return Err(ImageError::MissingImage(zarr_url.to_string()));
        };

        images.remove(position);
    }

    Ok(())
}
