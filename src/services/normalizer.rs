//! Result normalization.
//!
//! Providers report generated images in different shapes: a single URL, a list
//! of URLs, a comma-joined string, nested at a provider-specific JSON path.
//! Each adapter owns a [`Normalizer`] configured with the candidate paths of
//! its output; the raw value found there is parsed once into a
//! [`ProviderPayload`] and flattened into an ordered list of URLs.

use reqwest::Url;
use serde_json::Value;

use crate::models::staging::StagingResult;

/// Output value as found at the configured path.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderPayload {
    Missing,
    Single(String),
    CommaJoined(String),
    List(Vec<String>),
    Unsupported(&'static str),
}

impl ProviderPayload {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Missing,
            Some(Value::String(s)) if s.contains(',') => Self::CommaJoined(s.clone()),
            Some(Value::String(s)) => Self::Single(s.clone()),
            Some(Value::Array(items)) => Self::List(items.iter().filter_map(list_entry).collect()),
            Some(Value::Bool(_)) => Self::Unsupported("boolean"),
            Some(Value::Number(_)) => Self::Unsupported("number"),
            Some(Value::Object(_)) => Self::Unsupported("object"),
        }
    }

    /// Ordered http(s) URLs. Entries are split on commas and trimmed; anything
    /// that is not an absolute http(s) URL is dropped.
    pub fn into_urls(self) -> Vec<String> {
        let raw: Vec<String> = match self {
            Self::Missing | Self::Unsupported(_) => Vec::new(),
            Self::Single(url) => vec![url],
            Self::CommaJoined(joined) => vec![joined],
            Self::List(urls) => urls,
        };

        raw.iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|candidate| is_image_url(candidate))
            .map(str::to_string)
            .collect()
    }
}

fn is_image_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

/// List items are plain strings, or objects carrying the URL under `url`.
fn list_entry(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("image_url"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizationError {
    #[error("provider payload has no output at `{path}`")]
    MissingOutput { path: String },

    #[error("provider output at `{path}` is a {found}, expected URL(s)")]
    UnsupportedShape { path: String, found: &'static str },

    #[error("provider output at `{path}` contained no image URLs")]
    Empty { path: String },
}

/// Per-provider normalizer configuration.
///
/// Holds one or more output paths, tried in order; the first that yields at
/// least one URL wins.
#[derive(Debug, Clone)]
pub struct Normalizer {
    output_paths: Vec<Vec<&'static str>>,
}

impl Normalizer {
    /// `output_path` lists the object keys leading to the output value,
    /// e.g. `["data", "generated_images"]`.
    pub fn new(output_path: &[&'static str]) -> Self {
        Self {
            output_paths: vec![output_path.to_vec()],
        }
    }

    /// Add a path consulted when the earlier ones hold no usable output.
    pub fn or_path(mut self, output_path: &[&'static str]) -> Self {
        self.output_paths.push(output_path.to_vec());
        self
    }

    pub fn path(&self) -> String {
        self.output_paths
            .iter()
            .map(|keys| keys.join("."))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn extract(keys: &[&'static str], raw: &Value) -> Result<Vec<String>, NormalizationError> {
        let path = keys.join(".");
        let found = keys.iter().try_fold(raw, |node, key| node.get(*key));

        let images = match ProviderPayload::from_value(found) {
            ProviderPayload::Missing => return Err(NormalizationError::MissingOutput { path }),
            ProviderPayload::Unsupported(found) => {
                return Err(NormalizationError::UnsupportedShape { path, found })
            }
            payload => payload.into_urls(),
        };

        if images.is_empty() {
            return Err(NormalizationError::Empty { path });
        }
        Ok(images)
    }

    pub fn normalize(&self, raw: &Value) -> Result<StagingResult, NormalizationError> {
        let mut failure: Option<NormalizationError> = None;

        for keys in &self.output_paths {
            match Self::extract(keys, raw) {
                Ok(images) => {
                    return Ok(StagingResult {
                        images,
                        provider_metadata: raw.clone(),
                    })
                }
                // A present-but-unusable output explains more than a missing one.
                Err(e) => {
                    if matches!(failure, None | Some(NormalizationError::MissingOutput { .. })) {
                        failure = Some(e);
                    }
                }
            }
        }

        Err(match failure {
            Some(NormalizationError::MissingOutput { .. }) | None => {
                NormalizationError::MissingOutput { path: self.path() }
            }
            Some(other) => other,
        })
    }
}
