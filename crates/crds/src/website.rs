//! Website CRD
//!
//! Declares a website: the domain it serves, how many replicas should run,
//! the container image and the port the container listens on.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API group of the Website resource.
pub const WEBSITE_GROUP: &str = "example.com";
/// API version of the Website resource.
pub const WEBSITE_VERSION: &str = "v1";
/// Plural resource name of the Website resource.
pub const WEBSITE_RESOURCE: &str = "websites";

#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "example.com",
    version = "v1",
    kind = "Website",
    plural = "websites",
    namespaced,
    status = "WebsiteStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteSpec {
    /// Domain name served by the website
    pub domain: String,

    /// Desired number of running replicas
    pub replicas: i32,

    /// Container image to run
    pub image: String,

    /// Container port (1-65535)
    pub port: i32,
}

/// Reasons a `WebsiteSpec` cannot be reconciled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    /// `spec.domain` is empty
    #[error("spec.domain must not be empty")]
    EmptyDomain,

    /// `spec.image` is empty
    #[error("spec.image must not be empty")]
    EmptyImage,

    /// `spec.replicas` is negative
    #[error("spec.replicas must be >= 0, got {0}")]
    NegativeReplicas(i32),

    /// `spec.port` is outside 1-65535
    #[error("spec.port must be in 1..=65535, got {0}")]
    PortOutOfRange(i32),
}

impl WebsiteSpec {
    /// Checks the spec values the controller cannot reconcile.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.domain.trim().is_empty() {
            return Err(SpecError::EmptyDomain);
        }
        if self.image.trim().is_empty() {
            return Err(SpecError::EmptyImage);
        }
        if self.replicas < 0 {
            return Err(SpecError::NegativeReplicas(self.replicas));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(SpecError::PortOutOfRange(self.port));
        }
        Ok(())
    }
}

/// Coarse lifecycle state of a Website.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum WebsitePhase {
    /// No replicas are available yet
    #[default]
    Pending,

    /// Available replicas differ from the desired count
    Progressing,

    /// Available replicas match the desired count
    Available,

    /// The spec cannot be reconciled until it changes
    Failed,
}

impl std::fmt::Display for WebsitePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Progressing => "Progressing",
            Self::Available => "Available",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteStatus {
    /// Replicas currently available
    #[serde(default)]
    pub available_replicas: i32,

    /// Current phase
    #[serde(default)]
    pub phase: WebsitePhase,

    /// Error message when the phase is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebsiteStatus {
    /// Status with the given phase and available replica count.
    #[must_use]
    pub fn new(phase: WebsitePhase, available_replicas: i32) -> Self {
        Self {
            available_replicas,
            phase,
            message: None,
        }
    }

    /// `Failed` status carrying an error message.
    #[must_use]
    pub fn failed(available_replicas: i32, message: impl Into<String>) -> Self {
        Self {
            available_replicas,
            phase: WebsitePhase::Failed,
            message: Some(message.into()),
        }
    }
}
