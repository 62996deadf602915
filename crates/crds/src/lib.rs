//! Website CRD Definitions
//!
//! Kubernetes Custom Resource Definition for the Website controller.

pub mod website;

pub use website::*;
