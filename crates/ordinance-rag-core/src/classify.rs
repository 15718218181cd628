//! Classification of resources at ingest time.
//!
//! The rule-driven engine lives in the app crate; the ingester and tests
//! depend only on this trait, so a classifier is always injected rather
//! than looked up globally.

use crate::models::{Classification, ClassifyContext};

/// Assigns a [`Classification`] to a resource type.
pub trait Classifier: Send + Sync {
    fn classify(&self, resource_type: &str, context: &ClassifyContext) -> Classification;
}

/// Classifier that labels everything with one fixed level.
#[derive(Debug, Clone, Copy)]
pub struct FixedClassifier(pub Classification);

impl Classifier for FixedClassifier {
    fn classify(&self, _resource_type: &str, _context: &ClassifyContext) -> Classification {
        self.0
    }
}
