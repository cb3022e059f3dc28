//! IOA rule engine module
//!
//! A rule engine turns one normalized event into a list of IOA tags. The
//! pipeline only depends on the [`RuleEngine`] trait so the Sigma
//! implementation is swappable without touching it.

mod sigma;

pub use sigma::{SigmaEngine, SigmaLoadStats};

use crate::models::{Event, IoaTag};

/// Applies IOA rules to events.
pub trait RuleEngine: Send + Sync {
    fn apply(&self, event: &Event) -> Vec<IoaTag>;
}

/// Engine used when rules are disabled; tags nothing.
pub struct NoopEngine;

impl RuleEngine for NoopEngine {
    fn apply(&self, _event: &Event) -> Vec<IoaTag> {
        Vec::new()
    }
}
