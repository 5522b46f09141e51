//! Request routing: intent classification and tier assignment.
//!
//! [`classifier`] decides *what kind* of request this is (cache-only, local,
//! cheap, premium); [`tier_router`] turns that classification, plus a BM25
//! fast-path and a risk score, into a [`tier_router::RoutingDecision`] the
//! pipeline orchestrator can act on.

pub mod classifier;
pub mod tier_router;

pub use classifier::{Classifier, ClassificationResult, Tier};
pub use tier_router::{RoutingDecision, TierRouter};
