//! Risk classification and the confirmation gate
//!
//! Classification is a pure function over an ordered rule set. The policy turns a
//! classification plus the configured block-list into a [`GateDecision`].

pub mod classifier;
pub mod policy;
pub mod rules;

pub use classifier::{RiskAssessment, RiskClassifier};
pub use policy::{GateDecision, SafetyPolicy};
pub use rules::RiskLevel;
