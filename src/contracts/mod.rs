//! Contract publication, breaking-change detection and impact analysis.

pub mod breaking;
pub mod impact;

pub use breaking::{assess, BreakingAssessment, Strategy};
pub use impact::{ImpactAnalyzer, ImpactReport};
