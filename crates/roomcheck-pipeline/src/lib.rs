//! End-to-end room assessment: detection, rule retrieval, judgment and aggregation.

pub mod aggregate;
mod analyzer;
mod backends;
pub mod retriever;

pub use aggregate::aggregate;
pub use analyzer::{AnalysisReport, AnalyzeError, Analyzer, Stage};
pub use backends::Backends;
pub use retriever::RuleRetriever;
