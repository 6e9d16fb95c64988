//! Error taxonomy. Only configuration problems abort a run; numerical
//! hiccups inside EM degrade gracefully and end up as flags in the
//! [`crate::FitReport`] instead.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dimension mismatch in {context}: expected {expected} {unit}, found {found}")]
    DimensionMismatch {
        context: &'static str,
        unit: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("chromosome spans must tile the window axis: {0}")]
    BadSpans(String),
    #[error("empty design: at least one sample is required")]
    EmptyDesign,
    #[error("differential mode needs at least two conditions, found {0}")]
    TooFewConditions(usize),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
