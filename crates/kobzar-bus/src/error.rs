use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("channel '{0}' is closed")]
    Closed(&'static str),

    #[error("channel '{0}' shed a payload after backoff was exhausted")]
    Shed(&'static str),
}
