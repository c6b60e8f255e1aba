use thiserror::Error;

use crate::state::TransitionError;

#[derive(Debug, Error)]
pub enum HedwigError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
