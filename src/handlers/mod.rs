pub mod deploys;
pub mod health;
pub mod status;

use axum::http::StatusCode;

use crate::error::GuardError;

pub(crate) fn error_response(e: GuardError) -> (StatusCode, String) {
    let code = match &e {
        GuardError::Precondition(_)
        | GuardError::InvalidTransition { .. }
        | GuardError::RollbackInProgress => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}
