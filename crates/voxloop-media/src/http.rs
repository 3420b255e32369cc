//! HTTP failure classification shared by the capability adapters.

use voxloop_core::error::ServiceError;

/// Map a transport-level reqwest failure onto the capability error taxonomy.
pub(crate) fn send_error(err: reqwest::Error) -> ServiceError {
    if err.is_builder() {
        ServiceError::Rejected(err.to_string())
    } else {
        ServiceError::Unavailable(err.to_string())
    }
}

/// Pass successful responses through; turn error statuses into a [`ServiceError`].
pub(crate) async fn check_status(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ServiceError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ServiceError::from_status(status, &body))
}
