//! Route modules, one per resource.

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod plugins;
pub mod radio;
pub mod stream;
pub mod tv;

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Permission gate: when the DBAL adaptor enforces permissions, deny
/// unless the check passes. Conservative policy — an unreachable service
/// denies.
pub(crate) async fn require_permission(
    state: &AppState,
    tenant_id: &str,
    user_id: &str,
    permission: &str,
) -> Result<(), ApiError> {
    if !state.dbal.enforces_permissions() {
        return Ok(());
    }
    if state
        .dbal
        .check_permission(tenant_id, user_id, permission)
        .await
    {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!(
            "user {user_id} lacks permission {permission}"
        )))
    }
}
