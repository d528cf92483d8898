use tracing::debug;

use crate::arm::{ArmClient, RequestOptions};
use crate::error::CloudError;

pub const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";

/// Resolve a subscription display name to its ID.
pub async fn find_subscription_id(arm: &ArmClient, display_name: &str) -> Result<String, CloudError> {
    let url = arm.management_url(&format!("/subscriptions?api-version={}", SUBSCRIPTIONS_API_VERSION));
    let subscriptions = arm.list_all(&url, &RequestOptions::management()).await?;
    let id = subscriptions
        .iter()
        .find(|s| s["displayName"].as_str() == Some(display_name))
        .and_then(|s| s["subscriptionId"].as_str())
        .ok_or_else(|| CloudError::NotFound(format!("subscription with name '{}'", display_name)))?;
    debug!(display_name, subscription_id = id, "resolved subscription");
    Ok(id.to_string())
}
