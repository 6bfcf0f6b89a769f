//! OAuth scope boundary: `tag:<name>` scopes gate which tags a session may
//! filter on. The token-to-scopes mapping comes from config; issuing and
//! validating tokens is the external provider's job.

use std::collections::BTreeSet;

use magg_config::AuthSettings;
use magg_core::ProxyError;

use crate::filter::TagFilter;

const SCOPE_TAG_PREFIX: &str = "tag:";

/// Tags derivable from a granted scope list.
pub fn granted_tags(scopes: &[String]) -> BTreeSet<String> {
    scopes
        .iter()
        .filter_map(|scope| scope.strip_prefix(SCOPE_TAG_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Extract the bearer token from an `Authorization` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Enforce that every tag the filter references is covered by the granted
/// scopes. Runs after preset resolution, so preset-derived tags are checked
/// like explicit ones.
pub fn validate_filter_scopes(
    filter: &TagFilter,
    auth: &AuthSettings,
    bearer: Option<&str>,
) -> Result<(), ProxyError> {
    if !auth.enabled {
        return Ok(());
    }
    let token = bearer.ok_or_else(|| ProxyError::InsufficientScope {
        missing: filter.referenced_tags().into_iter().collect(),
    })?;
    let scopes = auth
        .tokens
        .get(token)
        .ok_or_else(|| ProxyError::InsufficientScope {
            missing: filter.referenced_tags().into_iter().collect(),
        })?;

    let granted = granted_tags(scopes);
    let missing: Vec<String> = filter
        .referenced_tags()
        .into_iter()
        .filter(|tag| !granted.contains(tag))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProxyError::InsufficientScope { missing })
    }
}
