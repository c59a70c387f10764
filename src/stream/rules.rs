// Filtered stream rules. Only what `watch --auto-setup` needs: list the
// current rules, delete them by id and add one rule per keyword.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::{Gateway, GatewayError, Payload, Query};

pub const RULES_PATH: &str = "2/tweets/search/stream/rules";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRule {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl NewRule {
    /// A rule matching `keyword`, tagged `watch_<keyword>` with spaces
    /// replaced by underscores.
    pub fn for_keyword(keyword: &str) -> Self {
        NewRule {
            value: keyword.to_string(),
            tag: Some(format!("watch_{}", keyword.replace(' ', "_"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RulesResponse {
    #[serde(default)]
    data: Vec<Rule>,
}

pub fn list_rules<G: Gateway + ?Sized>(gateway: &G) -> Result<Vec<Rule>, GatewayError> {
    let response: RulesResponse = gateway
        .get(RULES_PATH, &Query::new())?
        .error_for_status()?
        .json()?;
    Ok(response.data)
}

pub fn add_rules<G: Gateway + ?Sized>(
    gateway: &G,
    rules: &[NewRule],
    dry_run: bool,
) -> Result<Vec<Rule>, GatewayError> {
    let mut query = Query::new();
    if dry_run {
        query.insert("dry_run".into(), "true".into());
    }
    let payload = Payload::Json(json!({ "add": rules }));
    let response: RulesResponse = gateway
        .post(RULES_PATH, payload, &query)?
        .error_for_status()?
        .json()?;
    Ok(response.data)
}

/// The API deletes rules through a POST with a `delete` body.
pub fn delete_rules<G: Gateway + ?Sized>(gateway: &G, ids: &[String]) -> Result<(), GatewayError> {
    if ids.is_empty() {
        return Ok(());
    }
    let payload = Payload::Json(json!({ "delete": { "ids": ids } }));
    gateway
        .post(RULES_PATH, payload, &Query::new())?
        .error_for_status()?;
    Ok(())
}
