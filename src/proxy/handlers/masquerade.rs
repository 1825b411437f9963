//! IDE-facing endpoints. The desktop IDE probes these during startup; the
//! payloads are canned but must stay internally consistent so its runtime
//! checks pass.

use crate::proxy::model_map::DEFAULT_MODELS;
use crate::proxy::state::AppState;
use axum::{extract::State, response::Json};
use serde_json::{json, Value};

const PROFILE_ID: &str = "sovereign-hardware";
const PROFILE_EMAIL: &str = "local-hardware@antigravity.os";
const PROFILE_NAME: &str = "Local Hardware";
const PROFILE_GIVEN_NAME: &str = "Local";
const PROFILE_FAMILY_NAME: &str = "Hardware";
const PROFILE_PICTURE: &str = "https://antigravity.os/avatar/sovereign-hardware.png";
const PROFILE_LOCALE: &str = "en";
const PROFILE_HD: &str = "antigravity.os";

const COMPANION_PROJECT: &str = "antigravity-sovereign-project";

fn strip_models_prefix(id: &str) -> &str {
    id.strip_prefix("models/").unwrap_or(id)
}

// Same id source as /v1/models so the IDE's model picker and the gateway's
// catalogue never disagree.
fn catalogue_ids(state: &AppState) -> Vec<String> {
    let accounts = state.store.list().unwrap_or_default();
    let active = accounts.iter().find(|a| a.is_active && !a.provider.is_local());
    match active {
        Some(a) if !a.selected_models.is_empty() => a
            .selected_models
            .iter()
            .map(|m| strip_models_prefix(m).to_string())
            .collect(),
        Some(a)
            if a.quota
                .as_ref()
                .map(|q| !q.models.is_empty())
                .unwrap_or(false) =>
        {
            a.quota
                .as_ref()
                .map(|q| q.models.keys().cloned().collect())
                .unwrap_or_default()
        }
        _ => DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
    }
}

pub async fn fetch_available_models(State(state): State<AppState>) -> Json<Value> {
    let mut models = serde_json::Map::new();
    for id in catalogue_ids(&state) {
        models.insert(
            format!("models/{}", id),
            json!({"quotaInfo": {"remainingFraction": 1.0, "resetTime": ""}}),
        );
    }
    Json(json!({"models": models}))
}

pub async fn load_code_assist() -> Json<Value> {
    Json(json!({"cloudaicompanionProject": COMPANION_PROJECT}))
}

pub async fn userinfo() -> Json<Value> {
    Json(json!({
        "id": PROFILE_ID,
        "email": PROFILE_EMAIL,
        "verified_email": true,
        "name": PROFILE_NAME,
        "given_name": PROFILE_GIVEN_NAME,
        "family_name": PROFILE_FAMILY_NAME,
        "picture": PROFILE_PICTURE,
        "locale": PROFILE_LOCALE,
        "hd": PROFILE_HD
    }))
}

/// The same canned identity in People-API shape.
pub async fn people_me() -> Json<Value> {
    Json(json!({
        "resourceName": format!("people/{}", PROFILE_ID),
        "etag": "sovereign",
        "names": [{
            "metadata": {"primary": true},
            "displayName": PROFILE_NAME,
            "givenName": PROFILE_GIVEN_NAME,
            "familyName": PROFILE_FAMILY_NAME
        }],
        "emailAddresses": [{
            "metadata": {"primary": true, "verified": true},
            "value": PROFILE_EMAIL
        }],
        "photos": [{
            "metadata": {"primary": true},
            "url": PROFILE_PICTURE
        }]
    }))
}
