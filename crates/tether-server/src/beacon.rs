//! Out-of-band beacons sent by the page outside the WebSocket.
//!
//! Browsers fire these from `unload`/`visibilitychange`, so the request
//! may be malformed or arrive after the socket is gone. Handlers never
//! fail: anything unusable is a `400`.

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use metrics::counter;
use serde::Deserialize;
use tracing::debug;

use crate::metrics::BEACON_REQUESTS_TOTAL;
use crate::server::AppState;

/// Form body of the disconnect beacon.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectForm {
    /// Session secret of the circuit to terminate.
    pub circuit_id: Option<String>,
}

/// Form body of the visibility beacon.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityForm {
    /// Session secret of the circuit.
    pub circuit_id: Option<String>,
    /// `"true"` or `"false"`.
    pub is_visible: Option<String>,
}

fn record(kind: &'static str, status: StatusCode) -> StatusCode {
    let outcome = if status.is_success() { "ok" } else { "rejected" };
    counter!(BEACON_REQUESTS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
    status
}

fn secret_field<'a>(state: &AppState, value: Option<&'a str>) -> Option<&'a str> {
    value.filter(|s| !s.is_empty() && state.circuits.is_valid_secret(s))
}

/// POST /_tether/disconnect
///
/// Terminates the circuit immediately. An unknown but authentic secret is
/// still a `200`; the circuit may already have been evicted.
pub async fn disconnect_beacon(
    State(state): State<AppState>,
    form: Result<Form<DisconnectForm>, FormRejection>,
) -> StatusCode {
    let Ok(Form(form)) = form else {
        return record("disconnect", StatusCode::BAD_REQUEST);
    };
    let Some(secret) = secret_field(&state, form.circuit_id.as_deref()) else {
        return record("disconnect", StatusCode::BAD_REQUEST);
    };
    let found = state.circuits.terminate(secret).await;
    debug!(found, "disconnect beacon");
    record("disconnect", StatusCode::OK)
}

/// POST /_tether/visibility
pub async fn visibility_beacon(
    State(state): State<AppState>,
    form: Result<Form<VisibilityForm>, FormRejection>,
) -> StatusCode {
    let Ok(Form(form)) = form else {
        return record("visibility", StatusCode::BAD_REQUEST);
    };
    let Some(secret) = secret_field(&state, form.circuit_id.as_deref()) else {
        return record("visibility", StatusCode::BAD_REQUEST);
    };
    let visible = match form.is_visible.as_deref() {
        Some("true") => true,
        Some("false") => false,
        _ => return record("visibility", StatusCode::BAD_REQUEST),
    };
    let found = state.circuits.set_page_visibility(secret, visible);
    debug!(found, visible, "visibility beacon");
    record("visibility", StatusCode::OK)
}
