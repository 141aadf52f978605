//! SDP offer/answer exchange
//!
//! `POST /offer` takes a browser-generated SDP offer and returns the
//! gateway's answer once ICE gathering has finished. Malformed payloads
//! are rejected before any connection state exists, so a bad request
//! never leaves a session behind in the registry.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::AppState;
use crate::error::Error;

/// Offer payload, matching the browser's `RTCSessionDescription` JSON
#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Answer payload in the same shape
#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Exchange an SDP offer for an answer
///
/// POST /offer
pub async fn exchange_offer(
    State(state): State<AppState>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected unparseable offer payload");
            return (
                rejection.status(),
                Json(ErrorResponse {
                    error: "invalid_request".to_string(),
                    message: rejection.body_text(),
                }),
            )
                .into_response();
        }
    };

    if req.kind != "offer" {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid_request".to_string(),
                message: format!("Expected type \"offer\", got \"{}\"", req.kind),
            }),
        )
            .into_response();
    }

    let offer = match RTCSessionDescription::offer(req.sdp) {
        Ok(offer) => offer,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "invalid_sdp".to_string(),
                    message: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    match state.manager.handle_offer(offer).await {
        Ok(answer) => (
            StatusCode::OK,
            Json(AnswerResponse {
                sdp: answer.sdp,
                kind: "answer".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            // The full error is logged here; the response body carries a
            // stable message instead of internal error text
            warn!(error = %e, "Offer negotiation failed");
            let (status, code, message) = match &e {
                Error::PeerConnection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "at_capacity",
                    "Connection limit reached, try again later",
                ),
                Error::TransportState(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "source_unavailable",
                    "Video source is unavailable",
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "negotiation_failed",
                    "Could not negotiate a session for this offer",
                ),
            };
            (
                status,
                Json(ErrorResponse {
                    error: code.to_string(),
                    message: message.to_string(),
                }),
            )
                .into_response()
        }
    }
}
