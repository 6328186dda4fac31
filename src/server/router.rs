//! Request classification
//!
//! Every request head read by the server lands in exactly one branch:
//!
//! ```text
//! no carry or role cookie ........ Decoy(MissingCookie)
//! token unknown or expired ....... Decoy(UnknownToken)
//! method/flag match no role ...... Decoy(RoleMismatch)
//! otherwise ...................... Leg { role, token, state }
//! ```

use crate::config::CamouflageConfig;
use crate::http::{header_value, HttpError, RequestHead, ResponseHead};
use crate::protocol::{Role, CAMOUFLAGE_ENCODING, NO_CACHE};
use crate::token::{PairingState, TokenRegistry};
use http::header::{self, HeaderValue};
use http::StatusCode;
use std::fmt;
use std::sync::Arc;

/// Why a request is answered with decoy content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoyReason {
    MissingCookie,
    UnknownToken,
    RoleMismatch,
}

impl fmt::Display for DecoyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecoyReason::MissingCookie => "missing cookie",
            DecoyReason::UnknownToken => "unknown token",
            DecoyReason::RoleMismatch => "role mismatch",
        })
    }
}

pub enum Route {
    Decoy(DecoyReason),
    Leg {
        role: Role,
        token: String,
        state: Arc<PairingState>,
    },
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Decoy(reason) => f.debug_tuple("Decoy").field(reason).finish(),
            Route::Leg { role, token, .. } => f
                .debug_struct("Leg")
                .field("role", role)
                .field("token", token)
                .finish_non_exhaustive(),
        }
    }
}

pub async fn classify(
    head: &RequestHead,
    camouflage: &CamouflageConfig,
    registry: &TokenRegistry,
) -> Route {
    let (Some(token), Some(flag)) = (
        head.cookie(&camouflage.token_cookie),
        head.cookie(&camouflage.role_cookie),
    ) else {
        return Route::Decoy(DecoyReason::MissingCookie);
    };

    let Ok(state) = registry.validate(token).await else {
        return Route::Decoy(DecoyReason::UnknownToken);
    };

    match camouflage.role_for(head.method.as_str(), flag) {
        Some(role) => Route::Leg {
            role,
            token: token.to_string(),
            state,
        },
        None => Route::Decoy(DecoyReason::RoleMismatch),
    }
}

/// Head written on a leg before the raw connection is taken over.
///
/// The plain form looks like the start of an unbounded compressed response.
/// The WebSocket form fakes a protocol switch, echoing the token as the
/// accept key instead of a real handshake digest.
pub fn takeover_head(
    camouflage: &CamouflageConfig,
    role: Role,
    token: &str,
) -> Result<ResponseHead, HttpError> {
    if camouflage.websocket {
        return Ok(ResponseHead::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
            .with_header(header::SEC_WEBSOCKET_ACCEPT, header_value(token)?));
    }

    let head = ResponseHead::new(StatusCode::OK)
        .with_header(header::SERVER, header_value(&camouflage.server_header)?)
        .with_header(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE))
        .with_header(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(CAMOUFLAGE_ENCODING),
        );
    Ok(
        if role == Role::Download && camouflage.download_framing.chunked() {
            head.with_header(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
        } else {
            head
        },
    )
}
