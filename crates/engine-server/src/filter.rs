//! Request filter chain: origin check, CORS, and authentication.
//!
//! Every request passes through, in order:
//!
//! 1. [`check_origin`] -- a request carrying an `Origin` header that
//!    matches no allowed pattern is refused with a bare `403`.
//! 2. [`cors_layer`] -- answers preflights and echoes allowed origins.
//! 3. [`authenticate`] -- proves the client may talk to the server and
//!    attaches the connection's [`Envelope`] as a request extension.
//!
//! In box mode the client sends its hex public key as `publicKey` and any
//! JSON value sealed to the server as `encryptedMessage`. Opening that box
//! proves the client holds the private half of `publicKey`; the resulting
//! mailbox is what the handler uses for every later body. The public key
//! discovery route is exempt so clients can bootstrap.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Uri, header};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use subtle::ConstantTimeEq as _;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::debug;

use crate::config::{AuthMode, OriginPattern};
use crate::crypto::{Envelope, KeyPair, MailBox};
use crate::error::FilterError;
use crate::state::AppState;

/// Route exempt from authentication.
pub const PUBLIC_KEY_PATH: &str = "/getpublickey";

/// Header carrying the shared secret in shared-secret mode.
pub const SECRET_HEADER: &str = "x-secret-key";

#[derive(Deserialize)]
struct BoxCredentials {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "encryptedMessage")]
    encrypted_message: String,
}

#[derive(Deserialize)]
struct SecretCredentials {
    secret: Option<String>,
}

/// Refuse requests from origins that match no allowed pattern.
///
/// Requests without an `Origin` header (non-browser clients) pass.
pub async fn check_origin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, FilterError> {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .is_ok_and(|origin| state.origin_allowed(origin));
        if !allowed {
            debug!(?origin, "origin rejected");
            return Err(FilterError::OriginDenied);
        }
    }
    Ok(next.run(request).await)
}

/// CORS policy echoing any origin that matches an allowed pattern.
pub fn cors_layer(origins: Arc<[OriginPattern]>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin
                    .to_str()
                    .is_ok_and(|origin| origins.iter().any(|pattern| pattern.matches(origin)))
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Authenticate the request and attach its [`Envelope`].
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, FilterError> {
    if request.uri().path() == PUBLIC_KEY_PATH {
        return Ok(next.run(request).await);
    }

    let envelope = match &state.auth {
        AuthMode::Box => Envelope::Boxed(open_mailbox(&state.keys, request.uri())?),
        AuthMode::SharedSecret(secret) => {
            check_secret(secret, &request)?;
            Envelope::Plain
        }
    };

    request.extensions_mut().insert(Arc::new(envelope));
    Ok(next.run(request).await)
}

fn open_mailbox(keys: &KeyPair, uri: &Uri) -> Result<MailBox, FilterError> {
    let Query(credentials) = Query::<BoxCredentials>::try_from_uri(uri)
        .map_err(|rejection| FilterError::Unauthorized(format!("missing credentials: {rejection}")))?;

    let mailbox = keys.mailbox_for_hex(&credentials.public_key).map_err(|e| {
        debug!(error = %e, "client public key rejected");
        FilterError::Unauthorized("invalid public key".to_owned())
    })?;

    // An unencoded `+` in the query string arrives as a space.
    let sealed = credentials.encrypted_message.replace(' ', "+");
    mailbox.open(&sealed).map_err(|e| {
        debug!(client = %mailbox.peer_public_key_hex(), error = %e, "credential box rejected");
        FilterError::Unauthorized("message failed verification".to_owned())
    })?;

    Ok(mailbox)
}

fn check_secret(expected: &str, request: &Request) -> Result<(), FilterError> {
    let from_header = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let provided = from_header.or_else(|| {
        Query::<SecretCredentials>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(credentials)| credentials.secret)
    });

    match provided {
        Some(secret) if secret_matches(&secret, expected) => Ok(()),
        Some(_) => Err(FilterError::Unauthorized("invalid secret".to_owned())),
        None => Err(FilterError::Unauthorized("missing secret".to_owned())),
    }
}

/// Compare secrets without an early exit on the first differing byte.
fn secret_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
