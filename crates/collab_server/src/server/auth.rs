#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use collab_domain::{RoomName, SecretString};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

/// Version tag every accepted token starts with.
const TOKEN_VERSION: &str = "v1";

/// Claims carried by a connect token.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectClaims {
	/// Authenticated username; backs the `username` query parameter when a
	/// connection omits one.
	pub sub: String,

	/// When present, the token only admits this room.
	#[serde(default)]
	pub room: Option<String>,

	pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("malformed token")]
	Malformed,

	#[error("token signature mismatch")]
	BadSignature,

	#[error("token expired")]
	Expired,

	#[error("token is not valid for room {requested}")]
	WrongRoom {
		requested: String,
	},

	#[error("unreadable token claims: {0}")]
	Claims(#[from] serde_json::Error),
}

/// Pick the token out of an `Authorization: Bearer` header, falling back to
/// the `token` query parameter.
pub fn bearer_or_query_token<'a>(auth_header: Option<&'a str>, query_token: Option<&'a str>) -> Option<&'a str> {
	auth_header
		.and_then(|h| h.strip_prefix("Bearer "))
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.or(query_token.map(str::trim).filter(|t| !t.is_empty()))
}

/// Admit a connect token for the requested room.
///
/// Tokens are `v1.<claims-b64url>.<sig-b64url>` with the signature taken
/// over the encoded claims. A token carrying a `room` claim is scoped: it
/// admits that room and nothing else.
pub fn authorize(token: &str, secret: &SecretString, requested: &RoomName) -> Result<ConnectClaims, AuthError> {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	let claims = verify_at(token, secret, now)?;

	if let Some(scope) = claims.room.as_deref()
		&& scope != requested.as_str()
	{
		return Err(AuthError::WrongRoom {
			requested: requested.as_str().to_string(),
		});
	}

	Ok(claims)
}

/// Signature and expiry checks against an explicit clock.
fn verify_at(token: &str, secret: &SecretString, now: u64) -> Result<ConnectClaims, AuthError> {
	let rest = token.strip_prefix(TOKEN_VERSION).ok_or(AuthError::Malformed)?;
	let rest = rest.strip_prefix('.').ok_or(AuthError::Malformed)?;
	let (claims_b64, sig_b64) = rest.split_once('.').ok_or(AuthError::Malformed)?;

	let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;
	// verify_slice compares in constant time.
	let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose().as_bytes()).map_err(|_| AuthError::BadSignature)?;
	mac.update(claims_b64.as_bytes());
	mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

	let claims_json = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| AuthError::Malformed)?;
	let claims: ConnectClaims = serde_json::from_slice(&claims_json)?;

	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}
