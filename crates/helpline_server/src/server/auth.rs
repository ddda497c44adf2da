#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use helpline_domain::{Identity, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims carried by a `v1` identity token.
///
/// Tokens are minted by the external auth collaborator; this module only
/// verifies them and turns the claims into a caller `Identity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
	/// Stable user identifier (uuid).
	pub sub: String,
	/// Display name used to stamp outgoing messages.
	pub name: String,
	/// Expiry, Unix seconds.
	pub exp: u64,
}

/// Verify a `v1.<payload>.<sig>` token and extract the caller identity.
pub fn verify_identity_token(token: &str, secret: &str) -> anyhow::Result<Identity> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = hmac_sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: IdentityClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	let user_id = UserId::parse(&claims.sub).map_err(|e| anyhow!("token sub: {e}"))?;
	Identity::new(user_id, claims.name).map_err(|e| anyhow!("token name: {e}"))
}

/// Reference mint for the external auth contract; also used by tests.
pub fn sign_identity_token(claims: &IdentityClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = hmac_sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

fn hmac_sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(name: &str, exp_offset: i64) -> IdentityClaims {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
		IdentityClaims {
			sub: UserId::new_v4().to_string(),
			name: name.to_string(),
			exp: (now + exp_offset) as u64,
		}
	}

	#[test]
	fn verify_roundtrip() {
		let claims = claims("Alice", 600);
		let token = sign_identity_token(&claims, "s3cret").unwrap();
		let identity = verify_identity_token(&token, "s3cret").unwrap();
		assert_eq!(identity.name, "Alice");
		assert_eq!(identity.user_id.to_string(), claims.sub);
	}

	#[test]
	fn rejects_tampered_signature() {
		let token = sign_identity_token(&claims("Alice", 600), "s3cret").unwrap();
		assert!(verify_identity_token(&token, "other-secret").is_err());

		let mut forged = token.clone();
		forged.pop();
		forged.push('A');
		assert!(verify_identity_token(&forged, "s3cret").is_err());
	}

	#[test]
	fn rejects_expired_token() {
		let token = sign_identity_token(&claims("Alice", -5), "s3cret").unwrap();
		assert!(verify_identity_token(&token, "s3cret").is_err());
	}

	#[test]
	fn rejects_blank_display_name() {
		let token = sign_identity_token(&claims("   ", 600), "s3cret").unwrap();
		assert!(verify_identity_token(&token, "s3cret").is_err());
	}
}
