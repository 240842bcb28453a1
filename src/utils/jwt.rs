//! Signing and verification helpers built on `jsonwebtoken`.
//!
//! Two distinct operations live here: signing an `IdToken` with a provider's
//! own key (`encode_id_token`), and verifying an inbound RFC 7523 client
//! assertion against a candidate key of unknown provenance
//! (`decode_assertion_with_key`, `decoding_key_from_jwk`).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::models::IdToken;

/// Claims decoded from an inbound RFC 7523 client assertion. Only the
/// fields this core inspects are named; everything else is preserved in
/// `extra` (e.g. a `jti` a caller wants to log).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssertionClaims {
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AssertionClaims {
    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.exp.map(|exp| exp <= now_secs).unwrap_or(false)
    }
}

/// Parses a provider's configured algorithm name.
pub fn parse_algorithm(name: &str) -> anyhow::Result<Algorithm> {
    match name {
        "RS256" => Ok(Algorithm::RS256),
        "ES256" => Ok(Algorithm::ES256),
        "HS256" => Ok(Algorithm::HS256),
        other => anyhow::bail!("unsupported algorithm: {other}"),
    }
}

/// Builds the `EncodingKey` a provider signs its ID tokens with.
pub fn encoding_key_from_pem(pem: &str, alg: Algorithm) -> anyhow::Result<EncodingKey> {
    match alg {
        Algorithm::RS256 => Ok(EncodingKey::from_rsa_pem(pem.as_bytes())?),
        Algorithm::ES256 => Ok(EncodingKey::from_ec_pem(pem.as_bytes())?),
        other => anyhow::bail!("unsupported signing algorithm: {other:?}"),
    }
}

/// Builds a `DecodingKey` from a static X.509 certificate's public key.
pub fn decoding_key_from_certificate(cert_pem: &str) -> anyhow::Result<DecodingKey> {
    if let Ok(key) = DecodingKey::from_rsa_pem(cert_pem.as_bytes()) {
        return Ok(key);
    }
    Ok(DecodingKey::from_ec_pem(cert_pem.as_bytes())?)
}

/// Derives an RSA `DecodingKey` from the public half of a private key PEM,
/// so a provider whose registered certificate has gone stale relative to a
/// rotated private key still verifies against the key actually in use.
/// Tried before `decoding_key_from_certificate` whenever a `VerificationKey`
/// carries a `private_key_pem`. EC private keys have no equivalent path here
/// (no P-256 crate is carried by this dependency stack) and fall back to the
/// certificate.
pub fn decoding_key_from_private_key(private_key_pem: &str) -> anyhow::Result<DecodingKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))?;
    let public_key_pem = private_key.to_public_key().to_public_key_pem(LineEnding::LF)?;
    Ok(DecodingKey::from_rsa_pem(public_key_pem.as_bytes())?)
}

/// Builds a `(DecodingKey, Algorithm)` pair from a single JWK entry.
/// Supports the three key types an OIDC provider's JWKS realistically
/// advertises: RSA, EC, and symmetric (`oct`).
pub fn decoding_key_from_jwk(jwk: &serde_json::Value) -> anyhow::Result<(DecodingKey, Algorithm)> {
    let kty = jwk
        .get("kty")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("jwk missing kty"))?;

    match kty {
        "RSA" => {
            let n = jwk_str(jwk, "n")?;
            let e = jwk_str(jwk, "e")?;
            let alg = jwk.get("alg").and_then(|v| v.as_str()).unwrap_or("RS256");
            Ok((DecodingKey::from_rsa_components(n, e)?, parse_algorithm(alg)?))
        }
        "EC" => {
            let x = jwk_str(jwk, "x")?;
            let y = jwk_str(jwk, "y")?;
            let alg = jwk.get("alg").and_then(|v| v.as_str()).unwrap_or("ES256");
            Ok((DecodingKey::from_ec_components(x, y)?, parse_algorithm(alg)?))
        }
        "oct" => {
            let k = jwk_str(jwk, "k")?;
            let secret = URL_SAFE_NO_PAD.decode(k)?;
            let alg = jwk.get("alg").and_then(|v| v.as_str()).unwrap_or("HS256");
            Ok((DecodingKey::from_secret(&secret), parse_algorithm(alg)?))
        }
        other => anyhow::bail!("unsupported jwk kty: {other}"),
    }
}

fn jwk_str<'a>(jwk: &'a serde_json::Value, field: &str) -> anyhow::Result<&'a str> {
    jwk.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("jwk missing {field}"))
}

/// Attempts to verify `token` against a single candidate key. Returns
/// `None` on any failure (bad signature, malformed JWS, wrong key type) so
/// callers can move on to the next candidate; only the caller's overall
/// loop decides when exhaustion means `invalid_grant`.
///
/// `exp` is deliberately not checked here (`validate_exp = false`,
/// `required_spec_claims` cleared) — expiry is optional per RFC 7523 and
/// checked once, explicitly, by the caller after a signature has verified.
pub fn decode_assertion_with_key(
    token: &str,
    key: &DecodingKey,
    alg: Algorithm,
) -> Option<AssertionClaims> {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    decode::<AssertionClaims>(token, key, &validation)
        .ok()
        .map(|data| data.claims)
}

/// Signs an `IdToken`'s claims with the provider's own key, producing a
/// compact JWS.
pub fn encode_id_token(claims: &IdToken, key: &EncodingKey, alg: Algorithm) -> Result<String, CoreError> {
    let header = Header::new(alg);
    encode(&header, claims, key).map_err(|e| CoreError::Signing(format!("id token signing failed: {e}")))
}

/// `at_hash` per OIDC Core §3.1.3.6: base64url of the left half of the
/// SHA-256 digest of the access token's ASCII bytes.
pub fn compute_at_hash(access_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::EncodingKey as JwtEncodingKey;

    const TEST_PRIVATE_KEY: &str = include_str!("../../keys/private.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../../keys/public.pem");

    fn sample_id_token() -> IdToken {
        IdToken {
            iss: "https://issuer.example".into(),
            sub: "user-1".into(),
            aud: "client-1".into(),
            exp: 9_999_999_999,
            iat: 1,
            nonce: Some("n1".into()),
            at_hash: compute_at_hash("some-access-token"),
        }
    }

    #[test]
    fn id_token_round_trips_through_rs256() {
        let encoding_key = JwtEncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let decoding_key = DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap();

        let claims = sample_id_token();
        let jws = encode_id_token(&claims, &encoding_key, Algorithm::RS256).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client-1"]);
        let decoded = decode::<IdToken>(&jws, &decoding_key, &validation).unwrap();
        assert_eq!(decoded.claims.sub, "user-1");
        assert_eq!(decoded.claims.at_hash, claims.at_hash);
    }

    #[test]
    fn at_hash_is_left_half_of_sha256() {
        let hash = compute_at_hash("access-token-value");
        let decoded = URL_SAFE_NO_PAD.decode(&hash).unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn assertion_decode_fails_closed_on_wrong_key() {
        let encoding_key = JwtEncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let claims = AssertionClaims {
            sub: "client-1".into(),
            iss: Some("client-1".into()),
            exp: None,
            extra: HashMap::new(),
        };
        let header = Header::new(Algorithm::RS256);
        let jws = encode(&header, &claims, &encoding_key).unwrap();

        let bogus_jwk = serde_json::json!({
            "kty": "oct",
            "k": URL_SAFE_NO_PAD.encode(b"not-the-right-key"),
            "alg": "HS256",
        });
        let (key, alg) = decoding_key_from_jwk(&bogus_jwk).unwrap();
        assert!(decode_assertion_with_key(&jws, &key, alg).is_none());
    }

    #[test]
    fn assertion_decode_succeeds_with_matching_key() {
        let encoding_key = JwtEncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let decoding_key = DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap();
        let claims = AssertionClaims {
            sub: "client-1".into(),
            iss: Some("client-1".into()),
            exp: None,
            extra: HashMap::new(),
        };
        let header = Header::new(Algorithm::RS256);
        let jws = encode(&header, &claims, &encoding_key).unwrap();

        let decoded = decode_assertion_with_key(&jws, &decoding_key, Algorithm::RS256).unwrap();
        assert_eq!(decoded.sub, "client-1");
    }

    #[test]
    fn private_key_derived_decoding_key_verifies_tokens_signed_by_the_same_key() {
        let encoding_key = JwtEncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let claims = AssertionClaims {
            sub: "client-1".into(),
            iss: None,
            exp: None,
            extra: HashMap::new(),
        };
        let header = Header::new(Algorithm::RS256);
        let jws = encode(&header, &claims, &encoding_key).unwrap();

        let decoding_key = decoding_key_from_private_key(TEST_PRIVATE_KEY).unwrap();
        let decoded = decode_assertion_with_key(&jws, &decoding_key, Algorithm::RS256).unwrap();
        assert_eq!(decoded.sub, "client-1");
    }

    #[test]
    fn jwk_rsa_components_build_a_usable_decoding_key() {
        // Exercises the JWKS pass's key-construction path without a network fetch.
        let jwk = serde_json::json!({
            "kty": "RSA",
            "n": "0Z3qX2BTLS4e0ek55tJqNnFXRjCxLJQGxKHHKFpSgaQPkEkNOPWgWnLZHYHGLSqMdLOqoFgKg7wMHFoVrYHGwXsZBGfn-0XBqJlIUGTpMKKbKcLhwFtYgRxq8O5VBqdkgySgNByCMIaQJoQTFPmgR7azMgFcqaJmyTqo2RCHQJ8oKbQJxzgMPBj-0dL0MYchlwLPhAQcWnqBwCFG4lYwTN-sBD1nQqeAIaGsLfPNBD8znTICCPWDXQOV1WVXQFN5K3PqfuBDLmnnApGGf_RZuACin8aBxdj1LmBPTqHLpVPHCUreF5aEdkWOD5QlKJFFKFpIp9TP3bueshBKkxYRUQ",
            "e": "AQAB",
            "alg": "RS256",
        });
        let (_key, alg) = decoding_key_from_jwk(&jwk).unwrap();
        assert_eq!(alg, Algorithm::RS256);
    }
}
