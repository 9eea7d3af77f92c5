// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::Result as JWTResult, DecodingKey, EncodingKey, Header};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Admin permissions
pub const ADMIN: &[&str] = &["read", "write", "sign", "admin"];
/// Signing permissions
pub const SIGN: &[&str] = &["read", "write", "sign"];
/// Writing permissions
pub const WRITE: &[&str] = &["read", "write"];
/// Reading permissions
pub const READ: &[&str] = &["read"];

/// Claim structure for JWT Tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "Allow")]
    allow: Vec<String>,
    // Expiration time (as UTC timestamp)
    #[serde(default)]
    exp: Option<usize>,
}

/// Create a new JWT token granting the listed permissions.
pub fn create_token(perms: Vec<String>, key: &[u8], token_exp: Duration) -> JWTResult<String> {
    let exp_time = Utc::now() + token_exp;
    let payload = Claims {
        allow: perms,
        exp: Some(exp_time.timestamp() as usize),
    };
    encode(&Header::default(), &payload, &EncodingKey::from_secret(key))
}

/// Create a token that never expires, for service-to-service use.
pub fn create_token_without_exp(perms: Vec<String>, key: &[u8]) -> JWTResult<String> {
    let payload = Claims {
        allow: perms,
        exp: None,
    };
    encode(&Header::default(), &payload, &EncodingKey::from_secret(key))
}

/// Verify a JWT token and return the permissions it grants.
pub fn verify_token(token: &str, key: &[u8]) -> JWTResult<Vec<String>> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::default());
    // tokens without exp are accepted; expired ones are not
    let mut claims = validation.required_spec_claims.clone();
    claims.remove("exp");
    let buff: Vec<_> = claims.iter().collect();
    validation.set_required_spec_claims(&buff);
    let token = decode::<Claims>(token, &DecodingKey::from_secret(key), &validation)?;
    Ok(token.claims.allow)
}

/// Generate a fresh JWT secret.
pub fn generate_secret() -> Vec<u8> {
    rand::thread_rng().gen::<[u8; 32]>().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify_token() {
        let perms_expected: Vec<String> = WRITE.iter().map(|s| s.to_string()).collect();
        let key = generate_secret();

        // Token duration of 1 hour. Validation must pass.
        let token = create_token(
            perms_expected.clone(),
            &key,
            Duration::try_hours(1).expect("Infallible"),
        )
        .unwrap();
        let perms = verify_token(&token, &key).unwrap();
        assert_eq!(perms_expected, perms);

        // Token duration of -1 hour (already expired). Validation must fail.
        let token = create_token(
            perms_expected.clone(),
            &key,
            -Duration::try_hours(1).expect("Infallible"),
        )
        .unwrap();
        assert!(verify_token(&token, &key).is_err());

        // Wrong secret. Validation must fail.
        let token = create_token(perms_expected, &key, Duration::try_hours(1).unwrap()).unwrap();
        assert!(verify_token(&token, &generate_secret()).is_err());
    }

    #[test]
    fn create_and_verify_token_without_exp() {
        let perms_expected: Vec<String> = ADMIN.iter().map(|s| s.to_string()).collect();
        let key = generate_secret();

        let token = create_token_without_exp(perms_expected.clone(), &key).unwrap();
        let perms = verify_token(&token, &key).unwrap();
        assert_eq!(perms_expected, perms);
    }
}
