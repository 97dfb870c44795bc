// Copyright 2026 O7 Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session-token claim signing and extraction.
//!
//! Service-account and STS session tokens are JWTs signed with the
//! server's secret key. The claims carried in them drive the evaluator's
//! claim validation.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::Value;

use crate::error::IamError;

/// Claim naming the parent user of a service account or STS credential.
pub const PARENT_CLAIM: &str = "parent";

/// Claim selecting how a service account is policed.
pub const SA_POLICY_CLAIM: &str = "sa-policy";

/// `SA_POLICY_CLAIM` value: the base64 session policy in the claims applies.
pub const SA_POLICY_EMBEDDED: &str = "embedded-policy";

/// `SA_POLICY_CLAIM` value: the parent's mapped policies apply unchanged.
pub const SA_POLICY_INHERITED: &str = "inherited-policy";

/// Claim carrying an inline session policy (base64 of policy JSON).
pub const SESSION_POLICY_CLAIM: &str = "sessionPolicy";

/// Claim naming the directory user behind directory-mode STS credentials.
pub const DIRECTORY_USER_CLAIM: &str = "ldapUser";

/// Claim carrying the policy names granted by an OpenID provider.
pub const OPENID_POLICY_CLAIM: &str = "policy";

/// Claim embedding the access key the token was issued for.
pub const ACCESS_KEY_CLAIM: &str = "accessKey";

/// Signs a claim map into a session token for `access_key`.
pub fn sign_claims(
    access_key: &str,
    claims: &HashMap<String, Value>,
    secret_key: &str,
) -> Result<String, IamError> {
    let mut payload = serde_json::Map::new();
    for (name, value) in claims {
        payload.insert(name.clone(), value.clone());
    }
    payload.insert(ACCESS_KEY_CLAIM.to_string(), Value::from(access_key));

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS512),
        &payload,
        &EncodingKey::from_secret(secret_key.as_bytes()),
    )
    .map_err(|_| IamError::InvalidToken)
}

/// Verifies a session token and returns its claim map.
///
/// Service-account tokens carry no `exp`; expiry for temporary
/// credentials is tracked on the identity record, so none is enforced
/// here.
pub fn extract_claims(
    token: &str,
    secret_key: &str,
) -> Result<HashMap<String, Value>, IamError> {
    let mut validation = Validation::new(Algorithm::HS512);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<serde_json::Map<String, Value>>(
        token,
        &DecodingKey::from_secret(secret_key.as_bytes()),
        &validation,
    )
    .map_err(|_| IamError::InvalidToken)?;

    Ok(data.claims.into_iter().collect())
}

/// Looks up a string claim.
pub fn lookup(claims: &HashMap<String, Value>, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "server-secret-key-for-tests";

    #[test]
    fn test_sign_and_extract_round_trip() {
        let claims = HashMap::from([
            (PARENT_CLAIM.to_string(), Value::from("alice")),
            (SA_POLICY_CLAIM.to_string(), Value::from(SA_POLICY_INHERITED)),
        ]);

        let token = sign_claims("SVCKEY", &claims, SECRET).unwrap();
        let decoded = extract_claims(&token, SECRET).unwrap();

        assert_eq!(lookup(&decoded, PARENT_CLAIM).as_deref(), Some("alice"));
        assert_eq!(
            lookup(&decoded, SA_POLICY_CLAIM).as_deref(),
            Some(SA_POLICY_INHERITED)
        );
        assert_eq!(lookup(&decoded, ACCESS_KEY_CLAIM).as_deref(), Some("SVCKEY"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = HashMap::new();
        let token = sign_claims("SVCKEY", &claims, SECRET).unwrap();
        assert!(matches!(
            extract_claims(&token, "a-different-secret"),
            Err(IamError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(matches!(
            extract_claims("not-a-jwt", SECRET),
            Err(IamError::InvalidToken)
        ));
    }
}
