use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use pairline_types::api::Claims;
use pairline_types::validate_user_id;

/// Verify a bearer token issued by the identity provider.
///
/// Returns the claims only when the signature and expiry check out and the
/// subject is usable as a channel participant.
pub fn verify_token(token: &str, secret: &str) -> Option<Claims> {
    let token_data = match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data,
        Err(e) => {
            debug!("Rejected token: {}", e);
            return None;
        }
    };

    if let Err(e) = validate_user_id(&token_data.claims.sub) {
        debug!("Rejected token subject: {}", e);
        return None;
    }

    Some(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.into(),
            email: Some(format!("{}@example.com", sub)),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let claims = verify_token(&token("u1", 3600), SECRET).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        assert!(verify_token(&token("u1", 3600), "other-secret").is_none());
        assert!(verify_token(&token("u1", -3600), SECRET).is_none());
        assert!(verify_token("not-a-token", SECRET).is_none());
    }

    #[test]
    fn rejects_unusable_subject() {
        assert!(verify_token(&token("a_b", 3600), SECRET).is_none());
        assert!(verify_token(&token("", 3600), SECRET).is_none());
    }
}
