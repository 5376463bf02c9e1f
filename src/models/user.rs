//! User model and identity claims

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::ids::UserId;
use crate::error::AppError;

/// Account role, as issued by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Role {
    Admin,
    Librarian,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Librarian => "librarian",
            Role::Member => "member",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "librarian" => Ok(Role::Librarian),
            "member" => Ok(Role::Member),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// User row as referenced by loan records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: Role,
}

/// JWT Claims for authenticated users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: UserId,
    pub username: String,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

impl UserClaims {
    /// Claims for `user`, valid for `ttl_seconds`
    pub fn for_user(user: &User, ttl_seconds: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user.id,
            username: user.username.clone(),
            role: user.role,
            exp: now + ttl_seconds,
            iat: now,
        }
    }

    /// Create a new JWT token
    pub fn create_token(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{encode, EncodingKey, Header};
        encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }

    /// Parse JWT token
    pub fn from_token(token: &str, secret: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        let token_data = decode::<Self>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    pub fn user_id(&self) -> UserId {
        self.sub
    }

    /// Borrowing and returning are member operations
    pub fn require_member(&self) -> Result<(), AppError> {
        if self.role == Role::Member {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Only members can borrow or return books".to_string(),
            ))
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Librarian | Role::Admin)
    }

    /// Librarian or administrator
    pub fn require_staff(&self) -> Result<(), AppError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Librarian or administrator privileges required".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> User {
        User {
            id: UserId::new(),
            username: "member01".to_string(),
            role,
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let claims = UserClaims::for_user(&user(Role::Member), 3600);
        let token = claims.create_token("secret").unwrap();
        let parsed = UserClaims::from_token(&token, "secret").unwrap();
        assert_eq!(parsed.sub, claims.sub);
        assert_eq!(parsed.role, Role::Member);
    }

    #[test]
    fn test_token_wrong_secret() {
        let token = UserClaims::for_user(&user(Role::Admin), 3600)
            .create_token("secret")
            .unwrap();
        assert!(UserClaims::from_token(&token, "other").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = UserClaims::for_user(&user(Role::Member), -3600)
            .create_token("secret")
            .unwrap();
        assert!(UserClaims::from_token(&token, "secret").is_err());
    }

    #[test]
    fn test_role_checks() {
        let member = UserClaims::for_user(&user(Role::Member), 60);
        let librarian = UserClaims::for_user(&user(Role::Librarian), 60);
        let admin = UserClaims::for_user(&user(Role::Admin), 60);

        assert!(member.require_member().is_ok());
        assert!(member.require_staff().is_err());
        assert!(librarian.require_member().is_err());
        assert!(librarian.require_staff().is_ok());
        assert!(admin.require_staff().is_ok());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Librarian".parse::<Role>().unwrap(), Role::Librarian);
        assert!("guest".parse::<Role>().is_err());
    }
}
