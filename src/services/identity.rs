use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{PrincipalRecord, Role};

/// Validated token contents. The JWT library itself is an external
/// collaborator; only this interface is consumed by the gateway.
#[derive(Debug, Clone)]
pub struct Claims {
    pub principal_id: String,
    pub role: Role,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> anyhow::Result<Claims>;
}

/// Looks up the courier record behind a principal: role, legacy school zone
/// code, managed location-code prefix, and whether the account is active.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, principal_id: &str) -> anyhow::Result<Option<PrincipalRecord>>;
}

/// Local-stack token shim accepting `dev:<principal>:<role>` tokens.
///
/// Deployments wire the platform's JWT validator through [`TokenVerifier`];
/// this implementation exists for the local stack and tests only and
/// rejects everything that is not a dev token.
pub struct DevTokenVerifier;

#[async_trait]
impl TokenVerifier for DevTokenVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut parts = token.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("dev"), Some(id), Some(role)) if !id.is_empty() => Ok(Claims {
                principal_id: id.to_string(),
                role: Role::from(role),
            }),
            _ => anyhow::bail!("invalid token"),
        }
    }
}

/// In-memory principal directory for tests and the local stack.
#[derive(Default)]
pub struct StaticPrincipalResolver {
    records: HashMap<String, PrincipalRecord>,
}

impl StaticPrincipalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, principal_id: &str, record: PrincipalRecord) -> Self {
        self.records.insert(principal_id.to_string(), record);
        self
    }
}

#[async_trait]
impl PrincipalResolver for StaticPrincipalResolver {
    async fn resolve(&self, principal_id: &str) -> anyhow::Result<Option<PrincipalRecord>> {
        Ok(self.records.get(principal_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_verifier_parses_dev_tokens() {
        let claims = DevTokenVerifier.verify("dev:u1:courier_level2").await.unwrap();
        assert_eq!(claims.principal_id, "u1");
        assert_eq!(claims.role, Role::CourierLevel2);
    }

    #[tokio::test]
    async fn dev_verifier_rejects_foreign_tokens() {
        assert!(DevTokenVerifier.verify("eyJhbGciOi...").await.is_err());
        assert!(DevTokenVerifier.verify("dev::user").await.is_err());
    }

    #[tokio::test]
    async fn static_resolver_round_trips() {
        let resolver = StaticPrincipalResolver::new().with_record(
            "u1",
            PrincipalRecord {
                role: Role::CourierLevel3,
                school_code: Some("PK".into()),
                managed_opcode: None,
                is_active: true,
            },
        );
        let record = resolver.resolve("u1").await.unwrap().unwrap();
        assert_eq!(record.school_code.as_deref(), Some("PK"));
        assert!(resolver.resolve("u2").await.unwrap().is_none());
    }
}
