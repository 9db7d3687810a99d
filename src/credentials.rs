//! Credential Broker (component C): issues and retires ephemeral MySQL
//! principals scoped to a run's Keycloak group roles.
//!
//! Grounded in `original_source/src/mysql_service.py`, which builds every
//! statement below by interpolating `db_user`/`db_pass`/group names directly
//! into a SQL string, since MySQL's `CREATE USER`/`CREATE ROLE`/`GRANT`
//! can't bind identifiers as parameters through a prepared statement. The
//! broker keeps that same shape but closes the injection vector it opens:
//! `db_user`/`db_pass` are generated by this process and already hex, and
//! every caller-supplied role name is checked against [`is_safe_identifier`]
//! before it touches a query string.

use sqlx::MySqlPool;
use uuid::Uuid;

use crate::config::DbSettings;
use crate::error::{Error, Result};
use crate::model::DbPrincipal;

/// A role/identifier is safe to interpolate if it's non-empty and composed
/// only of ASCII alphanumerics and underscores: the shape MySQL identifiers
/// in this system are always generated or configured with.
fn is_safe_identifier(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub struct CredentialBroker {
    pool: MySqlPool,
}

impl CredentialBroker {
    pub async fn connect(settings: &DbSettings) -> Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}/mysql",
            settings.username, settings.password, settings.host
        );
        let pool = MySqlPool::connect(&url).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create a fresh principal, grant it `SELECT` via each role in `roles`,
    /// and set those roles as its default roles (spec.md §4.C).
    pub async fn create_db_principal(&self, roles: &[String]) -> Result<DbPrincipal> {
        for role in roles {
            if !is_safe_identifier(role) {
                return Err(Error::ProvisionFailed(format!(
                    "refusing to grant malformed role name: {role}"
                )));
            }
        }

        let db_user = Uuid::new_v4().simple().to_string();
        let db_pass = Uuid::new_v4().simple().to_string();

        sqlx::query(&format!("drop user if exists '{db_user}'"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "create user '{db_user}' identified by '{db_pass}'"
        ))
        .execute(&self.pool)
        .await?;

        for role in roles {
            sqlx::query(&format!("create role if not exists '{role}'"))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!("grant select on build_test.* to '{role}'"))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!("grant '{role}' to '{db_user}'"))
                .execute(&self.pool)
                .await?;
        }

        if !roles.is_empty() {
            let role_list = roles
                .iter()
                .map(|r| format!("'{r}'"))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!(
                "alter user '{db_user}' default role {role_list}"
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(DbPrincipal {
            user: db_user,
            password: db_pass,
        })
    }

    /// Drop a principal previously issued by [`Self::create_db_principal`].
    /// Best-effort: the caller is reaping a finished run and a missing or
    /// already-dropped user shouldn't block cleanup.
    pub async fn delete_principal(&self, db_user: &str) -> Result<()> {
        if !is_safe_identifier(db_user) {
            return Err(Error::ProvisionFailed(format!(
                "refusing to drop malformed user name: {db_user}"
            )));
        }
        sqlx::query(&format!("drop user if exists '{db_user}'"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    async fn user_exists(&self, db_user: &str) -> bool {
        sqlx::query("select 1 from mysql.user where user = ?")
            .bind(db_user)
            .fetch_optional(&self.pool)
            .await
            .unwrap()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_alphanumeric_and_underscore() {
        assert!(is_safe_identifier("analytics_ro"));
        assert!(is_safe_identifier("abc123"));
    }

    #[test]
    fn rejects_empty_and_shell_metacharacters() {
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("role'; drop table users; --"));
        assert!(!is_safe_identifier("role with spaces"));
        assert!(!is_safe_identifier("role-with-dash"));
    }

    // Exercising `create_db_principal`/`delete_principal` against a live
    // MySQL server is left to integration tests run against a real
    // database; this module only asserts the identifier guard, which is
    // pure and needs no connection.
    #[allow(dead_code)]
    async fn uses_pool_without_panicking(pool: MySqlPool) {
        let broker = CredentialBroker::from_pool(pool);
        let _ = broker.user_exists("nonexistent").await;
    }
}
