use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Proof that the caller logged in as the shop administrator.
///
/// Only [`Role::admin_token`] hands these out, so an admin operation's
/// signature is its access check.
#[derive(Debug)]
pub struct AdminToken(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Public,
    Admin,
}

impl Role {
    pub fn for_user(user: Option<&str>, admin_user: &str) -> Self {
        match user {
            Some(u) if u == admin_user => Role::Admin,
            _ => Role::Public,
        }
    }

    pub fn admin_token(&self) -> Option<AdminToken> {
        match self {
            Role::Admin => Some(AdminToken(())),
            Role::Public => None,
        }
    }
}

/// Cleartext password check: the admin user has its own password, every other
/// user shares the public one. Without an admin password the admin user
/// cannot log in at all.
#[derive(Debug)]
pub struct BarberAuthSource {
    public_password: String,
    admin_user: String,
    admin_password: Option<String>,
}

impl BarberAuthSource {
    pub fn new(public_password: String, admin_user: String, admin_password: Option<String>) -> Self {
        Self {
            public_password,
            admin_user,
            admin_password,
        }
    }

    fn password_for(&self, user: Option<&str>) -> Option<&str> {
        match Role::for_user(user, &self.admin_user) {
            Role::Admin => self.admin_password.as_deref(),
            Role::Public => Some(&self.public_password),
        }
    }
}

#[async_trait]
impl AuthSource for BarberAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(password) = self.password_for(login.user()) else {
            tracing::warn!(user = ?login.user(), "admin login refused: no admin password configured");
            return Err(PgWireError::InvalidPassword(
                login.user().unwrap_or_default().to_owned(),
            ));
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
