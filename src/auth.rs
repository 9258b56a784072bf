use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::observability::LOGINS_REJECTED_TOTAL;
use crate::venue::{DEFAULT_VENUE, venue_key};

/// Startup check for a connection: the venue it names must be usable and the
/// password must match the server's.
///
/// The login name is not a credential here. Statements later match it against
/// registered emails, so anyone holding the server password may present any
/// registered email.
#[derive(Debug)]
pub struct FieldbookAuthSource {
    password: String,
}

impl FieldbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// Venue key a login asks for. No database name means the default venue.
pub fn login_venue(database: Option<&str>) -> PgWireResult<String> {
    let requested = database.unwrap_or(DEFAULT_VENUE);
    venue_key(requested).map_err(|e| {
        metrics::counter!(LOGINS_REJECTED_TOTAL, "reason" => "venue").increment(1);
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".into(),
            "3D000".into(),
            format!("venue {requested:?}: {e}"),
        )))
    })
}

#[async_trait]
impl AuthSource for FieldbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let venue = login_venue(login.database())?;
        tracing::debug!("login {:?} for venue {venue}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::MAX_VENUE_NAME_LEN;

    #[test]
    fn login_venue_follows_venue_keys() {
        assert_eq!(login_venue(Some("club")).unwrap(), "club");
        assert_eq!(login_venue(Some("../club")).unwrap(), "club");
        assert_eq!(login_venue(None).unwrap(), DEFAULT_VENUE);
    }

    #[test]
    fn unusable_venue_refuses_login() {
        match login_venue(Some("../..")) {
            Err(PgWireError::UserError(info)) => {
                assert_eq!(info.severity, "FATAL");
                assert_eq!(info.code, "3D000");
            }
            other => panic!("expected a refused login, got {other:?}"),
        }
        assert!(login_venue(Some("")).is_err());
        assert!(login_venue(Some(&"x".repeat(MAX_VENUE_NAME_LEN + 1))).is_err());
    }
}
