//! Bearer credentials held for the duration of one session.
//!
//! The admin and user tokens are separate types: the identity lookup only
//! accepts an [`AdminToken`] and the authorization query only accepts a
//! [`UserToken`].

use std::fmt;

/// Locally minted assertion that authenticates the portal itself.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminToken(String);

/// Delegated credential for one resolved user, issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct UserToken(String);

impl AdminToken {
    pub(crate) fn new(raw: String) -> Self {
        Self(raw)
    }

    /// Raw bearer value for the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl UserToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw bearer value for the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Never print token material, even at debug level.
impl fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminToken(..)")
    }
}

impl fmt::Debug for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserToken(..)")
    }
}
