//! Process identity and the one-way privilege downgrade.
//!
//! An image starts out [`Privilege::Privileged`] (the base image runs as
//! root). [`Privilege::downgrade`] is the only transition and it consumes the
//! current state, so there is no way to get a `Privileged` value back out of
//! an `Unprivileged` one.

use serde::Serialize;
use thiserror::Error;

/// Name the base image uses for uid 0.
pub const ROOT_USER: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity name must not be empty")]
    EmptyName,

    #[error("identity name '{0}' is not a valid account name")]
    InvalidName(String),

    #[error("identity '{name}' would be privileged (uid {uid}, gid {gid})")]
    Privileged { name: String, uid: u32, gid: u32 },

    #[error("image already runs as '{current}', cannot switch to '{requested}'")]
    AlreadyDowngraded { current: String, requested: String },
}

/// An unprivileged account created at build time.
///
/// Construction is only possible through [`Identity::unprivileged`], which
/// rejects uid/gid 0 and the `root` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    name: String,
    uid: u32,
    gid: u32,
}

impl Identity {
    pub fn unprivileged(name: &str, uid: u32, gid: u32) -> Result<Self, IdentityError> {
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        if name == ROOT_USER || uid == 0 || gid == 0 {
            return Err(IdentityError::Privileged {
                name: name.to_string(),
                uid,
                gid,
            });
        }
        // useradd(8) portable name rules: lowercase start, then [a-z0-9_-], max 32.
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid_start || !valid_rest || name.len() > 32 {
            return Err(IdentityError::InvalidName(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            uid,
            gid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }
}

/// Default execution identity of an image under construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "identity", rename_all = "lowercase")]
pub enum Privilege {
    #[default]
    Privileged,
    Unprivileged(Identity),
}

impl Privilege {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Privilege::Privileged)
    }

    /// The identity processes run as, or `None` while still root.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Privilege::Privileged => None,
            Privilege::Unprivileged(identity) => Some(identity),
        }
    }

    pub fn user_name(&self) -> &str {
        self.identity().map_or(ROOT_USER, Identity::name)
    }

    /// Switch the default identity to `identity`.
    ///
    /// Allowed exactly once per image lineage.
    pub fn downgrade(self, identity: Identity) -> Result<Privilege, IdentityError> {
        match self {
            Privilege::Privileged => Ok(Privilege::Unprivileged(identity)),
            Privilege::Unprivileged(current) => Err(IdentityError::AlreadyDowngraded {
                current: current.name,
                requested: identity.name,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprivileged_identity_accepts_regular_account() {
        let id = Identity::unprivileged("lethe", 1000, 1000).unwrap();
        assert_eq!(id.name(), "lethe");
        assert_eq!(id.uid(), 1000);
        assert_eq!(id.gid(), 1000);
    }

    #[test]
    fn test_unprivileged_identity_rejects_root() {
        assert!(matches!(
            Identity::unprivileged("root", 1000, 1000),
            Err(IdentityError::Privileged { .. })
        ));
        assert!(matches!(
            Identity::unprivileged("lethe", 0, 1000),
            Err(IdentityError::Privileged { .. })
        ));
        assert!(matches!(
            Identity::unprivileged("lethe", 1000, 0),
            Err(IdentityError::Privileged { .. })
        ));
    }

    #[test]
    fn test_unprivileged_identity_rejects_bad_names() {
        assert_eq!(
            Identity::unprivileged("", 1000, 1000),
            Err(IdentityError::EmptyName)
        );
        assert!(Identity::unprivileged("Lethe", 1000, 1000).is_err());
        assert!(Identity::unprivileged("le the", 1000, 1000).is_err());
        assert!(Identity::unprivileged("1lethe", 1000, 1000).is_err());
    }

    #[test]
    fn test_downgrade_is_one_way() {
        let id = Identity::unprivileged("lethe", 1000, 1000).unwrap();
        let state = Privilege::default();
        assert!(state.is_privileged());

        let state = state.downgrade(id.clone()).unwrap();
        assert!(!state.is_privileged());
        assert_eq!(state.user_name(), "lethe");

        let other = Identity::unprivileged("agent", 1001, 1001).unwrap();
        let err = state.downgrade(other).unwrap_err();
        assert_eq!(
            err,
            IdentityError::AlreadyDowngraded {
                current: "lethe".to_string(),
                requested: "agent".to_string()
            }
        );
    }
}
