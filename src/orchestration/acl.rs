//! # Group ACLs
//!
//! Reader/writer group membership checks for callers that do not present an
//! execution token.

use crate::config::AclConfig;
use crate::error::{DmError, DmResult};
use std::collections::BTreeSet;
use tracing::debug;

/// An authenticated caller, as established by the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            user: user.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Default)]
pub struct AclChecker {
    config: AclConfig,
}

impl AclChecker {
    pub fn from_config(config: &AclConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Writers are implicitly readers.
    pub fn allows(&self, identity: &Identity, access: Access) -> bool {
        let member_of = |groups: &BTreeSet<String>| !groups.is_disjoint(&identity.groups);
        match access {
            Access::Write => member_of(&self.config.writer_groups),
            Access::Read => {
                member_of(&self.config.reader_groups) || member_of(&self.config.writer_groups)
            }
        }
    }

    pub fn check(&self, identity: &Identity, access: Access) -> DmResult<()> {
        if self.allows(identity, access) {
            return Ok(());
        }
        debug!(user = %identity.user, ?access, "ACL check failed");
        Err(DmError::PermissionDenied(format!(
            "{} lacks {} access",
            identity.user,
            match access {
                Access::Read => "read",
                Access::Write => "write",
            }
        )))
    }
}
