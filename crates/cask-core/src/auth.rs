//! Authorization database collaborator.
//!
//! A JSON document `{"keys": {"<key>": {"userid", "email"?, "allow"?,
//! "password"?}}}`. `allow`, when present and non-empty, restricts the key
//! to peer addresses contained in any listed CIDR (a bare IP counts as a
//! full-length prefix). When no database is configured, every operation
//! proceeds unauthenticated.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthDb {
    pub keys: HashMap<String, KeyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyEntry {
    pub userid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub password: Option<String>,
}

/// The account a successful authentication resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub userid: String,
    pub email: Option<String>,
}

impl Account {
    /// Account used when no database is present: manifests live directly
    /// under `backups/`.
    pub fn anonymous() -> Account {
        Account {
            userid: String::new(),
            email: None,
        }
    }
}

impl AuthDb {
    /// Load the database at `path`; `Ok(None)` when the file is absent.
    pub fn load(path: &Path) -> Result<Option<AuthDb>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Resolve a key presented from `addr` to an account, or deny.
    pub fn authenticate(&self, key: &str, addr: IpAddr) -> Option<Account> {
        let entry = self.keys.get(key)?;
        if let Some(allow) = entry.allow.as_deref() {
            if !allow.is_empty() && !allow.iter().any(|cidr| cidr_contains(cidr, addr)) {
                debug!(userid = %entry.userid, %addr, "key denied by allow list");
                return None;
            }
        }
        Some(Account {
            userid: entry.userid.clone(),
            email: entry.email.clone(),
        })
    }
}

/// Authenticate against an optional database; absence means open access.
pub fn authenticate(db: Option<&AuthDb>, key: &str, addr: IpAddr) -> Option<Account> {
    match db {
        Some(db) => db.authenticate(key, addr),
        None => Some(Account::anonymous()),
    }
}

/// True when `addr` falls inside `cidr` (`a.b.c.d/nn`, `x::y/nn`, or a bare
/// address, which is an exact match).
fn cidr_contains(cidr: &str, addr: IpAddr) -> bool {
    let (net, prefix) = match cidr.split_once('/') {
        Some((net, prefix)) => {
            let Ok(prefix) = prefix.parse::<u32>() else {
                return false;
            };
            (net, Some(prefix))
        }
        None => (cidr, None),
    };
    let Ok(net) = net.parse::<IpAddr>() else {
        return false;
    };
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            u32::from(net) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}
