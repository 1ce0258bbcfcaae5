use std::fmt;
use std::path::Path;

use uuid::Uuid;

use crate::driver::StorageTarget;

/// Key naming the logical database a context is connected to.
///
/// Locks and broadcasts are scoped by this key: clients with equal identities serialize
/// writes and see each other's effects, clients with different identities never interact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseIdentity(String);

const MEMORY_IDENTITY: &str = ":memory:";

impl DatabaseIdentity {
    #[must_use]
    pub fn from_target(target: &StorageTarget) -> Self {
        match target {
            StorageTarget::Memory => DatabaseIdentity(MEMORY_IDENTITY.to_owned()),
            StorageTarget::File { path } | StorageTarget::ExclusiveFile { path } => {
                DatabaseIdentity(format!("file:{}", normalize_path(path)))
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_path(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Random key generated for every client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey(Uuid);

impl InstanceKey {
    #[must_use]
    pub fn new() -> Self {
        InstanceKey(Uuid::new_v4())
    }
}

impl Default for InstanceKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_flavors_share_identity() {
        let plain = StorageTarget::File {
            path: "data/app.sqlite3".into(),
        };
        let exclusive = StorageTarget::ExclusiveFile {
            path: "data/app.sqlite3".into(),
        };
        assert_eq!(
            DatabaseIdentity::from_target(&plain),
            DatabaseIdentity::from_target(&exclusive)
        );
    }

    #[test]
    fn memory_and_files_never_collide() {
        let memory = DatabaseIdentity::from_target(&StorageTarget::Memory);
        let file = DatabaseIdentity::from_target(&StorageTarget::File {
            path: ":memory:".into(),
        });
        assert_eq!(memory.as_str(), ":memory:");
        assert_ne!(memory, file);
    }
}
