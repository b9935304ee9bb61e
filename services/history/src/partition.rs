use std::fmt;

/// Subject under which a tenant's notifications are stored.
pub const NOTIFICATIONS_SUBJECT: &str = "notifications";

/// Name of the storage partition (collection) holding one tenant's data for
/// one subject: a device id or [`NOTIFICATIONS_SUBJECT`].
///
/// The name is `{tenant}_{subject}`. Tenants or subjects containing `_` can
/// collide (`admin_dev` + `1` vs `admin` + `dev_1`); this matches the naming
/// already present in deployed databases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn resolve(tenant: &str, subject: &str) -> Self {
        Self(format!("{}_{}", tenant, subject))
    }

    pub fn notifications(tenant: &str) -> Self {
        Self::resolve(tenant, NOTIFICATIONS_SUBJECT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PartitionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_device_partition() {
        assert_eq!(PartitionKey::resolve("admin", "dev1").as_str(), "admin_dev1");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        assert_eq!(
            PartitionKey::resolve("admin", "dev1"),
            PartitionKey::resolve("admin", "dev1")
        );
    }

    #[test]
    fn test_notifications_partition() {
        assert_eq!(
            PartitionKey::notifications("admin").to_string(),
            "admin_notifications"
        );
        assert_eq!(
            PartitionKey::notifications("admin"),
            PartitionKey::resolve("admin", NOTIFICATIONS_SUBJECT)
        );
    }
}
