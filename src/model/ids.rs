use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Fresh time-sortable identifier.
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

record_id!(
    /// Key of a `CommandPolicyGroup`.
    GroupId
);
record_id!(GrantId);
record_id!(RequestId);
record_id!(ServerGroupId);
record_id!(DirectoryGroupId);
record_id!(
    /// Key of a `ServerExceptionWindow`.
    WindowId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_sortable() {
        let a = GrantId::generate();
        let b = GrantId::generate();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = GroupId::from("grp-web");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"grp-web\"");
    }
}
