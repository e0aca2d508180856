//! Id types for the fleet.

use crate::define_id;

define_id!(WorkspaceId, "ws");
define_id!(NodeId, "node");
define_id!(OrgId, "org");
define_id!(RegistryId, "reg");

impl OrgId {
    /// Owner of warm-pool workspaces that have not been handed to a customer
    /// yet. Those are never auto-stopped.
    #[must_use]
    pub const fn unassigned() -> Self {
        Self::nil()
    }

    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        *self == Self::unassigned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_workspace_id_roundtrip() {
        let id = WorkspaceId::new();
        let parsed: WorkspaceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("ws_"));
    }

    #[test]
    fn test_node_id_rejected_as_workspace_id() {
        let node = NodeId::new().to_string();
        let err = WorkspaceId::parse(&node).unwrap_err();
        assert!(matches!(err, IdError::InvalidPrefix { expected: "ws", .. }));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(OrgId::parse("").unwrap_err(), IdError::Empty);
        assert_eq!(
            OrgId::parse("org01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err(),
            IdError::MissingSeparator
        );
        assert!(matches!(
            OrgId::parse("org_not-a-ulid").unwrap_err(),
            IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = RegistryId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: RegistryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_unassigned_org_is_stable() {
        let org = OrgId::unassigned();
        assert!(org.is_unassigned());
        assert!(!OrgId::new().is_unassigned());
        assert_eq!(
            org.to_string(),
            "org_00000000000000000000000000"
        );
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let first = WorkspaceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = WorkspaceId::new();
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn parse_never_panics(input in ".{0,40}") {
            let _ = NodeId::parse(&input);
        }
    }
}
