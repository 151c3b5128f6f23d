use serde::{Deserialize, Serialize};

/// Canonical backend roles.
///
/// Courier roles carry an implicit geographic scope: level 1 (building)
/// through level 4 (city). The two admin roles bypass location checks
/// entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    CourierLevel1,
    CourierLevel2,
    CourierLevel3,
    CourierLevel4,
    PlatformAdmin,
    SuperAdmin,
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "courier_level1" | "courier" => Role::CourierLevel1,
            "courier_level2" => Role::CourierLevel2,
            "courier_level3" => Role::CourierLevel3,
            "courier_level4" => Role::CourierLevel4,
            "platform_admin" => Role::PlatformAdmin,
            "super_admin" => Role::SuperAdmin,
            _ => Role::User,
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::CourierLevel1 => "courier_level1",
            Role::CourierLevel2 => "courier_level2",
            Role::CourierLevel3 => "courier_level3",
            Role::CourierLevel4 => "courier_level4",
            Role::PlatformAdmin => "platform_admin",
            Role::SuperAdmin => "super_admin",
        };
        write!(f, "{}", s)
    }
}

impl Role {
    /// Courier scope level (1 = building … 4 = city), `None` for non-couriers.
    pub fn courier_level(&self) -> Option<u8> {
        match self {
            Role::CourierLevel1 => Some(1),
            Role::CourierLevel2 => Some(2),
            Role::CourierLevel3 => Some(3),
            Role::CourierLevel4 => Some(4),
            _ => None,
        }
    }

    /// Administrative override roles bypass the location permission engine.
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::PlatformAdmin | Role::SuperAdmin)
    }

    /// The vocabulary the frontend expects for this role.
    pub fn frontend_role(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::CourierLevel1 => "courier",
            Role::CourierLevel2 => "senior_courier",
            Role::CourierLevel3 => "courier_coordinator",
            Role::CourierLevel4 => "city_coordinator",
            Role::PlatformAdmin => "platform_admin",
            Role::SuperAdmin => "super_admin",
        }
    }
}

/// The capability set gated by the location permission engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    View,
    Edit,
    Create,
    Delete,
    Batch,
}

impl Capability {
    /// Display label shown to operators in permission diagnostics.
    pub fn display_label(&self) -> &'static str {
        match self {
            Capability::View => "查看",
            Capability::Edit => "编辑",
            Capability::Create => "创建",
            Capability::Delete => "删除",
            Capability::Batch => "批量操作",
        }
    }
}

/// The five capability flags a courier holds over one target location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub view: bool,
    pub edit: bool,
    pub create: bool,
    pub delete: bool,
    pub batch: bool,
}

impl PermissionSet {
    pub fn all() -> Self {
        Self {
            view: true,
            edit: true,
            create: true,
            delete: true,
            batch: true,
        }
    }

    pub fn none() -> Self {
        Self {
            view: false,
            edit: false,
            create: false,
            delete: false,
            batch: false,
        }
    }

    /// View and edit only, the building-level grant.
    pub fn view_edit() -> Self {
        Self {
            view: true,
            edit: true,
            create: false,
            delete: false,
            batch: false,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::View => self.view,
            Capability::Edit => self.edit,
            Capability::Create => self.create,
            Capability::Delete => self.delete,
            Capability::Batch => self.batch,
        }
    }
}

/// Inputs to the permission evaluator, derived from the principal record.
///
/// `managed_prefix` is the location-code prefix this courier administers
/// (up to 6 characters of `AABBCC`); it falls back to the legacy school
/// zone code when the courier record carries no explicit prefix.
#[derive(Debug, Clone)]
pub struct CourierProfile {
    pub id: String,
    pub level: u8,
    pub managed_prefix: String,
}

/// What the external principal resolver reports for one principal.
#[derive(Debug, Clone)]
pub struct PrincipalRecord {
    pub role: Role,
    pub school_code: Option<String>,
    pub managed_opcode: Option<String>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_canonical_strings() {
        for s in [
            "user",
            "courier_level1",
            "courier_level2",
            "courier_level3",
            "courier_level4",
            "platform_admin",
            "super_admin",
        ] {
            assert_eq!(Role::from(s).to_string(), s);
        }
    }

    #[test]
    fn unknown_role_falls_back_to_user() {
        assert_eq!(Role::from("moderator"), Role::User);
    }

    #[test]
    fn courier_levels() {
        assert_eq!(Role::CourierLevel1.courier_level(), Some(1));
        assert_eq!(Role::CourierLevel4.courier_level(), Some(4));
        assert_eq!(Role::PlatformAdmin.courier_level(), None);
    }

    #[test]
    fn permission_set_allows() {
        let set = PermissionSet::view_edit();
        assert!(set.allows(Capability::View));
        assert!(set.allows(Capability::Edit));
        assert!(!set.allows(Capability::Create));
        assert!(!set.allows(Capability::Delete));
        assert!(!set.allows(Capability::Batch));
    }
}
