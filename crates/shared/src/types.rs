//! Cross-crate billing vocabulary

use serde::{Deserialize, Serialize};

/// Role of the caller within an account.
///
/// Only owners and admins may start checkout or confirm payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Owner,
    Admin,
    Editor,
    Viewer,
}

impl AccountRole {
    /// Whether this role may initiate billing operations.
    pub fn can_manage_billing(&self) -> bool {
        matches!(self, AccountRole::Owner | AccountRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Owner => "owner",
            AccountRole::Admin => "admin",
            AccountRole::Editor => "editor",
            AccountRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(AccountRole::Owner),
            "admin" => Some(AccountRole::Admin),
            "editor" => Some(AccountRole::Editor),
            "viewer" => Some(AccountRole::Viewer),
            _ => None,
        }
    }
}

/// Billing health mirrored onto the account row.
///
/// This field is only ever written inside the engine's atomic store
/// operations; anything that needs authoritative health re-reads the
/// subscription itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    /// Never had a subscription.
    None,
    /// Active paid subscription.
    Active,
    /// Renewal payment failed; access degraded.
    PastDue,
    /// Canceled or deactivated.
    Inactive,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::None => "none",
            BillingStatus::Active => "active",
            BillingStatus::PastDue => "past_due",
            BillingStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(BillingStatus::None),
            "active" => Some(BillingStatus::Active),
            "past_due" => Some(BillingStatus::PastDue),
            "inactive" => Some(BillingStatus::Inactive),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
