//! Role + home-scope authorization for PHI access.
//!
//! The decision itself is a pure function over {role, active home
//! assignments, resource scope, PHI flag}. [`Guard`] wraps it so that every
//! decision touching a PHI resource, allowed or denied, produces exactly one
//! audit record carrying the resolved outcome.
//!
//! Rules:
//! - Admin bypasses home scope.
//! - Caregiver needs an active assignment to the home owning the resource.
//! - Sysadmin is denied PHI unconditionally; role membership is necessary
//!   but never sufficient for PHI.

use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditLedger, NewAuditRecord, Outcome};

/// Staff roles. Stored lowercase in the `identities.role` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    Caregiver,
    Sysadmin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Caregiver => "caregiver",
            Self::Sysadmin => "sysadmin",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "admin" => Ok(Self::Admin),
            "caregiver" => Ok(Self::Caregiver),
            "sysadmin" => Ok(Self::Sysadmin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(String);

/// Why a request was denied. Reasons stay server-side; responses carry only
/// a generic denial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("identity is inactive")]
    Inactive,
    #[error("required role not held")]
    RoleMissing,
    #[error("no active assignment to the owning home")]
    HomeScope,
    #[error("sysadmin role cannot access PHI")]
    SysadminPhi,
}

impl DenyReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::RoleMissing => "role_missing",
            Self::HomeScope => "home_scope",
            Self::SysadminPhi => "sysadmin_phi",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Whether the operation reads or mutates PHI. Mutations escalate an audit
/// append failure into operation failure; reads degrade to a logged fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhiAction {
    Read,
    Mutate,
}

impl PhiAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "phi.read",
            Self::Mutate => "phi.mutate",
        }
    }
}

/// The acting identity, resolved from the session by the caller.
#[derive(Clone, Debug)]
pub struct Actor {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub active: bool,
    /// Homes with an active assignment for this identity.
    pub assignments: Vec<Uuid>,
}

/// A PHI access request against a scoped resource.
#[derive(Clone, Debug)]
pub struct PhiRequest {
    pub action: PhiAction,
    pub resource_type: String,
    pub resource_id: String,
    /// Home owning the resource, when the resource is home-scoped.
    pub home_id: Option<Uuid>,
    pub required_roles: Vec<Role>,
    pub ip: Option<String>,
}

/// Pure decision function. No I/O, no dispatch.
#[must_use]
pub fn decide(actor: &Actor, request: &PhiRequest) -> Decision {
    if !actor.active {
        return Decision::Deny(DenyReason::Inactive);
    }
    // PHI tagging is layered over membership: even a Sysadmin listed in
    // required_roles never reaches PHI.
    if actor.role == Role::Sysadmin {
        return Decision::Deny(DenyReason::SysadminPhi);
    }
    if !request.required_roles.contains(&actor.role) {
        return Decision::Deny(DenyReason::RoleMissing);
    }
    if actor.role == Role::Caregiver {
        if let Some(home_id) = request.home_id {
            if !actor.assignments.contains(&home_id) {
                return Decision::Deny(DenyReason::HomeScope);
            }
        }
    }
    Decision::Allow
}

/// Audited decision point. One ledger write per decision, carrying the
/// resolved outcome.
pub struct Guard<'a> {
    ledger: &'a dyn AuditLedger,
}

impl<'a> Guard<'a> {
    #[must_use]
    pub fn new(ledger: &'a dyn AuditLedger) -> Self {
        Self { ledger }
    }

    /// Decide and record. For mutations, an append failure is returned to
    /// the caller so the surrounding transaction-less flows fail closed;
    /// mutation flows that own a transaction use `PgLedger::append_in_tx`
    /// directly instead.
    ///
    /// # Errors
    /// Returns an error if the audit append fails for a mutating action.
    pub async fn authorize(&self, actor: &Actor, request: &PhiRequest) -> Result<Decision> {
        let decision = decide(actor, request);
        let outcome = if decision.is_allow() {
            Outcome::Success
        } else {
            Outcome::Denied
        };

        let partition = request
            .home_id
            .map_or_else(|| crate::audit::GLOBAL_PARTITION.to_string(), |id| id.to_string());
        let mut record = NewAuditRecord::global(&actor.email, request.action.as_str(), outcome)
            .with_actor(actor.id)
            .with_resource(&request.resource_type, &request.resource_id)
            .with_partition(&partition)
            .with_ip(request.ip.clone());
        if let Decision::Deny(reason) = decision {
            record = record.with_detail(reason.as_str());
        }

        match request.action {
            PhiAction::Mutate => self.ledger.append(&record).await?,
            PhiAction::Read => self.ledger.append_best_effort(&record).await,
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Actor, Decision, DenyReason, Guard, PhiAction, PhiRequest, Role, decide,
    };
    use crate::audit::{AuditLedger, MemoryLedger};
    use anyhow::Result;
    use std::str::FromStr;
    use uuid::Uuid;

    fn actor(role: Role, assignments: Vec<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "staff@example.com".to_string(),
            role,
            active: true,
            assignments,
        }
    }

    fn client_read(home_id: Option<Uuid>) -> PhiRequest {
        PhiRequest {
            action: PhiAction::Read,
            resource_type: "client".to_string(),
            resource_id: Uuid::new_v4().to_string(),
            home_id,
            required_roles: vec![Role::Admin, Role::Caregiver],
            ip: None,
        }
    }

    #[test]
    fn role_round_trips() -> Result<()> {
        for role in [Role::Admin, Role::Caregiver, Role::Sysadmin] {
            assert_eq!(Role::from_str(role.as_str())?, role);
        }
        assert!(Role::from_str("resident").is_err());
        Ok(())
    }

    #[test]
    fn admin_bypasses_home_scope() {
        let home = Uuid::new_v4();
        let admin = actor(Role::Admin, Vec::new());
        assert_eq!(decide(&admin, &client_read(Some(home))), Decision::Allow);
    }

    #[test]
    fn caregiver_needs_assignment_to_owning_home() {
        let home_a = Uuid::new_v4();
        let home_b = Uuid::new_v4();
        let caregiver = actor(Role::Caregiver, vec![home_a]);

        assert_eq!(decide(&caregiver, &client_read(Some(home_a))), Decision::Allow);
        assert_eq!(
            decide(&caregiver, &client_read(Some(home_b))),
            Decision::Deny(DenyReason::HomeScope)
        );
    }

    #[test]
    fn sysadmin_denied_phi_unconditionally() {
        let home = Uuid::new_v4();
        let sysadmin = actor(Role::Sysadmin, vec![home]);
        let mut request = client_read(Some(home));
        // Even when the role list would admit sysadmin, PHI wins.
        request.required_roles = vec![Role::Sysadmin];
        assert_eq!(
            decide(&sysadmin, &request),
            Decision::Deny(DenyReason::SysadminPhi)
        );
    }

    #[test]
    fn inactive_identity_denied() {
        let mut admin = actor(Role::Admin, Vec::new());
        admin.active = false;
        assert_eq!(
            decide(&admin, &client_read(None)),
            Decision::Deny(DenyReason::Inactive)
        );
    }

    #[test]
    fn missing_role_denied() {
        let caregiver = actor(Role::Caregiver, Vec::new());
        let mut request = client_read(None);
        request.required_roles = vec![Role::Admin];
        assert_eq!(
            decide(&caregiver, &request),
            Decision::Deny(DenyReason::RoleMissing)
        );
    }

    #[tokio::test]
    async fn denied_decision_writes_exactly_one_denied_record() -> Result<()> {
        let ledger = MemoryLedger::new();
        let guard = Guard::new(&ledger);

        let home_a = Uuid::new_v4();
        let home_b = Uuid::new_v4();
        let caregiver = actor(Role::Caregiver, vec![home_a]);
        let request = client_read(Some(home_b));

        let decision = guard.authorize(&caregiver, &request).await?;
        assert_eq!(decision, Decision::Deny(DenyReason::HomeScope));

        let records = ledger.recent(&home_b.to_string(), 10).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "denied");
        assert_eq!(records[0].resource_type, "client");
        assert_eq!(records[0].detail.as_deref(), Some("home_scope"));
        Ok(())
    }

    #[tokio::test]
    async fn allowed_decision_writes_success_record() -> Result<()> {
        let ledger = MemoryLedger::new();
        let guard = Guard::new(&ledger);

        let home = Uuid::new_v4();
        let caregiver = actor(Role::Caregiver, vec![home]);
        let decision = guard.authorize(&caregiver, &client_read(Some(home))).await?;
        assert!(decision.is_allow());

        let records = ledger.recent(&home.to_string(), 10).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "success");
        Ok(())
    }

    #[tokio::test]
    async fn sysadmin_vitals_request_audits_client_resource() -> Result<()> {
        let ledger = MemoryLedger::new();
        let guard = Guard::new(&ledger);

        let home = Uuid::new_v4();
        let sysadmin = actor(Role::Sysadmin, Vec::new());
        let mut request = client_read(Some(home));
        request.resource_type = "client".to_string();

        let decision = guard.authorize(&sysadmin, &request).await?;
        assert_eq!(decision, Decision::Deny(DenyReason::SysadminPhi));

        let records = ledger.recent(&home.to_string(), 10).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_type, "client");
        assert_eq!(records[0].outcome, "denied");
        Ok(())
    }
}
