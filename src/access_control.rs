// Access control for namespace operations.
//
// Evaluation is a fixed tiered pipeline, checked in order:
// 1. blockedOperations  -> deny
// 2. allowedOperations  -> allow
// 3. permissions[]      -> allow on principal-type + target + condition match
// 4. accessRules[]      -> first match in descending priority wins
// 5. default            -> deny
//
// Evaluation is deterministic: the same principal against the same
// namespace state always yields the same verdict (rules are ordered by
// priority, ties broken by rule id).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::module_metadata::TenantId;

/// What kind of actor a principal or permission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Role,
    Module,
    Tenant,
    System,
}

/// The resolved caller identity used for access checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    /// Roles held by the principal, matched by Role-typed permissions
    pub roles: Vec<String>,
    pub tenant: Option<TenantId>,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::User,
            roles: Vec::new(),
            tenant: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// Operations subject to access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceOp {
    Read,
    Write,
    Delete,
    Admin,
    Export,
    Import,
}

impl NamespaceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceOp::Read => "read",
            NamespaceOp::Write => "write",
            NamespaceOp::Delete => "delete",
            NamespaceOp::Admin => "admin",
            NamespaceOp::Export => "export",
            NamespaceOp::Import => "import",
        }
    }
}

impl std::fmt::Display for NamespaceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A key/value condition evaluated against the request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessCondition {
    pub key: String,
    pub equals: Value,
}

impl AccessCondition {
    pub fn new(key: impl Into<String>, equals: Value) -> Self {
        Self {
            key: key.into(),
            equals,
        }
    }

    fn matches(&self, ctx: &HashMap<String, Value>) -> bool {
        ctx.get(&self.key) == Some(&self.equals)
    }
}

/// Grants operations to principals matched by type and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    /// Which principal attribute `target` is matched against
    pub kind: PrincipalKind,
    /// User -> principal id, Role -> held role, Module/Tenant -> context
    pub target: String,
    pub operations: Vec<NamespaceOp>,
    #[serde(default)]
    pub conditions: Vec<AccessCondition>,
}

impl Permission {
    pub fn grant(kind: PrincipalKind, target: impl Into<String>, operations: Vec<NamespaceOp>) -> Self {
        Self {
            kind,
            target: target.into(),
            operations,
            conditions: Vec::new(),
        }
    }

    fn matches(
        &self,
        principal: &Principal,
        op: NamespaceOp,
        ctx: &HashMap<String, Value>,
    ) -> bool {
        if !self.operations.contains(&op) {
            return false;
        }
        let target_hit = match self.kind {
            PrincipalKind::User => principal.kind == PrincipalKind::User && principal.id == self.target,
            PrincipalKind::Role => principal.roles.iter().any(|r| r == &self.target),
            PrincipalKind::Module => ctx
                .get("module")
                .and_then(|v| v.as_str())
                .map(|m| m == self.target)
                .unwrap_or(false),
            PrincipalKind::Tenant => principal
                .tenant
                .as_ref()
                .map(|t| t.as_str() == self.target)
                .unwrap_or(false),
            PrincipalKind::System => principal.kind == PrincipalKind::System,
        };
        target_hit && self.conditions.iter().all(|c| c.matches(ctx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// Priority-ordered rule; first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: String,
    pub priority: i32,
    pub effect: Effect,
    /// Principal ids this rule applies to; "*" matches any
    pub principals: Vec<String>,
    pub operations: Vec<NamespaceOp>,
    #[serde(default)]
    pub conditions: Vec<AccessCondition>,
}

impl AccessRule {
    fn matches(
        &self,
        principal: &Principal,
        op: NamespaceOp,
        ctx: &HashMap<String, Value>,
    ) -> bool {
        self.operations.contains(&op)
            && self
                .principals
                .iter()
                .any(|p| p == "*" || p == &principal.id)
            && self.conditions.iter().all(|c| c.matches(ctx))
    }
}

/// Per-namespace access control state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessControl {
    #[serde(default)]
    pub blocked_operations: HashSet<NamespaceOp>,
    #[serde(default)]
    pub allowed_operations: HashSet<NamespaceOp>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

/// Verdict of an access check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    /// Which tier produced the verdict
    pub reason: String,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

impl AccessControl {
    pub fn permissive() -> Self {
        Self {
            allowed_operations: [
                NamespaceOp::Read,
                NamespaceOp::Write,
                NamespaceOp::Delete,
                NamespaceOp::Admin,
                NamespaceOp::Export,
                NamespaceOp::Import,
            ]
            .into_iter()
            .collect(),
            ..Self::default()
        }
    }

    pub fn block(mut self, op: NamespaceOp) -> Self {
        self.blocked_operations.insert(op);
        self
    }

    pub fn allow_op(mut self, op: NamespaceOp) -> Self {
        self.allowed_operations.insert(op);
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn rule(mut self, rule: AccessRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Evaluate the tiered pipeline. `principal = None` means the engine
    /// itself is calling and is always allowed.
    pub fn evaluate(
        &self,
        principal: Option<&Principal>,
        op: NamespaceOp,
        ctx: &HashMap<String, Value>,
    ) -> AccessDecision {
        let principal = match principal {
            Some(p) => p,
            None => return AccessDecision::allow("system caller"),
        };

        if self.blocked_operations.contains(&op) {
            return AccessDecision::deny(format!("operation {} is blocked", op));
        }

        if self.allowed_operations.contains(&op) {
            return AccessDecision::allow(format!("operation {} is open", op));
        }

        for permission in &self.permissions {
            if permission.matches(principal, op, ctx) {
                return AccessDecision::allow(format!(
                    "permission for {:?} '{}'",
                    permission.kind, permission.target
                ));
            }
        }

        // Descending priority, ties broken by id for determinism.
        let mut rules: Vec<&AccessRule> = self.rules.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        for rule in rules {
            if rule.matches(principal, op, ctx) {
                return match rule.effect {
                    Effect::Allow => AccessDecision::allow(format!("rule '{}'", rule.id)),
                    Effect::Deny => AccessDecision::deny(format!("rule '{}'", rule.id)),
                };
            }
        }

        AccessDecision::deny("no matching grant")
    }
}
