//! Scope hierarchy types
//!
//! Four scope kinds form a strict inclusion chain:
//! global ⊃ organization ⊃ project ⊃ session. Entries are owned by exactly
//! one scope; queries may inherit from ancestor scopes.

use crate::{AgentId, OrgId, ProjectId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// SCOPE KIND AND REFERENCE
// ============================================================================

/// The four scope kinds, ordered from least to most specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Org,
    Project,
    Session,
}

impl ScopeKind {
    /// Specificity rank: global = 0 ... session = 3. Higher wins ties.
    pub fn specificity(&self) -> u8 {
        match self {
            ScopeKind::Global => 0,
            ScopeKind::Org => 1,
            ScopeKind::Project => 2,
            ScopeKind::Session => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::Org => "org",
            ScopeKind::Project => "project",
            ScopeKind::Session => "session",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(ScopeKind::Global),
            "org" | "organization" => Ok(ScopeKind::Org),
            "project" => Ok(ScopeKind::Project),
            "session" => Ok(ScopeKind::Session),
            other => Err(format!("unknown scope kind: {other}")),
        }
    }
}

/// Reference to a scope: `(kind, id)`, where `id` is `None` only for
/// the global scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeRef {
    #[serde(rename = "type")]
    pub kind: ScopeKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<Uuid>,
}

impl ScopeRef {
    pub fn global() -> Self {
        Self {
            kind: ScopeKind::Global,
            id: None,
        }
    }

    pub fn org(id: OrgId) -> Self {
        Self {
            kind: ScopeKind::Org,
            id: Some(crate::IdType::as_uuid(&id)),
        }
    }

    pub fn project(id: ProjectId) -> Self {
        Self {
            kind: ScopeKind::Project,
            id: Some(crate::IdType::as_uuid(&id)),
        }
    }

    pub fn session(id: SessionId) -> Self {
        Self {
            kind: ScopeKind::Session,
            id: Some(crate::IdType::as_uuid(&id)),
        }
    }

    pub fn is_global(&self) -> bool {
        self.kind == ScopeKind::Global
    }

    /// A scope reference is well-formed when it carries an id exactly for
    /// the non-global kinds.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            ScopeKind::Global => self.id.is_none(),
            _ => self.id.is_some(),
        }
    }

    /// Specificity of the referenced scope.
    pub fn specificity(&self) -> u8 {
        self.kind.specificity()
    }

    /// Stable cache-key fragment (`kind:id` or `kind:-`).
    ///
    /// A missing id renders as `-`, never as the string "null", so it can
    /// not collide with a scope literally named null.
    pub fn cache_key(&self) -> String {
        match self.id {
            Some(id) => format!("{}:{}", self.kind, id),
            None => format!("{}:-", self.kind),
        }
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}/{}", self.kind, id),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

// ============================================================================
// SCOPE CHAIN
// ============================================================================

/// Ordered list of scopes from most specific up to global.
///
/// Inheritance unions are computed most-specific first, so a chain built
/// for `session S` reads `[session S, project P, org O, global]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeChain(Vec<ScopeRef>);

impl ScopeChain {
    /// Build a chain from an already-ordered list. The last element must
    /// be the global scope.
    pub fn new(scopes: Vec<ScopeRef>) -> Self {
        debug_assert!(matches!(scopes.last(), Some(s) if s.is_global()));
        Self(scopes)
    }

    /// Chain containing only the global scope.
    pub fn global_only() -> Self {
        Self(vec![ScopeRef::global()])
    }

    pub fn scopes(&self) -> &[ScopeRef] {
        &self.0
    }

    pub fn contains(&self, scope: &ScopeRef) -> bool {
        self.0.contains(scope)
    }

    /// Position of a scope in the chain; 0 is most specific.
    pub fn position(&self, scope: &ScopeRef) -> Option<usize> {
        self.0.iter().position(|s| s == scope)
    }

    /// Scope-specificity contribution for scoring: most specific scope in
    /// the chain scores 1.0, global scores 1/len.
    pub fn specificity_weight(&self, scope: &ScopeRef) -> f64 {
        match self.position(scope) {
            Some(pos) => (self.0.len() - pos) as f64 / self.0.len() as f64,
            None => 0.0,
        }
    }

    /// Whether `ancestor` is at or above `descendant` in this chain.
    pub fn is_ancestor_or_self(&self, ancestor: &ScopeRef, descendant: &ScopeRef) -> bool {
        match (self.position(descendant), self.position(ancestor)) {
            (Some(d), Some(a)) => a >= d,
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a ScopeChain {
    type Item = &'a ScopeRef;
    type IntoIter = std::slice::Iter<'a, ScopeRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// SCOPE RECORDS
// ============================================================================

/// Organization record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Org {
    pub org_id: OrgId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub metadata: Option<serde_json::Value>,
}

/// Project record. Every project belongs to an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: ProjectId,
    pub org_id: OrgId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub metadata: Option<serde_json::Value>,
}

/// Session record. Every session belongs to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub agent_id: Option<AgentId>,
    pub name: String,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdType;

    #[test]
    fn test_scope_kind_ordering() {
        assert!(ScopeKind::Global.specificity() < ScopeKind::Org.specificity());
        assert!(ScopeKind::Org.specificity() < ScopeKind::Project.specificity());
        assert!(ScopeKind::Project.specificity() < ScopeKind::Session.specificity());
    }

    #[test]
    fn test_scope_ref_well_formed() {
        assert!(ScopeRef::global().is_well_formed());
        assert!(ScopeRef::project(ProjectId::now_v7()).is_well_formed());

        let bad = ScopeRef {
            kind: ScopeKind::Project,
            id: None,
        };
        assert!(!bad.is_well_formed());

        let bad_global = ScopeRef {
            kind: ScopeKind::Global,
            id: Some(uuid::Uuid::now_v7()),
        };
        assert!(!bad_global.is_well_formed());
    }

    #[test]
    fn test_cache_key_distinguishes_missing_id() {
        assert_eq!(ScopeRef::global().cache_key(), "global:-");
        // A project literally named "null" can never collide with a
        // missing id.
        assert!(!ScopeRef::global().cache_key().contains("null"));
    }

    #[test]
    fn test_chain_positions_and_weights() {
        let project = ScopeRef::project(ProjectId::now_v7());
        let org = ScopeRef::org(OrgId::now_v7());
        let chain = ScopeChain::new(vec![project, org, ScopeRef::global()]);

        assert_eq!(chain.position(&project), Some(0));
        assert_eq!(chain.position(&ScopeRef::global()), Some(2));
        assert!(chain.specificity_weight(&project) > chain.specificity_weight(&org));
        assert!(chain.specificity_weight(&org) > chain.specificity_weight(&ScopeRef::global()));
        assert!(chain.is_ancestor_or_self(&ScopeRef::global(), &project));
        assert!(!chain.is_ancestor_or_self(&project, &ScopeRef::global()));
    }

    #[test]
    fn test_scope_kind_parse() {
        assert_eq!("session".parse::<ScopeKind>().unwrap(), ScopeKind::Session);
        assert_eq!("organization".parse::<ScopeKind>().unwrap(), ScopeKind::Org);
        assert!("galaxy".parse::<ScopeKind>().is_err());
    }
}
