//! Permission tokens, matching and conditional grants.
//!
//! A permission is a `resource:action` token. Tokens containing `*` are
//! parsed once into a [`PermissionPattern`] so matching never builds a regex
//! from caller-supplied text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// The token that satisfies every check.
pub const SUPERUSER: &str = "*";

/// Parsed form of a permission token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionPattern {
    /// `*`
    Any,
    /// `resource:action`
    Exact(String),
    /// `resource:*`
    ResourceWildcard(String),
    /// `*:action`
    ActionWildcard(String),
    /// Any other token with `*` in it, where `*` matches any run of characters.
    Glob(String),
}

impl PermissionPattern {
    pub fn parse(token: &str) -> Self {
        if token == SUPERUSER {
            return PermissionPattern::Any;
        }
        if !token.contains('*') {
            return PermissionPattern::Exact(token.to_string());
        }
        match token.split_once(':') {
            Some((resource, "*")) if !resource.contains('*') && !resource.is_empty() => {
                PermissionPattern::ResourceWildcard(resource.to_string())
            }
            Some(("*", action)) if !action.contains('*') && !action.is_empty() => {
                PermissionPattern::ActionWildcard(action.to_string())
            }
            _ => PermissionPattern::Glob(token.to_string()),
        }
    }

    pub fn matches(&self, resource: &str, action: &str) -> bool {
        match self {
            PermissionPattern::Any => true,
            PermissionPattern::Exact(token) => token
                .split_once(':')
                .is_some_and(|(r, a)| r == resource && a == action),
            PermissionPattern::ResourceWildcard(r) => r == resource,
            PermissionPattern::ActionWildcard(a) => a == action,
            PermissionPattern::Glob(pattern) => {
                glob_match(pattern, &format!("{}:{}", resource, action))
            }
        }
    }

    pub fn match_kind(&self) -> MatchKind {
        match self {
            PermissionPattern::Any => MatchKind::Superuser,
            PermissionPattern::Exact(_) => MatchKind::Exact,
            PermissionPattern::ResourceWildcard(_) => MatchKind::ResourceWildcard,
            PermissionPattern::ActionWildcard(_) => MatchKind::ActionWildcard,
            PermissionPattern::Glob(_) => MatchKind::Pattern,
        }
    }
}

/// `*` matches any (possibly empty) run of characters; everything else is literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = ti;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Which rule granted a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Superuser,
    Exact,
    ResourceWildcard,
    ActionWildcard,
    Pattern,
    Conditional,
}

/// A user's effective permissions in one organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    grants: BTreeSet<String>,
    patterns: Vec<PermissionPattern>,
}

impl PermissionSet {
    pub fn new<I, S>(grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let grants: BTreeSet<String> = grants
            .into_iter()
            .map(Into::into)
            .filter(|g: &String| !g.trim().is_empty())
            .collect();
        let patterns = grants
            .iter()
            .map(|g| PermissionPattern::parse(g))
            .filter(|p| matches!(p, PermissionPattern::Glob(_)))
            .collect();
        Self { grants, patterns }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.grants.contains(token)
    }

    pub fn is_superuser(&self) -> bool {
        self.grants.contains(SUPERUSER)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(String::as_str)
    }

    /// Match order: `*`, exact, `resource:*`, `*:action`, then glob patterns.
    pub fn grants(&self, resource: &str, action: &str) -> Option<MatchKind> {
        if self.is_superuser() {
            return Some(MatchKind::Superuser);
        }
        if self.grants.contains(&format!("{}:{}", resource, action)) {
            return Some(MatchKind::Exact);
        }
        if self.grants.contains(&format!("{}:*", resource)) {
            return Some(MatchKind::ResourceWildcard);
        }
        if self.grants.contains(&format!("*:{}", action)) {
            return Some(MatchKind::ActionWildcard);
        }
        self.patterns
            .iter()
            .find(|p| p.matches(resource, action))
            .map(PermissionPattern::match_kind)
    }

    /// Same rules as [`grants`](Self::grants) for a `resource:action` token.
    /// Tokens without a colon only match literally or through `*`.
    pub fn grants_token(&self, token: &str) -> bool {
        match token.split_once(':') {
            Some((resource, action)) => self.grants(resource, action).is_some(),
            None => self.is_superuser() || self.contains(token),
        }
    }

    /// True if any listed token is granted. An empty list grants nothing
    /// except to a superuser.
    pub fn grants_any<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        self.is_superuser() || tokens.iter().any(|t| self.grants_token(t.as_ref()))
    }

    /// True if every listed token is granted. An empty list is vacuously true.
    pub fn grants_all<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        self.is_superuser() || tokens.iter().all(|t| self.grants_token(t.as_ref()))
    }
}

/// A single authorization question. Not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub user_id: String,
    pub organization_id: String,
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl PermissionCheck {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            resource: resource.into(),
            action: action.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn permission(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<MatchKind>,
}

impl PermissionDecision {
    pub fn allow(matched_by: MatchKind) -> Self {
        Self {
            allowed: true,
            reason: None,
            matched_by: Some(matched_by),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            matched_by: None,
        }
    }

    pub fn missing(permission: &str) -> Self {
        Self::deny(format!("Missing permission: {}", permission))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// A predicate attached to a conditional grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionCondition {
    /// Dot path into the caller-supplied context, e.g. `request.amount`.
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    /// How this condition combines with the next one.
    #[serde(default)]
    pub logic: ConditionLogic,
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid permission condition: {0}")]
pub struct ConditionError(#[from] serde_json::Error);

impl PermissionCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logic: ConditionLogic::And,
        }
    }

    pub fn with_logic(mut self, logic: ConditionLogic) -> Self {
        self.logic = logic;
        self
    }

    /// Parse a stored condition. Unknown operators and fields are rejected.
    pub fn from_value(value: Value) -> Result<Self, ConditionError> {
        Ok(serde_json::from_value(value)?)
    }

    /// A missing field fails the condition.
    pub fn evaluate(&self, context: &Value) -> bool {
        let Some(actual) = lookup_path(context, &self.field) else {
            return false;
        };
        let expected = &self.value;
        match self.operator {
            ConditionOperator::Eq => json_eq(actual, expected),
            ConditionOperator::Neq => !json_eq(actual, expected),
            ConditionOperator::Gt => json_cmp(actual, expected) == Some(Ordering::Greater),
            ConditionOperator::Gte => matches!(
                json_cmp(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConditionOperator::Lt => json_cmp(actual, expected) == Some(Ordering::Less),
            ConditionOperator::Lte => matches!(
                json_cmp(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConditionOperator::In => match expected {
                Value::Array(items) => items.iter().any(|item| json_eq(actual, item)),
                _ => false,
            },
            ConditionOperator::Contains => match (actual, expected) {
                (Value::Array(items), _) => items.iter().any(|item| json_eq(item, expected)),
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                _ => false,
            },
        }
    }
}

/// Evaluate left to right; each condition's `logic` joins it to the next.
/// An empty list grants nothing.
pub fn evaluate_conditions(conditions: &[PermissionCondition], context: &Value) -> bool {
    let Some((first, rest)) = conditions.split_first() else {
        return false;
    };

    let mut result = first.evaluate(context);
    let mut logic = first.logic;
    for condition in rest {
        let value = condition.evaluate(context);
        result = match logic {
            ConditionLogic::And => result && value,
            ConditionLogic::Or => result || value,
        };
        logic = condition.logic;
    }
    result
}

fn lookup_path<'v>(context: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl fmt::Display for PermissionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionPattern::Any => f.write_str(SUPERUSER),
            PermissionPattern::Exact(t) | PermissionPattern::Glob(t) => f.write_str(t),
            PermissionPattern::ResourceWildcard(r) => write!(f, "{}:*", r),
            PermissionPattern::ActionWildcard(a) => write!(f, "*:{}", a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tags_segments() {
        assert_eq!(PermissionPattern::parse("*"), PermissionPattern::Any);
        assert_eq!(
            PermissionPattern::parse("project:delete"),
            PermissionPattern::Exact("project:delete".into())
        );
        assert_eq!(
            PermissionPattern::parse("project:*"),
            PermissionPattern::ResourceWildcard("project".into())
        );
        assert_eq!(
            PermissionPattern::parse("*:view"),
            PermissionPattern::ActionWildcard("view".into())
        );
        assert_eq!(
            PermissionPattern::parse("proj*:de*"),
            PermissionPattern::Glob("proj*:de*".into())
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("proj*:*", "project:delete"));
        assert!(glob_match("*:de*", "item:delete"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("project:view", "project:views"));
    }

    #[test]
    fn test_any_and_all_token_lists() {
        let set = PermissionSet::new(["audit:view", "member:*"]);
        assert!(set.grants_any(&["audit:export", "audit:view"]));
        assert!(!set.grants_any(&["audit:export"]));
        assert!(!set.grants_any::<&str>(&[]));
        assert!(set.grants_all(&["audit:view", "member:manage"]));
        assert!(!set.grants_all(&["audit:view", "audit:export"]));
        assert!(set.grants_all::<&str>(&[]));
    }

    #[test]
    fn test_resource_wildcard_grants_any_action() {
        let set = PermissionSet::new(["workspace:view", "project:*"]);
        assert_eq!(
            set.grants("project", "delete"),
            Some(MatchKind::ResourceWildcard)
        );
        assert_eq!(set.grants("workspace", "view"), Some(MatchKind::Exact));
        assert_eq!(set.grants("workspace", "delete"), None);
    }

    #[test]
    fn test_action_wildcard_and_glob() {
        let set = PermissionSet::new(["*:view", "bill*:export"]);
        assert_eq!(set.grants("item", "view"), Some(MatchKind::ActionWildcard));
        assert_eq!(set.grants("billing", "export"), Some(MatchKind::Pattern));
        assert_eq!(set.grants("billing", "update"), None);
    }

    #[test]
    fn test_superuser_subsumes_everything() {
        let set = PermissionSet::new(["*"]);
        assert_eq!(set.grants("anything", "at-all"), Some(MatchKind::Superuser));
        assert!(set.grants_token("organization:delete"));
    }

    #[test]
    fn test_every_wildcard_matches_its_own_token() {
        for token in ["project:*", "*:view", "proj*:v*", "*"] {
            let set = PermissionSet::new([token]);
            let (resource, action) = token.split_once(':').unwrap_or(("*", "*"));
            assert!(set.grants(resource, action).is_some(), "{}", token);
        }
    }

    #[test]
    fn test_condition_lte() {
        let condition = PermissionCondition::new("request.amount", ConditionOperator::Lte, json!(1000));
        assert!(condition.evaluate(&json!({"request": {"amount": 500}})));
        assert!(condition.evaluate(&json!({"request": {"amount": 1000.0}})));
        assert!(!condition.evaluate(&json!({"request": {"amount": 5000}})));
        assert!(!condition.evaluate(&json!({"request": {}})));
    }

    #[test]
    fn test_condition_in_and_contains() {
        let within = PermissionCondition::new("region", ConditionOperator::In, json!(["eu", "us"]));
        assert!(within.evaluate(&json!({"region": "eu"})));
        assert!(!within.evaluate(&json!({"region": "apac"})));

        let tags = PermissionCondition::new("tags", ConditionOperator::Contains, json!("public"));
        assert!(tags.evaluate(&json!({"tags": ["public", "beta"]})));
        let name = PermissionCondition::new("name", ConditionOperator::Contains, json!("draft"));
        assert!(name.evaluate(&json!({"name": "q3-draft-plan"})));
    }

    #[test]
    fn test_conditions_chain_with_own_logic() {
        let conditions = vec![
            PermissionCondition::new("a", ConditionOperator::Eq, json!(1))
                .with_logic(ConditionLogic::Or),
            PermissionCondition::new("b", ConditionOperator::Eq, json!(2)),
            PermissionCondition::new("c", ConditionOperator::Neq, json!(3)),
        ];
        // (a==1 OR b==2) AND c!=3
        assert!(evaluate_conditions(&conditions, &json!({"a": 0, "b": 2, "c": 4})));
        assert!(!evaluate_conditions(&conditions, &json!({"a": 1, "b": 0, "c": 3})));
        assert!(!evaluate_conditions(&[], &json!({})));
    }

    #[test]
    fn test_unknown_operator_rejected_at_load() {
        let raw = json!({"field": "amount", "operator": "regex", "value": ".*"});
        assert!(PermissionCondition::from_value(raw).is_err());

        let raw = json!({"field": "amount", "operator": "gte", "value": 10, "logic": "or"});
        let parsed = PermissionCondition::from_value(raw).unwrap();
        assert_eq!(parsed.operator, ConditionOperator::Gte);
        assert_eq!(parsed.logic, ConditionLogic::Or);
    }
}
