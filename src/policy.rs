//! Policy documents and evaluation.
//!
//! A policy is a versioned, ordered list of statements gating which actions
//! a role may perform against a key. Evaluation is default-deny: absence of
//! a matching Allow statement is a denial, and there is no explicit Deny
//! effect — any effect other than the exact string "Allow" is inert.

use serde::{Deserialize, Serialize};

/// Action names checked against policy statements, one per endpoint.
pub mod actions {
    pub const CREATE_KEY: &str = "create-key";
    pub const LIST_KEYS: &str = "list-keys";
    pub const GET_KEY: &str = "get-key";
    pub const DELETE_KEY: &str = "delete-key";
    pub const ROTATE_KEY: &str = "rotate-key";
    pub const ENCRYPT: &str = "encrypt";
    pub const DECRYPT: &str = "decrypt";
}

/// Versioned policy document. Immutable once fetched for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Policy {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub statement: Vec<Statement>,
}

/// One allow-rule. Principal and resource are carried through from the
/// stored document but do not participate in matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub effect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(default)]
    pub action: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS", default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<String>,
}

/// Scan the policy's statements in document order and return true on the
/// first statement whose effect is exactly "Allow" and whose action set
/// contains `action` (exact string match, no wildcard expansion).
pub fn is_action_allowed(policy: &Policy, action: &str) -> bool {
    policy
        .statement
        .iter()
        .any(|stmt| stmt.effect == "Allow" && stmt.action.iter().any(|a| a == action))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(actions: &[&str]) -> Statement {
        Statement {
            effect: "Allow".to_string(),
            principal: None,
            action: actions.iter().map(|a| a.to_string()).collect(),
            resource: None,
        }
    }

    fn policy_with(statements: Vec<Statement>) -> Policy {
        Policy {
            version: "2012-10-17".to_string(),
            statement: statements,
        }
    }

    #[test]
    fn test_allow_statement_grants_listed_action() {
        let policy = policy_with(vec![allow(&["encrypt"])]);
        assert!(is_action_allowed(&policy, "encrypt"));
        assert!(!is_action_allowed(&policy, "decrypt"));
    }

    #[test]
    fn test_empty_policy_denies_everything() {
        let policy = policy_with(vec![]);
        assert!(!is_action_allowed(&policy, "encrypt"));
        assert!(!is_action_allowed(&policy, ""));
    }

    #[test]
    fn test_non_allow_effect_is_inert() {
        let mut denied = allow(&["encrypt"]);
        denied.effect = "Deny".to_string();
        let policy = policy_with(vec![denied]);
        assert!(!is_action_allowed(&policy, "encrypt"));
    }

    #[test]
    fn test_effect_match_is_exact() {
        let mut stmt = allow(&["encrypt"]);
        stmt.effect = "allow".to_string();
        let policy = policy_with(vec![stmt]);
        assert!(!is_action_allowed(&policy, "encrypt"));
    }

    #[test]
    fn test_action_match_is_exact_no_wildcards() {
        let policy = policy_with(vec![allow(&["*", "encrypt-all"])]);
        assert!(!is_action_allowed(&policy, "encrypt"));
        assert!(is_action_allowed(&policy, "*"));
    }

    #[test]
    fn test_any_matching_statement_suffices() {
        let policy = policy_with(vec![
            allow(&["list-keys"]),
            allow(&["encrypt", "decrypt"]),
        ]);
        assert!(is_action_allowed(&policy, "decrypt"));
        assert!(!is_action_allowed(&policy, "delete-key"));
    }

    #[test]
    fn test_parses_stored_document_schema() {
        let json = r#"{
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"AWS": "arn:aws:iam::123456789012:role/app"},
                "Action": ["encrypt", "decrypt"],
                "Resource": "*"
            }]
        }"#;

        let policy: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.version, "2012-10-17");
        assert_eq!(policy.statement.len(), 1);
        assert_eq!(
            policy.statement[0].principal.as_ref().unwrap().aws.as_deref(),
            Some("arn:aws:iam::123456789012:role/app")
        );
        assert!(is_action_allowed(&policy, "encrypt"));
        assert!(!is_action_allowed(&policy, "rotate-key"));
    }

    #[test]
    fn test_parses_minimal_document() {
        let policy: Policy = serde_json::from_str(r#"{"Statement": [{"Effect": "Allow"}]}"#).unwrap();
        assert!(policy.statement[0].action.is_empty());
        assert!(!is_action_allowed(&policy, "encrypt"));
    }
}
