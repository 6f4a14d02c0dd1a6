//! Search documents derived from event payloads
//!
//! Producers are not consistent about field casing, so every input field
//! accepts both its snake_case and camelCase spelling. Documents are always
//! written camelCase and carry a `type` discriminator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::Domain;

/// A document ready to be upserted into the search sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub index: String,
    /// Stable entity id (policy_id / claim_id), never the event_id
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct PolicyDocument {
    #[serde(alias = "policyId")]
    pub policy_id: String,
    #[serde(default, alias = "customerId")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub premium: Option<Value>,
    #[serde(default, alias = "effectiveDate")]
    pub effective_date: Option<String>,
    #[serde(default, alias = "expirationDate")]
    pub expiration_date: Option<String>,
    #[serde(default, alias = "coverageType")]
    pub coverage_type: Option<String>,
    #[serde(default)]
    pub deductible: Option<Value>,
    #[serde(default, alias = "coverageLimit")]
    pub coverage_limit: Option<Value>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<String>,
    #[serde(rename = "type", skip_deserializing, default = "policy_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct ClaimDocument {
    #[serde(alias = "claimId")]
    pub claim_id: String,
    #[serde(alias = "policyId")]
    pub policy_id: String,
    #[serde(default, alias = "customerId")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default, alias = "occurredAt")]
    pub occurred_at: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<String>,
    #[serde(rename = "type", skip_deserializing, default = "claim_kind")]
    pub kind: String,
}

fn policy_kind() -> String {
    "policy".to_string()
}

fn claim_kind() -> String {
    "claim".to_string()
}

/// Build the search document for an event payload.
///
/// `data` must already have passed the contract check; a payload that still
/// fails to deserialize is reported as the serde error message.
pub fn build(domain: Domain, index_prefix: &str, data: &Value) -> Result<SearchDocument, String> {
    let index = format!("{}-{}", index_prefix, domain.as_str());

    match domain {
        Domain::Policies => {
            let entity = data.get("policy").cloned().unwrap_or(Value::Null);
            let doc: PolicyDocument =
                serde_json::from_value(entity).map_err(|e| format!("policy payload: {}", e))?;
            Ok(SearchDocument {
                index,
                id: doc.policy_id.clone(),
                body: serde_json::to_value(&doc).map_err(|e| e.to_string())?,
            })
        }
        Domain::Claims => {
            let entity = data.get("claim").cloned().unwrap_or(Value::Null);
            let doc: ClaimDocument =
                serde_json::from_value(entity).map_err(|e| format!("claim payload: {}", e))?;
            Ok(SearchDocument {
                index,
                id: doc.claim_id.clone(),
                body: serde_json::to_value(&doc).map_err(|e| e.to_string())?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_normalized_to_camel_case() {
        let data = json!({
            "policy": {
                "policy_id": "POL-1",
                "customerId": "CUST-9",
                "status": "active",
                "premium": 1200.5,
                "coverage_type": "auto",
                "effective_date": "2024-01-01"
            }
        });

        let doc = build(Domain::Policies, "ins", &data).unwrap();
        assert_eq!(doc.index, "ins-policies");
        assert_eq!(doc.id, "POL-1");
        assert_eq!(doc.body["policyId"], "POL-1");
        assert_eq!(doc.body["customerId"], "CUST-9");
        assert_eq!(doc.body["coverageType"], "auto");
        assert_eq!(doc.body["effectiveDate"], "2024-01-01");
        assert_eq!(doc.body["premium"], 1200.5);
        assert_eq!(doc.body["type"], "policy");
        assert!(doc.body["expirationDate"].is_null());
    }

    #[test]
    fn test_claim_keyed_by_claim_id() {
        let data = json!({
            "claim": {
                "claimId": "CLM-7",
                "policy_id": "POL-1",
                "amount": "250.00",
                "category": "collision"
            }
        });

        let doc = build(Domain::Claims, "ins", &data).unwrap();
        assert_eq!(doc.index, "ins-claims");
        assert_eq!(doc.id, "CLM-7");
        assert_eq!(doc.body["policyId"], "POL-1");
        assert_eq!(doc.body["amount"], "250.00");
        assert_eq!(doc.body["type"], "claim");
    }

    #[test]
    fn test_missing_entity_rejected() {
        let err = build(Domain::Claims, "ins", &json!({"policy": {}})).unwrap_err();
        assert!(err.starts_with("claim payload"));
    }
}
