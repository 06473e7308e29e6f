//! Kubernetes object references used by the SCVMM CRDs
//!
//! Provides the small, namespaced reference types used for cross-resource
//! lookups (provider configuration, credential secrets).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a `ScvmmProvider` object
///
/// The namespace defaults to the namespace of the referencing resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReference {
    /// Name of the referenced ScvmmProvider
    pub name: String,

    /// Namespace of the referenced ScvmmProvider (defaults to same namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ProviderReference {
    /// Create a reference in the same namespace as the referencing resource
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Namespace to look the provider up in, falling back to `default_namespace`
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => default_namespace,
        }
    }
}

/// Reference to a Secret in the namespace of the referencing resource
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_or_falls_back_when_unset_or_empty() {
        let unset = ProviderReference::new("scvmm");
        assert_eq!(unset.namespace_or("capi"), "capi");

        let empty = ProviderReference {
            name: "scvmm".to_string(),
            namespace: Some(String::new()),
        };
        assert_eq!(empty.namespace_or("capi"), "capi");

        let explicit = ProviderReference {
            name: "scvmm".to_string(),
            namespace: Some("infra".to_string()),
        };
        assert_eq!(explicit.namespace_or("capi"), "infra");
    }
}
