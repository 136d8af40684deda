use core::fmt;
use std::fmt::Display;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod integration;
pub mod integrationtarget;

/// The closed set of tools this operator knows how to install and verify.
///
/// Adding a new tool means adding a variant here plus one entry in the
/// installer and checker factories.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    #[default]
    Prometheus,
    Grafana,
    FluentBit,
    CertManager,
}

impl ToolKind {
    /// Namespace the tool is expected to live in unless the Integration
    /// overrides it via `spec.config["namespace"]`.
    pub fn default_namespace(&self) -> &'static str {
        match self {
            ToolKind::Prometheus => "monitoring",
            ToolKind::Grafana => "monitoring",
            ToolKind::FluentBit => "logging",
            ToolKind::CertManager => "cert-manager",
        }
    }
}

impl Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ToolKind::Prometheus => write!(f, "prometheus"),
            ToolKind::Grafana => write!(f, "grafana"),
            ToolKind::FluentBit => write!(f, "fluent-bit"),
            ToolKind::CertManager => write!(f, "cert-manager"),
        }
    }
}

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .unwrap()
}

pub fn time_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "string",
        "format": "date-time",
    }))
    .unwrap()
}
