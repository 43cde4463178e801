//! Data-driven units built from plugin descriptor params

use crate::unit::{DependencyOutputs, FileContext, Payload, Unit, UnitDescriptor, UnitError, UnitId};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticParams {
    fields: Payload,
}

/// `static` kind: emits a fixed set of fields
pub struct StaticUnit {
    descriptor: UnitDescriptor,
    fields: Payload,
}

impl StaticUnit {
    pub fn new(descriptor: UnitDescriptor, fields: Payload) -> Self {
        Self { descriptor, fields }
    }

    pub fn from_params(descriptor: UnitDescriptor, params: &Value) -> Result<Self, String> {
        let params: StaticParams = serde_json::from_value(params.clone())
            .map_err(|e| format!("invalid params for 'static': {}", e))?;
        Ok(Self::new(descriptor, params.fields))
    }
}

#[async_trait]
impl Unit for StaticUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &FileContext, _deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        Ok(self.fields.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Projection {
    pub from: UnitId,
    pub field: String,
    #[serde(default, rename = "as")]
    pub rename: Option<String>,
}

impl Projection {
    fn target(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.field)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectionParams {
    fields: Vec<Projection>,
}

/// `projection` kind: copies named fields out of dependency outputs
///
/// Every `from` must be a declared dependency. Absent source fields are
/// left out of the payload.
pub struct ProjectionUnit {
    descriptor: UnitDescriptor,
    projections: Vec<Projection>,
}

impl ProjectionUnit {
    pub fn from_params(descriptor: UnitDescriptor, params: &Value) -> Result<Self, String> {
        let params: ProjectionParams = serde_json::from_value(params.clone())
            .map_err(|e| format!("invalid params for 'projection': {}", e))?;

        if params.fields.is_empty() {
            return Err("params.fields must not be empty".to_string());
        }
        for projection in &params.fields {
            if !descriptor.dependency_ids.contains(&projection.from) {
                return Err(format!(
                    "projection reads '{}' which is not in depends_on",
                    projection.from
                ));
            }
        }

        Ok(Self {
            descriptor,
            projections: params.fields,
        })
    }
}

#[async_trait]
impl Unit for ProjectionUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _ctx: &FileContext, deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        let mut payload = Payload::new();
        for projection in &self.projections {
            if let Some(value) = deps.field(&projection.from, &projection.field) {
                payload.insert(projection.target().to_string(), value.clone());
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn ctx() -> FileContext {
        FileContext::new("/upload/a.png", "image/png", 1)
    }

    #[tokio::test]
    async fn test_static_unit() {
        let desc = UnitDescriptor::new("acme.label", "1");
        let unit = StaticUnit::from_params(desc, &json!({"fields": {"vendor": "acme", "n": 2}})).unwrap();

        let payload = unit.invoke(&ctx(), &DependencyOutputs::default()).await.unwrap();
        assert_eq!(payload["vendor"], "acme");
        assert_eq!(payload["n"], 2);
    }

    #[test]
    fn test_static_rejects_bad_params() {
        let desc = UnitDescriptor::new("acme.label", "1");
        assert!(StaticUnit::from_params(desc.clone(), &json!(42)).is_err());
        assert!(StaticUnit::from_params(desc.clone(), &Value::Null).is_err());
        assert!(StaticUnit::from_params(desc, &json!({"fields": [1, 2]})).is_err());
    }

    #[tokio::test]
    async fn test_projection_unit() {
        let desc = UnitDescriptor::new("summary", "1").depends_on("file.basic");
        let params = json!({"fields": [
            {"from": "file.basic", "field": "size_bytes", "as": "size"},
            {"from": "file.basic", "field": "extension"},
            {"from": "file.basic", "field": "absent"}
        ]});
        let unit = ProjectionUnit::from_params(desc, &params).unwrap();

        let mut outputs = BTreeMap::new();
        let basic = match json!({"size_bytes": 10, "extension": "png"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        outputs.insert("file.basic".to_string(), Arc::new(basic));

        let payload = unit.invoke(&ctx(), &DependencyOutputs::new(outputs)).await.unwrap();
        assert_eq!(payload["size"], 10);
        assert_eq!(payload["extension"], "png");
        assert!(!payload.contains_key("absent"));
    }

    #[test]
    fn test_projection_requires_declared_dependency() {
        let desc = UnitDescriptor::new("summary", "1");
        let params = json!({"fields": [{"from": "file.basic", "field": "size_bytes"}]});
        let err = ProjectionUnit::from_params(desc, &params).err().unwrap();
        assert!(err.contains("depends_on"));
    }
}
