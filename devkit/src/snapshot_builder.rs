/*!
Construction d'arbres `Users` pour les tests

```ignore
let users = SnapshotBuilder::new()
    .node("alice", "n1", 121.0, 14.5)
    .packet("alice", "n1", "k1", readings(&[(Parameter::Ph, 5.0)]))
    .build();
```
*/

use serde_json::{json, Map, Value};
use soilmap_kernel::models::Parameter;

#[derive(Debug, Default, Clone)]
pub struct SnapshotBuilder {
    users: Map<String, Value>,
}

/// Lectures d'un packet ; les paramètres absents valent 0 à l'évaluation
pub fn readings(values: &[(Parameter, f64)]) -> Value {
    let fields: Map<String, Value> = values
        .iter()
        .map(|(parameter, value)| (parameter.reading_key(), json!(value)))
        .collect();
    Value::Object(fields)
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_entry(&mut self, tenant: &str, node: &str) -> &mut Map<String, Value> {
        let nodes = self
            .users
            .entry(tenant.to_string())
            .or_insert_with(|| json!({"Farm": {"Nodes": {}}}));
        let entry = nodes["Farm"]["Nodes"]
            .as_object_mut()
            .expect("tenant built by SnapshotBuilder")
            .entry(node.to_string())
            .or_insert_with(|| json!({}));
        entry.as_object_mut().expect("node built by SnapshotBuilder")
    }

    pub fn node(mut self, tenant: &str, node: &str, x: f64, y: f64) -> Self {
        self.node_entry(tenant, node)
            .insert("Coordinates".into(), json!({"X": x, "Y": y}));
        self
    }

    pub fn node_without_coordinates(mut self, tenant: &str, node: &str) -> Self {
        self.node_entry(tenant, node);
        self
    }

    /// Ajoute un packet (après les existants : il devient le plus récent)
    pub fn packet(mut self, tenant: &str, node: &str, key: &str, fields: Value) -> Self {
        let entry = self.node_entry(tenant, node);
        let packets = entry.entry("Packets").or_insert_with(|| json!({}));
        if let Some(packets) = packets.as_object_mut() {
            packets.insert(key.to_string(), fields);
        }
        self
    }

    /// Tenant sans `Farm/Nodes` : ne produit aucun marker
    pub fn tenant_without_farm(mut self, tenant: &str) -> Self {
        self.users.insert(tenant.to_string(), json!({"Profile": {"name": tenant}}));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.users)
    }
}
