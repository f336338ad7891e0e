/**
 * STORE - Capacité store temps réel (subscribe / write par chemin)
 *
 * Le store est hiérarchique : un chemin `Users/alice/Farm/...` désigne un sous-arbre.
 * `subscribe` livre la valeur courante du sous-arbre à chaque changement sur un canal
 * dédié ; le contrôleur de sync en est l'unique consommateur.
 */

use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;

pub mod mqtt;

pub const ADMIN_ROOT: &str = "Admin";
pub const USERS_ROOT: &str = "Users";

pub fn admin_path(identity: &str) -> String {
    format!("{ADMIN_ROOT}/{identity}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("write to {path} rejected: {reason}")]
    Rejected { path: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Flux de snapshots immuables pour un chemin
#[derive(Debug)]
pub struct Subscription {
    path: String,
    receiver: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, receiver: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            path: path.into(),
            receiver,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// None quand le store a fermé le flux
    pub async fn next(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

pub trait TelemetryStore: Send + Sync + 'static {
    fn subscribe(&self, path: &str) -> impl Future<Output = Result<Subscription, StoreError>> + Send;

    fn write(&self, path: &str, value: Value) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Existence au sens du store : null, false, 0 et "" valent absence
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_present() {
        assert!(!is_present(&Value::Null));
        assert!(!is_present(&json!(false)));
        assert!(!is_present(&json!("")));
        assert!(!is_present(&json!(0)));
        assert!(is_present(&json!(true)));
        assert!(is_present(&json!({"since": 2024})));
        assert!(is_present(&json!("bacofa")));
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new(USERS_ROOT, rx);
        tx.send(json!(1)).unwrap();
        tx.send(json!(2)).unwrap();
        drop(tx);

        assert_eq!(sub.path(), "Users");
        assert_eq!(sub.next().await, Some(json!(1)));
        assert_eq!(sub.next().await, Some(json!(2)));
        assert_eq!(sub.next().await, None);
    }
}
