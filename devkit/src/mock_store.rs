/*!
Store en mémoire pour tests sans broker

Arbre JSON unique adressé par chemins `A/B/C`. Chaque abonné reçoit la valeur courante
de son chemin à l'abonnement, puis à chaque modification de ce chemin, d'un ancêtre ou
d'un descendant. Les écritures réussies sont réappliquées sur l'arbre (écho).
*/

use serde_json::{Map, Value};
use soilmap_kernel::store::{StoreError, Subscription, TelemetryStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Inner {
    tree: Value,
    subscribers: Vec<(String, mpsc::UnboundedSender<Value>)>,
    subscriptions: Vec<String>,
    writes: Vec<(String, Value)>,
    write_failure: Option<String>,
    write_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<Inner>>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(tree, |node, segment| node.get(segment))
}

fn related(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valeur courante d'un chemin (null si absent)
    pub fn get(&self, path: &str) -> Value {
        let inner = self.inner.lock().unwrap();
        lookup(&inner.tree, path).cloned().unwrap_or(Value::Null)
    }

    /// Remplace la valeur d'un chemin (null = suppression) et notifie les abonnés concernés
    pub fn set(&self, path: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        let parts: Vec<&str> = segments(path).collect();
        let Some((leaf, parents)) = parts.split_last() else {
            inner.tree = value;
            return notify(&mut inner, path);
        };

        let mut node = &mut inner.tree;
        for part in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()
                .unwrap()
                .entry(part.to_string())
                .or_insert(Value::Null);
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let obj = node.as_object_mut().unwrap();
        if value.is_null() {
            obj.remove(*leaf);
        } else {
            obj.insert(leaf.to_string(), value);
        }
        notify(&mut inner, path);
    }

    /// Toutes les écritures suivantes échouent avec ce motif
    pub fn fail_writes_with(&self, reason: &str) {
        self.inner.lock().unwrap().write_failure = Some(reason.to_string());
    }

    pub fn accept_writes(&self) {
        self.inner.lock().unwrap().write_failure = None;
    }

    /// Latence simulée sur chaque écriture
    pub fn delay_writes(&self, delay: Duration) {
        self.inner.lock().unwrap().write_delay = Some(delay);
    }

    /// Écritures réussies, dans l'ordre
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().unwrap().subscriptions.clone()
    }
}

fn notify(inner: &mut Inner, changed: &str) {
    let Inner { tree, subscribers, .. } = inner;
    subscribers.retain(|(path, tx)| {
        if !related(path, changed) {
            return !tx.is_closed();
        }
        let value = lookup(tree, path).cloned().unwrap_or(Value::Null);
        tx.send(value).is_ok()
    });
}

impl TelemetryStore for MockStore {
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().unwrap();
            let current = lookup(&inner.tree, path).cloned().unwrap_or(Value::Null);
            // valeur courante livrée immédiatement, comme un snapshot retenu
            let _ = tx.send(current);
            inner.subscribers.push((path.to_string(), tx));
            inner.subscriptions.push(path.to_string());
        }
        debug!(%path, "[mock] subscribed");
        Ok(Subscription::new(path, rx))
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let delay = self.inner.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.inner.lock().unwrap().write_failure.clone();
        if let Some(reason) = failure {
            debug!(%path, "[mock] write rejected");
            return Err(StoreError::Rejected {
                path: path.to_string(),
                reason,
            });
        }

        self.inner.lock().unwrap().writes.push((path.to_string(), value.clone()));
        self.set(path, value);
        debug!(%path, "[mock] write applied");
        Ok(())
    }
}
