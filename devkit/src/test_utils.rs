/*!
Test harness pour le contrôleur de sync

Assemble un `MockStore`, une `MockMap` et un `TelemetrySyncController`, avec les
délais raccourcis pour des tests rapides.
*/

use crate::mock_map::MockMap;
use crate::mock_store::MockStore;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use soilmap_kernel::health::HealthTracker;
use soilmap_kernel::store::{admin_path, Subscription, USERS_ROOT};
use soilmap_kernel::sync::{SnapshotOutcome, SyncSettings, TelemetrySyncController};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const TEST_ADMIN: &str = "bacofa";

pub struct TestHarness {
    pub store: MockStore,
    pub map: MockMap,
    pub health: HealthTracker,
    pub controller: TelemetrySyncController<MockStore, MockMap>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings {
            suppress_cooldown: Duration::from_millis(200),
            identity_timeout: Duration::from_millis(200),
            ..SyncSettings::default()
        })
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        // logs visibles avec RUST_LOG=debug cargo test
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let store = MockStore::new();
        let map = MockMap::new();
        let health = HealthTracker::new();
        let controller = TelemetrySyncController::new(Arc::new(store.clone()), map.clone(), settings, health.clone());
        Self {
            store,
            map,
            health,
            controller,
        }
    }

    /// Enregistre l'opérateur de test sous `Admin/`
    pub fn with_admin(self) -> Self {
        self.store.set(&admin_path(TEST_ADMIN), json!({"role": "admin"}));
        self
    }

    pub fn with_users(self, users: Value) -> Self {
        self.store.set(USERS_ROOT, users);
        self
    }

    /// Validation d'identité + abonnement `Users`, comme au démarrage du kernel
    pub async fn start(&mut self) -> Result<Subscription> {
        self.controller
            .validate_identity(TEST_ADMIN)
            .await
            .context("identity validation failed")?;
        Ok(self.controller.open_subscription().await?)
    }

    /// Livre au contrôleur le prochain snapshot en attente
    pub async fn deliver_next(&mut self, subscription: &mut Subscription) -> Result<SnapshotOutcome> {
        let users = timeout(Duration::from_secs(1), subscription.next())
            .await
            .context("no snapshot delivered")?
            .context("subscription closed")?;
        Ok(self.controller.apply_snapshot(&users))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
