/**
 * SYNC - Contrôleur de synchronisation store -> carte
 *
 * RÔLE :
 * Propriétaire unique du jeu de markers, de l'advisory et du gate de suppression.
 * Aucun singleton : tout l'état vit dans `TelemetrySyncController`.
 *
 * FONCTIONNEMENT :
 * 1. valide l'identité opérateur (`Admin/<identité>` doit exister), sinon arrêt
 * 2. ouvre l'abonnement persistant sur `Users`
 * 3. boucle `select!` sur : snapshots livrés, commandes opérateur, écriture d'acquittement
 *    en cours (une seule, gardée dans la boucle, jamais spawnée)
 *
 * GATE DE SUPPRESSION :
 * Engagé pendant l'écriture d'acquittement puis pendant un cooldown après succès.
 * Les snapshots reçus pendant ce temps sont ignorés à la livraison, sans aucune
 * mutation des markers (l'écho de notre propre écriture ne provoque pas de rerendu).
 */

use crate::advisory::{AckRequest, AdvisoryError, AdvisoryMachine, AdvisoryPanel, AdvisoryState};
use crate::health::HealthTracker;
use crate::map::{compute_position, AdvisoryPosition, AdvisorySize, MapSurface, PanelLayout, ViewportChange};
use crate::markers::{MarkerSet, ReconcileReport};
use crate::models::{Parameter, TelemetrySnapshot};
use crate::ranges::range_for;
use crate::store::{admin_path, is_present, StoreError, Subscription, TelemetryStore, USERS_ROOT};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSettings {
    /// Fenêtre après un acquittement réussi pendant laquelle les snapshots sont ignorés
    pub suppress_cooldown: Duration,
    pub identity_timeout: Duration,
    pub panel: PanelLayout,
    pub advisory: AdvisorySize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            suppress_cooldown: Duration::from_millis(2000),
            identity_timeout: Duration::from_millis(5000),
            panel: PanelLayout::default(),
            advisory: AdvisorySize {
                width: 280.0,
                height: 140.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    InFlight,
    CoolingDown { until: Instant },
}

/// Gate à échéance : pas de timer, l'expiration est constatée à la livraison
#[derive(Debug, Clone, Copy)]
pub struct SuppressGate {
    state: GateState,
}

impl SuppressGate {
    pub fn new() -> Self {
        Self {
            state: GateState::Open,
        }
    }

    pub fn engage(&mut self) {
        self.state = GateState::InFlight;
    }

    pub fn release_now(&mut self) {
        self.state = GateState::Open;
    }

    pub fn release_after(&mut self, cooldown: Duration, now: Instant) {
        self.state = if cooldown.is_zero() {
            GateState::Open
        } else {
            GateState::CoolingDown {
                until: now + cooldown,
            }
        };
    }

    pub fn is_engaged(&self, now: Instant) -> bool {
        match self.state {
            GateState::Open => false,
            GateState::InFlight => true,
            GateState::CoolingDown { until } => now < until,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == GateState::InFlight
    }
}

impl Default for SuppressGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("operator identity {0:?} is not registered under Admin/")]
    UnknownIdentity(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("subscription to {0} closed by the store")]
    SubscriptionClosed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    Applied(ReconcileReport),
    Suppressed,
    Unvalidated,
}

/// Commandes opérateur envoyées à la boucle (réponse par oneshot)
#[derive(Debug)]
pub enum Command {
    OpenAdvisory {
        marker: String,
        parameter: Parameter,
        reply: oneshot::Sender<Result<AdvisoryState, AdvisoryError>>,
    },
    Acknowledge {
        reply: oneshot::Sender<Result<(), AdvisoryError>>,
    },
    ToggleExtra {
        marker: String,
        reply: oneshot::Sender<Option<bool>>,
    },
    Viewport(ViewportChange),
    MapClick,
}

type WriteFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>;

/// Écriture d'acquittement en vol, résolue par la boucle
struct PendingWrite {
    request: AckRequest,
    reply: oneshot::Sender<Result<(), AdvisoryError>>,
    future: WriteFuture,
}

pub struct TelemetrySyncController<S: TelemetryStore, M: MapSurface> {
    store: Arc<S>,
    map: M,
    settings: SyncSettings,
    markers: MarkerSet,
    advisory: AdvisoryMachine,
    gate: SuppressGate,
    identity: Option<String>,
    health: HealthTracker,
}

impl<S: TelemetryStore, M: MapSurface> TelemetrySyncController<S, M> {
    pub fn new(store: Arc<S>, map: M, settings: SyncSettings, health: HealthTracker) -> Self {
        Self {
            store,
            map,
            settings,
            markers: MarkerSet::new(),
            advisory: AdvisoryMachine::new(),
            gate: SuppressGate::new(),
            identity: None,
            health,
        }
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    pub fn advisory_state(&self) -> &AdvisoryState {
        self.advisory.state()
    }

    pub fn gate(&self) -> &SuppressGate {
        &self.gate
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    /// Premier snapshot de `Admin/<identité>` attendu au plus `identity_timeout`.
    /// Rien reçu ou valeur absente -> identité refusée.
    pub async fn validate_identity(&mut self, identity: &str) -> Result<(), SyncError> {
        let path = admin_path(identity);
        let mut subscription = self.store.subscribe(&path).await?;

        let delivered = timeout(self.settings.identity_timeout, subscription.next())
            .await
            .ok()
            .flatten();

        match delivered {
            Some(value) if is_present(&value) => {
                info!(%identity, "operator identity validated");
                self.identity = Some(identity.to_string());
                Ok(())
            }
            Some(_) => {
                error!(%identity, "operator identity not found");
                Err(SyncError::UnknownIdentity(identity.to_string()))
            }
            None => {
                error!(%identity, timeout = ?self.settings.identity_timeout, "no answer for operator identity");
                Err(SyncError::UnknownIdentity(identity.to_string()))
            }
        }
    }

    pub async fn open_subscription(&self) -> Result<Subscription, SyncError> {
        Ok(self.store.subscribe(USERS_ROOT).await?)
    }

    pub fn apply_snapshot(&mut self, users: &Value) -> SnapshotOutcome {
        self.apply_snapshot_at(users, Instant::now())
    }

    pub fn apply_snapshot_at(&mut self, users: &Value, now: Instant) -> SnapshotOutcome {
        if self.identity.is_none() {
            debug!("snapshot ignored: identity not validated");
            return SnapshotOutcome::Unvalidated;
        }
        if self.gate.is_engaged(now) {
            debug!("snapshot suppressed");
            self.health.record_snapshot_suppressed();
            return SnapshotOutcome::Suppressed;
        }

        let snapshot = TelemetrySnapshot::from_users(users);
        let report = self.markers.reconcile(&snapshot, &mut self.map);
        self.health.record_snapshot_applied(self.markers.len());
        info!(
            rendered = report.rendered,
            removed = report.removed,
            skipped = report.skipped.len(),
            "snapshot applied"
        );

        self.revalidate_advisory();
        SnapshotOutcome::Applied(report)
    }

    /// Après resync : l'advisory ne survit que si son marker et son affordance existent encore
    fn revalidate_advisory(&mut self) {
        let Some(open) = self.advisory.open() else {
            return;
        };
        let still_valid = self
            .markers
            .get(&open.marker)
            .and_then(|marker| marker.row(open.parameter))
            .is_some_and(|row| row.affordance_enabled);

        if !still_valid {
            debug!(marker = %open.marker, parameter = %open.parameter, "advisory closed by resync");
            self.advisory.close();
        }
        self.refresh_advisory();
    }

    fn position_for(&self, key: &str) -> Option<AdvisoryPosition> {
        let marker = self.markers.get(key)?;
        let pin = self.map.project_to_screen(marker.coordinates);
        let anchor = self.settings.panel.anchor_rect(pin);
        Some(compute_position(&anchor, &self.settings.advisory))
    }

    fn refresh_advisory(&mut self) {
        let Some(open) = self.advisory.open() else {
            self.map.hide_advisory();
            return;
        };
        let panel = AdvisoryPanel::new(open, self.position_for(&open.marker));
        self.map.show_advisory(&panel);
    }

    pub fn request_open(&mut self, marker: &str, parameter: Parameter) -> Result<AdvisoryState, AdvisoryError> {
        if self.gate.is_in_flight() {
            return Err(AdvisoryError::WriteInFlight);
        }
        let row = self
            .markers
            .get(marker)
            .ok_or_else(|| AdvisoryError::UnknownMarker(marker.to_string()))?
            .row(parameter)
            .filter(|row| row.affordance_enabled)
            .ok_or_else(|| AdvisoryError::AffordanceDisabled {
                marker: marker.to_string(),
                parameter,
            })?;

        let value = row.value;
        let state = self
            .advisory
            .request_open(marker, parameter, value, range_for(parameter))
            .clone();
        self.refresh_advisory();
        Ok(state)
    }

    /// Prépare l'écriture et engage le gate. L'advisory reste ouverte jusqu'au résultat.
    pub fn begin_acknowledge(&mut self) -> Result<AckRequest, AdvisoryError> {
        if self.gate.is_in_flight() {
            return Err(AdvisoryError::WriteInFlight);
        }
        let (key, parameter) = {
            let open = self.advisory.pending_acknowledgment()?;
            (open.marker.clone(), open.parameter)
        };

        let request = match self.markers.get(&key) {
            None => Err(AdvisoryError::UnknownMarker(key)),
            Some(marker) => match marker.latest_packet.as_deref() {
                Some(packet) => Ok(AckRequest::new(&marker.key, &marker.tenant, &marker.node, packet, parameter)),
                None => Err(AdvisoryError::NoPacket(marker.key.clone())),
            },
        };

        match request {
            Ok(request) => {
                self.gate.engage();
                info!(path = %request.path(), "writing acknowledgment");
                Ok(request)
            }
            Err(e) => {
                warn!("acknowledgment aborted: {e}");
                self.advisory.close();
                self.map.hide_advisory();
                Err(e)
            }
        }
    }

    pub fn finish_acknowledge(
        &mut self,
        request: &AckRequest,
        result: Result<(), StoreError>,
        now: Instant,
    ) -> Result<(), AdvisoryError> {
        self.advisory.close();
        self.map.hide_advisory();

        match result {
            Ok(()) => {
                self.markers
                    .disable_affordance(&request.marker, request.parameter, &request.packet_key, &mut self.map);
                self.gate.release_after(self.settings.suppress_cooldown, now);
                self.health.record_acknowledgment(true);
                info!(marker = %request.marker, parameter = %request.parameter, "acknowledgment stored");
                Ok(())
            }
            Err(e) => {
                self.gate.release_now();
                self.health.record_acknowledgment(false);
                error!(path = %request.path(), "acknowledgment write failed: {e}");
                Err(AdvisoryError::Write(e))
            }
        }
    }

    /// Variante séquentielle : attend l'écriture sur place
    pub async fn acknowledge(&mut self) -> Result<(), AdvisoryError> {
        let request = self.begin_acknowledge()?;
        let result = self.store.write(&request.path(), request.value()).await;
        self.finish_acknowledge(&request, result, Instant::now())
    }

    pub fn on_viewport_change(&mut self, change: ViewportChange) {
        debug!(?change, "viewport changed");
        if self.advisory.open().is_some() {
            self.refresh_advisory();
        }
    }

    /// Clic sur la carte : ferme l'advisory ouverte
    pub fn dismiss(&mut self) -> bool {
        if self.advisory.open().is_none() {
            return false;
        }
        self.advisory.close();
        self.map.hide_advisory();
        true
    }

    pub fn toggle_extra(&mut self, marker: &str) -> Option<bool> {
        self.markers.toggle_extra(marker, &mut self.map)
    }

    fn handle_command(&mut self, command: Command, pending: &mut Option<PendingWrite>) {
        match command {
            Command::OpenAdvisory {
                marker,
                parameter,
                reply,
            } => {
                let _ = reply.send(self.request_open(&marker, parameter));
            }
            Command::Acknowledge { reply } => match self.begin_acknowledge() {
                Ok(request) => {
                    let store = Arc::clone(&self.store);
                    let path = request.path();
                    let value = request.value();
                    *pending = Some(PendingWrite {
                        request,
                        reply,
                        future: Box::pin(async move { store.write(&path, value).await }),
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::ToggleExtra { marker, reply } => {
                let _ = reply.send(self.toggle_extra(&marker));
            }
            Command::Viewport(change) => self.on_viewport_change(change),
            Command::MapClick => {
                self.dismiss();
            }
        }
    }

    /// Boucle principale. Se termine quand le store ferme l'abonnement.
    pub async fn run(mut self, mut snapshots: Subscription, mut commands: mpsc::Receiver<Command>) -> Result<(), SyncError> {
        let mut pending: Option<PendingWrite> = None;
        let mut commands_open = true;
        info!(path = %snapshots.path(), "sync loop started");

        loop {
            tokio::select! {
                delivered = snapshots.next() => match delivered {
                    Some(users) => {
                        self.apply_snapshot(&users);
                    }
                    None => {
                        warn!(path = %snapshots.path(), "subscription closed");
                        return Err(SyncError::SubscriptionClosed(snapshots.path().to_string()));
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command, &mut pending),
                    None => {
                        debug!("command channel closed");
                        commands_open = false;
                    }
                },
                result = settle(&mut pending), if pending.is_some() => {
                    if let Some(write) = pending.take() {
                        let outcome = self.finish_acknowledge(&write.request, result, Instant::now());
                        let _ = write.reply.send(outcome);
                    }
                }
            }
        }
    }
}

async fn settle(pending: &mut Option<PendingWrite>) -> Result<(), StoreError> {
    match pending {
        Some(write) => write.future.as_mut().await,
        None => std::future::pending().await,
    }
}
