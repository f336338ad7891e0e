/**
 * MQTT STORE - Store temps réel exposé sur un broker MQTT
 *
 * Convention de topics (prefix par défaut "soilmap") :
 *   <prefix>/<chemin>       snapshot JSON retenu, republié à chaque changement
 *   <prefix>/<chemin>/set   écriture demandée par le kernel
 *
 * Un payload vide sur un topic retenu = chemin supprimé -> livré comme null.
 *
 * ÉCRITURES :
 * Une écriture ne réussit qu'au PUBACK du broker pour ce publish (QoS 1).
 * Hors connexion, sur coupure ou sans PUBACK dans `ack_timeout_ms` -> StoreError.
 * Les publish sortent dans l'ordre des requêtes : le n-ième `Outgoing::Publish`
 * porte le pkid de la n-ième écriture en attente.
 */

use super::{StoreError, Subscription, TelemetryStore};
use crate::config::MqttConf;
use crate::health::HealthTracker;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

type Routes = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;
type AckReply = oneshot::Sender<Result<(), StoreError>>;

/// Écritures en attente de leur pkid puis de leur PUBACK
#[derive(Default)]
struct AckTracker {
    awaiting_pkid: VecDeque<AckReply>,
    in_flight: HashMap<u16, AckReply>,
}

impl AckTracker {
    fn expect(&mut self) -> oneshot::Receiver<Result<(), StoreError>> {
        let (tx, rx) = oneshot::channel();
        self.awaiting_pkid.push_back(tx);
        rx
    }

    fn on_outgoing(&mut self, pkid: u16) {
        // publish rejoué après reconnexion : son écriture a déjà échoué
        if let Some(reply) = self.awaiting_pkid.pop_front() {
            self.in_flight.insert(pkid, reply);
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(reply) = self.in_flight.remove(&pkid) {
            let _ = reply.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let replies = self.awaiting_pkid.drain(..).chain(self.in_flight.drain().map(|(_, reply)| reply));
        for reply in replies {
            let _ = reply.send(Err(StoreError::Connection(reason.to_string())));
        }
    }
}

pub struct MqttStore {
    client: AsyncClient,
    prefix: String,
    routes: Routes,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<AckTracker>>,
    ack_timeout: Duration,
    // une écriture à la fois : garde l'ordre requêtes / Outgoing::Publish
    write_lock: tokio::sync::Mutex<()>,
}

impl MqttStore {
    /// Crée le client et lance la boucle d'événements MQTT en tâche de fond
    pub fn connect(conf: &MqttConf, health: HealthTracker) -> Self {
        let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
        // payload = sous-arbre complet, peut dépasser la limite par défaut
        opts.set_max_packet_size(8 * 1024 * 1024, 8 * 1024 * 1024);

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let prefix = conf.topic_prefix.trim_end_matches('/').to_string();

        let connected = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(Mutex::new(AckTracker::default()));

        let loop_routes = routes.clone();
        let loop_client = client.clone();
        let loop_prefix = prefix.clone();
        let loop_connected = connected.clone();
        let loop_acks = acks.clone();
        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("store connected to MQTT broker");
                        loop_connected.store(true, Ordering::SeqCst);
                        health.mark_store_connected();
                        resubscribe(&loop_client, &loop_routes).await;
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => loop_acks.lock().on_outgoing(pkid),
                    Ok(Event::Incoming(Incoming::PubAck(ack))) => loop_acks.lock().on_puback(ack.pkid),
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        if !is_snapshot_topic(&loop_prefix, &p.topic) {
                            continue;
                        }
                        match decode_payload(&p.payload) {
                            Ok(value) => dispatch(&loop_routes, &p.topic, value),
                            Err(e) => warn!(topic = %p.topic, "invalid JSON snapshot: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {e:?}");
                        loop_connected.store(false, Ordering::SeqCst);
                        loop_acks.lock().fail_all(&format!("connection lost: {e}"));
                        health.mark_store_disconnected();
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self {
            client,
            prefix,
            routes,
            connected,
            acks,
            ack_timeout: Duration::from_millis(conf.ack_timeout_ms),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn topic(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }
}

/// clean session : les abonnements sont perdus à chaque reconnexion
async fn resubscribe(client: &AsyncClient, routes: &Routes) {
    let topics: Vec<String> = routes.lock().keys().cloned().collect();
    for topic in topics {
        if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
            error!(%topic, "resubscribe failed: {e:?}");
        }
    }
}

fn dispatch(routes: &Routes, topic: &str, value: Value) {
    let mut routes = routes.lock();
    let Some(senders) = routes.get_mut(topic) else {
        debug!(%topic, "snapshot without subscriber");
        return;
    };
    // abonnés fermés retirés au passage
    senders.retain(|tx| tx.send(value.clone()).is_ok());
}

/// Topic sous le préfixe, hors topics d'écriture (`.../set`)
fn is_snapshot_topic(prefix: &str, topic: &str) -> bool {
    topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|path| !path.is_empty() && !path.ends_with("/set"))
}

fn decode_payload(payload: &[u8]) -> Result<Value, serde_json::Error> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload)
}

impl TelemetryStore for MqttStore {
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let topic = self.topic(path);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().entry(topic.clone()).or_default().push(tx);

        self.client
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!(%topic, "subscribed");
        Ok(Subscription::new(path, rx))
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Connection("broker not connected".into()));
        }
        let topic = format!("{}/set", self.topic(path));
        let payload = serde_json::to_vec(&value)?;

        let _guard = self.write_lock.lock().await;
        let ack = self.acks.lock().expect();
        if let Err(e) = self.client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
            // requête jamais partie : on retire l'attente qu'on vient d'ajouter
            self.acks.lock().awaiting_pkid.pop_back();
            return Err(StoreError::Rejected {
                path: path.to_string(),
                reason: e.to_string(),
            });
        }

        match timeout(self.ack_timeout, ack).await {
            Ok(Ok(result)) => {
                debug!(%topic, "write acknowledged");
                result
            }
            Ok(Err(_)) => Err(StoreError::Connection("store event loop stopped".into())),
            Err(_) => Err(StoreError::Connection(format!(
                "no PUBACK for {topic} within {:?}",
                self.ack_timeout
            ))),
        }
    }
}
