/**
 * MARKERS - Réconciliation du jeu de markers contre un snapshot complet
 *
 * FONCTIONNEMENT (remplacement total, pas de diff incrémental) :
 * 1. retire tous les markers rendus
 * 2. pour chaque node avec coordonnées : dernier packet, couleur, panneau de détail
 * 3. enregistre le marker sous `<tenant>_<node>`
 *
 * Les snapshots sont rares et complets : on préfère zéro marker périmé ou dupliqué
 * à un rendu économe.
 */

use crate::map::MapSurface;
use crate::models::{Coordinates, NodeSnapshot, Packet, Parameter, TelemetrySnapshot};
use crate::ranges::{evaluate, Direction};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const NO_DATA_TEXT: &str = "No data available yet.";

/// Les 4 premiers paramètres sont toujours visibles, les suivants repliables
const VISIBLE_ROWS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerColor {
    Red,
    Grey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BarColor {
    DarkGreen,
    Red,
}

impl BarColor {
    pub fn as_str(self) -> &'static str {
        match self {
            BarColor::DarkGreen => "darkgreen",
            BarColor::Red => "red",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterRow {
    pub parameter: Parameter,
    pub value: f64,
    pub percent: f64,
    pub in_range: bool,
    pub direction: Option<Direction>,
    pub bar_color: BarColor,
    /// Bouton d'acquittement cliquable
    pub affordance_enabled: bool,
    pub extra: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PanelBody {
    NoData { text: &'static str },
    Readings { rows: Vec<ParameterRow> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailPanel {
    pub title: String,
    pub body: PanelBody,
    pub extras_expanded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub key: String,
    pub tenant: String,
    pub node: String,
    pub coordinates: Coordinates,
    pub color: MarkerColor,
    pub latest_packet: Option<String>,
    pub panel: DetailPanel,
}

impl Marker {
    pub fn rows(&self) -> &[ParameterRow] {
        match &self.panel.body {
            PanelBody::Readings { rows } => rows,
            PanelBody::NoData { .. } => &[],
        }
    }

    pub fn row(&self, parameter: Parameter) -> Option<&ParameterRow> {
        self.rows().iter().find(|row| row.parameter == parameter)
    }

    fn row_mut(&mut self, parameter: Parameter) -> Option<&mut ParameterRow> {
        match &mut self.panel.body {
            PanelBody::Readings { rows } => rows.iter_mut().find(|row| row.parameter == parameter),
            PanelBody::NoData { .. } => None,
        }
    }
}

/// Une ligne par paramètre. L'affordance reste active seulement si la lecture
/// est hors plage ET que ce packet n'a pas déjà été acquitté.
fn build_row(index: usize, parameter: Parameter, packet: &Packet) -> ParameterRow {
    let evaluation = evaluate(parameter, packet.reading(parameter));
    ParameterRow {
        parameter,
        value: evaluation.value,
        percent: evaluation.percent,
        in_range: evaluation.in_range,
        direction: evaluation.direction,
        bar_color: if evaluation.in_range { BarColor::DarkGreen } else { BarColor::Red },
        affordance_enabled: !evaluation.in_range && !packet.is_acknowledged(parameter),
        extra: index >= VISIBLE_ROWS,
    }
}

/// None si le node n'a pas de coordonnées exploitables
pub fn build_marker(node: &NodeSnapshot) -> Option<Marker> {
    let coordinates = node.coordinates?;
    let latest = node.latest_packet();

    let body = match latest {
        Some(packet) => PanelBody::Readings {
            rows: Parameter::ALL
                .into_iter()
                .enumerate()
                .map(|(index, parameter)| build_row(index, parameter, packet))
                .collect(),
        },
        None => PanelBody::NoData { text: NO_DATA_TEXT },
    };

    Some(Marker {
        key: node.key(),
        tenant: node.tenant.clone(),
        node: node.name.clone(),
        coordinates,
        // deux états seulement : données ou pas, la couleur ne dépend pas des plages
        color: if latest.is_some() { MarkerColor::Red } else { MarkerColor::Grey },
        latest_packet: latest.map(|packet| packet.key.clone()),
        panel: DetailPanel {
            title: format!("{} ({})", node.name, node.tenant),
            body,
            extras_expanded: false,
        },
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub removed: usize,
    pub rendered: usize,
    /// Nodes ignorés faute de coordonnées
    pub skipped: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MarkerSet {
    markers: BTreeMap<String, Marker>,
}

impl MarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Marker> {
        self.markers.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.markers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }

    /// Retire tous les markers de la carte (resync complet)
    pub fn clear<M: MapSurface>(&mut self, map: &mut M) -> usize {
        let removed = self.markers.len();
        for key in self.markers.keys() {
            map.remove_marker(key);
        }
        self.markers.clear();
        removed
    }

    pub fn reconcile<M: MapSurface>(&mut self, snapshot: &TelemetrySnapshot, map: &mut M) -> ReconcileReport {
        let mut report = ReconcileReport {
            removed: self.clear(map),
            ..ReconcileReport::default()
        };

        for node in &snapshot.nodes {
            let Some(marker) = build_marker(node) else {
                warn!(tenant = %node.tenant, node = %node.name, "node skipped: missing coordinates");
                report.skipped.push(node.key());
                continue;
            };
            if marker.latest_packet.is_none() {
                debug!(marker = %marker.key, "node has no packets yet");
            }

            map.render_marker(&marker);
            // collision de clé composite : le dernier node l'emporte
            if self.markers.insert(marker.key.clone(), marker).is_none() {
                report.rendered += 1;
            }
        }

        report
    }

    /// Désactive l'affordance après un acquittement réussi, seulement si le packet
    /// acquitté est toujours le dernier du marker.
    pub fn disable_affordance<M: MapSurface>(
        &mut self,
        key: &str,
        parameter: Parameter,
        packet_key: &str,
        map: &mut M,
    ) -> bool {
        let Some(marker) = self.markers.get_mut(key) else {
            return false;
        };
        if marker.latest_packet.as_deref() != Some(packet_key) {
            return false;
        }
        let Some(row) = marker.row_mut(parameter) else {
            return false;
        };

        row.affordance_enabled = false;
        map.render_marker(marker);
        true
    }

    /// Déplie / replie les lignes 5 à 8 ; renvoie le nouvel état
    pub fn toggle_extra<M: MapSurface>(&mut self, key: &str, map: &mut M) -> Option<bool> {
        let marker = self.markers.get_mut(key)?;
        marker.panel.extras_expanded = !marker.panel.extras_expanded;
        map.render_marker(marker);
        Some(marker.panel.extras_expanded)
    }
}
