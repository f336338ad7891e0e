/*!
Carte factice : enregistre chaque opération demandée par le moteur.

Projection identité (X, Y) -> (x, y) pour des positions d'advisory prévisibles.
Clonable : le test garde une copie pendant que le contrôleur possède l'autre.
*/

use soilmap_kernel::advisory::AdvisoryPanel;
use soilmap_kernel::map::{MapSurface, ScreenPoint};
use soilmap_kernel::markers::Marker;
use soilmap_kernel::models::Coordinates;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum MapOp {
    Render(String),
    Remove(String),
    ShowAdvisory(AdvisoryPanel),
    HideAdvisory,
}

#[derive(Default)]
struct MapState {
    ops: Vec<MapOp>,
    markers: BTreeMap<String, Marker>,
    advisory: Option<AdvisoryPanel>,
}

#[derive(Clone, Default)]
pub struct MockMap {
    state: Arc<Mutex<MapState>>,
}

impl MockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<MapOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    /// Nombre de rendus / retraits de markers depuis le dernier `clear_ops`
    pub fn marker_mutations(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| matches!(op, MapOp::Render(_) | MapOp::Remove(_)))
            .count()
    }

    pub fn marker(&self, key: &str) -> Option<Marker> {
        self.state.lock().unwrap().markers.get(key).cloned()
    }

    pub fn marker_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().markers.keys().cloned().collect()
    }

    pub fn advisory(&self) -> Option<AdvisoryPanel> {
        self.state.lock().unwrap().advisory.clone()
    }
}

impl MapSurface for MockMap {
    fn render_marker(&mut self, marker: &Marker) {
        let mut state = self.state.lock().unwrap();
        state.ops.push(MapOp::Render(marker.key.clone()));
        state.markers.insert(marker.key.clone(), marker.clone());
    }

    fn remove_marker(&mut self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.ops.push(MapOp::Remove(key.to_string()));
        state.markers.remove(key);
    }

    fn project_to_screen(&self, point: Coordinates) -> ScreenPoint {
        ScreenPoint { x: point.x, y: point.y }
    }

    fn show_advisory(&mut self, panel: &AdvisoryPanel) {
        let mut state = self.state.lock().unwrap();
        state.ops.push(MapOp::ShowAdvisory(panel.clone()));
        state.advisory = Some(panel.clone());
    }

    fn hide_advisory(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.ops.push(MapOp::HideAdvisory);
        state.advisory = None;
    }
}
