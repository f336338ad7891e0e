/**
 * MAP - Capacité carte (rendu des markers + projection écran)
 *
 * Le widget carte est un collaborateur externe : le moteur ne connaît que le trait
 * `MapSurface`. `ViewMap` est l'implémentation headless du kernel : elle garde les
 * markers rendus et le viewport dans un état partagé lu par l'API HTTP.
 */

use crate::advisory::AdvisoryPanel;
use crate::markers::Marker;
use crate::models::Coordinates;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// Espace entre le bas du panneau de détail et l'advisory (px)
pub const ADVISORY_GAP: f64 = 8.0;

const TILE_SIZE: f64 = 256.0;
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRect {
    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvisorySize {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryPosition {
    pub top: f64,
    pub left: f64,
}

/// Advisory centrée horizontalement sous son ancre. Pure, rappelée à chaque move/zoom.
pub fn compute_position(anchor: &ScreenRect, advisory: &AdvisorySize) -> AdvisoryPosition {
    AdvisoryPosition {
        top: anchor.bottom() + ADVISORY_GAP,
        left: anchor.left + anchor.width / 2.0 - advisory.width / 2.0,
    }
}

/// Placement du panneau de détail : ancré à gauche, décalé du pin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelLayout {
    pub offset: (f64, f64),
    pub width: f64,
    pub height: f64,
}

impl PanelLayout {
    pub fn anchor_rect(&self, pin: ScreenPoint) -> ScreenRect {
        ScreenRect {
            left: pin.x + self.offset.0,
            top: pin.y + self.offset.1 - self.height / 2.0,
            width: self.width,
            height: self.height,
        }
    }
}

impl Default for PanelLayout {
    fn default() -> Self {
        Self {
            offset: (15.0, -15.0),
            width: 260.0,
            height: 320.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewportChange {
    Move,
    Zoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub center: Coordinates,
    pub zoom: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    // vue monde entier au démarrage
    fn default() -> Self {
        Self {
            center: Coordinates { x: 0.0, y: 0.0 },
            zoom: 1.0,
            width: 1280.0,
            height: 720.0,
        }
    }
}

impl Viewport {
    /// Web Mercator, tuiles 256px
    pub fn project(&self, point: Coordinates) -> ScreenPoint {
        let world = TILE_SIZE * 2f64.powf(self.zoom);
        let (px, py) = mercator(point, world);
        let (cx, cy) = mercator(self.center, world);
        ScreenPoint {
            x: px - cx + self.width / 2.0,
            y: py - cy + self.height / 2.0,
        }
    }
}

fn mercator(point: Coordinates, world: f64) -> (f64, f64) {
    let lat = point.y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let x = (point.x + 180.0) / 360.0 * world;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * world;
    (x, y)
}

/// Capacité carte vue par le moteur
pub trait MapSurface {
    /// Crée (ou remplace) le pin et son panneau de détail
    fn render_marker(&mut self, marker: &Marker);
    fn remove_marker(&mut self, key: &str);
    fn project_to_screen(&self, point: Coordinates) -> ScreenPoint;
    fn show_advisory(&mut self, panel: &AdvisoryPanel);
    fn hide_advisory(&mut self);
}

type Shared<T> = Arc<Mutex<T>>;

/// Carte headless partagée entre le contrôleur (écriture) et l'API (lecture)
#[derive(Clone)]
pub struct ViewMap {
    markers: Shared<BTreeMap<String, Marker>>,
    advisory: Shared<Option<AdvisoryPanel>>,
    viewport: Shared<Viewport>,
}

impl ViewMap {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            markers: Arc::new(Mutex::new(BTreeMap::new())),
            advisory: Arc::new(Mutex::new(None)),
            viewport: Arc::new(Mutex::new(viewport)),
        }
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.markers.lock().values().cloned().collect()
    }

    pub fn marker(&self, key: &str) -> Option<Marker> {
        self.markers.lock().get(key).cloned()
    }

    pub fn advisory(&self) -> Option<AdvisoryPanel> {
        self.advisory.lock().clone()
    }

    pub fn viewport(&self) -> Viewport {
        *self.viewport.lock()
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        *self.viewport.lock() = viewport;
    }
}

impl MapSurface for ViewMap {
    fn render_marker(&mut self, marker: &Marker) {
        self.markers.lock().insert(marker.key.clone(), marker.clone());
    }

    fn remove_marker(&mut self, key: &str) {
        self.markers.lock().remove(key);
    }

    fn project_to_screen(&self, point: Coordinates) -> ScreenPoint {
        self.viewport.lock().project(point)
    }

    fn show_advisory(&mut self, panel: &AdvisoryPanel) {
        *self.advisory.lock() = Some(panel.clone());
    }

    fn hide_advisory(&mut self) {
        *self.advisory.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_position_centers_below_anchor() {
        let anchor = ScreenRect { left: 100.0, top: 50.0, width: 260.0, height: 320.0 };
        let size = AdvisorySize { width: 280.0, height: 120.0 };
        let pos = compute_position(&anchor, &size);
        assert_eq!(pos.top, 378.0);
        assert_eq!(pos.left, 100.0 + 130.0 - 140.0);
        // idempotent
        assert_eq!(compute_position(&anchor, &size), pos);
    }

    #[test]
    fn test_projection_center_maps_to_screen_center() {
        let viewport = Viewport {
            center: Coordinates { x: 121.0, y: 14.6 },
            zoom: 9.0,
            width: 800.0,
            height: 600.0,
        };
        let p = viewport.project(viewport.center);
        assert!((p.x - 400.0).abs() < 1e-6);
        assert!((p.y - 300.0).abs() < 1e-6);

        // plus à l'est -> plus à droite, plus au nord -> plus haut
        let ne = viewport.project(Coordinates { x: 121.1, y: 14.7 });
        assert!(ne.x > 400.0);
        assert!(ne.y < 300.0);
    }

    #[test]
    fn test_world_view_projection() {
        let viewport = Viewport::default();
        // zoom 1 : monde de 512px centré sur (0,0)
        let east = viewport.project(Coordinates { x: 180.0, y: 0.0 });
        assert!((east.x - (640.0 + 256.0)).abs() < 1e-6);
        let pole = viewport.project(Coordinates { x: 0.0, y: 90.0 });
        assert!(pole.y.is_finite());
    }

    #[test]
    fn test_panel_anchor_rect() {
        let layout = PanelLayout::default();
        let rect = layout.anchor_rect(ScreenPoint { x: 200.0, y: 300.0 });
        assert_eq!(rect.left, 215.0);
        assert_eq!(rect.top, 300.0 - 15.0 - 160.0);
    }
}
