//! SoilMap kernel : carte de télémétrie sol multi-tenant.
//!
//! Le moteur (évaluation des plages, markers, advisory, contrôleur de sync) ne dépend
//! que de deux capacités : `store::TelemetryStore` et `map::MapSurface`.

pub mod advisory;
pub mod config;
pub mod health;
pub mod map;
pub mod markers;
pub mod models;
pub mod ranges;
pub mod store;
pub mod sync;
