/*!
# SoilMap DevKit - Stubs et utilitaires de test

Permet de piloter le contrôleur de sync sans broker ni carte réelle :
- `MockStore` : store hiérarchique en mémoire (abonnements, écritures, pannes simulées)
- `MockMap` : carte qui enregistre chaque opération de rendu
- `SnapshotBuilder` : construction d'arbres `Users` réalistes
- `TestHarness` : assemblage store + carte + contrôleur
*/

pub mod mock_map;
pub mod mock_store;
pub mod snapshot_builder;
pub mod test_utils;

pub use mock_map::{MapOp, MockMap};
pub use mock_store::MockStore;
pub use snapshot_builder::{readings, SnapshotBuilder};
pub use test_utils::{TestHarness, TEST_ADMIN};
