/**
 * ADVISORY - Cycle de vie de l'advisory unique (ouverture / toggle / acquittement)
 *
 * RÔLE :
 * Une seule advisory ouverte pour tout le process, identifiée par (marker, paramètre).
 * Redemander la même paire la ferme, demander une autre paire la remplace.
 *
 * ACQUITTEMENT :
 * Écrit un timestamp sous
 *   Users/<tenant>/Farm/Nodes/<node>/Packets/<dernier_packet>/Disabled_<Param>_done
 * Succès -> affordance désactivée pour ce packet, advisory fermée.
 * Échec  -> advisory fermée sans désactivation, l'opérateur peut réessayer.
 */

use crate::map::AdvisoryPosition;
use crate::models::Parameter;
use crate::ranges::{Direction, ParameterRange};
use crate::store::StoreError;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

pub const ACKNOWLEDGE_NOTE: &str = "Note: For parameters like NPK, EC, and pH, changes may take time or days to appear. \
If an action is performed, please wait before checking results.";

pub fn advisory_message(parameter: Parameter, direction: Direction) -> &'static str {
    use Direction::{High, Low};
    match (parameter, direction) {
        (Parameter::Ph, Low) => "Soil pH is too low — acidic soil reduces nutrient availability and stunts growth.",
        (Parameter::Ph, High) => "Soil pH is too high — alkaline soil locks nutrients and weakens plants.",
        (Parameter::Moisture, Low) => "Soil is too dry — roots can't absorb enough water or nutrients.",
        (Parameter::Moisture, High) => "Soil is waterlogged — risk of root rot and poor plant health.",
        (Parameter::Temperature, Low) => "Soil is too cold — growth slows and flowering is delayed.",
        (Parameter::Temperature, High) => "Soil is too hot — plants are stressed and yield may drop.",
        (Parameter::Salinity, Low) => "Soil salinity is too low — may cause nutrient imbalance.",
        (Parameter::Salinity, High) => "Soil salinity is too high — roots are damaged and leaves may burn.",
        (Parameter::Nitrogen, Low) => "Nitrogen is too low — leaves turn yellow, growth slows.",
        (Parameter::Nitrogen, High) => "Nitrogen is too high — excess leaves form, flowering is delayed.",
        (Parameter::Phosphorus, Low) => "Phosphorus is too low — weak roots and poor flowering.",
        (Parameter::Phosphorus, High) => "Phosphorus is too high — micronutrient uptake is blocked, growth suffers.",
        (Parameter::Potassium, Low) => "Potassium is too low — plants are weak, bean quality drops.",
        (Parameter::Potassium, High) => "Potassium is too high — calcium and magnesium uptake is disrupted.",
        (Parameter::Ec, Low) => "EC is too low — may cause nutrient imbalance.",
        (Parameter::Ec, High) => "EC is too high — roots are damaged and leaves may burn.",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdvisoryError {
    #[error("no advisory is open")]
    NotOpen,
    #[error("unknown marker: {0}")]
    UnknownMarker(String),
    #[error("acknowledgment for {parameter} on {marker} is disabled")]
    AffordanceDisabled { marker: String, parameter: Parameter },
    #[error("node {0} has no packet to acknowledge")]
    NoPacket(String),
    #[error("an acknowledgment write is already in flight")]
    WriteInFlight,
    #[error("acknowledgment write failed: {0}")]
    Write(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenAdvisory {
    pub marker: String,
    pub parameter: Parameter,
    pub direction: Direction,
    pub message: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AdvisoryState {
    #[default]
    Closed,
    Open(OpenAdvisory),
}

/// Contenu du panneau flottant affiché sous le détail du node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisoryPanel {
    pub marker: String,
    pub parameter: Parameter,
    pub direction: Direction,
    pub message: &'static str,
    pub note: &'static str,
    pub position: Option<AdvisoryPosition>,
}

impl AdvisoryPanel {
    pub fn new(open: &OpenAdvisory, position: Option<AdvisoryPosition>) -> Self {
        Self {
            marker: open.marker.clone(),
            parameter: open.parameter,
            direction: open.direction,
            message: open.message,
            note: ACKNOWLEDGE_NOTE,
            position,
        }
    }
}

#[derive(Debug, Default)]
pub struct AdvisoryMachine {
    state: AdvisoryState,
}

impl AdvisoryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AdvisoryState {
        &self.state
    }

    pub fn open(&self) -> Option<&OpenAdvisory> {
        match &self.state {
            AdvisoryState::Open(open) => Some(open),
            AdvisoryState::Closed => None,
        }
    }

    pub fn is_open_for(&self, marker: &str, parameter: Parameter) -> bool {
        self.open()
            .is_some_and(|open| open.marker == marker && open.parameter == parameter)
    }

    /// Toggle : même paire -> Closed, sinon ouvre (et remplace l'éventuelle autre)
    pub fn request_open(
        &mut self,
        marker: &str,
        parameter: Parameter,
        value: f64,
        range: ParameterRange,
    ) -> &AdvisoryState {
        if self.is_open_for(marker, parameter) {
            self.state = AdvisoryState::Closed;
            return &self.state;
        }

        let direction = if value < range.min {
            Direction::Low
        } else {
            Direction::High
        };
        self.state = AdvisoryState::Open(OpenAdvisory {
            marker: marker.to_string(),
            parameter,
            direction,
            message: advisory_message(parameter, direction),
        });
        &self.state
    }

    /// L'acquittement ne part que depuis Open
    pub fn pending_acknowledgment(&self) -> Result<&OpenAdvisory, AdvisoryError> {
        self.open().ok_or(AdvisoryError::NotOpen)
    }

    pub fn close(&mut self) {
        self.state = AdvisoryState::Closed;
    }
}

/// Écriture d'acquittement prête à partir vers le store
#[derive(Debug, Clone, PartialEq)]
pub struct AckRequest {
    pub marker: String,
    pub tenant: String,
    pub node: String,
    pub packet_key: String,
    pub parameter: Parameter,
    /// epoch millisecondes au moment du clic
    pub acknowledged_at: i64,
}

impl AckRequest {
    pub fn new(marker: &str, tenant: &str, node: &str, packet_key: &str, parameter: Parameter) -> Self {
        Self {
            marker: marker.to_string(),
            tenant: tenant.to_string(),
            node: node.to_string(),
            packet_key: packet_key.to_string(),
            parameter,
            acknowledged_at: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }

    pub fn path(&self) -> String {
        format!(
            "Users/{}/Farm/Nodes/{}/Packets/{}/{}",
            self.tenant,
            self.node,
            self.packet_key,
            self.parameter.disabled_key()
        )
    }

    pub fn value(&self) -> Value {
        Value::from(self.acknowledged_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::range_for;

    #[test]
    fn test_toggle_same_pair_closes() {
        let mut machine = AdvisoryMachine::new();
        let range = range_for(Parameter::Ph);

        machine.request_open("alice_n1", Parameter::Ph, 5.0, range);
        assert!(machine.is_open_for("alice_n1", Parameter::Ph));

        machine.request_open("alice_n1", Parameter::Ph, 5.0, range);
        assert_eq!(machine.state(), &AdvisoryState::Closed);
    }

    #[test]
    fn test_new_pair_replaces_open_one() {
        let mut machine = AdvisoryMachine::new();
        machine.request_open("alice_n1", Parameter::Ph, 5.0, range_for(Parameter::Ph));
        machine.request_open("bob_n2", Parameter::Nitrogen, 150.0, range_for(Parameter::Nitrogen));

        let open = machine.open().unwrap();
        assert_eq!(open.marker, "bob_n2");
        assert_eq!(open.parameter, Parameter::Nitrogen);
        assert_eq!(open.direction, Direction::High);
        assert!(!machine.is_open_for("alice_n1", Parameter::Ph));
    }

    #[test]
    fn test_same_marker_other_parameter_replaces() {
        let mut machine = AdvisoryMachine::new();
        machine.request_open("alice_n1", Parameter::Ph, 5.0, range_for(Parameter::Ph));
        machine.request_open("alice_n1", Parameter::Moisture, 10.0, range_for(Parameter::Moisture));
        assert!(machine.is_open_for("alice_n1", Parameter::Moisture));
    }

    #[test]
    fn test_low_ph_message() {
        let mut machine = AdvisoryMachine::new();
        machine.request_open("alice_n1", Parameter::Ph, 5.0, range_for(Parameter::Ph));
        let open = machine.pending_acknowledgment().unwrap();
        assert_eq!(open.direction, Direction::Low);
        assert!(open.message.starts_with("Soil pH is too low"));
    }

    #[test]
    fn test_acknowledge_requires_open() {
        let machine = AdvisoryMachine::new();
        assert!(matches!(machine.pending_acknowledgment(), Err(AdvisoryError::NotOpen)));
    }

    #[test]
    fn test_ack_request_path() {
        let req = AckRequest::new("alice_n1", "alice", "n1", "-Nx42", Parameter::Ph);
        assert_eq!(req.path(), "Users/alice/Farm/Nodes/n1/Packets/-Nx42/Disabled_pH_done");
        assert!(req.value().as_i64().unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_state_serialization() {
        let closed = serde_json::to_value(AdvisoryState::Closed).unwrap();
        assert_eq!(closed["state"], "closed");

        let mut machine = AdvisoryMachine::new();
        machine.request_open("alice_n1", Parameter::Ph, 7.0, range_for(Parameter::Ph));
        let open = serde_json::to_value(machine.state()).unwrap();
        assert_eq!(open["state"], "open");
        assert_eq!(open["parameter"], "pH");
        assert_eq!(open["direction"], "high");
    }
}
