//! Évaluation d'une lecture capteur contre sa plage normale.
//!
//! Deux domaines indépendants : la plage agronomique (`range_for`) décide de
//! `in_range`, l'échelle d'affichage (`display_percent`) ne sert qu'à la barre.

use crate::models::{coerce_number, Parameter};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
}

impl ParameterRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub value: f64,
    /// Toujours dans [0, 100]
    pub percent: f64,
    pub in_range: bool,
    /// None quand la lecture est dans la plage
    pub direction: Option<Direction>,
}

pub fn range_for(parameter: Parameter) -> ParameterRange {
    let (min, max) = match parameter {
        Parameter::Ph => (6.00, 6.50),
        Parameter::Moisture => (30.00, 50.00),
        Parameter::Temperature => (18.00, 24.00),
        Parameter::Salinity => (0.50, 2.00),
        Parameter::Ec => (0.50, 2.00),
        Parameter::Nitrogen => (80.00, 120.00),
        Parameter::Phosphorus => (20.00, 40.00),
        Parameter::Potassium => (80.00, 120.00),
    };
    ParameterRange { min, max }
}

/// Lecture brute -> f64 ; absente ou illisible vaut 0
pub fn parse_reading(raw: Option<&Value>) -> f64 {
    raw.and_then(coerce_number).unwrap_or(0.0)
}

pub fn evaluate(parameter: Parameter, raw: Option<&Value>) -> Evaluation {
    evaluate_value(parameter, parse_reading(raw))
}

pub fn evaluate_value(parameter: Parameter, value: f64) -> Evaluation {
    let range = range_for(parameter);
    let in_range = range.contains(value);
    let direction = match (in_range, value < range.min) {
        (true, _) => None,
        (false, true) => Some(Direction::Low),
        (false, false) => Some(Direction::High),
    };

    Evaluation {
        value,
        percent: display_percent(parameter, value).clamp(0.0, 100.0),
        in_range,
        direction,
    }
}

const LOG_FLOOR: f64 = 0.01;
const LOG_CEIL: f64 = 20.0;

fn display_percent(parameter: Parameter, value: f64) -> f64 {
    let percent = match parameter {
        Parameter::Ph => (value - 3.0) / (9.0 - 3.0) * 100.0,
        Parameter::Moisture => value,
        Parameter::Temperature => (value + 30.0) / (70.0 + 30.0) * 100.0,
        Parameter::Salinity
        | Parameter::Ec
        | Parameter::Nitrogen
        | Parameter::Phosphorus
        | Parameter::Potassium => {
            (value.max(LOG_FLOOR).log10() - LOG_FLOOR.log10())
                / (LOG_CEIL.log10() - LOG_FLOOR.log10())
                * 100.0
        }
    };
    // NaN ne survit pas au clamp, on le ramène à 0
    if percent.is_nan() {
        0.0
    } else {
        percent
    }
}
