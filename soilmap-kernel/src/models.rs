/**
 * MODELS - Arbre télémétrie multi-tenant tel que livré par le store
 *
 * Forme attendue sous `Users` :
 *   Users/<tenant>/Farm/Nodes/<node>/Coordinates {X, Y}
 *   Users/<tenant>/Farm/Nodes/<node>/Packets/<packet_key>/{temperature, ph, ..., Disabled_<Param>_done}
 *
 * Les snapshots sont immuables : on les aplatit une fois en `TelemetrySnapshot`
 * puis le reconciler travaille dessus.
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Les 8 paramètres mesurés par un node, dans l'ordre d'affichage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parameter {
    Temperature,
    Moisture,
    #[serde(rename = "pH")]
    Ph,
    Salinity,
    #[serde(rename = "EC")]
    Ec,
    Nitrogen,
    Phosphorus,
    Potassium,
}

impl Parameter {
    pub const ALL: [Parameter; 8] = [
        Parameter::Temperature,
        Parameter::Moisture,
        Parameter::Ph,
        Parameter::Salinity,
        Parameter::Ec,
        Parameter::Nitrogen,
        Parameter::Phosphorus,
        Parameter::Potassium,
    ];

    /// Nom affiché, aussi utilisé dans les clés `Disabled_<Param>_done`
    pub fn name(self) -> &'static str {
        match self {
            Parameter::Temperature => "Temperature",
            Parameter::Moisture => "Moisture",
            Parameter::Ph => "pH",
            Parameter::Salinity => "Salinity",
            Parameter::Ec => "EC",
            Parameter::Nitrogen => "Nitrogen",
            Parameter::Phosphorus => "Phosphorus",
            Parameter::Potassium => "Potassium",
        }
    }

    /// Clé de la lecture dans un packet (toujours en minuscules)
    pub fn reading_key(self) -> String {
        self.name().to_lowercase()
    }

    pub fn disabled_key(self) -> String {
        format!("Disabled_{}_done", self.name())
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown parameter: {0}")]
pub struct UnknownParameter(pub String);

impl FromStr for Parameter {
    type Err = UnknownParameter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownParameter(s.to_string()))
    }
}

/// Position d'un node : X = longitude, Y = latitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

/// Identifiant composite d'un marker : `<tenant>_<node>`
pub fn marker_key(tenant: &str, node: &str) -> String {
    format!("{tenant}_{node}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub key: String,
    pub fields: Map<String, Value>,
}

impl Packet {
    pub fn reading(&self, parameter: Parameter) -> Option<&Value> {
        self.fields.get(&parameter.reading_key())
    }

    /// Vrai si un acquittement a déjà été enregistré pour ce paramètre sur ce packet
    pub fn is_acknowledged(&self, parameter: Parameter) -> bool {
        self.fields.contains_key(&parameter.disabled_key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub tenant: String,
    pub name: String,
    pub coordinates: Option<Coordinates>,
    /// Ordre d'insertion du store, le dernier est le plus récent
    pub packets: Vec<Packet>,
}

impl NodeSnapshot {
    pub fn key(&self) -> String {
        marker_key(&self.tenant, &self.name)
    }

    pub fn latest_packet(&self) -> Option<&Packet> {
        self.packets.last()
    }
}

/// Vue aplatie de `Users` : tous les nodes de tous les tenants, ordre du store conservé
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

impl TelemetrySnapshot {
    /// Construit la vue depuis la valeur brute de `Users`.
    /// Un arbre null ou non-objet donne un snapshot vide.
    pub fn from_users(users: &Value) -> Self {
        let Some(tenants) = users.as_object() else {
            return Self::default();
        };

        let mut nodes = Vec::new();
        for (tenant, tenant_data) in tenants {
            let Some(farm_nodes) = tenant_data
                .get("Farm")
                .and_then(|farm| farm.get("Nodes"))
                .and_then(Value::as_object)
            else {
                continue;
            };

            for (name, node_data) in farm_nodes {
                nodes.push(NodeSnapshot {
                    tenant: tenant.clone(),
                    name: name.clone(),
                    coordinates: parse_coordinates(node_data.get("Coordinates")),
                    packets: parse_packets(node_data.get("Packets")),
                });
            }
        }

        Self { nodes }
    }
}

fn parse_coordinates(raw: Option<&Value>) -> Option<Coordinates> {
    let raw = raw?;
    let x = coerce_number(raw.get("X")?)?;
    let y = coerce_number(raw.get("Y")?)?;
    Some(Coordinates { x, y })
}

fn parse_packets(raw: Option<&Value>) -> Vec<Packet> {
    let to_packet = |key: String, value: &Value| Packet {
        key,
        fields: value.as_object().cloned().unwrap_or_default(),
    };

    match raw {
        Some(Value::Object(packets)) => packets
            .iter()
            .map(|(key, value)| to_packet(key.clone(), value))
            .collect(),
        // clés numériques séquentielles : le store renvoie un tableau, trous à null
        Some(Value::Array(packets)) => packets
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_null())
            .map(|(index, value)| to_packet(index.to_string(), value))
            .collect(),
        _ => Vec::new(),
    }
}

/// Nombre JSON ou chaîne numérique, valeurs non finies rejetées
pub fn coerce_number(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_float_prefix(s)?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// Lit le plus long préfixe numérique ("6.2 pH" -> 6.2), comme le firmware des nodes l'envoie parfois.
/// Un seul passage : signe, chiffres, `.` et chiffres, exposant seulement s'il a au moins un chiffre.
fn parse_float_prefix(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let digits_from = |start: usize| bytes[start..].iter().take_while(|b| b.is_ascii_digit()).count();

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_digits = digits_from(end);
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digits_from(end + 1);
        if int_digits > 0 || frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = digits_from(exp);
        if exp_digits > 0 {
            end = exp + exp_digits;
        }
    }

    s[..end].parse::<f64>().ok()
}
