//! Station/bandwidth branches of a dataset payload.
//!
//! Payloads key their values by station and bandwidth in one of two shapes, which may be mixed
//! within a mapping:
//!
//! * composite keys `"<station>_<bandwidth>" -> value`, split at the last `_`;
//! * nested mappings `"<station>" -> {"<bandwidth>" -> value}`, for keys without `_`.

use serde_json::{Map, Value};

/// Split a composite `station_bandwidth` key at its last `_`.
pub fn split_composite(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once('_')
}

/// One station/bandwidth value of a mapping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Leaf<'a> {
    pub station: &'a str,
    pub bandwidth: &'a str,
    pub value: &'a Value,
}

fn matches(wanted: Option<&str>, actual: &str) -> bool {
    wanted.map_or(true, |wanted| wanted == actual)
}

/// Keep only the branches whose station and bandwidth match.
///
/// The shape of the mapping is preserved. Nested stations left without any bandwidth are dropped.
pub fn retain(
    mapping: &Map<String, Value>,
    station: Option<&str>,
    bandwidth: Option<&str>,
) -> Map<String, Value> {
    if station.is_none() && bandwidth.is_none() {
        return mapping.clone();
    }
    let mut retained = Map::new();
    for (key, value) in mapping {
        match split_composite(key) {
            Some((key_station, key_bandwidth)) => {
                if matches(station, key_station) && matches(bandwidth, key_bandwidth) {
                    retained.insert(key.clone(), value.clone());
                }
            }
            None => {
                if !matches(station, key) {
                    continue;
                }
                match (value, bandwidth) {
                    (_, None) => {
                        retained.insert(key.clone(), value.clone());
                    }
                    (Value::Object(bandwidths), Some(bandwidth)) => {
                        if let Some(leaf) = bandwidths.get(bandwidth) {
                            let mut kept = Map::new();
                            kept.insert(bandwidth.to_string(), leaf.clone());
                            retained.insert(key.clone(), Value::Object(kept));
                        }
                    }
                    // A bare station value has no bandwidth to match.
                    (_, Some(_)) => (),
                }
            }
        }
    }
    retained
}

/// Every station/bandwidth value of a mapping, in mapping order.
///
/// A bare value under a nested station key is reported with an empty bandwidth.
pub fn leaves(mapping: &Map<String, Value>) -> Vec<Leaf<'_>> {
    let mut leaves = vec![];
    for (key, value) in mapping {
        match (split_composite(key), value) {
            (Some((station, bandwidth)), _) => leaves.push(Leaf {
                station,
                bandwidth,
                value,
            }),
            (None, Value::Object(bandwidths)) => {
                leaves.extend(bandwidths.iter().map(|(bandwidth, value)| Leaf {
                    station: key,
                    bandwidth,
                    value,
                }))
            }
            (None, _) => leaves.push(Leaf {
                station: key,
                bandwidth: "",
                value,
            }),
        }
    }
    leaves
}

/// Replace every leaf by `f(leaf)`, dropping the leaves for which it returns `None`.
///
/// Nested stations left without any bandwidth are dropped.
pub fn filter_map_leaves<F>(mapping: &Map<String, Value>, mut f: F) -> Map<String, Value>
where
    F: FnMut(&Value) -> Option<Value>,
{
    let mut mapped = Map::new();
    for (key, value) in mapping {
        match (split_composite(key), value) {
            (None, Value::Object(bandwidths)) => {
                let bandwidths: Map<String, Value> = bandwidths
                    .iter()
                    .filter_map(|(bandwidth, value)| Some((bandwidth.clone(), f(value)?)))
                    .collect();
                if !bandwidths.is_empty() {
                    mapped.insert(key.clone(), Value::Object(bandwidths));
                }
            }
            _ => {
                if let Some(value) = f(value) {
                    mapped.insert(key.clone(), value);
                }
            }
        }
    }
    mapped
}
