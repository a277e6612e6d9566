//! Flatten nested wearable-tracker records into dotted keys and strip the
//! `score.*` prefixes so the transform layer only sees column names.
use serde_json::{Map, Value};
use std::borrow::Cow;
use tracing::warn;

use crate::whoop::Category;

const RECOVERY_RENAMES: &[(&str, &str)] = &[
    ("score.user_calibrating", "user_calibrating"),
    ("score.recovery_score", "recovery_score"),
    ("score.resting_heart_rate", "resting_heart_rate"),
    ("score.hrv_rmssd_milli", "hrv_rmssd_milli"),
    ("score.spo2_percentage", "spo2_percentage"),
    ("score.skin_temp_celsius", "skin_temp_celsius"),
];

const SLEEP_RENAMES: &[(&str, &str)] = &[
    ("score.respiratory_rate", "respiratory_rate"),
    ("score.sleep_performance_percentage", "sleep_performance_percentage"),
    ("score.sleep_consistency_percentage", "sleep_consistency_percentage"),
    ("score.sleep_efficiency_percentage", "sleep_efficiency_percentage"),
    ("score.stage_summary.total_in_bed_time_milli", "total_in_bed_time_milli"),
    ("score.stage_summary.total_awake_time_milli", "total_awake_time_milli"),
    ("score.stage_summary.total_no_data_time_milli", "total_no_data_time_milli"),
    ("score.stage_summary.total_light_sleep_time_milli", "total_light_sleep_time_milli"),
    ("score.stage_summary.total_slow_wave_sleep_time_milli", "total_slow_wave_sleep_time_milli"),
    ("score.stage_summary.total_rem_sleep_time_milli", "total_rem_sleep_time_milli"),
    ("score.stage_summary.sleep_cycle_count", "sleep_cycle_count"),
    ("score.stage_summary.disturbance_count", "disturbance_count"),
    ("score.sleep_needed.baseline_milli", "baseline_sleep_needed_milli"),
    ("score.sleep_needed.need_from_sleep_debt_milli", "need_from_sleep_debt_milli"),
    ("score.sleep_needed.need_from_recent_strain_milli", "need_from_recent_strain_milli"),
    ("score.sleep_needed.need_from_recent_nap_milli", "need_from_recent_nap_milli"),
];

const WORKOUT_RENAMES: &[(&str, &str)] = &[
    ("score.strain", "strain"),
    ("score.average_heart_rate", "average_heart_rate"),
    ("score.max_heart_rate", "max_heart_rate"),
    ("score.kilojoule", "kilojoule"),
    ("score.percent_recorded", "percent_recorded"),
    ("score.distance_meter", "distance_meter"),
    ("score.altitude_gain_meter", "altitude_gain_meter"),
    ("score.altitude_change_meter", "altitude_change_meter"),
];

const ZONES: [&str; 6] = ["zero", "one", "two", "three", "four", "five"];

/// Accept either a JSON object or a string holding one. Anything else
/// becomes an empty map.
pub fn as_record(raw: &Value) -> Cow<'_, Map<String, Value>> {
    match raw {
        Value::Object(map) => Cow::Borrowed(map),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Cow::Owned(map),
            Ok(_) => {
                warn!("payload string is not a JSON object; using empty record");
                Cow::Owned(Map::new())
            }
            Err(err) => {
                warn!(%err, "malformed payload string; using empty record");
                Cow::Owned(Map::new())
            }
        },
        _ => Cow::Owned(Map::new()),
    }
}

/// Nested objects become dotted keys; arrays and scalars are kept as-is.
pub fn flatten(raw: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into("", &as_record(raw), &mut out);
    out
}

fn flatten_into(prefix: &str, map: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, value) in map {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten_into(&full, inner, out),
            other => {
                out.insert(full, other.clone());
            }
        }
    }
}

fn renames(category: Category) -> &'static [(&'static str, &'static str)] {
    match category {
        Category::Recovery => RECOVERY_RENAMES,
        Category::Sleep => SLEEP_RENAMES,
        Category::Workout => WORKOUT_RENAMES,
    }
}

fn millis_to_minutes(ms: f64) -> f64 {
    (ms / 60_000.0 * 100.0).round() / 100.0
}

/// Flatten one record and rename its score fields to column names.
pub fn prepare(category: Category, raw: &Value) -> Value {
    let mut flat = flatten(raw);
    for (from, to) in renames(category) {
        if let Some(v) = flat.remove(*from) {
            flat.insert((*to).to_string(), v);
        }
    }
    if category == Category::Workout {
        for zone in ZONES {
            let ms = [
                format!("score.zone_durations.zone_{zone}_milli"),
                format!("score.zone_duration.zone_{zone}_milli"),
            ]
            .iter()
            .filter_map(|k| flat.remove(k))
            .find_map(|v| v.as_f64());
            if let Some(ms) = ms {
                flat.insert(
                    format!("zone_{zone}_minutes"),
                    Value::from(millis_to_minutes(ms)),
                );
            }
        }
    }
    Value::Object(flat)
}
