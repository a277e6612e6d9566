//! Pure transforms from prepared vendor records to storage records.
//!
//! None of these functions fail: missing or mistyped fields become `None`.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use crate::flatten::as_record;
use crate::model::{
    BodyMeasurementRecord, RecoveryRecord, ScoreState, SleepRecord, VitalsRecord, WorkoutRecord,
};
use crate::withings::{MeasureField, MeasureKind};

/// ISO-8601 with a trailing `Z`, an explicit offset, or no offset (read as UTC).
pub fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn f64_field(m: &Map<String, Value>, key: &str) -> Option<f64> {
    match m.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn i64_field(m: &Map<String, Value>, key: &str) -> Option<i64> {
    match m.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_field(m: &Map<String, Value>, key: &str) -> Option<String> {
    match m.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_field(m: &Map<String, Value>, key: &str) -> Option<bool> {
    match m.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn time_field(m: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(m.get(key))
}

/// Canonical spelling for known states; unknown values pass through.
fn score_state(m: &Map<String, Value>) -> Option<String> {
    let raw = string_field(m, "score_state")?;
    Some(match ScoreState::parse_state(&raw) {
        Some(state) => state.as_str().to_string(),
        None => raw,
    })
}

fn legacy_or_current_id(m: &Map<String, Value>) -> Option<String> {
    string_field(m, "v1_id").or_else(|| string_field(m, "id"))
}

pub fn transform_recovery(raw: &Value) -> RecoveryRecord {
    let m = as_record(raw);
    RecoveryRecord {
        user_id: i64_field(&m, "user_id"),
        cycle_id: i64_field(&m, "cycle_id"),
        sleep_id: string_field(&m, "sleep_id"),
        created_at: time_field(&m, "created_at"),
        updated_at: time_field(&m, "updated_at"),
        score_state: score_state(&m),
        user_calibrating: bool_field(&m, "user_calibrating"),
        recovery_score: f64_field(&m, "recovery_score"),
        resting_heart_rate: f64_field(&m, "resting_heart_rate"),
        hrv_rmssd_milli: f64_field(&m, "hrv_rmssd_milli"),
        spo2_percentage: f64_field(&m, "spo2_percentage"),
        skin_temp_celsius: f64_field(&m, "skin_temp_celsius"),
    }
}

pub fn transform_sleep(raw: &Value) -> SleepRecord {
    let m = as_record(raw);
    SleepRecord {
        sleep_id: legacy_or_current_id(&m),
        user_id: i64_field(&m, "user_id"),
        created_at: time_field(&m, "created_at"),
        updated_at: time_field(&m, "updated_at"),
        start_time: time_field(&m, "start"),
        end_time: time_field(&m, "end"),
        timezone_offset: string_field(&m, "timezone_offset"),
        nap: bool_field(&m, "nap"),
        score_state: score_state(&m),
        respiratory_rate: f64_field(&m, "respiratory_rate"),
        sleep_performance_percentage: f64_field(&m, "sleep_performance_percentage"),
        sleep_consistency_percentage: f64_field(&m, "sleep_consistency_percentage"),
        sleep_efficiency_percentage: f64_field(&m, "sleep_efficiency_percentage"),
        total_in_bed_time_milli: i64_field(&m, "total_in_bed_time_milli")
            .or_else(|| i64_field(&m, "total_time_in_bed_time_milli")),
        total_awake_time_milli: i64_field(&m, "total_awake_time_milli"),
        total_no_data_time_milli: i64_field(&m, "total_no_data_time_milli"),
        total_light_sleep_time_milli: i64_field(&m, "total_light_sleep_time_milli"),
        total_slow_wave_sleep_time_milli: i64_field(&m, "total_slow_wave_sleep_time_milli"),
        total_rem_sleep_time_milli: i64_field(&m, "total_rem_sleep_time_milli"),
        sleep_cycle_count: i64_field(&m, "sleep_cycle_count"),
        disturbance_count: i64_field(&m, "disturbance_count"),
        baseline_sleep_needed_milli: i64_field(&m, "baseline_sleep_needed_milli"),
        need_from_sleep_debt_milli: i64_field(&m, "need_from_sleep_debt_milli"),
        need_from_recent_strain_milli: i64_field(&m, "need_from_recent_strain_milli"),
        need_from_recent_nap_milli: i64_field(&m, "need_from_recent_nap_milli"),
    }
}

pub fn transform_workout(raw: &Value) -> WorkoutRecord {
    let m = as_record(raw);
    let zone = |key: &str| f64_field(&m, key).unwrap_or(0.0);
    WorkoutRecord {
        workout_id: legacy_or_current_id(&m),
        user_id: i64_field(&m, "user_id"),
        created_at: time_field(&m, "created_at"),
        updated_at: time_field(&m, "updated_at"),
        start_time: time_field(&m, "start"),
        end_time: time_field(&m, "end"),
        timezone_offset: string_field(&m, "timezone_offset"),
        sport_id: i64_field(&m, "sport_id"),
        sport_name: string_field(&m, "sport_name"),
        score_state: score_state(&m),
        strain: f64_field(&m, "strain"),
        average_heart_rate: f64_field(&m, "average_heart_rate"),
        max_heart_rate: f64_field(&m, "max_heart_rate"),
        kilojoule: f64_field(&m, "kilojoule"),
        percent_recorded: f64_field(&m, "percent_recorded"),
        distance_meter: f64_field(&m, "distance_meter"),
        altitude_gain_meter: f64_field(&m, "altitude_gain_meter"),
        altitude_change_meter: f64_field(&m, "altitude_change_meter"),
        zone_zero_minutes: zone("zone_zero_minutes"),
        zone_one_minutes: zone("zone_one_minutes"),
        zone_two_minutes: zone("zone_two_minutes"),
        zone_three_minutes: zone("zone_three_minutes"),
        zone_four_minutes: zone("zone_four_minutes"),
        zone_five_minutes: zone("zone_five_minutes"),
    }
}

/// Explicit `datetime`, else epoch `date`, else `now`.
fn measured_at(m: &Map<String, Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    time_field(m, "datetime")
        .or_else(|| i64_field(m, "date").and_then(|secs| DateTime::from_timestamp(secs, 0)))
        .unwrap_or(now)
}

/// Pre-scaled value when present, else `value * 10^unit`.
fn actual_value(m: &Map<String, Value>) -> Option<f64> {
    if let Some(v) = f64_field(m, "actual_value") {
        return Some(v);
    }
    let value = f64_field(m, "raw_value").or_else(|| f64_field(m, "value"))?;
    // An exponent outside i32 is not a real unit; the value is unknown.
    let unit = match i64_field(m, "unit") {
        Some(unit) => i32::try_from(unit).ok()?,
        None => 0,
    };
    Some(scale(value, unit))
}

pub(crate) fn scale(value: f64, unit: i32) -> f64 {
    // Divide for negative exponents so 720e-1 is exactly 72.0.
    let magnitude = 10f64.powi(unit.saturating_abs());
    if unit >= 0 {
        value * magnitude
    } else {
        value / magnitude
    }
}

/// The measure's destination column for `kind`, or `Err(code)` for the unknown bucket.
fn resolve(m: &Map<String, Value>, kind: MeasureKind) -> Option<Result<MeasureField, i64>> {
    let code = i64_field(m, "measure_type")?;
    Some(match MeasureField::lookup(code) {
        Some(field) if field.kind() == kind => Ok(field),
        _ => Err(code),
    })
}

pub fn transform_body_measurement(raw: &Value) -> BodyMeasurementRecord {
    transform_body_measurement_at(raw, Utc::now())
}

pub fn transform_body_measurement_at(raw: &Value, now: DateTime<Utc>) -> BodyMeasurementRecord {
    let m = as_record(raw);
    let mut rec = BodyMeasurementRecord {
        grpid: i64_field(&m, "grpid"),
        deviceid: string_field(&m, "deviceid"),
        date: i64_field(&m, "date"),
        measured_at: measured_at(&m, now),
        timezone: string_field(&m, "timezone"),
        comment: string_field(&m, "comment"),
        category: i64_field(&m, "category").unwrap_or(1),
        ..Default::default()
    };
    let value = actual_value(&m);
    match resolve(&m, MeasureKind::Body) {
        Some(Ok(field)) => set_body_field(&mut rec, field, value),
        Some(Err(code)) => {
            rec.unknown_measure_type = Some(code);
            rec.unknown_value = value;
        }
        None => {}
    }
    rec
}

fn set_body_field(rec: &mut BodyMeasurementRecord, field: MeasureField, value: Option<f64>) {
    let slot = match field {
        MeasureField::WeightKg => &mut rec.weight_kg,
        MeasureField::HeightM => &mut rec.height_m,
        MeasureField::FatFreeMassKg => &mut rec.fat_free_mass_kg,
        MeasureField::FatRatioPercent => &mut rec.fat_ratio_percent,
        MeasureField::FatMassKg => &mut rec.fat_mass_kg,
        MeasureField::MuscleMassKg => &mut rec.muscle_mass_kg,
        MeasureField::HydrationKg => &mut rec.hydration_kg,
        MeasureField::BoneMassKg => &mut rec.bone_mass_kg,
        MeasureField::VisceralFat => &mut rec.visceral_fat,
        _ => return,
    };
    *slot = value;
}

pub fn transform_vitals(raw: &Value) -> VitalsRecord {
    transform_vitals_at(raw, Utc::now())
}

pub fn transform_vitals_at(raw: &Value, now: DateTime<Utc>) -> VitalsRecord {
    let m = as_record(raw);
    let mut rec = VitalsRecord {
        grpid: i64_field(&m, "grpid"),
        deviceid: string_field(&m, "deviceid"),
        date: i64_field(&m, "date"),
        measured_at: measured_at(&m, now),
        timezone: string_field(&m, "timezone"),
        category: i64_field(&m, "category").unwrap_or(1),
        ..Default::default()
    };
    let value = actual_value(&m);
    match resolve(&m, MeasureKind::Vitals) {
        Some(Ok(MeasureField::DiastolicBpMmhg)) => rec.diastolic_bp_mmhg = value,
        Some(Ok(MeasureField::SystolicBpMmhg)) => rec.systolic_bp_mmhg = value,
        Some(Ok(MeasureField::HeartRateBpm)) => rec.heart_rate_bpm = value,
        Some(Ok(_)) => {}
        Some(Err(code)) => {
            rec.unknown_measure_type = Some(code);
            rec.unknown_value = value;
        }
        None => {}
    }
    rec
}

/// Combines sparse rows that belong to one measure group: the first
/// non-null value wins per column. Rows without a `grpid` stay separate.
/// Output keeps first-seen order.
pub trait MergeMeasures: Sized {
    fn grpid(&self) -> Option<i64>;
    fn absorb(&mut self, other: Self);
}

pub fn merge_measure_group<T: MergeMeasures>(rows: Vec<T>) -> Vec<T> {
    let mut merged: Vec<T> = Vec::with_capacity(rows.len());
    let mut index: HashMap<i64, usize> = HashMap::new();
    for row in rows {
        match row.grpid() {
            Some(grpid) => match index.get(&grpid) {
                Some(&i) => merged[i].absorb(row),
                None => {
                    index.insert(grpid, merged.len());
                    merged.push(row);
                }
            },
            None => merged.push(row),
        }
    }
    merged
}

/// A merged row has one unknown-code slot; any further unknown code is logged.
fn note_dropped_unknown(grpid: Option<i64>, kept: Option<i64>, incoming: Option<i64>) {
    if let (Some(kept), Some(dropped)) = (kept, incoming) {
        if kept != dropped {
            warn!(?grpid, kept, dropped, "measure group has several unknown codes; keeping the first");
        }
    }
}

macro_rules! absorb_fields {
    ($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $( if $self.$field.is_none() { $self.$field = $other.$field; } )+
    };
}

impl MergeMeasures for BodyMeasurementRecord {
    fn grpid(&self) -> Option<i64> {
        self.grpid
    }

    fn absorb(&mut self, other: Self) {
        note_dropped_unknown(self.grpid, self.unknown_measure_type, other.unknown_measure_type);
        absorb_fields!(
            self,
            other,
            deviceid,
            date,
            timezone,
            comment,
            weight_kg,
            height_m,
            fat_free_mass_kg,
            fat_ratio_percent,
            fat_mass_kg,
            muscle_mass_kg,
            bone_mass_kg,
            hydration_kg,
            visceral_fat,
            unknown_measure_type,
            unknown_value,
        );
    }
}

impl MergeMeasures for VitalsRecord {
    fn grpid(&self) -> Option<i64> {
        self.grpid
    }

    fn absorb(&mut self, other: Self) {
        note_dropped_unknown(self.grpid, self.unknown_measure_type, other.unknown_measure_type);
        absorb_fields!(
            self,
            other,
            deviceid,
            date,
            timezone,
            diastolic_bp_mmhg,
            systolic_bp_mmhg,
            heart_rate_bpm,
            unknown_measure_type,
            unknown_value,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn timestamps_normalize_to_utc() {
        let expected = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp(Some(&json!("2023-01-01T10:00:00Z"))), Some(expected));
        assert_eq!(
            parse_timestamp(Some(&json!("2023-01-01T12:00:00+02:00"))),
            Some(expected)
        );
        assert_eq!(parse_timestamp(Some(&json!("2023-01-01T10:00:00"))), Some(expected));
        assert_eq!(parse_timestamp(Some(&Value::Null)), None);
        assert_eq!(parse_timestamp(None), None);
        assert_eq!(parse_timestamp(Some(&json!(""))), None);
        assert_eq!(parse_timestamp(Some(&json!("yesterday"))), None);
    }

    #[test]
    fn recovery_picks_columns_and_is_repeatable() {
        let raw = json!({
            "cycle_id": 93845,
            "sleep_id": "123e4567-e89b-12d3-a456-426614174000",
            "user_id": 10129,
            "created_at": "2022-04-24T11:25:44.774Z",
            "score_state": "SCORED",
            "recovery_score": 44,
            "resting_heart_rate": 64,
            "hrv_rmssd_milli": 31.813562,
            "user_calibrating": false,
            "ignored": "x"
        });
        let rec = transform_recovery(&raw);
        assert_eq!(rec.cycle_id, Some(93845));
        assert_eq!(rec.recovery_score, Some(44.0));
        assert_eq!(rec.score_state.as_deref(), Some("SCORED"));
        assert_eq!(rec.user_calibrating, Some(false));
        assert_eq!(rec.updated_at, None);
        assert_eq!(transform_recovery(&raw), rec);
    }

    #[test]
    fn score_state_spellings_are_canonicalized() {
        let rec = transform_recovery(&json!({"score_state": "pending"}));
        assert_eq!(rec.score_state.as_deref(), Some("PENDING_SCORE"));
        let rec = transform_recovery(&json!({"score_state": "SOMETHING_NEW"}));
        assert_eq!(rec.score_state.as_deref(), Some("SOMETHING_NEW"));
    }

    #[test]
    fn malformed_string_payload_yields_empty_record() {
        assert_eq!(transform_recovery(&json!("{not json")), RecoveryRecord::default());
        let rec = transform_recovery(&json!(r#"{"cycle_id": 7}"#));
        assert_eq!(rec.cycle_id, Some(7));
    }

    #[test]
    fn sleep_prefers_legacy_id() {
        assert_eq!(
            transform_sleep(&json!({"v1_id": "A", "id": "B"})).sleep_id.as_deref(),
            Some("A")
        );
        assert_eq!(transform_sleep(&json!({"id": "B"})).sleep_id.as_deref(), Some("B"));
        assert_eq!(
            transform_sleep(&json!({"v1_id": 93845, "id": "B"})).sleep_id.as_deref(),
            Some("93845")
        );
    }

    #[test]
    fn workout_prefers_legacy_id() {
        assert_eq!(
            transform_workout(&json!({"v1_id": 1_043_381, "id": "B"})).workout_id.as_deref(),
            Some("1043381")
        );
        assert_eq!(
            transform_workout(&json!({"v1_id": "A", "id": "B"})).workout_id.as_deref(),
            Some("A")
        );
        assert_eq!(transform_workout(&json!({"id": "B"})).workout_id.as_deref(), Some("B"));
    }

    #[test]
    fn sleep_accepts_both_in_bed_spellings() {
        let rec = transform_sleep(&json!({"total_time_in_bed_time_milli": 30_000_000}));
        assert_eq!(rec.total_in_bed_time_milli, Some(30_000_000));
    }

    #[test]
    fn workout_zones_default_to_zero() {
        let rec = transform_workout(&json!({
            "id": "w-1",
            "start": "2023-01-01T10:00:00Z",
            "end": "2023-01-01T11:00:00Z",
            "zone_two_minutes": 12.5
        }));
        assert_eq!(rec.workout_id.as_deref(), Some("w-1"));
        assert_eq!(rec.zone_two_minutes, 12.5);
        assert_eq!(rec.zone_zero_minutes, 0.0);
        assert_eq!(rec.total_zone_minutes(), 12.5);
        assert!(rec.end_time > rec.start_time);
    }

    #[test]
    fn weight_row_fans_out_to_one_column() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rec = transform_body_measurement_at(
            &json!({"grpid": 1, "date": 1_700_000_000, "measure_type": 1, "value": 720, "unit": -1}),
            now,
        );
        assert_eq!(rec.weight_kg, Some(72.0));
        assert_eq!(rec.height_m, None);
        assert_eq!(rec.fat_free_mass_kg, None);
        assert_eq!(rec.fat_ratio_percent, None);
        assert_eq!(rec.fat_mass_kg, None);
        assert_eq!(rec.muscle_mass_kg, None);
        assert_eq!(rec.bone_mass_kg, None);
        assert_eq!(rec.hydration_kg, None);
        assert_eq!(rec.visceral_fat, None);
        assert_eq!(rec.unknown_measure_type, None);
        assert_eq!(rec.measured_at, DateTime::from_timestamp(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn measured_at_prefers_datetime_then_date_then_now() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rec = transform_vitals_at(
            &json!({"datetime": "2023-06-01T08:00:00Z", "date": 1_700_000_000}),
            now,
        );
        assert_eq!(rec.measured_at, Utc.with_ymd_and_hms(2023, 6, 1, 8, 0, 0).unwrap());
        assert_eq!(transform_vitals_at(&json!({}), now).measured_at, now);
    }

    #[test]
    fn codes_outside_the_category_land_in_unknown_bucket() {
        let now = Utc::now();
        let rec = transform_vitals_at(&json!({"measure_type": 1, "actual_value": 72.0}), now);
        assert_eq!(rec.unknown_measure_type, Some(1));
        assert_eq!(rec.unknown_value, Some(72.0));
        assert_eq!(rec.systolic_bp_mmhg, None);

        let rec = transform_body_measurement_at(&json!({"measure_type": 999, "actual_value": 3.0}), now);
        assert_eq!(rec.unknown_measure_type, Some(999));
    }

    #[test]
    fn merge_combines_rows_of_one_group() {
        let now = Utc::now();
        let rows = vec![
            transform_vitals_at(&json!({"grpid": 7, "measure_type": 9, "actual_value": 80.0}), now),
            transform_vitals_at(&json!({"grpid": 8, "measure_type": 11, "actual_value": 58.0}), now),
            transform_vitals_at(&json!({"grpid": 7, "measure_type": 10, "actual_value": 120.0}), now),
        ];
        let merged = merge_measure_group(rows);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].grpid, Some(7));
        assert_eq!(merged[0].diastolic_bp_mmhg, Some(80.0));
        assert_eq!(merged[0].systolic_bp_mmhg, Some(120.0));
        assert_eq!(merged[1].heart_rate_bpm, Some(58.0));
    }

    #[test]
    fn scale_handles_both_exponent_signs() {
        assert_eq!(scale(720.0, -1), 72.0);
        assert_eq!(scale(1.0, 2), 100.0);
        assert_eq!(scale(5.0, 0), 5.0);
        assert_eq!(scale(720.0, i32::MIN), 0.0);
        assert_eq!(scale(720.0, i32::MAX), f64::INFINITY);
    }

    #[test]
    fn extreme_units_do_not_produce_a_value() {
        let now = Utc::now();
        for unit in [i64::from(i32::MIN) - 1, 4_294_967_295, i64::MIN, i64::MAX] {
            let rec = transform_body_measurement_at(
                &json!({"grpid": 1, "measure_type": 1, "value": 720, "unit": unit}),
                now,
            );
            assert_eq!(rec.weight_kg, None, "unit {unit}");
        }
        let rec = transform_body_measurement_at(
            &json!({"grpid": 1, "measure_type": 1, "value": 720, "unit": i64::from(i32::MIN)}),
            now,
        );
        assert_eq!(rec.weight_kg, Some(0.0));
    }

    #[test]
    fn merge_keeps_first_unknown_code() {
        let now = Utc::now();
        let rows = vec![
            transform_body_measurement_at(&json!({"grpid": 3, "measure_type": 1, "actual_value": 70.0}), now),
            transform_body_measurement_at(&json!({"grpid": 3, "measure_type": 500, "actual_value": 1.0}), now),
            transform_body_measurement_at(&json!({"grpid": 3, "measure_type": 501, "actual_value": 2.0}), now),
        ];
        let merged = merge_measure_group(rows);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].weight_kg, Some(70.0));
        assert_eq!(merged[0].unknown_measure_type, Some(500));
        assert_eq!(merged[0].unknown_value, Some(1.0));
    }
}
