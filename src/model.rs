//! Flat, storage-ready records produced by the transform layer.
//!
//! Every field is nullable unless noted: the vendors omit whole sub-objects
//! when a metric has not been scored yet, and the transform never fails on a
//! missing key.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScoreState {
    Scored,
    PendingScore,
    Unscorable,
}

impl ScoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreState::Scored => "SCORED",
            ScoreState::PendingScore => "PENDING_SCORE",
            ScoreState::Unscorable => "UNSCORABLE",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SCORED" => Some(ScoreState::Scored),
            "PENDING_SCORE" | "PENDING" => Some(ScoreState::PendingScore),
            "UNSCORABLE" | "UNSCORED" => Some(ScoreState::Unscorable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecoveryCategory {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WeightCategory {
    Underweight,
    Normal,
    Overweight,
    Obese,
}

/// Blood pressure bands as published by the AHA.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BloodPressureCategory {
    Normal,
    Elevated,
    Stage1High,
    Stage2High,
    Crisis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecoveryRecord {
    pub user_id: Option<i64>,
    pub cycle_id: Option<i64>,
    pub sleep_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub score_state: Option<String>,
    pub user_calibrating: Option<bool>,
    pub recovery_score: Option<f64>,
    pub resting_heart_rate: Option<f64>,
    pub hrv_rmssd_milli: Option<f64>,
    pub spo2_percentage: Option<f64>,
    pub skin_temp_celsius: Option<f64>,
}

impl RecoveryRecord {
    pub fn category(&self) -> Option<RecoveryCategory> {
        let score = self.recovery_score?;
        Some(if score >= 67.0 {
            RecoveryCategory::Green
        } else if score >= 34.0 {
            RecoveryCategory::Yellow
        } else {
            RecoveryCategory::Red
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SleepRecord {
    /// Legacy numeric id when the vendor still provides one, else the current id.
    pub sleep_id: Option<String>,
    pub user_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub timezone_offset: Option<String>,
    pub nap: Option<bool>,
    pub score_state: Option<String>,
    pub respiratory_rate: Option<f64>,
    pub sleep_performance_percentage: Option<f64>,
    pub sleep_consistency_percentage: Option<f64>,
    pub sleep_efficiency_percentage: Option<f64>,
    pub total_in_bed_time_milli: Option<i64>,
    pub total_awake_time_milli: Option<i64>,
    pub total_no_data_time_milli: Option<i64>,
    pub total_light_sleep_time_milli: Option<i64>,
    pub total_slow_wave_sleep_time_milli: Option<i64>,
    pub total_rem_sleep_time_milli: Option<i64>,
    pub sleep_cycle_count: Option<i64>,
    pub disturbance_count: Option<i64>,
    pub baseline_sleep_needed_milli: Option<i64>,
    pub need_from_sleep_debt_milli: Option<i64>,
    pub need_from_recent_strain_milli: Option<i64>,
    pub need_from_recent_nap_milli: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkoutRecord {
    pub workout_id: Option<String>,
    pub user_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub timezone_offset: Option<String>,
    pub sport_id: Option<i64>,
    pub sport_name: Option<String>,
    pub score_state: Option<String>,
    pub strain: Option<f64>,
    pub average_heart_rate: Option<f64>,
    pub max_heart_rate: Option<f64>,
    pub kilojoule: Option<f64>,
    pub percent_recorded: Option<f64>,
    pub distance_meter: Option<f64>,
    pub altitude_gain_meter: Option<f64>,
    pub altitude_change_meter: Option<f64>,
    pub zone_zero_minutes: f64,
    pub zone_one_minutes: f64,
    pub zone_two_minutes: f64,
    pub zone_three_minutes: f64,
    pub zone_four_minutes: f64,
    pub zone_five_minutes: f64,
}

impl WorkoutRecord {
    pub fn total_zone_minutes(&self) -> f64 {
        self.zone_zero_minutes
            + self.zone_one_minutes
            + self.zone_two_minutes
            + self.zone_three_minutes
            + self.zone_four_minutes
            + self.zone_five_minutes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BodyMeasurementRecord {
    pub grpid: Option<i64>,
    pub deviceid: Option<String>,
    /// Epoch seconds as reported by the vendor.
    pub date: Option<i64>,
    pub measured_at: DateTime<Utc>,
    pub timezone: Option<String>,
    pub comment: Option<String>,
    pub category: i64,
    pub weight_kg: Option<f64>,
    pub height_m: Option<f64>,
    pub fat_free_mass_kg: Option<f64>,
    pub fat_ratio_percent: Option<f64>,
    pub fat_mass_kg: Option<f64>,
    pub muscle_mass_kg: Option<f64>,
    pub bone_mass_kg: Option<f64>,
    pub hydration_kg: Option<f64>,
    pub visceral_fat: Option<f64>,
    pub unknown_measure_type: Option<i64>,
    pub unknown_value: Option<f64>,
}

impl BodyMeasurementRecord {
    pub fn bmi(&self) -> Option<f64> {
        match (self.weight_kg, self.height_m) {
            (Some(w), Some(h)) if h > 0.0 => Some((w / (h * h) * 10.0).round() / 10.0),
            _ => None,
        }
    }

    pub fn weight_category(&self) -> Option<WeightCategory> {
        let bmi = self.bmi()?;
        Some(if bmi < 18.5 {
            WeightCategory::Underweight
        } else if bmi < 25.0 {
            WeightCategory::Normal
        } else if bmi < 30.0 {
            WeightCategory::Overweight
        } else {
            WeightCategory::Obese
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VitalsRecord {
    pub grpid: Option<i64>,
    pub deviceid: Option<String>,
    pub date: Option<i64>,
    pub measured_at: DateTime<Utc>,
    pub timezone: Option<String>,
    pub category: i64,
    pub diastolic_bp_mmhg: Option<f64>,
    pub systolic_bp_mmhg: Option<f64>,
    pub heart_rate_bpm: Option<f64>,
    pub unknown_measure_type: Option<i64>,
    pub unknown_value: Option<f64>,
}

impl VitalsRecord {
    pub fn bp_category(&self) -> Option<BloodPressureCategory> {
        let (sys, dia) = (self.systolic_bp_mmhg?, self.diastolic_bp_mmhg?);
        Some(if sys < 120.0 && dia < 80.0 {
            BloodPressureCategory::Normal
        } else if sys < 130.0 && dia < 80.0 {
            BloodPressureCategory::Elevated
        } else if sys < 140.0 && dia < 90.0 {
            BloodPressureCategory::Stage1High
        } else if sys <= 180.0 && dia <= 120.0 {
            BloodPressureCategory::Stage2High
        } else {
            BloodPressureCategory::Crisis
        })
    }
}
