//! Health-monitor (scale / blood pressure cuff) client and measure-code table.
use once_cell::sync::Lazy;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{EtlError, Result};
use crate::http::{build_client, parse_base, send_with_retry, FetchWindow, RetryPolicy};
use crate::token::{CredentialFile, TokenStore, WithingsTokenEndpoint};
use crate::transform::scale;

const VENDOR: &str = "withings";

/// Which destination table a measure code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureKind {
    Body,
    Vitals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureField {
    WeightKg,
    HeightM,
    FatFreeMassKg,
    FatRatioPercent,
    FatMassKg,
    MuscleMassKg,
    HydrationKg,
    BoneMassKg,
    VisceralFat,
    DiastolicBpMmhg,
    SystolicBpMmhg,
    HeartRateBpm,
}

static MEASURE_FIELDS: Lazy<HashMap<i64, MeasureField>> = Lazy::new(|| {
    use MeasureField::*;
    HashMap::from([
        (1, WeightKg),
        (4, HeightM),
        (5, FatFreeMassKg),
        (6, FatRatioPercent),
        (8, FatMassKg),
        (76, MuscleMassKg),
        (77, HydrationKg),
        (88, BoneMassKg),
        (170, VisceralFat),
        (9, DiastolicBpMmhg),
        (10, SystolicBpMmhg),
        (11, HeartRateBpm),
    ])
});

impl MeasureField {
    pub fn lookup(code: i64) -> Option<MeasureField> {
        MEASURE_FIELDS.get(&code).copied()
    }

    pub fn kind(self) -> MeasureKind {
        match self {
            MeasureField::DiastolicBpMmhg
            | MeasureField::SystolicBpMmhg
            | MeasureField::HeartRateBpm => MeasureKind::Vitals,
            _ => MeasureKind::Body,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            MeasureField::WeightKg => "weight_kg",
            MeasureField::HeightM => "height_m",
            MeasureField::FatFreeMassKg => "fat_free_mass_kg",
            MeasureField::FatRatioPercent => "fat_ratio_percent",
            MeasureField::FatMassKg => "fat_mass_kg",
            MeasureField::MuscleMassKg => "muscle_mass_kg",
            MeasureField::HydrationKg => "hydration_kg",
            MeasureField::BoneMassKg => "bone_mass_kg",
            MeasureField::VisceralFat => "visceral_fat",
            MeasureField::DiastolicBpMmhg => "diastolic_bp_mmhg",
            MeasureField::SystolicBpMmhg => "systolic_bp_mmhg",
            MeasureField::HeartRateBpm => "heart_rate_bpm",
        }
    }
}

/// One row per measure: group metadata copied onto each, value pre-scaled.
pub fn explode_measure_groups(groups: &[Value]) -> Vec<Value> {
    let mut rows = Vec::new();
    for group in groups {
        let Some(measures) = group.get("measures").and_then(Value::as_array) else {
            continue;
        };
        for measure in measures {
            let value = measure.get("value").and_then(Value::as_f64);
            let unit = measure.get("unit").and_then(Value::as_i64).unwrap_or(0);
            rows.push(json!({
                "grpid": group.get("grpid"),
                "date": group.get("date"),
                "deviceid": group.get("deviceid"),
                "timezone": group.get("timezone"),
                "category": group.get("category"),
                "comment": group.get("comment"),
                "measure_type": measure.get("type"),
                "raw_value": measure.get("value"),
                "unit": unit,
                "actual_value": value
                    .zip(i32::try_from(unit).ok())
                    .map(|(v, unit)| scale(v, unit)),
            }));
        }
    }
    rows
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

#[derive(Clone)]
pub struct WithingsClient {
    http: Client,
    base_url: Url,
    tokens: TokenStore,
    retry: RetryPolicy,
}

impl fmt::Debug for WithingsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithingsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WithingsClient {
    pub fn new(http: Client, base_url: Url, tokens: TokenStore, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url,
            tokens,
            retry,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = build_client(cfg.app.request_timeout())?;
        let base_url = parse_base(&cfg.withings.api_base)?;
        let token_url = base_url
            .join("v2/oauth2")
            .map_err(|e| EtlError::InvalidUrl(format!("withings token URL: {e}")))?;
        let endpoint = WithingsTokenEndpoint::new(
            http.clone(),
            token_url,
            cfg.withings.client_id.clone(),
            cfg.withings.client_secret.clone(),
        );
        let tokens = TokenStore::new(
            CredentialFile::new(cfg.withings_token_path()),
            Arc::new(endpoint),
        );
        Ok(Self::new(
            http,
            base_url,
            tokens,
            RetryPolicy::from_config(&cfg.app),
        ))
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    fn measure_url(&self) -> Result<Url> {
        self.base_url
            .join("measure")
            .map_err(|e| EtlError::InvalidUrl(format!("withings measure URL: {e}")))
    }

    /// All measure groups for `meastypes` in `window`, following `more`/`offset`.
    #[instrument(skip_all, fields(meastypes = ?meastypes))]
    pub async fn get_measures(&self, meastypes: &[i64], window: &FetchWindow) -> Result<Vec<Value>> {
        let meastypes = meastypes
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut base: Vec<(&str, String)> = vec![
            ("action", "getmeas".to_string()),
            ("meastypes", meastypes),
            ("category", "1".to_string()),
        ];
        if let Some(start) = window.start {
            base.push(("startdate", start.timestamp().to_string()));
        }
        if let Some(end) = window.end {
            base.push(("enddate", end.timestamp().to_string()));
        }

        let mut groups = Vec::new();
        let mut offset: Option<i64> = None;
        let mut pages = 0usize;
        loop {
            let mut form = base.clone();
            if let Some(offset) = offset {
                form.push(("offset", offset.to_string()));
            }
            let body = self.request_page(&form).await?;
            pages += 1;
            if let Some(page) = body.get("measuregrps").and_then(Value::as_array) {
                groups.extend(page.iter().cloned());
            }
            let next = body.get("offset").and_then(Value::as_i64);
            match (truthy(body.get("more")), next) {
                (true, Some(next)) => {
                    debug!(pages, offset = next, "more measure groups available");
                    offset = Some(next);
                }
                (true, None) => {
                    warn!("response says more but carries no offset; stopping");
                    break;
                }
                (false, _) => break,
            }
        }
        info!(pages, groups = groups.len(), "fetched measure groups");
        Ok(groups)
    }

    /// One authenticated call; a 401 triggers a single forced refresh.
    async fn request_page(&self, form: &[(&str, String)]) -> Result<Value> {
        let url = self.measure_url()?;
        let mut credential = self.tokens.authenticate().await?;
        let mut refreshed = false;
        loop {
            let mut fields = form.to_vec();
            fields.push(("access_token", credential.access_token.clone()));
            let sent = send_with_retry(VENDOR, &self.retry, || {
                self.http.post(url.clone()).form(&fields)
            })
            .await;
            let res = match sent {
                Err(EtlError::Http { status: 401, .. }) if !refreshed => {
                    warn!("access token rejected; refreshing once");
                    credential = self.tokens.force_refresh().await?;
                    refreshed = true;
                    continue;
                }
                other => other?,
            };
            let envelope: Value = res.json().await?;
            let status = envelope.get("status").and_then(Value::as_i64).unwrap_or(-1);
            if status != 0 {
                return Err(EtlError::VendorStatus {
                    vendor: VENDOR,
                    status,
                });
            }
            return Ok(envelope.get("body").cloned().unwrap_or(Value::Null));
        }
    }
}
