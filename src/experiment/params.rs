//! Protocol parameter sets.
//!
//! Parameters are persisted as `(experiment_id, name, value)` rows. Each
//! parameter set below owns an explicit table from persisted name to typed
//! field, so loading an experiment never depends on reflection over field
//! names. Unknown names are reported to the caller, which logs and skips them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{SdlError, SdlResult};
use crate::protocol::{ECHEM_DEPOSITION, RINSE_ONLY};

fn invalid(name: &str, reason: impl Into<String>) -> SdlError {
    SdlError::InvalidParameter {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn as_f64(name: &str, value: &Value) -> SdlResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(name, "not a number")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(name, format!("'{s}' is not a number"))),
        other => Err(invalid(name, format!("expected a number, got {other}"))),
    }
}

fn as_u32(name: &str, value: &Value) -> SdlResult<u32> {
    let v = as_f64(name, value)?;
    if v < 0.0 || v.fract() != 0.0 || v > f64::from(u32::MAX) {
        return Err(invalid(name, format!("{v} is not a count")));
    }
    Ok(v as u32)
}

fn as_flag(name: &str, value: &Value) -> SdlResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(_) | Value::String(_) => match value.as_str() {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            _ => Ok(as_f64(name, value)? != 0.0),
        },
        other => Err(invalid(name, format!("expected a flag, got {other}"))),
    }
}

fn as_string(name: &str, value: &Value) -> SdlResult<String> {
    match value {
        Value::String(s) => Ok(s.trim().to_lowercase()),
        Value::Null => Ok(String::new()),
        other => Err(invalid(name, format!("expected text, got {other}"))),
    }
}

/// Well rinse settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RinseParams {
    pub rinse_sol_name: String,
    pub rinse_count: u32,
    pub rinse_vol: f64,
}

impl Default for RinseParams {
    fn default() -> Self {
        Self {
            rinse_sol_name: "rinse".to_string(),
            rinse_count: 4,
            rinse_vol: 120.0,
        }
    }
}

impl RinseParams {
    /// Set one field by persisted name. Returns `false` for unknown names.
    pub fn apply_parameter(&mut self, name: &str, value: &Value) -> SdlResult<bool> {
        match name {
            "rinse_sol_name" => self.rinse_sol_name = as_string(name, value)?,
            "rinse_count" => self.rinse_count = as_u32(name, value)?,
            "rinse_vol" => self.rinse_vol = as_f64(name, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Persisted rows.
    pub fn parameters(&self) -> Vec<(String, Value)> {
        vec![
            ("rinse_sol_name".into(), json!(self.rinse_sol_name)),
            ("rinse_count".into(), json!(self.rinse_count)),
            ("rinse_vol".into(), json!(self.rinse_vol)),
        ]
    }
}

/// Chronoamperometry waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaWaveform {
    pub sample_period: f64,
    pub prestep_voltage: f64,
    pub prestep_time_delay: f64,
    /// Deposition potential (V)
    pub step_1_voltage: f64,
    /// Deposition duration (s)
    pub step_1_time: f64,
    pub step_2_voltage: f64,
    pub step_2_time: f64,
}

impl Default for CaWaveform {
    fn default() -> Self {
        Self {
            sample_period: 0.1,
            prestep_voltage: 0.0,
            prestep_time_delay: 0.0,
            step_1_voltage: -1.7,
            step_1_time: 300.0,
            step_2_voltage: 0.0,
            step_2_time: 0.0,
        }
    }
}

impl CaWaveform {
    /// Total programmed duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.prestep_time_delay + self.step_1_time + self.step_2_time
    }
}

/// Cyclic voltammetry waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvWaveform {
    pub sample_period: f64,
    pub initial_voltage: f64,
    pub first_anodic_peak: f64,
    pub second_anodic_peak: f64,
    pub final_voltage: f64,
    pub step_size: f64,
    pub cycle_count: u32,
    /// Scan rate (V/s) for the first three cycles
    pub scan_rates: [f64; 3],
}

impl Default for CvWaveform {
    fn default() -> Self {
        Self {
            sample_period: 0.1,
            initial_voltage: 0.0,
            first_anodic_peak: 0.5,
            second_anodic_peak: -0.2,
            final_voltage: 0.0,
            step_size: 0.01,
            cycle_count: 3,
            scan_rates: [0.1; 3],
        }
    }
}

impl CvWaveform {
    /// Seconds between samples implied by the step size and first scan rate.
    pub fn sample_rate(&self) -> f64 {
        if self.scan_rates[0] == 0.0 {
            return 0.0;
        }
        ((self.step_size / self.scan_rates[0]) * 1e4).round() / 1e4
    }

    /// Rough duration estimate in seconds, used for progress logging.
    pub fn duration_secs(&self) -> f64 {
        let span = (self.first_anodic_peak - self.initial_voltage).abs()
            + (self.first_anodic_peak - self.second_anodic_peak).abs()
            + (self.final_voltage - self.second_anodic_peak).abs();
        let rate = self.scan_rates[0].abs().max(f64::EPSILON);
        span / rate * f64::from(self.cycle_count.max(1))
    }
}

/// Parameters of the electrochemical deposition protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchemParams {
    pub run_ocp: bool,
    pub run_ca: bool,
    pub run_cv: bool,
    pub run_baseline: bool,

    pub flush_sol_name: String,
    pub flush_sol_vol: f64,
    pub flush_count: u32,

    pub mix_count: u32,
    pub mix_volume: f64,

    pub rinse: RinseParams,
    pub ca: CaWaveform,

    pub char_sol_name: String,
    pub char_vol: f64,
    pub char_concentration: f64,
    pub cv: CvWaveform,
}

impl Default for EchemParams {
    fn default() -> Self {
        Self {
            run_ocp: true,
            run_ca: true,
            run_cv: true,
            run_baseline: false,
            flush_sol_name: String::new(),
            flush_sol_vol: 0.0,
            flush_count: 3,
            mix_count: 0,
            mix_volume: 0.0,
            rinse: RinseParams::default(),
            ca: CaWaveform::default(),
            char_sol_name: String::new(),
            char_vol: 0.0,
            char_concentration: 1.0,
            cv: CvWaveform::default(),
        }
    }
}

impl EchemParams {
    /// Set one field by persisted name. Returns `false` for unknown names.
    pub fn apply_parameter(&mut self, name: &str, value: &Value) -> SdlResult<bool> {
        match name {
            "ocp" => self.run_ocp = as_flag(name, value)?,
            "ca" => self.run_ca = as_flag(name, value)?,
            "cv" => self.run_cv = as_flag(name, value)?,
            "baseline" => self.run_baseline = as_flag(name, value)?,

            "flush_sol_name" => self.flush_sol_name = as_string(name, value)?,
            "flush_sol_vol" => self.flush_sol_vol = as_f64(name, value)?,
            "flush_count" => self.flush_count = as_u32(name, value)?,

            "mix_count" => self.mix_count = as_u32(name, value)?,
            "mix_volume" => self.mix_volume = as_f64(name, value)?,

            "ca_sample_period" => self.ca.sample_period = as_f64(name, value)?,
            "ca_prestep_voltage" => self.ca.prestep_voltage = as_f64(name, value)?,
            "ca_prestep_time_delay" => self.ca.prestep_time_delay = as_f64(name, value)?,
            "ca_step_1_voltage" => self.ca.step_1_voltage = as_f64(name, value)?,
            "ca_step_1_time" => self.ca.step_1_time = as_f64(name, value)?,
            "ca_step_2_voltage" => self.ca.step_2_voltage = as_f64(name, value)?,
            "ca_step_2_time" => self.ca.step_2_time = as_f64(name, value)?,

            "char_sol_name" => self.char_sol_name = as_string(name, value)?,
            "char_vol" => self.char_vol = as_f64(name, value)?,
            "char_concentration" => self.char_concentration = as_f64(name, value)?,

            "cv_sample_period" => self.cv.sample_period = as_f64(name, value)?,
            "cv_initial_voltage" => self.cv.initial_voltage = as_f64(name, value)?,
            "cv_first_anodic_peak" => self.cv.first_anodic_peak = as_f64(name, value)?,
            "cv_second_anodic_peak" => self.cv.second_anodic_peak = as_f64(name, value)?,
            "cv_final_voltage" => self.cv.final_voltage = as_f64(name, value)?,
            "cv_step_size" => self.cv.step_size = as_f64(name, value)?,
            "cv_cycle_count" => self.cv.cycle_count = as_u32(name, value)?,
            "cv_scan_rate_cycle_1" => self.cv.scan_rates[0] = as_f64(name, value)?,
            "cv_scan_rate_cycle_2" => self.cv.scan_rates[1] = as_f64(name, value)?,
            "cv_scan_rate_cycle_3" => self.cv.scan_rates[2] = as_f64(name, value)?,

            other => return self.rinse.apply_parameter(other, value),
        }
        Ok(true)
    }

    /// Persisted rows.
    pub fn parameters(&self) -> Vec<(String, Value)> {
        let mut rows: Vec<(String, Value)> = vec![
            ("ocp".into(), json!(u8::from(self.run_ocp))),
            ("ca".into(), json!(u8::from(self.run_ca))),
            ("cv".into(), json!(u8::from(self.run_cv))),
            ("baseline".into(), json!(u8::from(self.run_baseline))),
            ("flush_sol_name".into(), json!(self.flush_sol_name)),
            ("flush_sol_vol".into(), json!(self.flush_sol_vol)),
            ("flush_count".into(), json!(self.flush_count)),
            ("mix_count".into(), json!(self.mix_count)),
            ("mix_volume".into(), json!(self.mix_volume)),
            ("ca_sample_period".into(), json!(self.ca.sample_period)),
            ("ca_prestep_voltage".into(), json!(self.ca.prestep_voltage)),
            ("ca_prestep_time_delay".into(), json!(self.ca.prestep_time_delay)),
            ("ca_step_1_voltage".into(), json!(self.ca.step_1_voltage)),
            ("ca_step_1_time".into(), json!(self.ca.step_1_time)),
            ("ca_step_2_voltage".into(), json!(self.ca.step_2_voltage)),
            ("ca_step_2_time".into(), json!(self.ca.step_2_time)),
            ("char_sol_name".into(), json!(self.char_sol_name)),
            ("char_vol".into(), json!(self.char_vol)),
            ("char_concentration".into(), json!(self.char_concentration)),
            ("cv_sample_period".into(), json!(self.cv.sample_period)),
            ("cv_initial_voltage".into(), json!(self.cv.initial_voltage)),
            ("cv_first_anodic_peak".into(), json!(self.cv.first_anodic_peak)),
            ("cv_second_anodic_peak".into(), json!(self.cv.second_anodic_peak)),
            ("cv_final_voltage".into(), json!(self.cv.final_voltage)),
            ("cv_step_size".into(), json!(self.cv.step_size)),
            ("cv_cycle_count".into(), json!(self.cv.cycle_count)),
            ("cv_scan_rate_cycle_1".into(), json!(self.cv.scan_rates[0])),
            ("cv_scan_rate_cycle_2".into(), json!(self.cv.scan_rates[1])),
            ("cv_scan_rate_cycle_3".into(), json!(self.cv.scan_rates[2])),
        ];
        rows.extend(self.rinse.parameters());
        rows
    }
}

/// Protocol-specific parameters, one variant per built-in protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolParams {
    /// Protocols that need nothing beyond the base experiment
    #[default]
    Base,
    Rinse(RinseParams),
    Echem(EchemParams),
}

impl ProtocolParams {
    /// Default parameter set for a protocol id.
    pub fn for_protocol(protocol_id: &str) -> Self {
        match protocol_id {
            ECHEM_DEPOSITION => ProtocolParams::Echem(EchemParams::default()),
            RINSE_ONLY => ProtocolParams::Rinse(RinseParams::default()),
            _ => ProtocolParams::Base,
        }
    }

    /// Build from persisted rows, logging names with no typed field.
    pub fn from_rows(protocol_id: &str, rows: &[(String, Value)]) -> SdlResult<Self> {
        let mut params = Self::for_protocol(protocol_id);
        for (name, value) in rows {
            if !params.apply_parameter(name, value)? {
                tracing::warn!(parameter = %name, protocol = protocol_id, "Ignoring unknown parameter");
            }
        }
        Ok(params)
    }

    /// Set one field by persisted name. Returns `false` for unknown names.
    pub fn apply_parameter(&mut self, name: &str, value: &Value) -> SdlResult<bool> {
        match self {
            ProtocolParams::Base => Ok(false),
            ProtocolParams::Rinse(p) => p.apply_parameter(name, value),
            ProtocolParams::Echem(p) => p.apply_parameter(name, value),
        }
    }

    /// Persisted rows.
    pub fn parameters(&self) -> Vec<(String, Value)> {
        match self {
            ProtocolParams::Base => Vec::new(),
            ProtocolParams::Rinse(p) => p.parameters(),
            ProtocolParams::Echem(p) => p.parameters(),
        }
    }

    pub fn echem(&self) -> Option<&EchemParams> {
        match self {
            ProtocolParams::Echem(p) => Some(p),
            _ => None,
        }
    }

    /// Rinse settings, standalone or embedded in an echem set.
    pub fn rinse(&self) -> Option<&RinseParams> {
        match self {
            ProtocolParams::Rinse(p) => Some(p),
            ProtocolParams::Echem(p) => Some(&p.rinse),
            ProtocolParams::Base => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_restore_typed_fields() {
        let mut original = EchemParams::default();
        original.ca.step_1_voltage = -1.2;
        original.cv.scan_rates = [0.05, 0.1, 0.2];
        original.flush_sol_name = "dmf".into();
        original.rinse.rinse_count = 2;
        original.run_cv = false;

        let rows = ProtocolParams::Echem(original.clone()).parameters();
        let restored = ProtocolParams::from_rows(ECHEM_DEPOSITION, &rows).unwrap();
        assert_eq!(restored, ProtocolParams::Echem(original));
    }

    #[test]
    fn test_legacy_string_values_are_coerced() {
        let mut params = EchemParams::default();
        assert!(params
            .apply_parameter("ca_step_1_time", &json!("120"))
            .unwrap());
        assert!(params.apply_parameter("ocp", &json!(0)).unwrap());
        assert!(params
            .apply_parameter("rinse_sol_name", &json!("  ACN "))
            .unwrap());
        assert_eq!(params.ca.step_1_time, 120.0);
        assert!(!params.run_ocp);
        assert_eq!(params.rinse.rinse_sol_name, "acn");
    }

    #[test]
    fn test_unknown_names_are_not_applied() {
        let mut params = ProtocolParams::for_protocol(RINSE_ONLY);
        assert!(!params.apply_parameter("laser_power", &json!(3)).unwrap());
        assert_eq!(params, ProtocolParams::Rinse(RinseParams::default()));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let mut params = EchemParams::default();
        let err = params
            .apply_parameter("cv_cycle_count", &json!(2.5))
            .unwrap_err();
        assert!(err.to_string().contains("cv_cycle_count"));
    }

    #[test]
    fn test_cv_sample_rate() {
        let cv = CvWaveform::default();
        assert_eq!(cv.sample_rate(), 0.1);
    }
}
