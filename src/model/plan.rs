//! Test-plan data model.
//!
//! A test plan is an ordered list of [`TestPoint`]s for one station/product
//! combination. Each point selects a measurement handler via `execute_name`
//! (with an optional driver sub-selector in `switch_mode`), carries a
//! handler-specific parameter map, and declares how its measured value is
//! validated (`limit_type` × `value_type`, see [`crate::validation`]).
//!
//! The CSV column mapping used by the external plan parser is mirrored here
//! as [`PlanRecord`] so the recognised columns round-trip losslessly.

use crate::error::{PdtError, PdtResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Comparison rule applied to a measured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    /// PASS iff measured >= lower_limit
    Lower,
    /// PASS iff measured <= upper_limit
    Upper,
    /// PASS iff lower_limit <= measured <= upper_limit (inclusive)
    Both,
    /// PASS iff measured == eq_limit (typed)
    Equality,
    /// PASS iff measured != eq_limit (typed)
    Inequality,
    /// PASS iff eq_limit is a substring of measured (string forms)
    Partial,
    /// Always PASS
    #[default]
    None,
}

impl LimitType {
    /// Case-insensitive parse; unknown strings fall back to `None`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "lower" => LimitType::Lower,
            "upper" => LimitType::Upper,
            "both" => LimitType::Both,
            "equality" => LimitType::Equality,
            "inequality" => LimitType::Inequality,
            "partial" => LimitType::Partial,
            _ => LimitType::None,
        }
    }

    /// Canonical lowercase name, as stored in plans.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Lower => "lower",
            LimitType::Upper => "upper",
            LimitType::Both => "both",
            LimitType::Equality => "equality",
            LimitType::Inequality => "inequality",
            LimitType::Partial => "partial",
            LimitType::None => "none",
        }
    }
}

/// Coercion rule applied to a measured value before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Verbatim text; bounds compared lexicographically where applicable
    #[default]
    String,
    /// Signed integer
    Integer,
    /// Finite floating point
    Float,
}

impl ValueType {
    /// Case-insensitive parse; unknown strings fall back to `String`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" => ValueType::Integer,
            "float" | "double" => ValueType::Float,
            _ => ValueType::String,
        }
    }

    /// Canonical lowercase name, as stored in plans.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
        }
    }
}

/// Handler kind selected by a point's `execute_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecuteName {
    /// Drive a programmable power supply
    PowerSet,
    /// Read a DMM/DAQ channel
    PowerRead,
    /// Serial command/response
    ComPort,
    /// Console (SSH) command/response
    Console,
    /// TCP line command/response
    Tcpip,
    /// Shop Floor Control (MES) upload
    Sfc,
    /// Return the session serial number
    GetSn,
    /// Operator OK/NG gate
    OpJudge,
    /// Fixed delay
    Wait,
    /// Relay toggle on the DUT communications driver
    Relay,
    /// Chassis fixture rotation over the framed serial protocol
    ChassisRotation,
    /// RF instrument query
    RfMeasurements,
    /// L6MPU command over SSH/serial/hybrid
    L6Mpu,
    /// Escape hatch; must still produce a value or an error
    Other,
}

/// Alias table: normalised execute-name spellings accepted from plans.
///
/// Normalisation lowercases and strips `_`, `-` and spaces, so the legacy
/// spellings (`ConSole`, `RF_Measurements`, `L6MPU`, ...) and CSV-authored
/// casing variants all resolve to the same handler kind.
static EXECUTE_ALIASES: Lazy<HashMap<&'static str, ExecuteName>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("powerset", ExecuteName::PowerSet);
    m.insert("powerread", ExecuteName::PowerRead);
    m.insert("comport", ExecuteName::ComPort);
    m.insert("console", ExecuteName::Console);
    m.insert("tcpip", ExecuteName::Tcpip);
    m.insert("sfc", ExecuteName::Sfc);
    m.insert("getsn", ExecuteName::GetSn);
    m.insert("opjudge", ExecuteName::OpJudge);
    m.insert("wait", ExecuteName::Wait);
    m.insert("relay", ExecuteName::Relay);
    m.insert("chassisrotation", ExecuteName::ChassisRotation);
    m.insert("rfmeasurements", ExecuteName::RfMeasurements);
    m.insert("l6mpu", ExecuteName::L6Mpu);
    m.insert("other", ExecuteName::Other);
    m
});

impl ExecuteName {
    /// Resolve a raw plan spelling through the alias table.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalised: String = raw
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(|c| c.to_lowercase())
            .collect();
        EXECUTE_ALIASES.get(normalised.as_str()).copied()
    }

    /// Canonical display spelling, matching the legacy plan vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecuteName::PowerSet => "PowerSet",
            ExecuteName::PowerRead => "PowerRead",
            ExecuteName::ComPort => "ComPort",
            ExecuteName::Console => "ConSole",
            ExecuteName::Tcpip => "TCPIP",
            ExecuteName::Sfc => "SFC",
            ExecuteName::GetSn => "GetSN",
            ExecuteName::OpJudge => "OPJudge",
            ExecuteName::Wait => "Wait",
            ExecuteName::Relay => "Relay",
            ExecuteName::ChassisRotation => "ChassisRotation",
            ExecuteName::RfMeasurements => "RF_Measurements",
            ExecuteName::L6Mpu => "L6MPU",
            ExecuteName::Other => "Other",
        }
    }
}

/// Parameter key under which an upstream `use_result` value is bound for
/// handlers that consume it explicitly.
pub const UPSTREAM_VALUE_KEY: &str = "UpstreamValue";

/// One executable row of a test plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPoint {
    /// Stable identifier, opaque to the engine
    pub id: String,
    /// Integer sort key, unique within a plan
    pub item_no: i32,
    /// Display label; also the key other points reference via `use_result`
    pub item_name: String,
    /// Optional secondary key
    #[serde(default)]
    pub item_key: Option<String>,
    /// Raw handler selector; resolved through the alias table at dispatch
    pub execute_name: String,
    /// Driver/sub-mode selector within a handler (legacy `case_type`)
    #[serde(default)]
    pub switch_mode: Option<String>,
    /// Handler-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Hoisted copy of the frequent `Command` parameter
    #[serde(default)]
    pub command: Option<String>,
    /// Hoisted copy of the frequent `Timeout` parameter, in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Hoisted copy of the frequent `WaitmSec` parameter, in milliseconds
    #[serde(default)]
    pub wait_msec: Option<u64>,
    /// Reference to an earlier point's `item_name` whose measured value is
    /// substituted into this point's parameters
    #[serde(default)]
    pub use_result: Option<String>,
    /// Numeric lower bound
    #[serde(default)]
    pub lower_limit: Option<f64>,
    /// Numeric upper bound
    #[serde(default)]
    pub upper_limit: Option<f64>,
    /// Expected value for equality/inequality/partial types
    #[serde(default)]
    pub eq_limit: Option<String>,
    /// Comparison rule
    #[serde(default)]
    pub limit_type: LimitType,
    /// Coercion rule
    #[serde(default)]
    pub value_type: ValueType,
    /// Display unit
    #[serde(default)]
    pub unit: Option<String>,
    /// Disabled points are never executed and never referenceable
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Primary execution order; ties broken by `item_no`
    pub sequence_order: i32,
}

fn default_enabled() -> bool {
    true
}

impl TestPoint {
    /// Execution ordering key: `(sequence_order, item_no)`.
    pub fn sort_key(&self) -> (i32, i32) {
        (self.sequence_order, self.item_no)
    }

    /// Effective handler I/O timeout, clamped to the engine's hard cap.
    pub fn effective_timeout(&self, default_ms: u64, max_ms: u64) -> Duration {
        let ms = self.timeout_ms.unwrap_or(default_ms).min(max_ms);
        Duration::from_millis(ms)
    }
}

/// Advisory plan validation: issues are logged before execution starts.
///
/// Dangling `use_result` references still surface at runtime as per-point
/// SKIP results; this pass lets a bad plan be diagnosed up front.
pub fn validate_plan(points: &[TestPoint]) -> Vec<String> {
    let mut issues = Vec::new();

    let mut seen_no = std::collections::HashSet::new();
    for p in points {
        if !seen_no.insert(p.item_no) {
            issues.push(format!("duplicate item_no {} ({})", p.item_no, p.item_name));
        }
        if ExecuteName::parse(&p.execute_name).is_none() {
            issues.push(format!(
                "unknown execute_name '{}' on item {}",
                p.execute_name, p.item_no
            ));
        }
    }

    let mut earlier: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut ordered: Vec<&TestPoint> = points.iter().filter(|p| p.enabled).collect();
    ordered.sort_by_key(|p| p.sort_key());
    for p in &ordered {
        if let Some(target) = &p.use_result {
            if !earlier.contains(target.as_str()) {
                issues.push(format!(
                    "item {} use_result '{}' does not name an earlier enabled point",
                    p.item_no, target
                ));
            }
        }
        earlier.insert(p.item_name.as_str());
    }

    issues
}

/// CSV row shape produced by the external plan parser.
///
/// Column names match the legacy export; `case` is accepted as an alias for
/// `SwitchMode`. Round-tripping a plan through this record preserves every
/// recognised column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    /// `ID` column → `item_no`
    #[serde(rename = "ID")]
    pub id: i32,
    /// `ItemKey` column
    #[serde(rename = "ItemKey", default)]
    pub item_key: Option<String>,
    /// `ItemName` column
    #[serde(rename = "ItemName")]
    pub item_name: String,
    /// `ValueType` column
    #[serde(rename = "ValueType", default)]
    pub value_type: Option<String>,
    /// `LimitType` column
    #[serde(rename = "LimitType", default)]
    pub limit_type: Option<String>,
    /// `EqLimit` column
    #[serde(rename = "EqLimit", default)]
    pub eq_limit: Option<String>,
    /// `LL` column
    #[serde(rename = "LL", default)]
    pub lower_limit: Option<f64>,
    /// `UL` column
    #[serde(rename = "UL", default)]
    pub upper_limit: Option<f64>,
    /// `ExecuteName` column
    #[serde(rename = "ExecuteName")]
    pub execute_name: String,
    /// `SwitchMode` column; legacy exports label it `case`
    #[serde(rename = "SwitchMode", alias = "case", default)]
    pub switch_mode: Option<String>,
    /// `Command` column
    #[serde(rename = "Command", default)]
    pub command: Option<String>,
    /// `Timeout` column, milliseconds
    #[serde(rename = "Timeout", default)]
    pub timeout: Option<u64>,
    /// `UseResult` column
    #[serde(rename = "UseResult", default)]
    pub use_result: Option<String>,
    /// `WaitmSec` column, milliseconds
    #[serde(rename = "WaitmSec", default)]
    pub wait_msec: Option<u64>,
    /// `Unit` column
    #[serde(rename = "Unit", default)]
    pub unit: Option<String>,
    /// Free-form `Parameters` column, a JSON object of scalars
    #[serde(rename = "Parameters", default)]
    pub parameters: Option<String>,
}

fn none_if_empty(opt: Option<String>) -> Option<String> {
    opt.filter(|s| !s.is_empty())
}

impl PlanRecord {
    /// Convert a parsed CSV row into an engine point.
    ///
    /// `sequence_order` comes from the row's position in the file; the legacy
    /// export has no dedicated column for it.
    pub fn into_point(self, sequence_order: i32) -> PdtResult<TestPoint> {
        let parameters = match none_if_empty(self.parameters) {
            Some(raw) => parse_parameters_json(&raw)?,
            None => BTreeMap::new(),
        };

        Ok(TestPoint {
            id: self.id.to_string(),
            item_no: self.id,
            item_name: self.item_name,
            item_key: none_if_empty(self.item_key),
            execute_name: self.execute_name,
            switch_mode: none_if_empty(self.switch_mode),
            parameters,
            command: none_if_empty(self.command),
            timeout_ms: self.timeout,
            wait_msec: self.wait_msec,
            use_result: none_if_empty(self.use_result),
            lower_limit: self.lower_limit,
            upper_limit: self.upper_limit,
            eq_limit: none_if_empty(self.eq_limit),
            limit_type: self
                .limit_type
                .as_deref()
                .map(LimitType::parse)
                .unwrap_or_default(),
            value_type: self
                .value_type
                .as_deref()
                .map(ValueType::parse)
                .unwrap_or_default(),
            unit: none_if_empty(self.unit),
            enabled: true,
            sequence_order,
        })
    }

    /// Project an engine point back onto the CSV row shape.
    pub fn from_point(point: &TestPoint) -> Self {
        let parameters = if point.parameters.is_empty() {
            None
        } else {
            serde_json::to_string(&point.parameters).ok()
        };

        Self {
            id: point.item_no,
            item_key: point.item_key.clone(),
            item_name: point.item_name.clone(),
            value_type: Some(point.value_type.as_str().to_string()),
            limit_type: Some(point.limit_type.as_str().to_string()),
            eq_limit: point.eq_limit.clone(),
            lower_limit: point.lower_limit,
            upper_limit: point.upper_limit,
            execute_name: point.execute_name.clone(),
            switch_mode: point.switch_mode.clone(),
            command: point.command.clone(),
            timeout: point.timeout_ms,
            use_result: point.use_result.clone(),
            wait_msec: point.wait_msec,
            unit: point.unit.clone(),
            parameters,
        }
    }
}

/// Parse the free-form `Parameters` JSON column into a scalar map.
///
/// Scalars are stored as their string forms; nested objects and arrays are
/// rejected as plan errors.
pub fn parse_parameters_json(raw: &str) -> PdtResult<BTreeMap<String, String>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| PdtError::InvalidParameter {
            name: "Parameters".to_string(),
            reason: e.to_string(),
        })?;

    let obj = value.as_object().ok_or_else(|| PdtError::InvalidParameter {
        name: "Parameters".to_string(),
        reason: "expected a JSON object".to_string(),
    })?;

    let mut map = BTreeMap::new();
    for (key, val) in obj {
        let scalar = match val {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => String::new(),
            _ => {
                return Err(PdtError::InvalidParameter {
                    name: key.clone(),
                    reason: "expected a scalar".to_string(),
                })
            }
        };
        map.insert(key.clone(), scalar);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(item_no: i32, name: &str) -> TestPoint {
        TestPoint {
            id: item_no.to_string(),
            item_no,
            item_name: name.to_string(),
            item_key: None,
            execute_name: "Wait".to_string(),
            switch_mode: None,
            parameters: BTreeMap::new(),
            command: None,
            timeout_ms: None,
            wait_msec: Some(1),
            use_result: None,
            lower_limit: None,
            upper_limit: None,
            eq_limit: None,
            limit_type: LimitType::None,
            value_type: ValueType::String,
            unit: None,
            enabled: true,
            sequence_order: item_no,
        }
    }

    #[test]
    fn alias_table_resolves_legacy_spellings() {
        assert_eq!(ExecuteName::parse("PowerSet"), Some(ExecuteName::PowerSet));
        assert_eq!(ExecuteName::parse("powerset"), Some(ExecuteName::PowerSet));
        assert_eq!(ExecuteName::parse("ConSole"), Some(ExecuteName::Console));
        assert_eq!(
            ExecuteName::parse("RF_Measurements"),
            Some(ExecuteName::RfMeasurements)
        );
        assert_eq!(ExecuteName::parse("rf measurements"), Some(ExecuteName::RfMeasurements));
        assert_eq!(ExecuteName::parse("L6MPU"), Some(ExecuteName::L6Mpu));
        assert_eq!(ExecuteName::parse("GetSN"), Some(ExecuteName::GetSn));
        assert_eq!(ExecuteName::parse("NoSuchHandler"), None);
    }

    #[test]
    fn timeout_is_clamped_to_cap() {
        let mut p = point(1, "clamp");
        p.timeout_ms = Some(120_000);
        assert_eq!(
            p.effective_timeout(5_000, 30_000),
            Duration::from_millis(30_000)
        );
        p.timeout_ms = None;
        assert_eq!(
            p.effective_timeout(5_000, 30_000),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn validate_plan_flags_duplicates_and_dangling_references() {
        let mut a = point(1, "first");
        let mut b = point(1, "second");
        b.use_result = Some("missing".to_string());
        a.sequence_order = 1;
        b.sequence_order = 2;
        let issues = validate_plan(&[a, b]);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("duplicate item_no"));
        assert!(issues[1].contains("use_result"));
    }

    #[test]
    fn validate_plan_rejects_disabled_use_result_targets() {
        let mut src = point(1, "src");
        src.enabled = false;
        let mut user = point(2, "user");
        user.sequence_order = 2;
        user.use_result = Some("src".to_string());
        let issues = validate_plan(&[src, user]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("earlier enabled point"));
    }

    #[test]
    fn csv_record_round_trips_recognised_columns() {
        let mut p = point(7, "vbat_check");
        p.execute_name = "PowerRead".to_string();
        p.switch_mode = Some("DAQ973A".to_string());
        p.parameters
            .insert("Channel".to_string(), "101".to_string());
        p.parameters.insert("Type".to_string(), "DC".to_string());
        p.lower_limit = Some(11.5);
        p.upper_limit = Some(12.5);
        p.limit_type = LimitType::Both;
        p.value_type = ValueType::Float;
        p.unit = Some("V".to_string());

        let record = PlanRecord::from_point(&p);
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.serialize(&record).unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let parsed: PlanRecord = reader.deserialize().next().unwrap().unwrap();
        let q = parsed.into_point(p.sequence_order).unwrap();

        assert_eq!(q.item_no, p.item_no);
        assert_eq!(q.item_name, p.item_name);
        assert_eq!(q.execute_name, p.execute_name);
        assert_eq!(q.switch_mode, p.switch_mode);
        assert_eq!(q.parameters, p.parameters);
        assert_eq!(q.lower_limit, p.lower_limit);
        assert_eq!(q.upper_limit, p.upper_limit);
        assert_eq!(q.limit_type, p.limit_type);
        assert_eq!(q.value_type, p.value_type);
        assert_eq!(q.unit, p.unit);
    }

    #[test]
    fn parameters_json_accepts_scalars_only() {
        let map = parse_parameters_json(r#"{"Channel":"101","SetVolt":12.0,"Enable":true}"#).unwrap();
        assert_eq!(map.get("Channel").map(String::as_str), Some("101"));
        assert_eq!(map.get("SetVolt").map(String::as_str), Some("12.0"));
        assert_eq!(map.get("Enable").map(String::as_str), Some("true"));

        assert!(parse_parameters_json(r#"{"nested":{"a":1}}"#).is_err());
        assert!(parse_parameters_json("not json").is_err());
    }
}
