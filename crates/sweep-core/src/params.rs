use serde::de::{self, Deserializer, Visitor};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    /// Numeric literal, kept exactly as written.
    Number(String),
    Text(String),
}

impl ParamValue {
    /// Interpret a raw table cell or CLI token.
    ///
    /// `True`/`False` become booleans, float-looking tokens (including `2.`,
    /// `.5`, `1e-3`) become numbers, everything else is kept as text.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        match s {
            "True" | "true" => return ParamValue::Bool(true),
            "False" | "false" => return ParamValue::Bool(false),
            _ => {}
        }
        if looks_numeric(s) && s.parse::<f64>().is_ok() {
            return ParamValue::Number(s.to_string());
        }
        ParamValue::Text(s.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => v.parse().ok(),
            _ => None,
        }
    }
}

fn looks_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.chars().any(|c| c.is_ascii_digit())
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
}

pub fn float_literal(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(true) => f.write_str("True"),
            ParamValue::Bool(false) => f.write_str("False"),
            ParamValue::Number(v) | ParamValue::Text(v) => f.write_str(v),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamValue::Bool(b) => serializer.serialize_bool(*b),
            ParamValue::Number(v) => {
                if let Ok(i) = v.parse::<i64>() {
                    serializer.serialize_i64(i)
                } else if let Some(f) = self.as_f64() {
                    serializer.serialize_f64(f)
                } else {
                    serializer.serialize_str(v)
                }
            }
            ParamValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

struct ParamValueVisitor;

impl<'de> Visitor<'de> for ParamValueVisitor {
    type Value = ParamValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a boolean, number or string")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ParamValue, E> {
        Ok(ParamValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ParamValue, E> {
        Ok(ParamValue::Number(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ParamValue, E> {
        Ok(ParamValue::Number(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ParamValue, E> {
        Ok(ParamValue::Number(float_literal(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ParamValue, E> {
        Ok(ParamValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ParamValue, E> {
        Ok(ParamValue::Text(v))
    }
}

impl<'de> serde::Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ParamValueVisitor)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::parse(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(float_literal(value))
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Number(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    Default,
    Row,
    Override,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
    sources: BTreeMap<String, ParamSource>,
}

impl ParameterSet {
    pub fn builder() -> ParameterSetBuilder {
        ParameterSetBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn source(&self, key: &str) -> Option<ParamSource> {
        self.sources.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> &BTreeMap<String, ParamValue> {
        &self.values
    }

    pub fn to_delimited(&self, delimiter: &str) -> String {
        let mut out = String::new();
        for (k, v) in &self.values {
            out.push_str(k);
            out.push_str(delimiter);
            out.push_str(&v.to_string());
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct ParameterSetBuilder {
    layers: Vec<(ParamSource, BTreeMap<String, ParamValue>)>,
}

impl ParameterSetBuilder {
    pub fn defaults(mut self, defaults: &BTreeMap<String, ParamValue>) -> Self {
        self.layers.push((ParamSource::Default, defaults.clone()));
        self
    }

    pub fn row<'a, I>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let layer = cells
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.to_string(), ParamValue::parse(v)))
            .collect();
        self.layers.push((ParamSource::Row, layer));
        self
    }

    pub fn overrides(mut self, values: &BTreeMap<String, ParamValue>) -> Self {
        self.layers.push((ParamSource::Override, values.clone()));
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let mut layer = BTreeMap::new();
        layer.insert(key.into(), value.into());
        self.layers.push((ParamSource::Override, layer));
        self
    }

    pub fn build(self) -> ParameterSet {
        let mut out = ParameterSet::default();
        for (source, layer) in self.layers {
            for (k, v) in layer {
                out.sources.insert(k.clone(), source);
                out.values.insert(k, v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> ParamValue {
        ParamValue::Number(s.to_string())
    }

    fn defaults() -> BTreeMap<String, ParamValue> {
        let mut d = BTreeMap::new();
        d.insert("duration".to_string(), num("50"));
        d.insert("dustsp".to_string(), ParamValue::Text("gbas".to_string()));
        d.insert("add_secondary".to_string(), ParamValue::Bool(false));
        d
    }

    #[test]
    fn parse_matches_driver_conventions() {
        assert_eq!(ParamValue::parse("True"), ParamValue::Bool(true));
        assert_eq!(ParamValue::parse("False"), ParamValue::Bool(false));
        assert_eq!(ParamValue::parse("2."), num("2."));
        assert_eq!(ParamValue::parse(" -0.5 "), num("-0.5"));
        assert_eq!(ParamValue::parse("1e-3").as_f64(), Some(0.001));
        assert_eq!(
            ParamValue::parse("site_311a"),
            ParamValue::Text("site_311a".to_string())
        );
        assert_eq!(ParamValue::parse("inf"), ParamValue::Text("inf".to_string()));
        assert_eq!(ParamValue::parse("-"), ParamValue::Text("-".to_string()));
    }

    #[test]
    fn row_values_win_and_defaults_fill() {
        let row = vec![("duration", "15"), ("cec", "21.1")];
        let set = ParameterSet::builder()
            .defaults(&defaults())
            .row(row.iter().copied())
            .build();
        assert_eq!(set.get("duration"), Some(&num("15")));
        assert_eq!(set.source("duration"), Some(ParamSource::Row));
        assert_eq!(set.get("cec"), Some(&num("21.1")));
        assert_eq!(set.get("dustsp"), Some(&ParamValue::Text("gbas".to_string())));
        assert_eq!(set.source("dustsp"), Some(ParamSource::Default));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn empty_cells_fall_back_to_defaults() {
        let row = vec![("dustsp", "  "), ("duration", "")];
        let set = ParameterSet::builder()
            .defaults(&defaults())
            .row(row.iter().copied())
            .build();
        assert_eq!(set.get("dustsp"), Some(&ParamValue::Text("gbas".to_string())));
        assert_eq!(set.get("duration"), Some(&num("50")));
    }

    #[test]
    fn explicit_overrides_beat_rows() {
        let row = vec![("duration", "15")];
        let set = ParameterSet::builder()
            .defaults(&defaults())
            .row(row.iter().copied())
            .set("duration", 3.0)
            .build();
        assert_eq!(set.get("duration"), Some(&num("3.0")));
        assert_eq!(set.source("duration"), Some(ParamSource::Override));
    }

    #[test]
    fn delimited_rendering_is_sorted() {
        let set = ParameterSet::builder().defaults(&defaults()).build();
        assert_eq!(
            set.to_delimited("\t"),
            "add_secondary\tFalse\nduration\t50\ndustsp\tgbas\n"
        );
    }

    #[test]
    fn numeric_cells_reach_the_simulator_as_written() {
        let row = vec![("rate", "1e-3"), ("seed", "12345678901234567891")];
        let set = ParameterSet::builder().row(row.iter().copied()).build();
        assert_eq!(set.get("rate").map(|v| v.to_string()).as_deref(), Some("1e-3"));
        assert_eq!(
            set.get("seed").map(|v| v.to_string()).as_deref(),
            Some("12345678901234567891")
        );
    }

    #[test]
    fn whole_floats_keep_their_fraction() {
        assert_eq!(ParamValue::from(0.0).to_string(), "0.0");
        assert_eq!(ParamValue::from(30.0).to_string(), "30.0");
        assert_eq!(ParamValue::from(0.3).to_string(), "0.3");
        assert_eq!(ParamValue::from(30_i64).to_string(), "30");
    }

    #[test]
    fn json_numbers_keep_integer_and_float_forms() {
        let ints: ParamValue = serde_json::from_str("30").expect("int");
        let floats: ParamValue = serde_json::from_str("30.0").expect("float");
        assert_eq!(ints, num("30"));
        assert_eq!(floats, num("30.0"));
        assert_eq!(serde_json::to_string(&floats).expect("ser"), "30.0");
        assert!(serde_json::from_str::<ParamValue>("null").is_err());
    }
}
