use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_core::{ParamValue, SweepError};
use tracing::warn;

pub const DEFAULT_ID_COLUMN: &str = "newrun_id";
pub const DEFAULT_SIMULATOR: &str = "scepter";
pub const DEFAULT_WORKFLOW_TEMPLATE: &str = "scepter-run";
pub const DEFAULT_DEFAULTS_FILE: &str = "defaults.yaml";
pub const DEFAULT_OUTPUT_DIR: &str = "scepter_output";
pub const DEFAULT_SUBMIT_DELAY_SECONDS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchDescriptor {
    pub batch_input_dir: PathBuf,
    pub batch_input: String,
    pub default_dict: String,
    pub control_script: String,
    pub model_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl BatchDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SweepError::NotFound(path.to_path_buf()).into());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading batch descriptor {}", path.display()))?;
        let mut descriptor = Self::from_yaml_str(&raw).map_err(|e| {
            SweepError::configuration(format!(
                "invalid batch descriptor {}: {}",
                path.display(),
                e
            ))
        })?;
        descriptor.base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        if let Ok(abs) = descriptor.base_dir.canonicalize() {
            descriptor.base_dir = abs;
        }
        Ok(descriptor)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        let mut descriptor: BatchDescriptor = serde_yaml::from_str(raw)?;
        descriptor.base_dir = PathBuf::from(".");
        Ok(descriptor)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn table_dir(&self) -> PathBuf {
        self.resolve(&self.batch_input_dir)
    }

    pub fn table_path(&self) -> PathBuf {
        self.table_dir().join(&self.batch_input)
    }

    pub fn resolve_table(&self) -> Result<PathBuf, SweepError> {
        let dir = self.table_dir();
        if !dir.is_dir() {
            return Err(SweepError::NotFound(dir));
        }
        let path = dir.join(&self.batch_input);
        if !path.is_file() {
            return Err(SweepError::NotFound(path));
        }
        Ok(path.canonicalize().unwrap_or(path))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.resolve(&self.model_dir)
    }

    pub fn output_root(&self) -> PathBuf {
        match &self.output_root {
            Some(p) => self.resolve(p),
            None => self.model_dir().join(DEFAULT_OUTPUT_DIR),
        }
    }

    pub fn id_column(&self) -> &str {
        self.id_column.as_deref().unwrap_or(DEFAULT_ID_COLUMN)
    }

    pub fn simulator(&self) -> &str {
        self.simulator.as_deref().unwrap_or(DEFAULT_SIMULATOR)
    }

    pub fn workflow_template(&self) -> &str {
        self.workflow_template
            .as_deref()
            .unwrap_or(DEFAULT_WORKFLOW_TEMPLATE)
    }

    pub fn submit_command(&self) -> Vec<String> {
        self.submit_command.clone().unwrap_or_else(|| {
            vec![
                "argo".to_string(),
                "submit".to_string(),
                "--from".to_string(),
                "workflowtemplate/{template}".to_string(),
            ]
        })
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_secs(
            self.submit_delay_seconds
                .unwrap_or(DEFAULT_SUBMIT_DELAY_SECONDS),
        )
    }

    pub fn defaults_path(&self) -> (PathBuf, bool) {
        match &self.defaults_file {
            Some(p) => (self.resolve(p), true),
            None => (self.model_dir().join(DEFAULT_DEFAULTS_FILE), false),
        }
    }

    /// Defaults used while expanding on the submitting host.
    ///
    /// An explicitly configured defaults file must exist. The implicit one
    /// under the model directory may only exist on workers; when it is absent
    /// rows are expanded without defaults and the invoker fills them later.
    pub fn defaults_for_expansion(&self) -> Result<BTreeMap<String, ParamValue>> {
        let (path, explicit) = self.defaults_path();
        if !explicit && !path.is_file() {
            warn!(
                defaults = %path.display(),
                "defaults file not present on this host; expanding row values only"
            );
            return Ok(BTreeMap::new());
        }
        load_default_dict(&path, &self.default_dict)
    }

    pub fn for_row(&self, row_index: usize) -> Self {
        let mut copy = self.clone();
        copy.batch_input_dir = self.table_dir();
        copy.model_dir = self.model_dir();
        copy.output_root = self.output_root.as_ref().map(|p| self.resolve(p));
        copy.defaults_file = self.defaults_file.as_ref().map(|p| self.resolve(p));
        copy.row_index = Some(row_index);
        copy
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

pub type DefaultDicts = BTreeMap<String, BTreeMap<String, ParamValue>>;

pub fn load_default_dicts(path: &Path) -> Result<DefaultDicts> {
    if !path.is_file() {
        return Err(SweepError::NotFound(path.to_path_buf()).into());
    }
    let raw = fs::read_to_string(path)?;
    // `key: null` leaves the key unset, same as leaving it out
    let parsed: BTreeMap<String, BTreeMap<String, Option<ParamValue>>> =
        serde_yaml::from_str(&raw).map_err(|e| {
            SweepError::configuration(format!(
                "invalid defaults file {}: {}",
                path.display(),
                e
            ))
        })?;
    Ok(parsed
        .into_iter()
        .map(|(name, dict)| {
            let values = dict
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();
            (name, values)
        })
        .collect())
}

pub fn load_default_dict(path: &Path, name: &str) -> Result<BTreeMap<String, ParamValue>> {
    let mut dicts = load_default_dicts(path)?;
    match dicts.remove(name) {
        Some(dict) => Ok(dict),
        None => Err(anyhow!(SweepError::configuration(format!(
            "default dictionary '{}' not found in {} (available: {})",
            name,
            path.display(),
            dicts.keys().cloned().collect::<Vec<_>>().join(", ")
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sweep_core::ensure_dir;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_descriptor_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    const MINIMAL: &str = "\
batch-input-dir: inputs
batch-input: t.csv
default-dict: dict_singlerun
control-script: scepter_run.py
model-dir: /opt/scepter
aws_bucket: s3://bucket/prefix/
";

    #[test]
    fn parses_required_keys_and_keeps_unknown_ones() {
        let d = BatchDescriptor::from_yaml_str(MINIMAL).expect("parse");
        assert_eq!(d.batch_input, "t.csv");
        assert_eq!(d.default_dict, "dict_singlerun");
        assert_eq!(d.id_column(), "newrun_id");
        assert_eq!(d.simulator(), "scepter");
        assert_eq!(d.submit_delay(), Duration::from_secs(60));
        assert_eq!(d.output_root(), PathBuf::from("/opt/scepter/scepter_output"));
        assert!(d.extra.contains_key("aws_bucket"));
        let yaml = d.for_row(3).to_yaml().expect("yaml");
        assert!(yaml.contains("aws_bucket"));
        assert!(yaml.contains("row-index: 3"));
    }

    #[test]
    fn missing_required_key_is_a_parse_error() {
        let raw = "batch-input: t.csv\ndefault-dict: d\ncontrol-script: c\nmodel-dir: m\n";
        let err = BatchDescriptor::from_yaml_str(raw).expect_err("must fail");
        assert!(err.to_string().contains("batch-input-dir"), "{}", err);
    }

    #[test]
    fn load_resolves_relative_paths_against_descriptor_dir() {
        let root = temp_root("resolve");
        ensure_dir(&root.join("inputs")).expect("inputs");
        fs::write(root.join("inputs").join("t.csv"), "newrun_id\nr1\n").expect("table");
        let path = root.join("batch.yaml");
        fs::write(&path, MINIMAL).expect("descriptor");

        let d = BatchDescriptor::load(&path).expect("load");
        let table = d.resolve_table().expect("table resolves");
        assert!(table.is_absolute());
        assert!(table.ends_with("inputs/t.csv"));

        let copy = d.for_row(1);
        assert!(copy.batch_input_dir.is_absolute());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_table_is_not_found() {
        let root = temp_root("missing");
        let path = root.join("batch.yaml");
        fs::write(&path, MINIMAL).expect("descriptor");
        let d = BatchDescriptor::load(&path).expect("load");
        let err = d.resolve_table().expect_err("no table");
        assert!(matches!(err, SweepError::NotFound(_)));
        assert!(err.to_string().starts_with("File not found"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn default_dict_lookup_reports_available_names() {
        let root = temp_root("dicts");
        let path = root.join("defaults.yaml");
        fs::write(
            &path,
            "dict_singlerun:\n  duration: 50\n  dustsp: gbas\n  add_secondary: false\n",
        )
        .expect("defaults");
        let dict = load_default_dict(&path, "dict_singlerun").expect("dict");
        assert_eq!(dict.get("duration"), Some(&ParamValue::Number("50".into())));
        assert_eq!(dict.get("add_secondary"), Some(&ParamValue::Bool(false)));

        let err = load_default_dict(&path, "nope").expect_err("unknown dict");
        assert!(err.to_string().contains("dict_singlerun"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn null_defaults_are_left_unset() {
        let root = temp_root("nulls");
        let path = root.join("defaults.yaml");
        fs::write(
            &path,
            "dict_singlerun:\n  duration: 50\n  aws_save: null\n  cec: 21.0\n",
        )
        .expect("defaults");
        let dict = load_default_dict(&path, "dict_singlerun").expect("dict");
        assert!(!dict.contains_key("aws_save"));
        assert_eq!(dict.get("cec"), Some(&ParamValue::Number("21.0".into())));
        assert_eq!(dict.len(), 2);
        let _ = fs::remove_dir_all(root);
    }
}
