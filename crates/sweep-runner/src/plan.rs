use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{atomic_write_bytes, ensure_dir, id_token, ParamValue, SweepError};
use tracing::{info, warn};

pub const RUN_ID_COLUMN: &str = "newrun_id";
pub const SITE_COLUMN: &str = "site";
const DUST_RATE_COLUMN: &str = "dustrate";
const DUST_RADIUS_COLUMN: &str = "dustrad";
const SITE_NAME_COLUMN: &str = "climatefiles";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SweepPlan {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub clim_tag: Option<String>,
    #[serde(default)]
    pub constants: serde_yaml::Mapping,
    pub sites: Vec<String>,
    #[serde(default)]
    pub by_site: serde_yaml::Mapping,
    #[serde(default)]
    pub combinations: serde_yaml::Mapping,
    #[serde(default)]
    pub add_control: bool,
}

impl SweepPlan {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SweepError::NotFound(path.to_path_buf()).into());
        }
        let raw = fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| {
            anyhow!(SweepError::configuration(format!(
                "invalid sweep plan {}: {}",
                path.display(),
                e
            )))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<ParamValue>>,
    pub duplicate_ids: Vec<String>,
}

impl BuiltTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&ParamValue> {
        let c = self.column(column)?;
        self.rows.get(row).and_then(|r| r.get(c))
    }

    pub fn run_ids(&self) -> Vec<String> {
        match self.column(RUN_ID_COLUMN) {
            Some(c) => self.rows.iter().map(|r| r[c].to_string()).collect(),
            None => Vec::new(),
        }
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        self.rows_to_csv(&self.rows)
    }

    fn rows_to_csv(&self, rows: &[Vec<ParamValue>]) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.header)?;
        for row in rows {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow!("flushing csv buffer: {}", e))
    }
}

fn mapping_entries(map: &serde_yaml::Mapping, what: &str) -> Result<Vec<(String, serde_yaml::Value)>> {
    map.iter()
        .map(|(k, v)| {
            let key = k.as_str().ok_or_else(|| {
                anyhow!(SweepError::configuration(format!(
                    "{} keys must be strings, found {:?}",
                    what, k
                )))
            })?;
            Ok((key.to_string(), v.clone()))
        })
        .collect()
}

fn scalar(value: &serde_yaml::Value, what: &str) -> Result<ParamValue> {
    serde_yaml::from_value::<ParamValue>(value.clone()).map_err(|_| {
        anyhow!(SweepError::configuration(format!(
            "{} must be a scalar, found {:?}",
            what, value
        )))
    })
}

fn scalar_list(value: &serde_yaml::Value, what: &str) -> Result<Vec<ParamValue>> {
    let seq = value.as_sequence().ok_or_else(|| {
        anyhow!(SweepError::configuration(format!("{} must be a list", what)))
    })?;
    seq.iter().map(|v| scalar(v, what)).collect()
}

/// Expand a plan into rows.
///
/// Column order: combination keys, `site`, per-site keys, constants, then the
/// run identifier. Combinations vary with the first key slowest.
pub fn build_table(plan: &SweepPlan) -> Result<BuiltTable> {
    if plan.sites.is_empty() {
        return Err(SweepError::configuration("sweep plan lists no sites").into());
    }

    let mut combo_keys = Vec::new();
    let mut combo_values = Vec::new();
    for (key, value) in mapping_entries(&plan.combinations, "combinations")? {
        let list = scalar_list(&value, &format!("combinations.{}", key))?;
        if list.is_empty() {
            return Err(SweepError::configuration(format!(
                "combinations.{} is empty; the sweep would have no runs",
                key
            ))
            .into());
        }
        combo_keys.push(key);
        combo_values.push(list);
    }

    let mut site_keys = Vec::new();
    let mut site_values = Vec::new();
    for (key, value) in mapping_entries(&plan.by_site, "by-site")? {
        let list = scalar_list(&value, &format!("by-site.{}", key))?;
        if list.len() != plan.sites.len() {
            return Err(SweepError::configuration(format!(
                "by-site.{} has {} values for {} sites",
                key,
                list.len(),
                plan.sites.len()
            ))
            .into());
        }
        site_keys.push(key);
        site_values.push(list);
    }

    let mut const_keys = Vec::new();
    let mut const_values = Vec::new();
    for (key, value) in mapping_entries(&plan.constants, "constants")? {
        const_values.push(scalar(&value, &format!("constants.{}", key))?);
        const_keys.push(key);
    }

    let mut header: Vec<String> = combo_keys.clone();
    header.push(SITE_COLUMN.to_string());
    header.extend(site_keys.iter().cloned());
    header.extend(const_keys.iter().cloned());
    let mut seen = std::collections::BTreeSet::new();
    for h in &header {
        if !seen.insert(h.as_str()) || h == RUN_ID_COLUMN {
            return Err(SweepError::configuration(format!(
                "column '{}' is defined more than once in the sweep plan",
                h
            ))
            .into());
        }
    }

    let combos = cartesian(&combo_values);
    let mut rows: Vec<Vec<ParamValue>> = Vec::with_capacity(combos.len() * plan.sites.len());
    let mut first_row_of_site = Vec::with_capacity(plan.sites.len());
    for (site_idx, site) in plan.sites.iter().enumerate() {
        first_row_of_site.push(rows.len());
        for combo in &combos {
            let mut row = combo.clone();
            row.push(ParamValue::Text(site.clone()));
            for values in &site_values {
                row.push(values[site_idx].clone());
            }
            row.extend(const_values.iter().cloned());
            rows.push(row);
        }
    }

    if plan.add_control {
        let rate_col = header
            .iter()
            .position(|h| h == DUST_RATE_COLUMN)
            .ok_or_else(|| {
                anyhow!(SweepError::configuration(
                    "add-control requires a dustrate column"
                ))
            })?;
        let mut controls: Vec<Vec<ParamValue>> = first_row_of_site
            .iter()
            .map(|&i| {
                let mut row = rows[i].clone();
                row[rate_col] = ParamValue::from(0.0);
                row
            })
            .collect();
        controls.extend(rows);
        rows = controls;
    }

    let mut table = BuiltTable {
        header,
        rows,
        duplicate_ids: Vec::new(),
    };
    assign_run_ids(&mut table, plan);
    Ok(table)
}

fn cartesian(lists: &[Vec<ParamValue>]) -> Vec<Vec<ParamValue>> {
    let mut out: Vec<Vec<ParamValue>> = vec![Vec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(out.len() * list.len());
        for prefix in &out {
            for v in list {
                let mut row = prefix.clone();
                row.push(v.clone());
                next.push(row);
            }
        }
        out = next;
    }
    out
}

fn assign_run_ids(table: &mut BuiltTable, plan: &SweepPlan) {
    let site_col = table
        .column(SITE_NAME_COLUMN)
        .or_else(|| table.column(SITE_COLUMN));
    let rate_col = table.column(DUST_RATE_COLUMN);
    let radius_col = table.column(DUST_RADIUS_COLUMN);

    let mut ids = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let mut parts: Vec<String> = Vec::new();
        if let Some(p) = &plan.prefix {
            parts.push(p.clone());
        }
        if let Some(c) = site_col {
            parts.push(row[c].to_string());
        }
        if let Some(t) = &plan.clim_tag {
            parts.push(t.clone());
        }
        if let Some(c) = rate_col {
            parts.push(format!("app_{}", id_token(&row[c].to_string())));
        }
        if let Some(c) = radius_col {
            parts.push(format!("psize_{}", id_token(&row[c].to_string())));
        }
        ids.push(parts.join("_"));
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for id in &ids {
        *counts.entry(id.as_str()).or_default() += 1;
    }
    table.duplicate_ids = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    if !table.duplicate_ids.is_empty() {
        warn!(
            duplicates = ?table.duplicate_ids,
            "run identifiers are not unique; later runs will overwrite earlier ones"
        );
    }

    table.header.push(RUN_ID_COLUMN.to_string());
    for (row, id) in table.rows.iter_mut().zip(ids) {
        row.push(ParamValue::Text(id));
    }
}

pub fn save_table(
    table: &BuiltTable,
    dir: &Path,
    file_name: &str,
    split: Option<usize>,
    force: bool,
) -> Result<Vec<PathBuf>> {
    let stem = file_name.strip_suffix(".csv").unwrap_or(file_name);
    let mut outputs: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    if let Some(chunk) = split {
        if chunk == 0 {
            return Err(SweepError::configuration("split size must be at least 1").into());
        }
        let chunks: Vec<&[Vec<ParamValue>]> = table.rows.chunks(chunk).collect();
        let total = chunks.len();
        for (i, rows) in chunks.into_iter().enumerate() {
            let name = format!("{}_set{}of{}.csv", stem, i + 1, total);
            outputs.push((dir.join(name), table.rows_to_csv(rows)?));
        }
    }
    outputs.push((dir.join(format!("{}.csv", stem)), table.to_csv()?));

    if !force {
        if let Some((existing, _)) = outputs.iter().find(|(p, _)| p.exists()) {
            return Err(SweepError::configuration(format!(
                "refusing to overwrite existing table {} (use --force)",
                existing.display()
            ))
            .into());
        }
    }
    ensure_dir(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut written = Vec::with_capacity(outputs.len());
    for (path, bytes) in outputs {
        atomic_write_bytes(&path, &bytes)?;
        info!(path = %path.display(), "wrote parameter table");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ParameterTable;
    use chrono::Utc;

    const PLAN: &str = "\
prefix: hiFert_cc
constants:
  duration: 15
  dustsp: cc
  add_secondary: false
sites: [site_311a, site_311b]
by-site:
  cec: [21.10329, 6.96125]
  climatefiles: [site_311a, site_311b]
combinations:
  dustrate: [30, 300, 3000]
  dustrad: [10, 100]
add-control: true
";

    fn plan() -> SweepPlan {
        serde_yaml::from_str(PLAN).expect("plan")
    }

    #[test]
    fn rows_are_sites_times_combinations_plus_controls() {
        let table = build_table(&plan()).expect("build");
        assert_eq!(table.rows.len(), 2 * 3 * 2 + 2);
        assert_eq!(
            table.header,
            vec![
                "dustrate",
                "dustrad",
                "site",
                "cec",
                "climatefiles",
                "duration",
                "dustsp",
                "add_secondary",
                "newrun_id"
            ]
        );
        assert!(table.duplicate_ids.is_empty());
    }

    #[test]
    fn controls_lead_in_site_order_with_zero_dust() {
        let table = build_table(&plan()).expect("build");
        assert_eq!(table.value(0, "site"), Some(&ParamValue::Text("site_311a".into())));
        assert_eq!(table.value(1, "site"), Some(&ParamValue::Text("site_311b".into())));
        assert_eq!(table.value(0, "dustrate"), Some(&ParamValue::Number("0.0".into())));
        assert_eq!(table.value(1, "dustrad"), Some(&ParamValue::Number("10".into())));
        assert_eq!(table.run_ids()[0], "hiFert_cc_site_311a_app_0p0_psize_10");
    }

    #[test]
    fn combinations_vary_first_key_slowest() {
        let table = build_table(&plan()).expect("build");
        let ids = table.run_ids();
        assert_eq!(ids[2], "hiFert_cc_site_311a_app_30_psize_10");
        assert_eq!(ids[3], "hiFert_cc_site_311a_app_30_psize_100");
        assert_eq!(ids[4], "hiFert_cc_site_311a_app_300_psize_10");
        assert_eq!(ids[8], "hiFert_cc_site_311b_app_30_psize_10");
    }

    #[test]
    fn float_rates_keep_their_written_form_in_identifiers() {
        let p: SweepPlan = serde_yaml::from_str(
            "sites: [s1]\ncombinations:\n  dustrate: [30.0, 0.3]\n  dustrad: [10]\nadd-control: true\n",
        )
        .expect("plan");
        let table = build_table(&p).expect("build");
        assert_eq!(
            table.run_ids(),
            vec!["s1_app_0p0_psize_10", "s1_app_30p0_psize_10", "s1_app_0p3_psize_10"]
        );
        assert_eq!(table.value(1, "dustrate").map(|v| v.to_string()).as_deref(), Some("30.0"));
    }

    #[test]
    fn decimal_rates_use_p_in_identifiers() {
        let mut p = plan();
        p.combinations = serde_yaml::from_str("dustrate: [0.5]\ndustrad: [10]").expect("map");
        p.add_control = false;
        let table = build_table(&p).expect("build");
        assert_eq!(table.run_ids()[0], "hiFert_cc_site_311a_app_0p5_psize_10");
    }

    #[test]
    fn by_site_length_mismatch_is_rejected() {
        let mut p = plan();
        p.by_site = serde_yaml::from_str("cec: [1.0]").expect("map");
        let err = build_table(&p).expect_err("mismatch");
        assert!(err.to_string().contains("by-site.cec"), "{}", err);
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let mut p = plan();
        p.combinations = serde_yaml::from_str("dustrate: [30, 30]").expect("map");
        p.add_control = false;
        let table = build_table(&p).expect("build");
        assert_eq!(table.duplicate_ids.len(), 2);
    }

    #[test]
    fn saved_table_round_trips_through_the_reader_and_refuses_overwrite() {
        let dir = std::env::temp_dir().join(format!(
            "sweep_plan_save_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let table = build_table(&plan()).expect("build");
        let written = save_table(&table, &dir, "batch_v0.csv", Some(5), false).expect("save");
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "batch_v0_set1of3.csv",
                "batch_v0_set2of3.csv",
                "batch_v0_set3of3.csv",
                "batch_v0.csv"
            ]
        );
        let full = ParameterTable::load(&dir.join("batch_v0.csv")).expect("load");
        assert_eq!(full.row_count(), 14);
        let last = ParameterTable::load(&dir.join("batch_v0_set3of3.csv")).expect("load");
        assert_eq!(last.row_count(), 4);

        let err = save_table(&table, &dir, "batch_v0.csv", None, false).expect_err("exists");
        assert!(err.to_string().contains("refusing to overwrite"));
        save_table(&table, &dir, "batch_v0.csv", None, true).expect("forced");
        let _ = fs::remove_dir_all(dir);
    }
}
