pub mod audit;
pub mod descriptor;
pub mod invoke;
pub mod orchestrator;
pub mod plan;
pub mod table;
pub mod throttle;

pub use audit::{audit, audit_iter, summarize, AuditEntry, AuditSummary};
pub use descriptor::{load_default_dict, BatchDescriptor, DefaultDicts};
pub use invoke::{invoke, invoke_descriptor, prepare_run, InvokeOutcome, InvokeRequest, RunChecks};
pub use orchestrator::{CommandOrchestrator, DryRunOrchestrator, JobHandle, Orchestrator};
pub use plan::{build_table, save_table, BuiltTable, SweepPlan};
pub use table::{ParameterTable, TableRow};
pub use throttle::{RatePolicy, Throttle};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{
    atomic_write_bytes, atomic_write_json_pretty, next_free_name, row_file_name, sha256_file,
    ParamValue, ParameterSet, SweepError, COMPLETION_SENTINEL,
};
use tracing::{error, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    IndexOnly,
    Materialized,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::IndexOnly => "index",
            Strategy::Materialized => "materialize",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedRow {
    pub index: usize,
    pub run_id: String,
    pub parameters: ParameterSet,
}

#[derive(Debug)]
pub struct Expansion {
    pub table_path: PathBuf,
    pub row_count: usize,
    pub rows: Vec<ExpandedRow>,
    pub rejected: Vec<SweepError>,
}

/// Resolve the table and build one parameter set per data row.
///
/// Fails before producing anything when the table is missing or its header is
/// unusable. A row with an empty identifier is rejected on its own and does
/// not shift the indices of the others.
pub fn expand(descriptor: &BatchDescriptor) -> Result<Expansion> {
    let table_path = descriptor.resolve_table()?;
    let table = ParameterTable::load(&table_path)?;
    let id_column = descriptor.id_column();
    table.require_column(id_column)?;
    let defaults = descriptor.defaults_for_expansion()?;

    let mut rows = Vec::with_capacity(table.row_count());
    let mut rejected = Vec::new();
    for row in table.rows() {
        match row.run_id(id_column) {
            Ok(run_id) => {
                let parameters = ParameterSet::builder()
                    .defaults(&defaults)
                    .row(row.parameter_cells(id_column))
                    .build();
                rows.push(ExpandedRow {
                    index: row.index,
                    run_id: run_id.to_string(),
                    parameters,
                });
            }
            Err(e) => {
                warn!(row = row.index, error = %e, "rejecting row");
                rejected.push(e);
            }
        }
    }
    info!(
        table = %table_path.display(),
        rows = table.row_count(),
        accepted = rows.len(),
        rejected = rejected.len(),
        "expanded batch"
    );
    Ok(Expansion {
        table_path,
        row_count: table.row_count(),
        rows,
        rejected,
    })
}

#[derive(Debug)]
pub struct MaterializedBatch {
    pub dir: PathBuf,
    pub files: Vec<(usize, PathBuf)>,
    pub rejected: Vec<SweepError>,
}

/// Never reuses an existing directory: `base` becomes `base_2`, `base_3`, ...
pub fn materialize(
    descriptor: &BatchDescriptor,
    expansion: Expansion,
    parent: &Path,
    base: &str,
) -> Result<MaterializedBatch> {
    sweep_core::ensure_dir(parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let dir = create_fresh_dir(parent, base)?;

    let mut files = Vec::with_capacity(expansion.rows.len());
    for row in &expansion.rows {
        let path = dir.join(row_file_name(row.index));
        let yaml = descriptor.for_row(row.index).to_yaml()?;
        atomic_write_bytes(&path, yaml.as_bytes())?;
        files.push((row.index, path));
    }

    let rejected_rows: Vec<Value> = expansion
        .rejected
        .iter()
        .map(|e| json!({ "row": e.row(), "reason": e.to_string() }))
        .collect();
    let manifest = json!({
        "schema_version": "sweep_batch_manifest_v1",
        "table": expansion.table_path.display().to_string(),
        "table_digest": sha256_file(&expansion.table_path)?,
        "row_count": expansion.row_count,
        "materialized": files.len(),
        "rejected": rejected_rows,
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&dir.join(MANIFEST_FILE), &manifest)?;
    info!(dir = %dir.display(), files = files.len(), "materialized batch");
    Ok(MaterializedBatch {
        dir,
        files,
        rejected: expansion.rejected,
    })
}

fn create_fresh_dir(parent: &Path, base: &str) -> Result<PathBuf> {
    loop {
        let existing: Vec<String> = fs::read_dir(parent)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        let name = next_free_name(base, &existing);
        let dir = parent.join(&name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            // lost a race with another writer; pick again
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn list_materialized(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Err(SweepError::NotFound(dir.to_path_buf()).into());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("row_") && n.ends_with(".yaml"))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let d = BatchDescriptor::load(&path)?;
        let index = d.row_index.ok_or_else(|| {
            anyhow!(SweepError::configuration(format!(
                "{} has no row-index",
                path.display()
            )))
        })?;
        out.push((index, path));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedJob {
    pub row: usize,
    pub run_id: Option<String>,
    pub params: BTreeMap<String, String>,
}

pub fn index_job(descriptor: &BatchDescriptor, row: &ExpandedRow) -> PlannedJob {
    let mut params = BTreeMap::new();
    params.insert(
        "control-script".to_string(),
        descriptor.control_script.clone(),
    );
    params.insert(
        "model-dir".to_string(),
        descriptor.model_dir().display().to_string(),
    );
    params.insert(
        "batch-input-dir".to_string(),
        descriptor.table_dir().display().to_string(),
    );
    params.insert("batch-input".to_string(), descriptor.batch_input.clone());
    params.insert("row-index".to_string(), row.index.to_string());
    params.insert("default-dict".to_string(), descriptor.default_dict.clone());
    // optional keys travel only when set, so the worker sees what expansion saw
    if descriptor.id_column.is_some() {
        params.insert("id-column".to_string(), descriptor.id_column().to_string());
    }
    if descriptor.defaults_file.is_some() {
        let (path, _) = descriptor.defaults_path();
        params.insert("defaults-file".to_string(), path.display().to_string());
    }
    if descriptor.simulator.is_some() {
        params.insert("simulator".to_string(), descriptor.simulator().to_string());
    }
    if descriptor.output_root.is_some() {
        params.insert(
            "output-root".to_string(),
            descriptor.output_root().display().to_string(),
        );
    }
    PlannedJob {
        row: row.index,
        run_id: Some(row.run_id.clone()),
        params,
    }
}

pub fn file_job(row: usize, path: &Path) -> PlannedJob {
    let mut params = BTreeMap::new();
    params.insert("descriptor-file".to_string(), path.display().to_string());
    PlannedJob {
        row,
        run_id: None,
        params,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResumeFilter {
    pub from_row: Option<usize>,
    pub completed_under: Option<PathBuf>,
}

impl ResumeFilter {
    pub fn skip_reason(&self, row: &ExpandedRow) -> Option<&'static str> {
        if let Some(from) = self.from_row {
            if row.index < from {
                return Some("before --from-row");
            }
        }
        if let Some(root) = &self.completed_under {
            if root.join(&row.run_id).join(COMPLETION_SENTINEL).is_file() {
                return Some("already complete");
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub row: usize,
    pub run_id: Option<String>,
    pub handle: JobHandle,
}

#[derive(Debug, Default)]
pub struct SubmissionReport {
    pub submitted: Vec<SubmittedJob>,
    pub rejected: Vec<SweepError>,
    pub failed: Vec<SweepError>,
    pub skipped: Vec<(usize, String)>,
    pub materialized_dir: Option<PathBuf>,
}

impl SubmissionReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.failed.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "submitted": self.submitted.iter().map(|j| json!({
                "row": j.row,
                "run_id": j.run_id,
                "handle": j.handle.0,
            })).collect::<Vec<_>>(),
            "rejected": self.rejected.iter().map(row_error_json).collect::<Vec<_>>(),
            "failed": self.failed.iter().map(row_error_json).collect::<Vec<_>>(),
            "skipped": self.skipped.iter().map(|(row, why)| json!({
                "row": row,
                "reason": why,
            })).collect::<Vec<_>>(),
            "materialized_dir": self.materialized_dir.as_ref().map(|p| p.display().to_string()),
        })
    }
}

fn row_error_json(e: &SweepError) -> Value {
    json!({ "row": e.row(), "code": e.code(), "message": e.to_string() })
}

/// Ascending row order. A failed submission is recorded and the loop moves on.
pub fn submit_all<O: Orchestrator + ?Sized>(
    jobs: &[PlannedJob],
    template: &str,
    orchestrator: &mut O,
    throttle: &mut Throttle,
) -> SubmissionReport {
    let mut ordered: Vec<&PlannedJob> = jobs.iter().collect();
    ordered.sort_by_key(|j| j.row);

    let mut report = SubmissionReport::default();
    for job in ordered {
        throttle.wait();
        match orchestrator.submit(template, &job.params) {
            Ok(handle) => {
                info!(row = job.row, run_id = ?job.run_id, handle = %handle, "submitted");
                report.submitted.push(SubmittedJob {
                    row: job.row,
                    run_id: job.run_id.clone(),
                    handle,
                });
            }
            Err(e) => {
                let err = SweepError::Submission {
                    row: job.row,
                    message: e.to_string(),
                };
                error!(row = job.row, error = %err, "submission failed");
                report.failed.push(err);
            }
        }
    }
    report
}

#[derive(Debug, Clone)]
pub struct MaterializeTarget {
    pub parent: PathBuf,
    pub base: String,
}

impl MaterializeTarget {
    pub fn for_descriptor(
        descriptor: &BatchDescriptor,
        parent: Option<PathBuf>,
        base: Option<String>,
    ) -> Self {
        let parent = parent.unwrap_or_else(|| descriptor.table_dir().join("materialized"));
        let base = base.unwrap_or_else(|| {
            Path::new(&descriptor.batch_input)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "batch".to_string())
        });
        Self { parent, base }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub strategy: Strategy,
    pub rate: RatePolicy,
    pub resume: ResumeFilter,
    pub materialize_target: Option<MaterializeTarget>,
}

pub fn run_batch<O: Orchestrator + ?Sized>(
    descriptor: &BatchDescriptor,
    options: &SubmitOptions,
    orchestrator: &mut O,
) -> Result<SubmissionReport> {
    let expansion = expand(descriptor)?;
    let mut skipped = Vec::new();
    let mut kept = Vec::with_capacity(expansion.rows.len());
    for row in expansion.rows {
        match options.resume.skip_reason(&row) {
            Some(why) => {
                info!(row = row.index, run_id = %row.run_id, reason = why, "skipping row");
                skipped.push((row.index, why.to_string()));
            }
            None => kept.push(row),
        }
    }
    let expansion = Expansion {
        rows: kept,
        ..expansion
    };

    let (jobs, rejected, materialized_dir) = match options.strategy {
        Strategy::IndexOnly => {
            let jobs: Vec<PlannedJob> = expansion
                .rows
                .iter()
                .map(|row| index_job(descriptor, row))
                .collect();
            (jobs, expansion.rejected, None)
        }
        Strategy::Materialized => {
            let target = options
                .materialize_target
                .clone()
                .unwrap_or_else(|| MaterializeTarget::for_descriptor(descriptor, None, None));
            let batch = materialize(descriptor, expansion, &target.parent, &target.base)?;
            let files = list_materialized(&batch.dir)?;
            let jobs: Vec<PlannedJob> = files
                .iter()
                .map(|(row, path)| file_job(*row, path))
                .collect();
            (jobs, batch.rejected, Some(batch.dir))
        }
    };

    let mut throttle = Throttle::new(options.rate);
    info!(
        jobs = jobs.len(),
        strategy = options.strategy.as_str(),
        rate = options.rate.as_str(),
        "submitting batch"
    );
    let mut report = submit_all(
        &jobs,
        descriptor.workflow_template(),
        orchestrator,
        &mut throttle,
    );
    report.rejected = rejected;
    report.skipped = skipped;
    report.materialized_dir = materialized_dir;
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub table_path: PathBuf,
    pub table_digest: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub accepted: usize,
    pub rejected: Vec<String>,
    pub id_column: String,
    pub default_dict: String,
    pub control_script: String,
    pub model_dir: PathBuf,
    pub output_root: PathBuf,
    pub workflow_template: String,
    pub submit_delay_seconds: u64,
}

pub fn describe_batch(descriptor: &BatchDescriptor) -> Result<BatchSummary> {
    let expansion = expand(descriptor)?;
    let table = ParameterTable::load(&expansion.table_path)?;
    Ok(BatchSummary {
        table_digest: sha256_file(&expansion.table_path)?,
        columns: table.header().to_vec(),
        row_count: expansion.row_count,
        accepted: expansion.rows.len(),
        rejected: expansion.rejected.iter().map(|e| e.to_string()).collect(),
        table_path: expansion.table_path,
        id_column: descriptor.id_column().to_string(),
        default_dict: descriptor.default_dict.clone(),
        control_script: descriptor.control_script.clone(),
        model_dir: descriptor.model_dir(),
        output_root: descriptor.output_root(),
        workflow_template: descriptor.workflow_template().to_string(),
        submit_delay_seconds: descriptor.submit_delay().as_secs(),
    })
}

pub fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, ParamValue>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        out.insert(key.trim().to_string(), ParamValue::parse(val_raw));
    }
    Ok(out)
}
