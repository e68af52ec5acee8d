use crate::descriptor::{
    load_default_dict, BatchDescriptor, DEFAULT_DEFAULTS_FILE, DEFAULT_ID_COLUMN,
    DEFAULT_SIMULATOR,
};
use crate::table::ParameterTable;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use sweep_core::{atomic_write_bytes, ensure_dir, ParamValue, ParameterSet, SweepError, COMPLETION_SENTINEL};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const VARS_FILE: &str = "vars.res";
pub const CHECK_RESULTS_FILE: &str = "check_results.res";
pub const RUN_LOG_FILE: &str = "run.log";
pub const EXPECTED_OUTPUT_DIRS: [&str; 2] = ["prof", "flx"];

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model_dir: PathBuf,
    pub output_root: PathBuf,
    pub table_dir: PathBuf,
    pub table_name: String,
    pub row_index: usize,
    pub default_dict: String,
    pub defaults_file: Option<PathBuf>,
    pub id_column: String,
    pub simulator: String,
    pub overrides: BTreeMap<String, ParamValue>,
}

impl InvokeRequest {
    pub fn new(
        model_dir: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        table_dir: impl Into<PathBuf>,
        table_name: impl Into<String>,
        row_index: usize,
        default_dict: impl Into<String>,
    ) -> Self {
        Self {
            model_dir: model_dir.into(),
            output_root: output_root.into(),
            table_dir: table_dir.into(),
            table_name: table_name.into(),
            row_index,
            default_dict: default_dict.into(),
            defaults_file: None,
            id_column: DEFAULT_ID_COLUMN.to_string(),
            simulator: DEFAULT_SIMULATOR.to_string(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn from_descriptor(descriptor: &BatchDescriptor) -> Result<Self> {
        let row_index = descriptor.row_index.ok_or_else(|| {
            SweepError::configuration("descriptor has no row-index; materialize the batch first")
        })?;
        let (defaults_file, _) = descriptor.defaults_path();
        Ok(Self {
            model_dir: descriptor.model_dir(),
            output_root: descriptor.output_root(),
            table_dir: descriptor.table_dir(),
            table_name: descriptor.batch_input.clone(),
            row_index,
            default_dict: descriptor.default_dict.clone(),
            defaults_file: Some(defaults_file),
            id_column: descriptor.id_column().to_string(),
            simulator: descriptor.simulator().to_string(),
            overrides: BTreeMap::new(),
        })
    }

    pub fn defaults_path(&self) -> PathBuf {
        self.defaults_file
            .clone()
            .unwrap_or_else(|| self.model_dir.join(DEFAULT_DEFAULTS_FILE))
    }

    pub fn simulator_path(&self) -> PathBuf {
        let p = Path::new(&self.simulator);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.model_dir.join(p)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub parameters: ParameterSet,
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub exit_status: String,
    pub checks: RunChecks,
}

pub fn prepare_run(req: &InvokeRequest) -> Result<PreparedRun> {
    if !req.table_dir.is_dir() {
        return Err(SweepError::configuration(format!(
            "batch input directory does not exist: {}",
            req.table_dir.display()
        ))
        .into());
    }
    let table_path = req.table_dir.join(&req.table_name);
    if !table_path.is_file() {
        return Err(SweepError::configuration(format!(
            "batch input file does not exist: {}",
            table_path.display()
        ))
        .into());
    }
    let table = ParameterTable::load(&table_path)?;
    table.require_column(&req.id_column)?;
    let row = table.row(req.row_index)?;
    let run_id = row.run_id(&req.id_column)?.to_string();

    let defaults = load_default_dict(&req.defaults_path(), &req.default_dict)?;
    let parameters = ParameterSet::builder()
        .defaults(&defaults)
        .row(row.parameter_cells(&req.id_column))
        .overrides(&req.overrides)
        .build();
    let run_dir = req.output_root.join(&run_id);
    Ok(PreparedRun {
        run_id,
        run_dir,
        parameters,
    })
}

/// Run one row to completion. The sentinel is written only when the
/// simulator exits with status 0.
pub fn invoke(req: &InvokeRequest) -> Result<InvokeOutcome> {
    let prepared = prepare_run(req)?;
    let simulator = req.simulator_path();
    if !simulator.is_file() {
        return Err(SweepError::configuration(format!(
            "simulator executable not found: {}",
            simulator.display()
        ))
        .into());
    }
    info!(
        run_id = %prepared.run_id,
        row = req.row_index,
        parameters = prepared.parameters.len(),
        "starting simulation"
    );

    let run_dir = &prepared.run_dir;
    ensure_dir(run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    // a rerun must not inherit the previous attempt's completion marker
    for stale in [COMPLETION_SENTINEL, CHECK_RESULTS_FILE] {
        let p = run_dir.join(stale);
        if p.exists() {
            fs::remove_file(&p)?;
        }
    }
    write_vars_file(&run_dir.join(VARS_FILE), &prepared.parameters)?;

    let log = fs::File::create(run_dir.join(RUN_LOG_FILE))?;
    let log_err = log.try_clone()?;
    let mut cmd = Command::new(&simulator);
    cmd.current_dir(run_dir)
        .arg("--default-dict")
        .arg(&req.default_dict)
        .arg("--runname")
        .arg(&prepared.run_id);
    for (key, value) in prepared.parameters.iter() {
        cmd.arg(format!("--{}", key)).arg(value.to_string());
    }
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .status()
        .with_context(|| format!("starting simulator {}", simulator.display()))?;

    let exit_status = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    if !status.success() {
        warn!(run_id = %prepared.run_id, exit_status = %exit_status, "simulation failed");
        return Err(SweepError::SimulationFailure {
            run_id: prepared.run_id,
            status: exit_status,
        }
        .into());
    }

    let checks = check_run_outputs(run_dir)?;
    atomic_write_bytes(&run_dir.join(CHECK_RESULTS_FILE), checks.render().as_bytes())?;
    atomic_write_bytes(&run_dir.join(COMPLETION_SENTINEL), b"")?;
    info!(run_id = %prepared.run_id, "simulation complete");
    Ok(InvokeOutcome {
        run_id: prepared.run_id,
        run_dir: prepared.run_dir,
        exit_status,
        checks,
    })
}

pub fn invoke_descriptor(path: &Path, overrides: &BTreeMap<String, ParamValue>) -> Result<InvokeOutcome> {
    let descriptor = BatchDescriptor::load(path)?;
    let mut req = InvokeRequest::from_descriptor(&descriptor)?;
    req.overrides = overrides.clone();
    invoke(&req)
}

fn write_vars_file(path: &Path, parameters: &ParameterSet) -> Result<()> {
    let mut body = String::from("*** variables set by dictionary and table row\n");
    body.push_str(&parameters.to_delimited("\t"));
    atomic_write_bytes(path, body.as_bytes())?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunChecks {
    pub missing_dirs: Vec<String>,
    pub empty_dirs: Vec<PathBuf>,
    pub empty_files: Vec<PathBuf>,
}

impl RunChecks {
    pub fn is_clean(&self) -> bool {
        self.missing_dirs.is_empty() && self.empty_dirs.is_empty() && self.empty_files.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("*** results of post-run diagnostic checks\n");
        for name in EXPECTED_OUTPUT_DIRS {
            out.push_str(&format!(
                "{} subdir exists: \t{}\n",
                name,
                !self.missing_dirs.iter().any(|m| m == name)
            ));
        }
        out.push_str(&format!(
            "output dirs are not empty: \t{}\n",
            self.empty_dirs.is_empty()
        ));
        out.push_str(&format!(
            "no output files are empty: \t{}\n",
            self.empty_files.is_empty()
        ));
        for d in &self.empty_dirs {
            out.push_str(&format!("empty dir: {}\n", d.display()));
        }
        for f in &self.empty_files {
            out.push_str(&format!("empty file: {}\n", f.display()));
        }
        out
    }
}

pub fn check_run_outputs(run_dir: &Path) -> Result<RunChecks> {
    let mut checks = RunChecks::default();
    for name in EXPECTED_OUTPUT_DIRS {
        if !run_dir.join(name).is_dir() {
            checks.missing_dirs.push(name.to_string());
        }
    }
    let walker = WalkDir::new(run_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".ipynb_checkpoints");
    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(run_dir)
            .unwrap_or(entry.path())
            .to_path_buf();
        if entry.file_type().is_dir() {
            if fs::read_dir(entry.path())?.next().is_none() {
                checks.empty_dirs.push(rel);
            }
        } else if entry.file_type().is_file() && entry.depth() >= 2 {
            let is_save = entry
                .path()
                .extension()
                .map(|e| e.eq_ignore_ascii_case("save"))
                .unwrap_or(false);
            if is_save {
                continue;
            }
            let bytes = fs::read(entry.path())?;
            if bytes.iter().all(|b| b.is_ascii_whitespace()) {
                checks.empty_files.push(rel);
            }
        }
    }
    Ok(checks)
}
