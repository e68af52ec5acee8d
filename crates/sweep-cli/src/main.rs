use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_core::{SweepError, COMPLETION_SENTINEL};
use sweep_runner::descriptor::DEFAULT_DEFAULTS_FILE;
use sweep_runner::{
    BatchDescriptor, CommandOrchestrator, DryRunOrchestrator, MaterializeTarget, Orchestrator,
    RatePolicy, ResumeFilter, Strategy, SubmitOptions,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "sweep",
    version,
    about = "Batch parameter sweeps for the SCEPTER soil model"
)]
struct Cli {
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    #[value(name = "index")]
    Index,
    #[value(name = "materialize")]
    Materialize,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Index => Strategy::IndexOnly,
            StrategyArg::Materialize => Strategy::Materialized,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ThrottleArg {
    #[value(name = "fixed")]
    Fixed,
    #[value(name = "token-bucket")]
    TokenBucket,
    #[value(name = "none")]
    None,
}

#[derive(Subcommand)]
enum Commands {
    Describe {
        descriptor: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Submit {
        descriptor: PathBuf,
        #[arg(long, value_enum, default_value = "index")]
        strategy: StrategyArg,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum, default_value = "fixed")]
        throttle: ThrottleArg,
        #[arg(long)]
        delay_seconds: Option<u64>,
        #[arg(long, default_value_t = 5)]
        burst: u32,
        #[arg(long)]
        interval_seconds: Option<u64>,
        #[arg(long)]
        from_row: Option<usize>,
        #[arg(long)]
        skip_completed: bool,
        #[arg(long)]
        output_root: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    Materialize {
        descriptor: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Invoke {
        #[arg(long)]
        model_dir: PathBuf,
        #[arg(long)]
        output_root: PathBuf,
        #[arg(long)]
        batch_input_dir: PathBuf,
        #[arg(long)]
        batch_input: String,
        #[arg(long)]
        row_index: usize,
        #[arg(long)]
        default_dict: String,
        #[arg(long)]
        defaults_file: Option<PathBuf>,
        #[arg(long)]
        id_column: Option<String>,
        #[arg(long)]
        simulator: Option<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    InvokeDescriptor {
        descriptor: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Audit {
        output_root: PathBuf,
        #[arg(long, default_value = "")]
        pattern: String,
        #[arg(long, default_value = COMPLETION_SENTINEL)]
        sentinel: String,
        #[arg(long)]
        json: bool,
    },
    BuildTable {
        plan: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        file_name: String,
        #[arg(long)]
        split: Option<usize>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

struct CommandOutcome {
    payload: Option<Value>,
    rows_ok: bool,
}

impl CommandOutcome {
    fn done() -> Self {
        Self {
            payload: None,
            rows_ok: true,
        }
    }

    fn json(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            rows_ok: true,
        }
    }

    fn with_rows_ok(mut self, rows_ok: bool) -> Self {
        self.rows_ok = rows_ok;
        self
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            if !outcome.rows_ok {
                std::process::exit(2);
            }
        }
        Err(err) => {
            let sweep_err = err.downcast_ref::<SweepError>();
            let code = sweep_err.map(|e| e.code()).unwrap_or("command_failed");
            if json_mode {
                let details = match sweep_err.and_then(|e| e.row()) {
                    Some(row) => json!({ "row": row }),
                    None => json!({}),
                };
                emit_json(&json_error(code, err.to_string(), details));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SweepError>() {
        Some(e) if !e.is_fatal() => 2,
        _ => 1,
    }
}

fn run_command(command: Commands) -> Result<CommandOutcome> {
    match command {
        Commands::Describe { descriptor, json } => {
            let d = BatchDescriptor::load(&descriptor)?;
            let summary = sweep_runner::describe_batch(&d)?;
            if json {
                return Ok(CommandOutcome::json(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Submit {
            descriptor,
            strategy,
            out,
            name,
            throttle,
            delay_seconds,
            burst,
            interval_seconds,
            from_row,
            skip_completed,
            output_root,
            dry_run,
            json,
        } => {
            let d = BatchDescriptor::load(&descriptor)?;
            let delay = delay_seconds
                .map(Duration::from_secs)
                .unwrap_or_else(|| d.submit_delay());
            let rate = match throttle {
                ThrottleArg::Fixed => RatePolicy::FixedDelay(delay),
                ThrottleArg::TokenBucket => RatePolicy::TokenBucket {
                    burst,
                    interval: interval_seconds.map(Duration::from_secs).unwrap_or(delay),
                },
                ThrottleArg::None => RatePolicy::Unthrottled,
            };
            let completed_under = if skip_completed {
                Some(output_root.unwrap_or_else(|| d.output_root()))
            } else {
                None
            };
            let strategy: Strategy = strategy.into();
            let options = SubmitOptions {
                strategy,
                rate,
                resume: ResumeFilter {
                    from_row,
                    completed_under,
                },
                materialize_target: Some(MaterializeTarget::for_descriptor(&d, out, name)),
            };

            let client = CommandOrchestrator::new(d.submit_command())?;
            let mut orchestrator: Box<dyn Orchestrator> = if dry_run {
                Box::new(DryRunOrchestrator::new(client))
            } else {
                Box::new(client)
            };
            let report = sweep_runner::run_batch(&d, &options, orchestrator.as_mut())?;
            let rows_ok = report.is_clean();
            if json {
                return Ok(CommandOutcome::json(json!({
                    "ok": rows_ok,
                    "command": "submit",
                    "strategy": strategy.as_str(),
                    "throttle": rate.as_str(),
                    "dry_run": dry_run,
                    "report": report.to_json(),
                }))
                .with_rows_ok(rows_ok));
            }
            print_report(&report);
            return Ok(CommandOutcome::done().with_rows_ok(rows_ok));
        }
        Commands::Materialize {
            descriptor,
            out,
            name,
            json,
        } => {
            let d = BatchDescriptor::load(&descriptor)?;
            let target = MaterializeTarget::for_descriptor(&d, out, name);
            let expansion = sweep_runner::expand(&d)?;
            let batch = sweep_runner::materialize(&d, expansion, &target.parent, &target.base)?;
            let rows_ok = batch.rejected.is_empty();
            if json {
                return Ok(CommandOutcome::json(json!({
                    "ok": rows_ok,
                    "command": "materialize",
                    "dir": batch.dir.display().to_string(),
                    "files": batch.files.len(),
                    "rejected": batch.rejected.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
                }))
                .with_rows_ok(rows_ok));
            }
            println!("dir: {}", batch.dir.display());
            println!("files: {}", batch.files.len());
            for e in &batch.rejected {
                println!("rejected: {}", e);
            }
            return Ok(CommandOutcome::done().with_rows_ok(rows_ok));
        }
        Commands::Invoke {
            model_dir,
            output_root,
            batch_input_dir,
            batch_input,
            row_index,
            default_dict,
            defaults_file,
            id_column,
            simulator,
            set_values,
            json,
        } => {
            let mut req = sweep_runner::InvokeRequest::new(
                model_dir,
                output_root,
                batch_input_dir,
                batch_input,
                row_index,
                default_dict,
            );
            req.defaults_file = defaults_file;
            if let Some(col) = id_column {
                req.id_column = col;
            }
            if let Some(sim) = simulator {
                req.simulator = sim;
            }
            req.overrides = sweep_runner::parse_set_bindings(&set_values)?;
            let outcome = sweep_runner::invoke(&req)?;
            return Ok(invoke_outcome(&outcome, json));
        }
        Commands::InvokeDescriptor {
            descriptor,
            set_values,
            json,
        } => {
            let overrides = sweep_runner::parse_set_bindings(&set_values)?;
            let outcome = sweep_runner::invoke_descriptor(&descriptor, &overrides)?;
            return Ok(invoke_outcome(&outcome, json));
        }
        Commands::Audit {
            output_root,
            pattern,
            sentinel,
            json,
        } => {
            let results = sweep_runner::audit(&output_root, &pattern, &sentinel)?;
            let summary = sweep_runner::summarize(&results);
            if json {
                let runs: Vec<Value> = results
                    .iter()
                    .map(|(dir, done)| {
                        json!({ "run_dir": dir.display().to_string(), "complete": done })
                    })
                    .collect();
                return Ok(CommandOutcome::json(json!({
                    "ok": true,
                    "command": "audit",
                    "output_root": output_root.display().to_string(),
                    "total": summary.total,
                    "complete": summary.complete,
                    "runs": runs,
                })));
            }
            for (dir, done) in &results {
                println!("{}\t{}", if *done { "complete" } else { "incomplete" }, dir.display());
            }
            println!("total: {}", summary.total);
            println!("complete: {}", summary.complete);
            println!("incomplete: {}", summary.incomplete.len());
        }
        Commands::BuildTable {
            plan,
            out_dir,
            file_name,
            split,
            force,
            json,
        } => {
            let plan = sweep_runner::SweepPlan::load(&plan)?;
            let table = sweep_runner::build_table(&plan)?;
            let written = sweep_runner::save_table(&table, &out_dir, &file_name, split, force)?;
            if json {
                return Ok(CommandOutcome::json(json!({
                    "ok": true,
                    "command": "build-table",
                    "rows": table.rows.len(),
                    "columns": table.header,
                    "duplicate_ids": table.duplicate_ids,
                    "written": written.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                })));
            }
            println!("rows: {}", table.rows.len());
            for p in &written {
                println!("wrote: {}", p.display());
            }
            for id in &table.duplicate_ids {
                println!("duplicate_id: {}", id);
            }
        }
        Commands::Init { dir, force } => {
            write_init_files(&dir, force)?;
        }
    }
    Ok(CommandOutcome::done())
}

fn invoke_outcome(outcome: &sweep_runner::InvokeOutcome, json: bool) -> CommandOutcome {
    if json {
        return CommandOutcome::json(json!({
            "ok": true,
            "command": "invoke",
            "run_id": outcome.run_id,
            "run_dir": outcome.run_dir.display().to_string(),
            "exit_status": outcome.exit_status,
            "checks_clean": outcome.checks.is_clean(),
        }));
    }
    println!("run_id: {}", outcome.run_id);
    println!("run_dir: {}", outcome.run_dir.display());
    println!("exit_status: {}", outcome.exit_status);
    if !outcome.checks.is_clean() {
        print!("{}", outcome.checks.render());
    }
    CommandOutcome::done()
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Submit { json, .. }
        | Commands::Materialize { json, .. }
        | Commands::Invoke { json, .. }
        | Commands::InvokeDescriptor { json, .. }
        | Commands::Audit { json, .. }
        | Commands::BuildTable { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn summary_to_json(summary: &sweep_runner::BatchSummary) -> Value {
    json!({
        "table": summary.table_path.display().to_string(),
        "table_digest": summary.table_digest,
        "columns": summary.columns,
        "rows": summary.row_count,
        "accepted": summary.accepted,
        "rejected": summary.rejected,
        "id_column": summary.id_column,
        "default_dict": summary.default_dict,
        "control_script": summary.control_script,
        "model_dir": summary.model_dir.display().to_string(),
        "output_root": summary.output_root.display().to_string(),
        "workflow_template": summary.workflow_template,
        "submit_delay_seconds": summary.submit_delay_seconds,
    })
}

fn print_summary(summary: &sweep_runner::BatchSummary) {
    println!("table: {}", summary.table_path.display());
    println!("table_digest: {}", summary.table_digest);
    println!("columns: {}", summary.columns.join(","));
    println!("rows: {}", summary.row_count);
    println!("accepted: {}", summary.accepted);
    for r in &summary.rejected {
        println!("rejected: {}", r);
    }
    println!("id_column: {}", summary.id_column);
    println!("default_dict: {}", summary.default_dict);
    println!("control_script: {}", summary.control_script);
    println!("model_dir: {}", summary.model_dir.display());
    println!("output_root: {}", summary.output_root.display());
    println!("workflow_template: {}", summary.workflow_template);
    println!("submit_delay_seconds: {}", summary.submit_delay_seconds);
}

fn print_report(report: &sweep_runner::SubmissionReport) {
    if let Some(dir) = &report.materialized_dir {
        println!("materialized: {}", dir.display());
    }
    for job in &report.submitted {
        match &job.run_id {
            Some(id) => println!("submitted: row {} ({}) -> {}", job.row, id, job.handle),
            None => println!("submitted: row {} -> {}", job.row, job.handle),
        }
    }
    for (row, why) in &report.skipped {
        println!("skipped: row {} ({})", row, why);
    }
    for e in &report.rejected {
        println!("rejected: {}", e);
    }
    for e in &report.failed {
        println!("failed: {}", e);
    }
    println!(
        "totals: submitted={} skipped={} rejected={} failed={}",
        report.submitted.len(),
        report.skipped.len(),
        report.rejected.len(),
        report.failed.len()
    );
}

const BATCH_TEMPLATE: &str = "\
batch-input-dir: inputs                 # REQUIRED: directory holding the table
batch-input: batch.csv                  # REQUIRED: table file name
default-dict: dict_singlerun            # REQUIRED: entry in the defaults file
control-script: scepter_run.py          # REQUIRED
model-dir: .                            # REQUIRED: directory holding the simulator
# output-root: ./scepter_output
# defaults-file: ./defaults.yaml
# id-column: newrun_id
# simulator: scepter
# workflow-template: scepter-run
# submit-command: [argo, submit, --from, 'workflowtemplate/{template}']
# submit-delay-seconds: 60
";

const DEFAULTS_TEMPLATE: &str = "\
dict_singlerun:
  duration: 50
  dustsp: gbas
  dustrate: 0
  dustrad: 150
  cec: 21.1
";

const PLAN_TEMPLATE: &str = "\
prefix: hiFert
clim-tag: base
sites: [site_311a, site_311b]
by-site:
  climatefiles: [site_311a, site_311b]
  cec: [21.1, 6.9]
constants:
  dustsp: gbas
  duration: 50
combinations:
  dustrate: [30, 300, 3000]
  dustrad: [10, 100]
add-control: true
";

fn write_init_files(dir: &Path, force: bool) -> Result<()> {
    sweep_core::ensure_dir(dir)?;
    let files = [
        ("batch.yaml", BATCH_TEMPLATE),
        (DEFAULT_DEFAULTS_FILE, DEFAULTS_TEMPLATE),
        ("plan.yaml", PLAN_TEMPLATE),
    ];
    for (name, _) in &files {
        let path = dir.join(name);
        if !force && path.exists() {
            return Err(anyhow::anyhow!(SweepError::configuration(format!(
                "init file already exists (use --force): {}",
                path.display()
            ))));
        }
    }
    for (name, body) in &files {
        let path = dir.join(name);
        std::fs::write(&path, body)?;
        info!(path = %path.display(), "wrote template");
        println!("wrote: {}", path.display());
    }
    println!(
        "next: sweep build-table {} --out-dir {} --file-name batch.csv",
        dir.join("plan.yaml").display(),
        dir.join("inputs").display()
    );
    println!("next: sweep describe {}", dir.join("batch.yaml").display());
    Ok(())
}
