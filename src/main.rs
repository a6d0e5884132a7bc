use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use veriql::pipeline::shared::Dialect;
use veriql::pipeline::{self, Input};

/// Checks two compiled SQL plans for equivalence over a bounded database.
#[derive(Parser, Debug)]
#[command(name = "veriql", version)]
struct Args {
	/// JSON file holding `schema`, `constraints`, `queries` and optional `settings`.
	input: PathBuf,
	/// Rows per base table.
	#[arg(long)]
	row_num: Option<usize>,
	#[arg(long)]
	timeout_ms: Option<u64>,
	/// all, mysql, mariadb, postgresql (psql) or oracle.
	#[arg(long)]
	dialect: Option<Dialect>,
	#[arg(long)]
	no_counterexample: bool,
	#[arg(long)]
	no_timer: bool,
	/// Write the result here instead of stdout. A JSON report lands next to it.
	#[arg(long)]
	output_file: Option<PathBuf>,
}

fn main() -> Result<()> {
	env_logger::init();
	let args = Args::parse();
	let text = fs::read_to_string(&args.input).with_context(|| format!("cannot read {}", args.input.display()))?;
	let mut input: Input =
		serde_json::from_str(&text).with_context(|| format!("malformed input {}", args.input.display()))?;

	let settings = &mut input.settings;
	if let Some(rows) = args.row_num {
		settings.bound_size = rows;
	}
	if let Some(ms) = args.timeout_ms {
		settings.timeout_ms = Some(ms);
	}
	if let Some(dialect) = args.dialect {
		settings.dialect = dialect;
	}
	settings.show_counterexample &= !args.no_counterexample;
	settings.timer &= !args.no_timer;
	let timer = settings.timer;

	let report = pipeline::check(input).context("equivalence check aborted")?;
	log::debug!("Stats: {}", serde_json::to_string(&report.stats)?);
	let rendered = report.render(timer);
	match args.output_file {
		Some(path) => {
			if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
				fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
			}
			fs::write(&path, &rendered).with_context(|| format!("cannot write {}", path.display()))?;
			let json = serde_json::to_string_pretty(&report)?;
			fs::write(path.with_extension("report.json"), json).with_context(|| format!("cannot write report next to {}", path.display()))?;
		},
		None => print!("{}", rendered),
	}
	Ok(())
}
