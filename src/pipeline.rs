use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use z3::{Config, Context};

use crate::pipeline::constraint::Constraint;
use crate::pipeline::engine::{Counterexample, Environment, Settings, Verdict};
use crate::pipeline::error::{CheckError, Result};
use crate::pipeline::shared::{Dialect, SqlType};
use crate::pipeline::syntax::Relation;

pub mod aggregate;
pub mod algebra;
pub mod constraint;
pub mod engine;
pub mod error;
pub mod predicate;
pub mod registry;
pub mod shared;
pub mod syntax;
pub mod table;
#[cfg(test)]
mod tests;
pub mod value;

/// One equivalence problem: the schema (table -> column -> SQL type, in
/// declaration order), its constraints and the two compiled plans.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Input {
	pub schema: serde_json::Map<String, serde_json::Value>,
	#[serde(default)]
	pub constraints: Vec<Constraint>,
	pub queries: (Relation, Relation),
	/// Source texts of the two queries, only logged.
	#[serde(default)]
	pub sql: (String, String),
	#[serde(default)]
	pub settings: Settings,
}

impl Input {
	pub fn tables(&self) -> Result<Vec<(String, Vec<(String, SqlType)>)>> {
		self.schema
			.iter()
			.map(|(table, columns)| {
				let columns = columns.as_object().ok_or_else(|| CheckError::UnknownType(columns.to_string()))?;
				let columns = columns
					.iter()
					.map(|(column, ty)| {
						let ty = ty.as_str().ok_or_else(|| CheckError::UnknownType(ty.to_string()))?;
						Ok((column.clone(), ty.parse()?))
					})
					.collect::<Result<Vec<_>>>()?;
				Ok((table.clone(), columns))
			})
			.collect()
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Stats {
	pub bound_size: usize,
	pub dialect: Dialect,
	pub trivial: bool,
	pub setup_duration: Duration,
	pub traversing_duration: Duration,
	pub solving_duration: Duration,
	pub total_duration: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
	pub verdict: Verdict,
	pub counterexample: Option<Counterexample>,
	pub stats: Stats,
}

impl Report {
	pub fn render(&self, timer: bool) -> String {
		let mut out = self.counterexample.as_ref().map(ToString::to_string).unwrap_or_default();
		if timer {
			let cost = self.stats.traversing_duration + self.stats.solving_duration;
			out.push_str(&format!("Time cost: {:.2}\n", cost.as_secs_f64()));
		}
		out.push_str(&format!("{}\n", self.verdict));
		out
	}
}

pub fn check(input: Input) -> Result<Report> {
	let tables = input.tables()?;
	let Input { constraints, queries: (q1, q2), sql, settings, .. } = input;
	let mut stats = Stats { bound_size: settings.bound_size, dialect: settings.dialect, ..Stats::default() };
	log::info!("Input:\n{}\n{}", sql.0, sql.1);
	log::info!("Left:\n{}", q1);
	log::info!("Right:\n{}", q2);

	let start = Instant::now();
	log::debug!("Setup started");
	let z3_ctx = Context::new(&Config::new());
	let mut env = Environment::new(&z3_ctx, settings);
	for (name, columns) in &tables {
		env.create_database(columns, stats.bound_size, name)?;
	}
	env.add_constraints(&constraints)?;
	env.save_checkpoints("setup");
	stats.setup_duration = start.elapsed();
	log::debug!("Setup finished - {:.4?}", stats.setup_duration);

	let verdict = env.analyze(&q1, &q2)?;
	stats.trivial = env.trivial;
	stats.traversing_duration = env.traversing_time;
	stats.solving_duration = env.solving_time;
	stats.total_duration = start.elapsed();
	log::debug!("Check finished - {:.4?}", stats.total_duration);
	Ok(Report { verdict, counterexample: env.counterexample.take(), stats })
}
