use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use indenter::indented;
use itertools::Itertools;
use num::rational::Ratio;
use serde::{Deserialize, Serialize};
use z3::ast::{Ast, Bool, Real};
use z3::{Context, Model, Params, SatResult, Solver};

use super::constraint::Constraint;
use super::error::{CheckError, Result};
use super::shared::{Dialect, Domain, Eval, SqlType};
use super::syntax::Relation;
use super::table::{Attribute, Row, Scope, Table};
use super::value::{render_temporal, Ctx, Tri, Value};

/// Everything formula construction needs: the solver context, the catalog of
/// relations and the dialect in force.
#[derive(Clone)]
pub struct Z3Env<'c> {
	pub ctx: Rc<Ctx<'c>>,
	pub scope: Rc<RefCell<Scope<'c>>>,
	pub dialect: Dialect,
}

impl<'c> Z3Env<'c> {
	pub fn new(ctx: Rc<Ctx<'c>>, dialect: Dialect) -> Self {
		Z3Env { ctx, scope: Default::default(), dialect }
	}

	/// A base table of `bound` rows with free deletion markers and free cells.
	pub fn create_table(&self, name: &str, columns: &[(String, SqlType)], bound: usize) -> Result<Rc<Table<'c>>> {
		let ctx = self.ctx.as_ref();
		let z3_ctx = ctx.z3_ctx();
		let rows = (0..bound)
			.map(|i| {
				let deleted = Bool::new_const(z3_ctx, format!("{}!{}!deleted", name, i));
				let cells = columns
					.iter()
					.map(|(column, ty)| {
						let prefix = format!("{}!{}!{}", name, i, column);
						let null = Bool::new_const(z3_ctx, format!("{}!null", prefix));
						let value = match ty {
							SqlType::Boolean => Value::Bool(Bool::new_const(z3_ctx, prefix)),
							_ => {
								let v = Real::new_const(z3_ctx, prefix);
								if *ty == SqlType::Integer {
									ctx.solver.assert(&v.is_int());
								}
								Value::Num(v)
							},
						};
						Tri::new(null, value).masked(ctx)
					})
					.collect();
				Row { deleted, cells }
			})
			.collect();
		let table = Rc::new(Table {
			name: name.to_string(),
			attributes: columns.iter().map(|(column, ty)| Attribute::new(Some(name), column, *ty)).collect(),
			rows,
			order: None,
			fathers: vec![],
			root: BTreeSet::from([name.to_string()]),
		});
		self.scope.borrow_mut().add_base(table.clone())?;
		Ok(table)
	}

	/// Holds iff some live row occurs a different number of times in the two
	/// tables. Rows match null-safely.
	pub fn differ(&self, t1: &Table<'c>, t2: &Table<'c>) -> Bool<'c> {
		let ctx = self.ctx.as_ref();
		let multiplicity = |row: &Row<'c>, table: &Table<'c>| {
			let hits = table.rows.iter().map(|s| ctx.all(&[s.deleted.not(), s.same(row, ctx)])).collect_vec();
			ctx.count(&hits)
		};
		let differs = t1
			.rows
			.iter()
			.chain(&t2.rows)
			.map(|r| ctx.all(&[r.deleted.not(), multiplicity(r, t1)._eq(&multiplicity(r, t2)).not()]))
			.collect_vec();
		ctx.any(&differs)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	/// Rows per base table.
	pub bound_size: usize,
	pub timeout_ms: Option<u64>,
	pub dialect: Dialect,
	pub show_counterexample: bool,
	pub timer: bool,
}

impl Default for Settings {
	fn default() -> Self {
		Settings { bound_size: 2, timeout_ms: None, dialect: Dialect::default(), show_counterexample: true, timer: true }
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
	Equivalent,
	NotEquivalent,
	/// The solver gave up, with its reason.
	Unknown(String),
}

impl Display for Verdict {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Verdict::Equivalent => write!(f, ">>> Equivalent!"),
			Verdict::NotEquivalent => write!(f, ">>> Non-Equivalent! Found a counterexample!"),
			Verdict::Unknown(reason) => write!(f, ">>> Unknown: {}", reason),
		}
	}
}

/// Live rows of a table under a model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
	pub name: String,
	pub columns: Vec<String>,
	pub rows: Vec<Vec<String>>,
}

impl Display for Instance {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "{}({}):", self.name, self.columns.iter().format(", "))?;
		if self.rows.is_empty() {
			return writeln!(indented(f).with_str("\t"), "(empty)");
		}
		for row in &self.rows {
			writeln!(indented(f).with_str("\t"), "({})", row.iter().format(", "))?;
		}
		Ok(())
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Counterexample {
	pub tables: Vec<Instance>,
	pub left: Instance,
	pub right: Instance,
}

impl Display for Counterexample {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "Counterexample database:")?;
		for table in &self.tables {
			write!(indented(f).with_str("\t"), "{}", table)?;
		}
		writeln!(f, "Left result:")?;
		write!(indented(f).with_str("\t"), "{}", self.left)?;
		writeln!(f, "Right result:")?;
		write!(indented(f).with_str("\t"), "{}", self.right)
	}
}

/// One check session: a bounded symbolic database, its constraints and the
/// queries analyzed against it.
pub struct Environment<'c> {
	env: Z3Env<'c>,
	settings: Settings,
	checkpoints: Vec<String>,
	pub counterexample: Option<Counterexample>,
	/// The last pair was equivalent without consulting the solver.
	pub trivial: bool,
	pub traversing_time: Duration,
	pub solving_time: Duration,
}

impl<'c> Environment<'c> {
	pub fn new(z3_ctx: &'c Context, settings: Settings) -> Self {
		let solver = Solver::new(z3_ctx);
		if let Some(ms) = settings.timeout_ms {
			let mut params = Params::new(z3_ctx);
			params.set_u32("timeout", u32::try_from(ms).unwrap_or(u32::MAX));
			solver.set_params(&params);
		}
		let env = Z3Env::new(Rc::new(Ctx::new(z3_ctx, solver)), settings.dialect);
		Environment {
			env,
			settings,
			checkpoints: vec![],
			counterexample: None,
			trivial: false,
			traversing_time: Duration::ZERO,
			solving_time: Duration::ZERO,
		}
	}

	pub fn z3_env(&self) -> &Z3Env<'c> {
		&self.env
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn create_database(
		&self,
		attributes: &[(String, SqlType)],
		bound_size: usize,
		name: &str,
	) -> Result<Rc<Table<'c>>> {
		log::debug!("Creating {} with {} rows", name, bound_size);
		self.env.create_table(name, attributes, bound_size)
	}

	pub fn add_constraints(&self, constraints: &[Constraint]) -> Result<()> {
		for constraint in constraints {
			let phi = (&self.env).eval(constraint)?;
			log::trace!("Constraint {:?}: {}", constraint, phi);
			self.env.ctx.solver.assert(&phi);
		}
		Ok(())
	}

	/// Pushes a named restore point.
	pub fn save_checkpoints(&mut self, name: &str) {
		self.env.ctx.solver.push();
		self.checkpoints.push(name.to_string());
		log::debug!("Checkpoint `{}` saved", name);
	}

	/// Restores the solver to checkpoint `name`, which stays available.
	pub fn rollback(&mut self, name: &str) -> Result<()> {
		let depth = self
			.checkpoints
			.iter()
			.rposition(|c| c == name)
			.ok_or_else(|| CheckError::Solver(format!("no checkpoint named `{}`", name)))?;
		let levels = self.checkpoints.len() - depth;
		self.env.ctx.solver.pop(u32::try_from(levels).unwrap_or(u32::MAX));
		self.env.ctx.solver.push();
		self.checkpoints.truncate(depth + 1);
		self.env.scope.borrow_mut().reset_derived();
		log::debug!("Rolled back to `{}`", name);
		Ok(())
	}

	pub fn analyze(&mut self, q1: &Relation, q2: &Relation) -> Result<Verdict> {
		self.counterexample = None;
		self.trivial = false;
		self.solving_time = Duration::ZERO;
		self.env.scope.borrow_mut().reset_derived();

		let start = Instant::now();
		log::debug!("Traversal started");
		let t1 = (&self.env).eval((q1, None))?;
		let t2 = (&self.env).eval((q2, None))?;
		self.traversing_time = start.elapsed();
		log::debug!(
			"Traversal finished - {:.4?}, {} relations",
			self.traversing_time,
			self.env.scope.borrow().derived_len()
		);
		if t1.arity() != t2.arity() {
			return Err(CheckError::ArityMismatch { left: t1.arity(), right: t2.arity() });
		}
		if q1 == q2 {
			log::debug!("Early exit: equivalent after traversal");
			self.trivial = true;
			log::info!("{}", Verdict::Equivalent);
			return Ok(Verdict::Equivalent);
		}

		let ctx = self.env.ctx.clone();
		let goal = self.env.differ(&t1, &t2);
		log::trace!("Differ goal: {}", goal);
		ctx.solver.push();
		ctx.solver.assert(&ctx.string_axioms());
		ctx.solver.assert(&goal);
		let start = Instant::now();
		log::debug!("Solving started");
		let result = ctx.solver.check();
		self.solving_time = start.elapsed();
		log::debug!("Solving finished - {:.4?}", self.solving_time);
		let verdict = match result {
			SatResult::Unsat => Verdict::Equivalent,
			SatResult::Sat => {
				if self.settings.show_counterexample {
					self.counterexample = ctx.solver.get_model().map(|model| self.extract(&model, &t1, &t2));
				}
				Verdict::NotEquivalent
			},
			SatResult::Unknown => {
				Verdict::Unknown(ctx.solver.get_reason_unknown().unwrap_or_else(|| "unknown".to_string()))
			},
		};
		ctx.solver.pop(1);
		log::info!("{}", verdict);
		Ok(verdict)
	}

	fn extract(&self, model: &Model<'c>, t1: &Table<'c>, t2: &Table<'c>) -> Counterexample {
		let roots = t1.root.union(&t2.root).collect::<BTreeSet<_>>();
		let scope = self.env.scope.borrow();
		let tables = scope.bases().filter(|t| roots.contains(&t.name)).map(|t| self.instance(model, &t.name, t)).collect();
		Counterexample { tables, left: self.instance(model, "Left", t1), right: self.instance(model, "Right", t2) }
	}

	fn instance(&self, model: &Model<'c>, name: &str, table: &Table<'c>) -> Instance {
		let truth = |b: &Bool<'c>| model.eval(b, true).and_then(|b| b.as_bool());
		let rows = table
			.rows
			.iter()
			.filter(|row| truth(&row.deleted) == Some(false))
			.map(|row| row.cells.iter().zip(&table.attributes).map(|(cell, a)| self.render(model, cell, a.ty)).collect())
			.collect();
		let columns = table.attributes.iter().map(|a| a.name.clone()).collect();
		Instance { name: name.to_string(), columns, rows }
	}

	fn render(&self, model: &Model<'c>, cell: &Tri<'c>, ty: SqlType) -> String {
		if model.eval(&cell.null, true).and_then(|b| b.as_bool()) == Some(true) {
			return "NULL".to_string();
		}
		let num = match &cell.value {
			Value::Bool(b) => {
				return match model.eval(b, true).and_then(|b| b.as_bool()) {
					Some(true) => "TRUE".to_string(),
					Some(false) => "FALSE".to_string(),
					None => "?".to_string(),
				};
			},
			Value::Num(v) => match model.eval(v, true) {
				Some(v) => v,
				None => return "?".to_string(),
			},
		};
		let Some((n, d)) = num.as_real() else {
			return num.to_string();
		};
		let r = Ratio::new(n, d);
		let temporal = match ty {
			SqlType::Date => Some(Domain::Date),
			SqlType::Time => Some(Domain::Time),
			SqlType::Timestamp => Some(Domain::Timestamp),
			_ => None,
		};
		match (ty, temporal) {
			(SqlType::Varchar, _) => self
				.env
				.ctx
				.strings()
				.into_iter()
				.find(|(_, s)| model.eval(s, true).and_then(|s| s.as_real()) == Some((n, d)))
				.map(|(s, _)| format!("'{}'", s))
				.unwrap_or_else(|| format!("str#{}", r)),
			(_, Some(domain)) if r.is_integer() => render_temporal(domain, r.to_integer()).unwrap_or_else(|| r.to_string()),
			_ => r.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::syntax::Expr;

	fn columns(names: &[&str]) -> Vec<(String, SqlType)> {
		names.iter().map(|n| (n.to_string(), SqlType::Integer)).collect()
	}

	#[test]
	fn base_tables_have_independent_rows() {
		let z3_ctx = Context::new(&z3::Config::new());
		let env = Environment::new(&z3_ctx, Settings::default());
		let t = env.create_database(&columns(&["A", "B"]), 3, "T").unwrap();
		assert_eq!(t.rows.len(), 3);
		assert!(t.rows.iter().all(|r| r.cells.len() == 2));
		let names = t.rows.iter().map(|r| r.deleted.to_string()).collect::<BTreeSet<_>>();
		assert_eq!(names.len(), 3);
		assert!(matches!(env.create_database(&columns(&["A"]), 2, "T"), Err(CheckError::DuplicateTable(_))));
	}

	#[test]
	fn rollback_restores_the_checkpoint() {
		let z3_ctx = Context::new(&z3::Config::new());
		let mut env = Environment::new(&z3_ctx, Settings::default());
		env.create_database(&columns(&["A"]), 1, "T").unwrap();
		env.save_checkpoints("setup");
		let t = env.z3_env().scope.borrow().base("T").unwrap();
		env.z3_env().ctx.solver.assert(&t.rows[0].deleted);
		env.z3_env().ctx.solver.assert(&t.rows[0].deleted.not());
		assert_eq!(env.z3_env().ctx.solver.check(), SatResult::Unsat);
		env.rollback("setup").unwrap();
		assert_eq!(env.z3_env().ctx.solver.check(), SatResult::Sat);
		env.rollback("setup").unwrap();
		assert!(env.rollback("missing").is_err());
	}

	#[test]
	fn counterexamples_show_the_offending_rows() {
		let z3_ctx = Context::new(&z3::Config::new());
		let mut env = Environment::new(&z3_ctx, Settings::default());
		env.create_database(&columns(&["A"]), 1, "T").unwrap();
		let q1 = Relation::scan("T").project(vec![Expr::attr("A")]);
		let q2 = Relation::scan("T").filter(Expr::lit(crate::pipeline::shared::Literal::Bool(false)));
		assert_eq!(env.analyze(&q1, &q2).unwrap(), Verdict::NotEquivalent);
		let cex = env.counterexample.clone().unwrap();
		assert_eq!(cex.tables.len(), 1);
		assert_eq!(cex.tables[0].rows.len(), 1);
		assert_eq!(cex.left.rows.len(), 1);
		assert!(cex.right.rows.is_empty());
		assert!(cex.to_string().contains("Left result:"));
	}

	#[test]
	fn undecided_goals_are_reported_unknown() {
		use crate::pipeline::shared::Operator;

		let z3_ctx = Context::new(&z3::Config::new());
		let settings = Settings { timeout_ms: Some(200), ..Settings::default() };
		let mut env = Environment::new(&z3_ctx, settings);
		env.create_database(&columns(&["X", "Y", "Z"]), 1, "T").unwrap();
		// Positive integer solutions of x^3 + y^3 = z^3 do not exist, which
		// nonlinear integer arithmetic cannot establish.
		let cube = |c: &str| Expr::Power { base: Box::new(Expr::attr(c)), exponent: Box::new(Expr::int(3)) };
		let positive = |c: &str| Expr::binary(Operator::Gt, Expr::attr(c), Expr::int(0));
		let fermat = Expr::binary(Operator::Eq, Expr::binary(Operator::Add, cube("X"), cube("Y")), cube("Z"));
		let condition = Expr::op(Operator::And, vec![positive("X"), positive("Y"), positive("Z"), fermat]);
		let q1 = Relation::scan("T").filter(condition);
		let q2 = Relation::scan("T").filter(Expr::lit(crate::pipeline::shared::Literal::Bool(false)));
		let verdict = env.analyze(&q1, &q2).unwrap();
		assert!(matches!(verdict, Verdict::Unknown(_)), "got {}", verdict);
		assert!(env.counterexample.is_none());
		assert!(!env.trivial);
	}
}
