use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use itertools::Itertools;
use num::rational::Ratio;
use z3::ast::{Ast, Bool, Int, Real};
use z3::{Context, FuncDecl, Solver, Sort};

use super::error::{CheckError, Result};
use super::shared::Domain;

/// Solver context of one check session: the z3 solver, the unobserved NULL
/// placeholder, interned string literals and uninterpreted function symbols.
pub struct Ctx<'c> {
	z3: &'c Context,
	pub solver: Solver<'c>,
	null_value: Real<'c>,
	strings: RefCell<BTreeMap<String, Real<'c>>>,
	functions: RefCell<HashMap<(String, usize), FuncDecl<'c>>>,
}

impl<'c> Ctx<'c> {
	pub fn new(z3: &'c Context, solver: Solver<'c>) -> Self {
		Ctx {
			z3,
			solver,
			null_value: Real::new_const(z3, "Z3_NULL_VALUE"),
			strings: Default::default(),
			functions: Default::default(),
		}
	}

	#[inline]
	pub fn z3_ctx(&self) -> &'c Context {
		self.z3
	}

	#[inline]
	pub fn bool(&self, b: bool) -> Bool<'c> {
		Bool::from_bool(self.z3, b)
	}

	pub fn int(&self, i: i64) -> Int<'c> {
		Int::from_i64(self.z3, i)
	}

	pub fn real(&self, i: i64) -> Real<'c> {
		self.int(i).to_real()
	}

	pub fn ratio(&self, r: Ratio<i64>) -> Real<'c> {
		match (i32::try_from(*r.numer()), i32::try_from(*r.denom())) {
			(Ok(n), Ok(d)) => Real::from_real(self.z3, n, d),
			_ => self.real(*r.numer()).div(&self.real(*r.denom())),
		}
	}

	pub fn null_value(&self) -> Real<'c> {
		self.null_value.clone()
	}

	pub fn all(&self, conds: &[Bool<'c>]) -> Bool<'c> {
		match conds {
			[] => self.bool(true),
			[c] => c.clone(),
			_ => Bool::and(self.z3, &conds.iter().collect_vec()),
		}
	}

	pub fn any(&self, conds: &[Bool<'c>]) -> Bool<'c> {
		match conds {
			[] => self.bool(false),
			[c] => c.clone(),
			_ => Bool::or(self.z3, &conds.iter().collect_vec()),
		}
	}

	pub fn sum(&self, terms: &[Real<'c>]) -> Real<'c> {
		match terms {
			[] => self.real(0),
			[t] => t.clone(),
			_ => Real::add(self.z3, &terms.iter().collect_vec()),
		}
	}

	/// Number of conditions that hold.
	pub fn count(&self, conds: &[Bool<'c>]) -> Int<'c> {
		let (one, zero) = (self.int(1), self.int(0));
		let terms = conds.iter().map(|c| c.ite(&one, &zero)).collect_vec();
		match terms.as_slice() {
			[] => zero,
			[t] => t.clone(),
			_ => Int::add(self.z3, &terms.iter().collect_vec()),
		}
	}

	/// One constant per distinct string literal; see [`Ctx::string_axioms`].
	pub fn string(&self, s: &str) -> Real<'c> {
		let mut strings = self.strings.borrow_mut();
		strings
			.entry(s.to_string())
			.or_insert_with(|| Real::new_const(self.z3, format!("str!{}", s)))
			.clone()
	}

	/// Interned literals are strictly ordered by their byte order.
	pub fn string_axioms(&self) -> Bool<'c> {
		let strings = self.strings.borrow();
		let chain = strings.values().tuple_windows().map(|(a, b)| a.lt(b)).collect_vec();
		self.all(&chain)
	}

	pub fn strings(&self) -> Vec<(String, Real<'c>)> {
		self.strings.borrow().iter().map(|(s, r)| (s.clone(), r.clone())).collect()
	}

	/// Applies the uninterpreted function `name` over reals.
	pub fn apply(&self, name: &str, args: &[Real<'c>]) -> Result<Real<'c>> {
		let mut functions = self.functions.borrow_mut();
		let decl = functions.entry((name.to_ascii_uppercase(), args.len())).or_insert_with(|| {
			let domain = vec![Sort::real(self.z3); args.len()];
			let domain = domain.iter().collect_vec();
			FuncDecl::new(self.z3, format!("f!{}", name.to_ascii_uppercase()), &domain, &Sort::real(self.z3))
		});
		let args = args.iter().map(|a| a as &dyn Ast<'c>).collect_vec();
		decl.apply(&args)
			.as_real()
			.ok_or_else(|| CheckError::Solver(format!("`{}` is not real-valued", name)))
	}
}

/// SQL scalar after evaluation: numbers (and encoded strings/dates) are reals.
#[derive(Clone, Debug)]
pub enum Value<'c> {
	Num(Real<'c>),
	Bool(Bool<'c>),
}

impl<'c> Value<'c> {
	pub fn num(&self, ctx: &Ctx<'c>) -> Real<'c> {
		match self {
			Value::Num(r) => r.clone(),
			Value::Bool(b) => b.ite(&ctx.real(1), &ctx.real(0)),
		}
	}

	pub fn truth(&self, ctx: &Ctx<'c>) -> Bool<'c> {
		match self {
			Value::Num(r) => r._eq(&ctx.real(0)).not(),
			Value::Bool(b) => b.clone(),
		}
	}

	pub fn equals(&self, other: &Value<'c>, ctx: &Ctx<'c>) -> Bool<'c> {
		match (self, other) {
			(Value::Bool(a), Value::Bool(b)) => a._eq(b),
			_ => self.num(ctx)._eq(&other.num(ctx)),
		}
	}

	pub fn select(cond: &Bool<'c>, then: &Value<'c>, otherwise: &Value<'c>, ctx: &Ctx<'c>) -> Value<'c> {
		match (then, otherwise) {
			(Value::Bool(a), Value::Bool(b)) => Value::Bool(cond.ite(a, b)),
			_ => Value::Num(cond.ite(&then.num(ctx), &otherwise.num(ctx))),
		}
	}

	fn placeholder(&self, ctx: &Ctx<'c>) -> Value<'c> {
		match self {
			Value::Num(_) => Value::Num(ctx.null_value()),
			Value::Bool(_) => Value::Bool(ctx.bool(false)),
		}
	}
}

/// The `(NULL, VALUE)` pair every evaluation yields. `value` is only
/// observable when `null` is false.
#[derive(Clone, Debug)]
pub struct Tri<'c> {
	pub null: Bool<'c>,
	pub value: Value<'c>,
}

impl<'c> Tri<'c> {
	pub fn new(null: Bool<'c>, value: Value<'c>) -> Self {
		Tri { null, value }
	}

	pub fn known(ctx: &Ctx<'c>, value: Value<'c>) -> Self {
		Tri { null: ctx.bool(false), value }
	}

	pub fn num(ctx: &Ctx<'c>, value: Real<'c>) -> Self {
		Tri::known(ctx, Value::Num(value))
	}

	pub fn boolean(ctx: &Ctx<'c>, value: Bool<'c>) -> Self {
		Tri::known(ctx, Value::Bool(value))
	}

	pub fn null(ctx: &Ctx<'c>) -> Self {
		Tri { null: ctx.bool(true), value: Value::Num(ctx.null_value()) }
	}

	/// SQL `WHERE` truth: non-NULL and true.
	pub fn holds(&self, ctx: &Ctx<'c>) -> Bool<'c> {
		ctx.all(&[self.null.not(), self.value.truth(ctx)])
	}

	/// Replaces the value by the placeholder whenever the tuple is NULL.
	pub fn masked(self, ctx: &Ctx<'c>) -> Self {
		let placeholder = self.value.placeholder(ctx);
		let value = Value::select(&self.null, &placeholder, &self.value, ctx);
		Tri { null: self.null, value }
	}

	/// Row-matching equality: NULL matches NULL.
	pub fn same(&self, other: &Tri<'c>, ctx: &Ctx<'c>) -> Bool<'c> {
		let both_null = ctx.all(&[self.null.clone(), other.null.clone()]);
		let both_equal = ctx.all(&[self.null.not(), other.null.not(), self.value.equals(&other.value, ctx)]);
		ctx.any(&[both_null, both_equal])
	}

	pub fn select(cond: &Bool<'c>, then: &Tri<'c>, otherwise: &Tri<'c>, ctx: &Ctx<'c>) -> Self {
		Tri {
			null: cond.ite(&then.null, &otherwise.null),
			value: Value::select(cond, &then.value, &otherwise.value, ctx),
		}
	}
}

/// Exact integer encoding of a temporal literal.
pub fn temporal_literal(domain: Domain, text: &str) -> Result<i64> {
	let invalid = |reason: String| CheckError::Literal { literal: text.to_string(), reason };
	let text = text.trim();
	match domain {
		Domain::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
			.map(|d| i64::from(d.num_days_from_ce()))
			.map_err(|e| invalid(e.to_string())),
		Domain::Time => NaiveTime::parse_from_str(text, "%H:%M:%S")
			.map(|t| i64::from(t.num_seconds_from_midnight()))
			.map_err(|e| invalid(e.to_string())),
		Domain::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
			.or_else(|_| NaiveDate::parse_from_str(text, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)))
			.map(|dt| dt.and_utc().timestamp())
			.map_err(|e| invalid(e.to_string())),
		other => Err(invalid(format!("{} is not a temporal domain", other.name()))),
	}
}

/// Inverse of [`temporal_literal`], for counterexample rendering.
pub fn render_temporal(domain: Domain, encoded: i64) -> Option<String> {
	match domain {
		Domain::Date => {
			let days = i32::try_from(encoded).ok()?;
			NaiveDate::from_num_days_from_ce_opt(days).map(|d| d.format("%Y-%m-%d").to_string())
		},
		Domain::Time => {
			let secs = u32::try_from(encoded).ok()?;
			NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).map(|t| t.format("%H:%M:%S").to_string())
		},
		Domain::Timestamp => {
			chrono::DateTime::from_timestamp(encoded, 0).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
		},
		_ => None,
	}
}
