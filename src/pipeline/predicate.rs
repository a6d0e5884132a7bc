use itertools::Itertools;
use z3::ast::{Ast, Real};

use super::aggregate;
use super::engine::Z3Env;
use super::error::{CheckError, Result};
use super::shared::{parse_decimal, Domain, Eval, Literal, Operator, SqlType};
use super::syntax::{AggFunc, Expr, When};
use super::table::Frame;
use super::value::{temporal_literal, Tri, Value};

/// Exponents up to this bound are expanded into products.
const POWER_EXPANSION: i64 = 8;

impl<'c> Z3Env<'c> {
	/// `IF`, `ANY_VALUE` and `<=>` only exist in the MySQL family.
	pub(crate) fn gate(&self, construct: &str) -> Result<()> {
		if self.dialect.is_mysql_family() {
			Ok(())
		} else {
			Err(CheckError::Unsupported { construct: construct.to_string(), dialect: self.dialect.to_string() })
		}
	}

	fn literal(&self, lit: &Literal) -> Result<Tri<'c>> {
		let ctx = self.ctx.as_ref();
		Ok(match lit {
			Literal::Null => Tri::null(ctx),
			Literal::Int(i) => Tri::num(ctx, ctx.real(*i)),
			Literal::Decimal(d) => Tri::num(ctx, ctx.ratio(parse_decimal(d)?)),
			Literal::Str(s) => Tri::num(ctx, ctx.string(s)),
			Literal::Bool(b) => Tri::boolean(ctx, ctx.bool(*b)),
		})
	}

	/// Comparison `a = b` under SQL semantics: NULL if either side is.
	pub(crate) fn equal(&self, a: &Tri<'c>, b: &Tri<'c>) -> Tri<'c> {
		let ctx = self.ctx.as_ref();
		let null = ctx.any(&[a.null.clone(), b.null.clone()]);
		Tri::new(null, Value::Bool(a.value.equals(&b.value, ctx))).masked(ctx)
	}

	/// Kleene conjunction: false as soon as one operand is known false.
	pub(crate) fn conjunction(&self, args: &[Tri<'c>]) -> Tri<'c> {
		let ctx = self.ctx.as_ref();
		let falsified = args.iter().map(|a| ctx.all(&[a.null.not(), a.value.truth(ctx).not()])).collect_vec();
		let falsified = ctx.any(&falsified);
		let nulls = args.iter().map(|a| a.null.clone()).collect_vec();
		let holds = args.iter().map(|a| a.holds(ctx)).collect_vec();
		let null = ctx.all(&[falsified.not(), ctx.any(&nulls)]);
		Tri::new(null, Value::Bool(ctx.all(&holds)))
	}

	/// Kleene disjunction: true as soon as one operand is known true.
	pub(crate) fn disjunction(&self, args: &[Tri<'c>]) -> Tri<'c> {
		let ctx = self.ctx.as_ref();
		let holds = args.iter().map(|a| a.holds(ctx)).collect_vec();
		let verified = ctx.any(&holds);
		let nulls = args.iter().map(|a| a.null.clone()).collect_vec();
		let null = ctx.all(&[verified.not(), ctx.any(&nulls)]);
		Tri::new(null, Value::Bool(verified))
	}

	fn operator(&self, op: Operator, args: &[Tri<'c>]) -> Result<Tri<'c>> {
		use Operator::*;
		let ctx = self.ctx.as_ref();
		let z3_ctx = ctx.z3_ctx();
		let arity = match op {
			Neg | Not | IsNull | IsNotNull => Some(1),
			And | Or => None,
			_ => Some(2),
		};
		if let Some(n) = arity.filter(|n| *n != args.len()) {
			let expected = format!("{} operand(s)", n);
			return Err(CheckError::Operands { tag: op.symbol().to_string(), expected, actual: args.len() });
		}
		let nulls = args.iter().map(|a| a.null.clone()).collect_vec();
		let nums = args.iter().map(|a| a.value.num(ctx)).collect_vec();
		let (null, value) = match op {
			Add => (ctx.any(&nulls), Value::Num(Real::add(z3_ctx, &[&nums[0], &nums[1]]))),
			Sub => (ctx.any(&nulls), Value::Num(Real::sub(z3_ctx, &[&nums[0], &nums[1]]))),
			Mul => (ctx.any(&nulls), Value::Num(Real::mul(z3_ctx, &[&nums[0], &nums[1]]))),
			Div | Mod => {
				let by_zero = nums[1]._eq(&ctx.real(0));
				let value = match op {
					Div => nums[0].div(&nums[1]),
					_ => ctx.apply("MOD", &nums)?,
				};
				(ctx.any(&[ctx.any(&nulls), by_zero]), Value::Num(value))
			},
			Neg => (nulls[0].clone(), Value::Num(nums[0].unary_minus())),
			Eq => return Ok(self.equal(&args[0], &args[1])),
			Ne => (ctx.any(&nulls), Value::Bool(args[0].value.equals(&args[1].value, ctx).not())),
			Lt => (ctx.any(&nulls), Value::Bool(nums[0].lt(&nums[1]))),
			Le => (ctx.any(&nulls), Value::Bool(nums[0].le(&nums[1]))),
			Gt => (ctx.any(&nulls), Value::Bool(nums[0].gt(&nums[1]))),
			Ge => (ctx.any(&nulls), Value::Bool(nums[0].ge(&nums[1]))),
			NullSafeEq => {
				self.gate("<=>")?;
				(ctx.bool(false), Value::Bool(args[0].same(&args[1], ctx)))
			},
			And => return Ok(self.conjunction(args)),
			Or => return Ok(self.disjunction(args)),
			Not => (nulls[0].clone(), Value::Bool(args[0].value.truth(ctx).not())),
			IsNull => (ctx.bool(false), Value::Bool(nulls[0].clone())),
			IsNotNull => (ctx.bool(false), Value::Bool(nulls[0].not())),
		};
		Ok(Tri::new(null, value).masked(ctx))
	}

	fn typed(&self, domain: Domain, arg: &Expr, frame: &Frame<'_, 'c>) -> Result<Tri<'c>> {
		let ctx = self.ctx.as_ref();
		if let (Domain::Date | Domain::Time | Domain::Timestamp, Expr::Lit { value: Literal::Str(text) }) =
			(domain, arg)
		{
			return Ok(Tri::num(ctx, ctx.real(temporal_literal(domain, text)?)));
		}
		let tri = self.eval((arg, frame))?;
		let value = match domain {
			Domain::Boolean => Value::Bool(tri.value.truth(ctx)),
			Domain::Upper => Value::Num(ctx.apply("UPPER", &[tri.value.num(ctx)])?),
			Domain::Integer if !matches!(self.type_of(arg, frame)?, SqlType::Integer | SqlType::Boolean) => {
				Value::Num(ctx.apply("INTEGER", &[tri.value.num(ctx)])?)
			},
			_ => Value::Num(tri.value.num(ctx)),
		};
		Ok(Tri::new(tri.null, value).masked(ctx))
	}

	fn power(&self, base: &Expr, exponent: &Expr, frame: &Frame<'_, 'c>) -> Result<Tri<'c>> {
		let ctx = self.ctx.as_ref();
		let base = self.eval((base, frame))?;
		let b = base.value.num(ctx);
		match exponent {
			Expr::Lit { value: Literal::Int(n) } if (0..=POWER_EXPANSION).contains(n) => {
				let value = match *n {
					0 => ctx.real(1),
					1 => b,
					n => Real::mul(ctx.z3_ctx(), &vec![&b; n as usize]),
				};
				Ok(Tri::new(base.null, Value::Num(value)).masked(ctx))
			},
			_ => {
				let exponent = self.eval((exponent, frame))?;
				let null = ctx.any(&[base.null, exponent.null]);
				Ok(Tri::new(null, Value::Num(b.power(&exponent.value.num(ctx)))).masked(ctx))
			},
		}
	}

	fn common_type<'e>(&self, branches: impl Iterator<Item = &'e Expr>, frame: &Frame<'_, 'c>) -> Result<SqlType> {
		let types = branches
			.filter(|e| !matches!(e, Expr::Lit { value: Literal::Null }))
			.map(|e| self.type_of(e, frame))
			.collect::<Result<Vec<_>>>()?;
		Ok(match types.as_slice() {
			[] => SqlType::Real,
			[first, ..] if types.iter().all(|t| t == first) => *first,
			_ if types.iter().all(|t| matches!(t, SqlType::Integer | SqlType::Real)) => SqlType::Real,
			[first, ..] => *first,
		})
	}

	/// Static type of an expression, used to label derived columns.
	pub fn type_of(&self, expr: &Expr, frame: &Frame<'_, 'c>) -> Result<SqlType> {
		use SqlType::*;
		Ok(match expr {
			Expr::Attr { name } => frame.attribute(name)?.ty,
			Expr::Star { .. } => return Err(CheckError::MisplacedStar),
			Expr::Lit { value } => value.ty(),
			Expr::Op { op, .. } if op.is_boolean() => Boolean,
			Expr::Op { op: Operator::Div, .. } => Real,
			Expr::Op { args, .. } => match self.common_type(args.iter(), frame)? {
				Integer | Boolean => Integer,
				_ => Real,
			},
			Expr::Func { .. } | Expr::Power { .. } => Real,
			Expr::Typed { domain, .. } => domain.ty(),
			Expr::If { then, otherwise, .. } => self.common_type([then.as_ref(), otherwise.as_ref()].into_iter(), frame)?,
			Expr::Case { whens, otherwise, .. } => {
				self.common_type(whens.iter().map(|w| &w.then).chain(otherwise.iter().map(|e| e.as_ref())), frame)?
			},
			Expr::Coalesce { args } => self.common_type(args.iter(), frame)?,
			Expr::NullIf { left, .. } => self.type_of(left, frame)?,
			Expr::Exists { .. }
			| Expr::InList { .. }
			| Expr::InSubquery { .. }
			| Expr::IsTrue { .. }
			| Expr::IsFalse { .. }
			| Expr::IsNotTrue { .. }
			| Expr::IsNotFalse { .. } => Boolean,
			Expr::ScalarSubquery { subquery } => {
				let table = self.eval((subquery.as_ref(), Some(frame)))?;
				table.attributes.first().map(|a| a.ty).unwrap_or(Real)
			},
			Expr::Abs { arg } | Expr::AnyValue { arg } | Expr::FirstValue { arg } | Expr::LastValue { arg } => {
				self.type_of(arg, frame)?
			},
			Expr::Agg(agg) => match (agg.func, &agg.arg) {
				(AggFunc::Count, _) => Integer,
				(AggFunc::Sum, Some(arg)) => match self.type_of(arg, frame)? {
					Integer | Boolean => Integer,
					_ => Real,
				},
				(AggFunc::Min | AggFunc::Max, Some(arg)) => self.type_of(arg, frame)?,
				_ => Real,
			},
		})
	}
}

impl<'c, 'x, 'a> Eval<(&'x Expr, &'x Frame<'a, 'c>), Result<Tri<'c>>> for &Z3Env<'c> {
	fn eval(self, (expr, frame): (&'x Expr, &'x Frame<'a, 'c>)) -> Result<Tri<'c>> {
		let ctx = self.ctx.as_ref();
		let tri = match expr {
			Expr::Attr { name } => frame.lookup(name, ctx)?,
			Expr::Star { .. } => return Err(CheckError::MisplacedStar),
			Expr::Lit { value } => self.literal(value)?,
			Expr::Op { op, args } => {
				let args = args.iter().map(|a| self.eval((a, frame))).collect::<Result<Vec<_>>>()?;
				self.operator(*op, &args)?
			},
			Expr::Func { name, args } => {
				let args = args.iter().map(|a| self.eval((a, frame))).collect::<Result<Vec<_>>>()?;
				let nulls = args.iter().map(|a| a.null.clone()).collect_vec();
				let nums = args.iter().map(|a| a.value.num(ctx)).collect_vec();
				Tri::new(ctx.any(&nulls), Value::Num(ctx.apply(name, &nums)?)).masked(ctx)
			},
			Expr::Typed { domain, arg } => self.typed(*domain, arg, frame)?,
			Expr::If { cond, then, otherwise } => {
				self.gate("IF")?;
				let cond = self.eval((cond.as_ref(), frame))?.holds(ctx);
				let then = self.eval((then.as_ref(), frame))?;
				let otherwise = self.eval((otherwise.as_ref(), frame))?;
				Tri::select(&cond, &then, &otherwise, ctx)
			},
			Expr::Case { operand, whens, otherwise } => {
				let operand = operand.as_ref().map(|o| self.eval((o.as_ref(), frame))).transpose()?;
				let mut result = match otherwise {
					Some(e) => self.eval((e.as_ref(), frame))?,
					None => Tri::null(ctx),
				};
				for When { cond, then } in whens.iter().rev() {
					let cond = self.eval((cond, frame))?;
					let fires = match &operand {
						Some(o) => self.equal(o, &cond).holds(ctx),
						None => cond.holds(ctx),
					};
					let then = self.eval((then, frame))?;
					result = Tri::select(&fires, &then, &result, ctx);
				}
				result
			},
			Expr::Coalesce { args } => {
				let args = args.iter().map(|a| self.eval((a, frame))).collect::<Result<Vec<_>>>()?;
				let (last, rest) = args.split_last().ok_or_else(|| CheckError::Operands {
					tag: "coalesce_predicate".to_string(),
					expected: "at least one operand".to_string(),
					actual: 0,
				})?;
				let value = rest.iter().rev().fold(last.value.clone(), |acc, a| Value::select(&a.null.not(), &a.value, &acc, ctx));
				let nulls = args.iter().map(|a| a.null.clone()).collect_vec();
				Tri::new(ctx.all(&nulls), value).masked(ctx)
			},
			Expr::NullIf { left, right } => {
				let left = self.eval((left.as_ref(), frame))?;
				let right = self.eval((right.as_ref(), frame))?;
				let null = ctx.any(&[left.null.clone(), self.equal(&left, &right).holds(ctx)]);
				Tri::new(null, left.value).masked(ctx)
			},
			Expr::Exists { subquery } => {
				let table = self.eval((subquery.as_ref(), Some(frame)))?;
				let present = table.rows.iter().map(|r| r.deleted.not()).collect_vec();
				Tri::boolean(ctx, ctx.any(&present))
			},
			Expr::InList { arg, list } => {
				let needle = self.eval((arg.as_ref(), frame))?;
				let eqs = list.iter().map(|e| Ok(self.equal(&needle, &self.eval((e, frame))?))).collect::<Result<Vec<_>>>()?;
				self.disjunction(&eqs)
			},
			Expr::InSubquery { arg, subquery } => {
				let needle = self.eval((arg.as_ref(), frame))?;
				let table = self.eval((subquery.as_ref(), Some(frame)))?;
				if table.arity() != 1 {
					let expected = "a single-column subquery".to_string();
					return Err(CheckError::Operands { tag: "in_subquery".to_string(), expected, actual: table.arity() });
				}
				let eqs = table
					.rows
					.iter()
					.map(|row| {
						let eq = self.equal(&needle, &row.cells[0]);
						let present = row.deleted.not();
						let null = ctx.all(&[present.clone(), eq.null.clone()]);
						Tri::new(null, Value::Bool(ctx.all(&[present, eq.holds(ctx)])))
					})
					.collect_vec();
				self.disjunction(&eqs)
			},
			Expr::ScalarSubquery { subquery } => {
				let table = self.eval((subquery.as_ref(), Some(frame)))?;
				if table.arity() != 1 {
					let expected = "a single-column subquery".to_string();
					return Err(CheckError::Operands { tag: "scalar_subquery".to_string(), expected, actual: table.arity() });
				}
				table.rows.iter().rev().fold(Tri::null(ctx), |acc, row| Tri::select(&row.deleted.not(), &row.cells[0], &acc, ctx))
			},
			Expr::IsTrue { arg } => Tri::boolean(ctx, self.eval((arg.as_ref(), frame))?.holds(ctx)),
			Expr::IsNotTrue { arg } => Tri::boolean(ctx, self.eval((arg.as_ref(), frame))?.holds(ctx).not()),
			Expr::IsFalse { arg } => {
				let arg = self.eval((arg.as_ref(), frame))?;
				Tri::boolean(ctx, ctx.all(&[arg.null.not(), arg.value.truth(ctx).not()]))
			},
			Expr::IsNotFalse { arg } => {
				let arg = self.eval((arg.as_ref(), frame))?;
				Tri::boolean(ctx, ctx.any(&[arg.null.clone(), arg.value.truth(ctx)]))
			},
			Expr::Abs { arg } => {
				let arg = self.eval((arg.as_ref(), frame))?;
				let v = arg.value.num(ctx);
				let abs = v.lt(&ctx.real(0)).ite(&v.unary_minus(), &v);
				Tri::new(arg.null, Value::Num(abs)).masked(ctx)
			},
			Expr::Power { base, exponent } => self.power(base, exponent, frame)?,
			Expr::AnyValue { arg } => {
				self.gate("ANY_VALUE")?;
				aggregate::pick(self, arg, frame, false)?
			},
			Expr::FirstValue { arg } => aggregate::pick(self, arg, frame, false)?,
			Expr::LastValue { arg } => aggregate::pick(self, arg, frame, true)?,
			Expr::Agg(agg) => aggregate::evaluate(self, agg, frame)?,
		};
		Ok(tri)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;
	use std::rc::Rc;

	use z3::ast::Bool;
	use z3::{Config, Context, SatResult, Solver};

	use super::*;
	use crate::pipeline::shared::Dialect;
	use crate::pipeline::table::{Row, Table};
	use crate::pipeline::value::Ctx;

	fn dual<'c>(ctx: &Ctx<'c>) -> Table<'c> {
		Table {
			name: "dual".to_string(),
			attributes: vec![],
			rows: vec![Row { deleted: ctx.bool(false), cells: vec![] }],
			order: None,
			fathers: vec![],
			root: BTreeSet::new(),
		}
	}

	fn valid<'c>(env: &Z3Env<'c>, claim: &Bool<'c>) -> bool {
		let solver = &env.ctx.solver;
		solver.push();
		solver.assert(&env.ctx.string_axioms());
		solver.assert(&claim.not());
		let res = solver.check();
		solver.pop(1);
		res == SatResult::Unsat
	}

	fn null() -> Expr {
		Expr::null()
	}

	#[test]
	fn coalesce_picks_first_non_null() {
		let z3_ctx = Context::new(&Config::new());
		let env = Z3Env::new(Rc::new(Ctx::new(&z3_ctx, Solver::new(&z3_ctx))), Dialect::Mysql);
		let table = dual(&env.ctx);
		let frame = Frame::new(&table, 0, None);

		let five = (&env).eval((&Expr::Coalesce { args: vec![null(), null(), Expr::int(5)] }, &frame)).unwrap();
		assert!(valid(&env, &five.null.not()));
		assert!(valid(&env, &five.value.num(&env.ctx)._eq(&env.ctx.real(5))));

		let none = (&env).eval((&Expr::Coalesce { args: vec![null(), null()] }, &frame)).unwrap();
		assert!(valid(&env, &none.null));
	}

	#[test]
	fn kleene_logic() {
		let z3_ctx = Context::new(&Config::new());
		let env = Z3Env::new(Rc::new(Ctx::new(&z3_ctx, Solver::new(&z3_ctx))), Dialect::Mysql);
		let table = dual(&env.ctx);
		let frame = Frame::new(&table, 0, None);
		let eval = |e: Expr| (&env).eval((&e, &frame)).unwrap();
		let f = Expr::lit(Literal::Bool(false));
		let t = Expr::lit(Literal::Bool(true));

		let and = eval(Expr::op(Operator::And, vec![null(), f.clone()]));
		assert!(valid(&env, &and.null.not()));
		assert!(valid(&env, &and.value.truth(&env.ctx).not()));

		let or = eval(Expr::op(Operator::Or, vec![null(), t.clone()]));
		assert!(valid(&env, &or.holds(&env.ctx)));

		let unknown = eval(Expr::op(Operator::And, vec![null(), t]));
		assert!(valid(&env, &unknown.null));

		let not_false = eval(Expr::IsNotFalse { arg: Box::new(null()) });
		assert!(valid(&env, &not_false.holds(&env.ctx)));
		let is_false = eval(Expr::IsFalse { arg: Box::new(f) });
		assert!(valid(&env, &is_false.holds(&env.ctx)));
	}

	#[test]
	fn division_by_zero_is_null() {
		let z3_ctx = Context::new(&Config::new());
		let env = Z3Env::new(Rc::new(Ctx::new(&z3_ctx, Solver::new(&z3_ctx))), Dialect::Mysql);
		let table = dual(&env.ctx);
		let frame = Frame::new(&table, 0, None);
		let div = Expr::binary(Operator::Div, Expr::int(1), Expr::int(0));
		assert!(valid(&env, &(&env).eval((&div, &frame)).unwrap().null));
		let half = Expr::binary(Operator::Div, Expr::int(1), Expr::int(2));
		let half = (&env).eval((&half, &frame)).unwrap();
		assert!(valid(&env, &half.value.num(&env.ctx)._eq(&env.ctx.ratio(num::rational::Ratio::new(1, 2)))));
	}

	#[test]
	fn in_list_and_case() {
		let z3_ctx = Context::new(&Config::new());
		let env = Z3Env::new(Rc::new(Ctx::new(&z3_ctx, Solver::new(&z3_ctx))), Dialect::Mysql);
		let table = dual(&env.ctx);
		let frame = Frame::new(&table, 0, None);

		let missing = Expr::InList { arg: Box::new(Expr::int(3)), list: vec![Expr::int(1), null()] };
		assert!(valid(&env, &(&env).eval((&missing, &frame)).unwrap().null));
		let found = Expr::InList { arg: Box::new(Expr::string("b")), list: vec![Expr::string("a"), Expr::string("b")] };
		assert!(valid(&env, &(&env).eval((&found, &frame)).unwrap().holds(&env.ctx)));

		let case = Expr::Case {
			operand: Some(Box::new(Expr::int(2))),
			whens: vec![
				When { cond: Expr::int(1), then: Expr::string("one") },
				When { cond: Expr::int(2), then: Expr::string("two") },
			],
			otherwise: None,
		};
		let two = (&env).eval((&case, &frame)).unwrap();
		assert!(valid(&env, &two.value.num(&env.ctx)._eq(&env.ctx.string("two"))));
	}

	#[test]
	fn mysql_only_constructs_are_gated() {
		let z3_ctx = Context::new(&Config::new());
		let env = Z3Env::new(Rc::new(Ctx::new(&z3_ctx, Solver::new(&z3_ctx))), Dialect::Postgresql);
		let table = dual(&env.ctx);
		let frame = Frame::new(&table, 0, None);
		let safe = Expr::binary(Operator::NullSafeEq, null(), null());
		assert!(matches!((&env).eval((&safe, &frame)), Err(CheckError::Unsupported { .. })));
		let cond = Expr::If { cond: Box::new(null()), then: Box::new(Expr::int(1)), otherwise: Box::new(Expr::int(2)) };
		assert!(matches!((&env).eval((&cond, &frame)), Err(CheckError::Unsupported { .. })));
	}

	#[test]
	fn temporal_literals_compare_chronologically() {
		let z3_ctx = Context::new(&Config::new());
		let env = Z3Env::new(Rc::new(Ctx::new(&z3_ctx, Solver::new(&z3_ctx))), Dialect::All);
		let table = dual(&env.ctx);
		let frame = Frame::new(&table, 0, None);
		let date = |s: &str| Expr::typed(Domain::Date, Expr::string(s));
		let lt = Expr::binary(Operator::Lt, date("1999-12-31"), date("2000-01-01"));
		assert!(valid(&env, &(&env).eval((&lt, &frame)).unwrap().holds(&env.ctx)));
	}
}
