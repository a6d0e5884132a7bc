//! SQL aggregates over symbolic rows.
//!
//! Every input row becomes a [`Candidate`]. A candidate is skipped when it is
//! deleted, NULL, outside the group, rejected by `FILTER`, or (for `DISTINCT`)
//! equal to an earlier eligible candidate. Aggregates fold over what is left.

use imbl::Vector;
use itertools::Itertools;
use num::rational::Ratio;
use z3::ast::{Ast, Bool, Real};

use super::engine::Z3Env;
use super::error::{CheckError, Result};
use super::shared::Eval;
use super::syntax::{AggFunc, Aggregate, Expr};
use super::table::Frame;
use super::value::{Ctx, Tri, Value};

#[derive(Clone, Debug)]
pub struct Candidate<'c> {
	pub deleted: Bool<'c>,
	pub member: Bool<'c>,
	pub filter: Bool<'c>,
	pub tri: Tri<'c>,
}

/// An earlier candidate as seen by the `DISTINCT` rule.
#[derive(Clone, Debug)]
pub struct Earlier<'c> {
	pub eligible: Bool<'c>,
	pub value: Value<'c>,
}

impl<'c> Candidate<'c> {
	/// Not deleted, in the group, passing `FILTER` and non-NULL.
	pub fn eligible(&self, ctx: &Ctx<'c>) -> Bool<'c> {
		ctx.all(&[self.deleted.not(), self.member.clone(), self.filter.clone(), self.tri.null.not()])
	}
}

/// `prefixes(cs)[i]` holds the candidates before `i`.
pub fn prefixes<'c>(ctx: &Ctx<'c>, candidates: &[Candidate<'c>]) -> Vec<Vector<Earlier<'c>>> {
	candidates
		.iter()
		.scan(Vector::new(), |seen: &mut Vector<Earlier<'c>>, c| {
			let before = seen.clone();
			seen.push_back(Earlier { eligible: c.eligible(ctx), value: c.tri.value.clone() });
			Some(before)
		})
		.collect()
}

pub fn skip_condition<'c>(
	ctx: &Ctx<'c>,
	candidate: &Candidate<'c>,
	prefix: &Vector<Earlier<'c>>,
	distinct: bool,
	count_nulls: bool,
) -> Bool<'c> {
	let mut skip = vec![candidate.deleted.clone(), candidate.member.not(), candidate.filter.not()];
	if !count_nulls {
		skip.push(candidate.tri.null.clone());
	}
	if distinct {
		let seen = prefix
			.iter()
			.map(|e| ctx.all(&[e.eligible.clone(), e.value.equals(&candidate.tri.value, ctx)]))
			.collect_vec();
		skip.push(ctx.any(&seen));
	}
	ctx.any(&skip)
}

fn div<'c>(null: &Bool<'c>, num: &Real<'c>, den: &Real<'c>, ctx: &Ctx<'c>) -> Real<'c> {
	null.ite(&ctx.null_value(), &num.div(den))
}

/// Folds `func` over the candidates. `count_star` counts NULL rows too,
/// `constant` marks an operand that cannot vary between rows.
pub fn aggregate<'c>(
	ctx: &Ctx<'c>,
	func: AggFunc,
	candidates: &[Candidate<'c>],
	distinct: bool,
	constant: bool,
	count_star: bool,
) -> Tri<'c> {
	let skips = candidates
		.iter()
		.zip(prefixes(ctx, candidates))
		.map(|(c, prefix)| skip_condition(ctx, c, &prefix, distinct, count_star))
		.collect_vec();
	let kept = skips.iter().map(Bool::not).collect_vec();
	let count = ctx.count(&kept);
	let count_real = count.to_real();
	let empty = count._eq(&ctx.int(0));
	let nums = candidates.iter().map(|c| c.tri.value.num(ctx)).collect_vec();
	let zero = ctx.real(0);
	let kept_sum = |terms: &[Real<'c>]| {
		let terms = skips.iter().zip(terms).map(|(skip, t)| skip.ite(&zero, t)).collect_vec();
		ctx.sum(&terms)
	};

	match func {
		AggFunc::Count => Tri::num(ctx, count_real),
		AggFunc::Sum => Tri::new(empty, Value::Num(kept_sum(&nums))).masked(ctx),
		AggFunc::Avg => {
			let avg = div(&empty, &kept_sum(&nums), &count_real, ctx);
			Tri::new(empty, Value::Num(avg))
		},
		AggFunc::Min | AggFunc::Max => {
			let init = Tri::null(ctx);
			candidates.iter().zip(&kept).fold(init, |best, (c, keep)| {
				let better = match func {
					AggFunc::Min => c.tri.value.num(ctx).lt(&best.value.num(ctx)),
					_ => c.tri.value.num(ctx).gt(&best.value.num(ctx)),
				};
				let take = ctx.all(&[keep.clone(), ctx.any(&[best.null.clone(), better])]);
				Tri::select(&take, &c.tri, &best, ctx)
			})
		},
		AggFunc::VarPop | AggFunc::VarSamp | AggFunc::StddevPop | AggFunc::StddevSamp => {
			let sample = matches!(func, AggFunc::VarSamp | AggFunc::StddevSamp);
			let null = match sample {
				true => count.lt(&ctx.int(2)),
				false => empty,
			};
			if constant {
				return Tri::new(null, Value::Num(zero.clone())).masked(ctx);
			}
			let mean = div(&count._eq(&ctx.int(0)), &kept_sum(&nums), &count_real, ctx);
			let squares = nums
				.iter()
				.map(|v| {
					let d = Real::sub(ctx.z3_ctx(), &[v, &mean]);
					Real::mul(ctx.z3_ctx(), &[&d, &d])
				})
				.collect_vec();
			let den = match sample {
				true => Real::sub(ctx.z3_ctx(), &[&count_real, &ctx.real(1)]),
				false => count_real.clone(),
			};
			let variance = div(&null, &kept_sum(&squares), &den, ctx);
			let value = match func {
				AggFunc::StddevPop | AggFunc::StddevSamp => {
					null.ite(&ctx.null_value(), &variance.power(&ctx.ratio(Ratio::new(1, 2))))
				},
				_ => variance,
			};
			Tri::new(null, Value::Num(value))
		},
	}
}

/// Evaluates an aggregate call over the group of `frame`.
pub fn evaluate<'c>(env: &Z3Env<'c>, agg: &Aggregate, frame: &Frame<'_, 'c>) -> Result<Tri<'c>> {
	let group = frame.group.ok_or_else(|| CheckError::MisplacedAggregate(agg.to_string()))?;
	let ctx = env.ctx.as_ref();
	let candidates = frame
		.table
		.rows
		.iter()
		.enumerate()
		.map(|(j, row)| {
			let at = frame.at(j);
			let tri = match &agg.arg {
				Some(arg) => env.eval((arg.as_ref(), &at))?,
				None => Tri::num(ctx, ctx.real(1)),
			};
			let filter = match &agg.filter {
				Some(cond) => env.eval((cond.as_ref(), &at))?.holds(ctx),
				None => ctx.bool(true),
			};
			Ok(Candidate { deleted: row.deleted.clone(), member: group.members[j].clone(), filter, tri })
		})
		.collect::<Result<Vec<_>>>()?;
	let constant = agg.arg.as_ref().map_or(true, |arg| arg.is_constant());
	let tri = aggregate(ctx, agg.func, &candidates, agg.distinct, constant, agg.arg.is_none());
	log::trace!("{} over {} candidates -> ({}, {:?})", agg, candidates.len(), tri.null, tri.value);
	Ok(tri)
}

/// The operand at the first (or last) live row of the group. Outside a
/// grouping context this is the operand itself.
pub fn pick<'c>(env: &Z3Env<'c>, arg: &Expr, frame: &Frame<'_, 'c>, last: bool) -> Result<Tri<'c>> {
	let Some(group) = frame.group else {
		return env.eval((arg, frame));
	};
	let ctx = env.ctx.as_ref();
	let rows = frame
		.table
		.rows
		.iter()
		.enumerate()
		.map(|(j, row)| {
			let live = ctx.all(&[row.deleted.not(), group.members[j].clone()]);
			Ok((live, env.eval((arg, &frame.at(j)))?))
		})
		.collect::<Result<Vec<_>>>()?;
	let pick = |acc: Tri<'c>, (live, tri): &(Bool<'c>, Tri<'c>)| Tri::select(live, tri, &acc, ctx);
	Ok(match last {
		true => rows.iter().fold(Tri::null(ctx), pick),
		false => rows.iter().rev().fold(Tri::null(ctx), pick),
	})
}
