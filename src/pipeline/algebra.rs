use std::rc::Rc;

use itertools::Itertools;
use z3::ast::Bool;

use super::engine::Z3Env;
use super::error::{CheckError, Result};
use super::shared::Eval;
use super::syntax::{Expr, Item, JoinKind, Relation, SetOp, SortKey};
use super::table::{Attribute, Frame, Group, Ordering, Row, Table};
use super::value::Tri;

/// Where a projected cell comes from.
enum Column<'e> {
	Copy(usize),
	Computed(&'e Expr),
}

impl<'c> Z3Env<'c> {
	fn fresh(&self, prefix: &str) -> String {
		self.scope.borrow_mut().fresh_name(prefix)
	}

	fn derive(
		&self,
		prefix: &str,
		attributes: Vec<Attribute>,
		rows: Vec<Row<'c>>,
		order: Option<Ordering<'c>>,
		sources: &[&Table<'c>],
	) -> Table<'c> {
		Table {
			name: self.fresh(prefix),
			attributes,
			rows,
			order,
			fathers: sources.iter().map(|t| t.name.clone()).collect(),
			root: sources.iter().flat_map(|t| t.root.iter().cloned()).collect(),
		}
	}

	fn scan(&self, name: &str, alias: Option<&str>) -> Result<Table<'c>> {
		let source = self.scope.borrow().get(name).ok_or_else(|| CheckError::UnknownRelation(name.to_string()))?;
		let qualifier = alias.unwrap_or(name);
		let attributes = source.requalified(qualifier);
		Ok(self.derive(&format!("Scan_{}", qualifier), attributes, source.rows.clone(), None, &[source.as_ref()]))
	}

	fn filter(&self, input: &Table<'c>, condition: &Expr, outer: Option<&Frame<'_, 'c>>) -> Result<Table<'c>> {
		let ctx = self.ctx.as_ref();
		let rows = input
			.rows
			.iter()
			.enumerate()
			.map(|(i, row)| {
				let holds = self.eval((condition, &Frame::new(input, i, outer)))?.holds(ctx);
				Ok(Row { deleted: ctx.any(&[row.deleted.clone(), holds.not()]), cells: row.cells.clone() })
			})
			.collect::<Result<Vec<_>>>()?;
		Ok(self.derive("Filter", input.attributes.clone(), rows, input.order.clone(), &[input]))
	}

	fn cells(&self, columns: &[Column<'_>], frame: &Frame<'_, 'c>) -> Result<Vec<Tri<'c>>> {
		let ctx = self.ctx.as_ref();
		columns
			.iter()
			.map(|column| match column {
				Column::Copy(k) => Ok(frame.table.rows.get(frame.row).map_or_else(|| Tri::null(ctx), |r| r.cells[*k].clone())),
				Column::Computed(expr) => self.eval((*expr, frame)),
			})
			.collect()
	}

	fn projection(
		&self,
		input: &Table<'c>,
		items: &[Item],
		group_by: &[Expr],
		having: Option<&Expr>,
		outer: Option<&Frame<'_, 'c>>,
	) -> Result<Table<'c>> {
		let ctx = self.ctx.as_ref();
		let sample = Frame::new(input, 0, outer);
		let mut columns = vec![];
		let mut attributes = vec![];
		for item in items {
			match &item.expr {
				Expr::Star { qualifier } => {
					let hits = input
						.attributes
						.iter()
						.positions(|a| match qualifier {
							None => true,
							Some(q) => a.qualifier.as_deref().is_some_and(|own| own.eq_ignore_ascii_case(q)),
						})
						.collect_vec();
					if let (Some(q), true) = (qualifier, hits.is_empty()) {
						return Err(CheckError::UnknownRelation(q.clone()));
					}
					for i in hits {
						columns.push(Column::Copy(i));
						attributes.push(input.attributes[i].clone());
					}
				},
				expr => {
					let ty = self.type_of(expr, &sample)?;
					let attribute = match (expr, &item.alias) {
						(_, Some(alias)) => Attribute::new(None, alias, ty),
						(Expr::Attr { name }, None) => {
							let source = sample.attribute(name)?;
							Attribute::new(source.qualifier.as_deref(), &source.name, ty)
						},
						(expr, None) => Attribute::new(None, &expr.to_string(), ty),
					};
					columns.push(Column::Computed(expr));
					attributes.push(attribute);
				},
			}
		}

		let grouped = !group_by.is_empty() || having.is_some() || items.iter().any(|i| i.expr.has_aggregate());
		if !grouped {
			let rows = input
				.rows
				.iter()
				.enumerate()
				.map(|(i, row)| Ok(Row { deleted: row.deleted.clone(), cells: self.cells(&columns, &Frame::new(input, i, outer))? }))
				.collect::<Result<Vec<_>>>()?;
			return Ok(self.derive("Projection", attributes, rows, input.order.clone(), &[input]));
		}

		// One candidate group per input row; row `i` represents its group iff no
		// earlier live row has the same keys.
		let groups = if group_by.is_empty() {
			vec![(ctx.bool(true), Group { members: vec![ctx.bool(true); input.rows.len()] })]
		} else {
			let keys = (0..input.rows.len())
				.map(|i| {
					let frame = Frame::new(input, i, outer);
					group_by.iter().map(|e| self.eval((e, &frame))).collect::<Result<Vec<_>>>()
				})
				.collect::<Result<Vec<_>>>()?;
			let same = |i: usize, j: usize| {
				let eqs = keys[i].iter().zip(&keys[j]).map(|(a, b)| a.same(b, ctx)).collect_vec();
				ctx.all(&eqs)
			};
			input
				.rows
				.iter()
				.enumerate()
				.map(|(i, row)| {
					let members = (0..input.rows.len()).map(|j| same(i, j)).collect_vec();
					let taken = (0..i).map(|j| ctx.all(&[input.rows[j].deleted.not(), members[j].clone()])).collect_vec();
					let representative = ctx.all(&[row.deleted.not(), ctx.any(&taken).not()]);
					(representative, Group { members })
				})
				.collect_vec()
		};

		let rows = groups
			.iter()
			.enumerate()
			.map(|(i, (representative, group))| {
				let frame = Frame { table: input, row: i, group: Some(group), outer };
				let cells = self.cells(&columns, &frame)?;
				let kept = match having {
					Some(cond) => ctx.all(&[representative.clone(), self.eval((cond, &frame))?.holds(ctx)]),
					None => representative.clone(),
				};
				Ok(Row { deleted: kept.not(), cells })
			})
			.collect::<Result<Vec<_>>>()?;
		Ok(self.derive("Aggregation", attributes, rows, None, &[input]))
	}

	fn join(
		&self,
		kind: JoinKind,
		left: &Table<'c>,
		right: &Table<'c>,
		on: Option<&Expr>,
		outer: Option<&Frame<'_, 'c>>,
	) -> Result<Table<'c>> {
		let ctx = self.ctx.as_ref();
		let attributes = left.attributes.iter().chain(&right.attributes).cloned().collect_vec();
		let pairs = left
			.rows
			.iter()
			.cartesian_product(&right.rows)
			.map(|(l, r)| Row {
				deleted: ctx.any(&[l.deleted.clone(), r.deleted.clone()]),
				cells: l.cells.iter().chain(&r.cells).cloned().collect(),
			})
			.collect_vec();
		let mut product = self.derive("Join", attributes, pairs, None, &[left, right]);
		let matched = match (kind, on) {
			(JoinKind::Cross, _) | (_, None) => product.rows.iter().map(|r| r.deleted.not()).collect_vec(),
			(_, Some(on)) => (0..product.rows.len())
				.map(|p| {
					let holds = self.eval((on, &Frame::new(&product, p, outer)))?.holds(ctx);
					Ok(ctx.all(&[product.rows[p].deleted.not(), holds]))
				})
				.collect::<Result<Vec<_>>>()?,
		};
		for (row, matched) in product.rows.iter_mut().zip(&matched) {
			row.deleted = matched.not();
		}

		let width = right.rows.len();
		let nulls = |n: usize| (0..n).map(|_| Tri::null(ctx)).collect_vec();
		if matches!(kind, JoinKind::Left | JoinKind::Full) {
			for (i, row) in left.rows.iter().enumerate() {
				let any_match = ctx.any(&matched[i * width..(i + 1) * width]);
				let cells = row.cells.iter().cloned().chain(nulls(right.arity())).collect();
				product.rows.push(Row { deleted: ctx.any(&[row.deleted.clone(), any_match]), cells });
			}
		}
		if matches!(kind, JoinKind::Right | JoinKind::Full) {
			for (j, row) in right.rows.iter().enumerate() {
				let column = (0..left.rows.len()).map(|i| matched[i * width + j].clone()).collect_vec();
				let cells = nulls(left.arity()).into_iter().chain(row.cells.iter().cloned()).collect();
				product.rows.push(Row { deleted: ctx.any(&[row.deleted.clone(), ctx.any(&column)]), cells });
			}
		}
		Ok(product)
	}

	/// Marks every row that repeats an earlier live row as deleted.
	fn distinct(&self, input: &Table<'c>) -> Table<'c> {
		let ctx = self.ctx.as_ref();
		let rows = input
			.rows
			.iter()
			.enumerate()
			.map(|(i, row)| {
				let repeats = input.rows[..i].iter().map(|e| ctx.all(&[e.deleted.not(), e.same(row, ctx)])).collect_vec();
				Row { deleted: ctx.any(&[row.deleted.clone(), ctx.any(&repeats)]), cells: row.cells.clone() }
			})
			.collect_vec();
		self.derive("Distinct", input.attributes.clone(), rows, input.order.clone(), &[input])
	}

	fn union_all(&self, left: &Table<'c>, right: &Table<'c>) -> Table<'c> {
		let rows = left.rows.iter().chain(&right.rows).cloned().collect_vec();
		self.derive("UnionAll", left.attributes.clone(), rows, None, &[left, right])
	}

	/// `EXCEPT ALL` (or `INTERSECT ALL`): the k-th copy of a left row survives
	/// iff the right side has fewer (or more) than k copies of it.
	fn bag(&self, left: &Table<'c>, right: &Table<'c>, except: bool) -> Table<'c> {
		let ctx = self.ctx.as_ref();
		let rows = left
			.rows
			.iter()
			.enumerate()
			.map(|(i, row)| {
				let earlier = left.rows[..i].iter().map(|e| ctx.all(&[e.deleted.not(), e.same(row, ctx)])).collect_vec();
				let opposite = right.rows.iter().map(|r| ctx.all(&[r.deleted.not(), r.same(row, ctx)])).collect_vec();
				let (earlier, opposite) = (ctx.count(&earlier), ctx.count(&opposite));
				let kept = match except {
					true => earlier.ge(&opposite),
					false => earlier.lt(&opposite),
				};
				Row { deleted: ctx.any(&[row.deleted.clone(), kept.not()]), cells: row.cells.clone() }
			})
			.collect_vec();
		let prefix = if except { "ExceptAll" } else { "IntersectAll" };
		self.derive(prefix, left.attributes.clone(), rows, None, &[left, right])
	}

	fn set_op(&self, op: SetOp, left: &Table<'c>, right: &Table<'c>) -> Result<Table<'c>> {
		if left.arity() != right.arity() {
			return Err(CheckError::SetArity { left: left.arity(), right: right.arity() });
		}
		Ok(match op {
			SetOp::UnionAll => self.union_all(left, right),
			SetOp::Union => self.distinct(&self.union_all(left, right)),
			SetOp::ExceptAll => self.bag(left, right, true),
			SetOp::IntersectAll => self.bag(left, right, false),
			SetOp::Except => self.distinct(&self.bag(&self.distinct(left), right, true)),
			SetOp::Intersect => self.distinct(&self.bag(left, right, false)),
		})
	}

	fn order_by(&self, input: &Table<'c>, keys: &[SortKey], outer: Option<&Frame<'_, 'c>>) -> Result<Table<'c>> {
		let values = (0..input.rows.len())
			.map(|i| {
				let frame = Frame::new(input, i, outer);
				keys.iter().map(|k| self.eval((&k.expr, &frame))).collect::<Result<Vec<_>>>()
			})
			.collect::<Result<Vec<_>>>()?;
		let order = Ordering { keys: values, ascending: keys.iter().map(|k| k.ascending).collect() };
		Ok(self.derive("OrderBy", input.attributes.clone(), input.rows.clone(), Some(order), &[input]))
	}

	/// Whether row `j` sorts strictly before row `i`. Equal keys fall back to
	/// the row index.
	pub(crate) fn precedes(&self, order: &Ordering<'c>, j: usize, i: usize) -> Bool<'c> {
		let ctx = self.ctx.as_ref();
		let mut tied = vec![];
		let mut before = vec![];
		for (k, ascending) in order.ascending.iter().enumerate() {
			let (a, b) = (&order.keys[j][k], &order.keys[i][k]);
			let nulls_first = self.dialect.nulls_first_ascending() == *ascending;
			let (av, bv) = (a.value.num(ctx), b.value.num(ctx));
			let less = if *ascending { av.lt(&bv) } else { av.gt(&bv) };
			let null_first = match nulls_first {
				true => ctx.all(&[a.null.clone(), b.null.not()]),
				false => ctx.all(&[a.null.not(), b.null.clone()]),
			};
			let strictly = ctx.any(&[null_first, ctx.all(&[a.null.not(), b.null.not(), less])]);
			before.push(ctx.all(&tied.iter().cloned().chain([strictly]).collect_vec()));
			tied.push(a.same(b, ctx));
		}
		if j < i {
			before.push(ctx.all(&tied));
		}
		ctx.any(&before)
	}

	fn limit(&self, input: &Table<'c>, count: u64, offset: u64) -> Table<'c> {
		let ctx = self.ctx.as_ref();
		let bound = |n: u64| ctx.int(i64::try_from(n).unwrap_or(i64::MAX));
		let (low, high) = (bound(offset), bound(offset.saturating_add(count)));
		let rows = input
			.rows
			.iter()
			.enumerate()
			.map(|(i, row)| {
				let ahead = (0..input.rows.len())
					.filter(|j| *j != i)
					.map(|j| {
						let precedes = match &input.order {
							Some(order) => self.precedes(order, j, i),
							None => ctx.bool(j < i),
						};
						ctx.all(&[input.rows[j].deleted.not(), precedes])
					})
					.collect_vec();
				let rank = ctx.count(&ahead);
				let kept = ctx.all(&[row.deleted.not(), rank.ge(&low), rank.lt(&high)]);
				Row { deleted: kept.not(), cells: row.cells.clone() }
			})
			.collect_vec();
		self.derive("Limit", input.attributes.clone(), rows, input.order.clone(), &[input])
	}

	/// Compiles `body` with `name` bound to `definition`. The binding is gone
	/// once the body is compiled, whether or not that succeeded.
	fn with(
		&self,
		name: &str,
		definition: &Table<'c>,
		body: &Relation,
		outer: Option<&Frame<'_, 'c>>,
	) -> Result<Rc<Table<'c>>> {
		let cte = Rc::new(Table {
			name: name.to_string(),
			attributes: definition.requalified(name),
			rows: definition.rows.clone(),
			order: None,
			fathers: vec![definition.name.clone()],
			root: definition.root.clone(),
		});
		self.scope.borrow_mut().bind(cte);
		let result = self.eval((body, outer));
		self.scope.borrow_mut().unbind();
		result
	}
}

impl<'c, 'x, 'a> Eval<(&'x Relation, Option<&'x Frame<'a, 'c>>), Result<Rc<Table<'c>>>> for &Z3Env<'c> {
	fn eval(self, (rel, outer): (&'x Relation, Option<&'x Frame<'a, 'c>>)) -> Result<Rc<Table<'c>>> {
		let table = match rel {
			Relation::Scan { table, alias } => self.scan(table, alias.as_deref())?,
			Relation::Alias { input, name } => {
				let input = self.eval((input.as_ref(), outer))?;
				let attributes = input.requalified(name);
				self.derive(&format!("Alias_{}", name), attributes, input.rows.clone(), input.order.clone(), &[input.as_ref()])
			},
			Relation::Filter { input, condition } => self.filter(&self.eval((input.as_ref(), outer))?, condition, outer)?,
			Relation::Projection { input, items, group_by, having } => {
				let input = self.eval((input.as_ref(), outer))?;
				self.projection(&input, items, group_by, having.as_ref(), outer)?
			},
			Relation::Join { kind, left, right, on } => {
				let left = self.eval((left.as_ref(), outer))?;
				let right = self.eval((right.as_ref(), outer))?;
				self.join(*kind, &left, &right, on.as_ref(), outer)?
			},
			Relation::SetOp { op, left, right } => {
				let left = self.eval((left.as_ref(), outer))?;
				let right = self.eval((right.as_ref(), outer))?;
				self.set_op(*op, &left, &right)?
			},
			Relation::Distinct { input } => self.distinct(&self.eval((input.as_ref(), outer))?),
			Relation::OrderBy { input, keys } => self.order_by(&self.eval((input.as_ref(), outer))?, keys, outer)?,
			Relation::Limit { input, count, offset } => self.limit(&self.eval((input.as_ref(), outer))?, *count, *offset),
			Relation::With { name, definition, body } => {
				let definition = self.eval((definition.as_ref(), outer))?;
				return self.with(name, &definition, body, outer);
			},
		};
		log::trace!("{}", table);
		let table = Rc::new(table);
		self.scope.borrow_mut().register(table.clone());
		Ok(table)
	}
}

#[cfg(test)]
mod tests {
	use z3::ast::Ast;
	use z3::{Config, Context, SatResult, Solver};

	use super::*;
	use crate::pipeline::shared::{Dialect, Literal, Operator, SqlType};
	use crate::pipeline::value::Ctx;

	fn env<'c>(z3_ctx: &'c Context, dialect: Dialect) -> Z3Env<'c> {
		let env = Z3Env::new(Rc::new(Ctx::new(z3_ctx, Solver::new(z3_ctx))), dialect);
		let columns = [("A".to_string(), SqlType::Integer), ("B".to_string(), SqlType::Varchar)];
		env.create_table("T", &columns, 2).unwrap();
		env
	}

	fn satisfiable<'c>(env: &Z3Env<'c>, claim: &Bool<'c>) -> bool {
		let solver = &env.ctx.solver;
		solver.push();
		solver.assert(claim);
		let res = solver.check();
		solver.pop(1);
		res == SatResult::Sat
	}

	#[test]
	fn outer_joins_pad_unmatched_rows() {
		let z3_ctx = Context::new(&Config::new());
		let env = env(&z3_ctx, Dialect::Mysql);
		let never = Expr::lit(Literal::Bool(false));
		let plan = Relation::scan_as("T", "L").join(JoinKind::Full, Relation::scan_as("T", "R"), Some(never));
		let table = (&env).eval((&plan, None)).unwrap();
		assert_eq!(table.arity(), 4);
		assert_eq!(table.rows.len(), 4 + 2 + 2);
		// A pair row can never survive a false condition.
		assert!(!satisfiable(&env, &table.rows[0].deleted.not()));
		assert!(satisfiable(&env, &table.rows[4].deleted.not()));
		assert!(matches!(table.resolve("A"), Err(CheckError::AmbiguousAttribute(_))));
		assert_eq!(table.resolve("R.B").unwrap(), Some(3));
	}

	#[test]
	fn nulls_sort_by_dialect() {
		for (dialect, null_first) in [(Dialect::Mysql, true), (Dialect::Postgresql, false)] {
			let z3_ctx = Context::new(&Config::new());
			let env = env(&z3_ctx, dialect);
			let ctx = env.ctx.as_ref();
			let order = Ordering {
				keys: vec![vec![Tri::null(ctx)], vec![Tri::num(ctx, ctx.real(1))]],
				ascending: vec![true],
			};
			let claim = env.precedes(&order, 0, 1);
			assert_eq!(!satisfiable(&env, &claim.not()), null_first);
			let desc = Ordering { ascending: vec![false], ..order };
			assert_eq!(!satisfiable(&env, &env.precedes(&desc, 0, 1).not()), !null_first);
		}
	}

	#[test]
	fn global_aggregates_yield_one_row() {
		let z3_ctx = Context::new(&Config::new());
		let env = env(&z3_ctx, Dialect::Mysql);
		let plan = Relation::scan("T")
			.filter(Expr::lit(Literal::Bool(false)))
			.project(vec![Expr::count_star(), Expr::agg(crate::pipeline::syntax::AggFunc::Sum, Expr::attr("A"))]);
		let table = (&env).eval((&plan, None)).unwrap();
		assert_eq!(table.rows.len(), 1);
		let ctx = env.ctx.as_ref();
		assert!(!satisfiable(&env, &table.rows[0].deleted));
		assert!(!satisfiable(&env, &table.rows[0].cells[0].value.num(ctx)._eq(&ctx.real(0)).not()));
		assert!(!satisfiable(&env, &table.rows[0].cells[1].null.not()));
	}

	#[test]
	fn star_expands_and_set_arity_is_checked() {
		let z3_ctx = Context::new(&Config::new());
		let env = env(&z3_ctx, Dialect::Mysql);
		let star = Relation::scan("T").project(vec![Expr::Star { qualifier: Some("T".to_string()) }]);
		assert_eq!((&env).eval((&star, None)).unwrap().arity(), 2);
		let narrow = Relation::scan("T").project(vec![Expr::attr("A")]);
		let union = Relation::scan("T").set_op(SetOp::Union, narrow);
		assert!(matches!((&env).eval((&union, None)), Err(CheckError::SetArity { left: 2, right: 1 })));
		let unknown = Relation::scan("T").filter(Expr::binary(Operator::Gt, Expr::attr("C"), Expr::int(0)));
		assert!(matches!((&env).eval((&unknown, None)), Err(CheckError::UnknownAttribute(_))));
	}

	#[test]
	fn ctes_are_visible_to_the_body() {
		let z3_ctx = Context::new(&Config::new());
		let env = env(&z3_ctx, Dialect::Mysql);
		let plan = Relation::With {
			name: "V".to_string(),
			definition: Box::new(Relation::scan("T").project(vec![Expr::attr("A")])),
			body: Box::new(Relation::scan("V").project(vec![Expr::attr("V.A")])),
		};
		let table = (&env).eval((&plan, None)).unwrap();
		assert_eq!(table.arity(), 1);
		assert!(table.root.contains("T"));
		assert!(env.scope.borrow().get("V").is_none());
	}

	#[test]
	fn ctes_do_not_leak_into_sibling_scans() {
		let z3_ctx = Context::new(&Config::new());
		let env = env(&z3_ctx, Dialect::Mysql);
		let narrow = Relation::With {
			name: "T".to_string(),
			definition: Box::new(Relation::scan("T").project(vec![Expr::attr("A")])),
			body: Box::new(Relation::scan("T")),
		};
		let plan = narrow.join(JoinKind::Cross, Relation::scan("T"), None);
		let table = (&env).eval((&plan, None)).unwrap();
		assert_eq!(table.arity(), 1 + 2);
		assert_eq!(env.scope.borrow().get("T").unwrap().arity(), 2);

		let failing = Relation::With {
			name: "T".to_string(),
			definition: Box::new(Relation::scan("T").project(vec![Expr::attr("A")])),
			body: Box::new(Relation::scan("T").project(vec![Expr::attr("B")])),
		};
		assert!(matches!((&env).eval((&failing, None)), Err(CheckError::UnknownAttribute(_))));
		assert_eq!(env.scope.borrow().get("T").unwrap().arity(), 2);
	}
}
