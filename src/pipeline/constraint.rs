use std::rc::Rc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use z3::ast::Bool;

use crate::pipeline::engine::Z3Env;
use crate::pipeline::error::{CheckError, Result};
use crate::pipeline::shared::Eval;
use crate::pipeline::table::Table;

/// A `TABLE__COLUMN` reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
	pub value: String,
}

impl ColumnRef {
	pub fn new(value: &str) -> Self {
		ColumnRef { value: value.to_string() }
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
	Primary(Vec<ColumnRef>),
	/// Child columns followed by the same number of parent columns.
	Foreign(Vec<ColumnRef>),
	Unique(Vec<ColumnRef>),
	NotNull(Vec<ColumnRef>),
}

impl<'c> Z3Env<'c> {
	/// Resolves `T__C`, trying every `__` split since both names may contain one.
	fn column(&self, column: &ColumnRef) -> Result<(Rc<Table<'c>>, usize)> {
		let scope = self.scope.borrow();
		let found = column.value.match_indices("__").find_map(|(at, _)| {
			let table = scope.base(&column.value[..at])?;
			let index = table.resolve(&column.value[at + 2..]).ok().flatten()?;
			Some((table, index))
		});
		found.ok_or_else(|| CheckError::ConstraintColumn(column.value.clone()))
	}

	/// Columns of one table.
	fn key(&self, columns: &[ColumnRef]) -> Result<(Rc<Table<'c>>, Vec<usize>)> {
		let resolved = columns.iter().map(|c| self.column(c)).collect::<Result<Vec<_>>>()?;
		let Some((table, _)) = resolved.first() else {
			return Err(CheckError::Constraint("empty column list".to_string()));
		};
		let table = table.clone();
		if resolved.iter().any(|(t, _)| !Rc::ptr_eq(t, &table)) {
			let names = columns.iter().map(|c| &c.value).join(", ");
			return Err(CheckError::Constraint(format!("key [{}] spans several tables", names)));
		}
		Ok((table, resolved.into_iter().map(|(_, i)| i).collect()))
	}

	pub fn encode_notnull(&self, table: &Table<'c>, index: usize) -> Bool<'c> {
		let ctx = self.ctx.as_ref();
		let rows = table.rows.iter().map(|r| r.deleted.not().implies(&r.cells[index].null.not())).collect_vec();
		ctx.all(&rows)
	}

	/// No two live rows agree on the key. With `skip_nulls`, rows with a NULL
	/// key component never collide.
	pub fn encode_unique(&self, table: &Table<'c>, key: &[usize], skip_nulls: bool) -> Bool<'c> {
		let ctx = self.ctx.as_ref();
		let collisions = table
			.rows
			.iter()
			.tuple_combinations()
			.map(|(r, s)| {
				let agree = key.iter().map(|&k| {
					let (a, b) = (&r.cells[k], &s.cells[k]);
					match skip_nulls {
						true => ctx.all(&[a.null.not(), b.null.not(), a.value.equals(&b.value, ctx)]),
						false => a.same(b, ctx),
					}
				});
				let agree = agree.collect_vec();
				ctx.all(&[r.deleted.not(), s.deleted.not(), ctx.all(&agree)])
			})
			.collect_vec();
		ctx.any(&collisions).not()
	}

	pub fn encode_primary(&self, table: &Table<'c>, key: &[usize]) -> Bool<'c> {
		let ctx = self.ctx.as_ref();
		let mut parts = key.iter().map(|&k| self.encode_notnull(table, k)).collect_vec();
		parts.push(self.encode_unique(table, key, false));
		ctx.all(&parts)
	}

	/// Every live child row with a complete key has a live parent row with the
	/// same key.
	pub fn encode_foreign(&self, child: &Table<'c>, fk: &[usize], parent: &Table<'c>, pk: &[usize]) -> Bool<'c> {
		let ctx = self.ctx.as_ref();
		let rows = child
			.rows
			.iter()
			.map(|c| {
				let complete = fk.iter().map(|&k| c.cells[k].null.not()).collect_vec();
				let antecedent = ctx.all(&[c.deleted.not(), ctx.all(&complete)]);
				let parents = parent
					.rows
					.iter()
					.map(|p| {
						let eqs = fk.iter().zip(pk).map(|(&f, &k)| {
							let (a, b) = (&c.cells[f], &p.cells[k]);
							ctx.all(&[b.null.not(), a.value.equals(&b.value, ctx)])
						});
						let eqs = eqs.collect_vec();
						ctx.all(&[p.deleted.not(), ctx.all(&eqs)])
					})
					.collect_vec();
				antecedent.implies(&ctx.any(&parents))
			})
			.collect_vec();
		ctx.all(&rows)
	}
}

impl<'c> Eval<&Constraint, Result<Bool<'c>>> for &Z3Env<'c> {
	fn eval(self, source: &Constraint) -> Result<Bool<'c>> {
		match source {
			Constraint::Primary(columns) => {
				let (table, key) = self.key(columns)?;
				Ok(self.encode_primary(&table, &key))
			},
			Constraint::Unique(columns) => {
				let (table, key) = self.key(columns)?;
				Ok(self.encode_unique(&table, &key, true))
			},
			Constraint::NotNull(columns) => {
				let parts = columns
					.iter()
					.map(|c| self.column(c).map(|(table, index)| self.encode_notnull(&table, index)))
					.collect::<Result<Vec<_>>>()?;
				Ok(self.ctx.all(&parts))
			},
			Constraint::Foreign(columns) => {
				if columns.is_empty() || columns.len() % 2 != 0 {
					let reason = format!("foreign key needs matching child and parent columns, got {}", columns.len());
					return Err(CheckError::Constraint(reason));
				}
				let (child, parent) = columns.split_at(columns.len() / 2);
				let (child, fk) = self.key(child)?;
				let (parent, pk) = self.key(parent)?;
				Ok(self.encode_foreign(&child, &fk, &parent, &pk))
			},
		}
	}
}
