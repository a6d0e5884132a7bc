use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter, Write};
use std::rc::Rc;

use indenter::indented;
use itertools::Itertools;
use z3::ast::Bool;

use super::error::{CheckError, Result};
use super::shared::{split_qualified, SqlType};
use super::value::{Ctx, Tri};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
	pub qualifier: Option<String>,
	pub name: String,
	pub ty: SqlType,
}

impl Attribute {
	pub fn new(qualifier: Option<&str>, name: &str, ty: SqlType) -> Self {
		Attribute { qualifier: qualifier.map(str::to_string), name: name.to_string(), ty }
	}

	fn matches(&self, qualifier: Option<&str>, name: &str) -> bool {
		self.name.eq_ignore_ascii_case(name)
			&& match qualifier {
				None => true,
				Some(q) => self.qualifier.as_deref().is_some_and(|own| own.eq_ignore_ascii_case(q)),
			}
	}
}

impl Display for Attribute {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match &self.qualifier {
			Some(q) => write!(f, "{}.{}", q, self.name),
			None => write!(f, "{}", self.name),
		}
	}
}

/// A symbolic row. A deleted row is not part of the relation.
#[derive(Clone, Debug)]
pub struct Row<'c> {
	pub deleted: Bool<'c>,
	pub cells: Vec<Tri<'c>>,
}

impl<'c> Row<'c> {
	/// Null-safe equality of every cell.
	pub fn same(&self, other: &Row<'c>, ctx: &Ctx<'c>) -> Bool<'c> {
		let eqs = self.cells.iter().zip(&other.cells).map(|(a, b)| a.same(b, ctx)).collect_vec();
		ctx.all(&eqs)
	}
}

/// Sort keys attached by `ORDER BY`, one key tuple per row.
#[derive(Clone, Debug)]
pub struct Ordering<'c> {
	pub keys: Vec<Vec<Tri<'c>>>,
	pub ascending: Vec<bool>,
}

#[derive(Clone, Debug)]
pub struct Table<'c> {
	pub name: String,
	pub attributes: Vec<Attribute>,
	pub rows: Vec<Row<'c>>,
	pub order: Option<Ordering<'c>>,
	pub fathers: Vec<String>,
	pub root: BTreeSet<String>,
}

impl<'c> Table<'c> {
	pub fn arity(&self) -> usize {
		self.attributes.len()
	}

	/// Position of `name` (optionally `Q.name`) among the attributes.
	pub fn resolve(&self, name: &str) -> Result<Option<usize>> {
		let (qualifier, column) = split_qualified(name);
		let hits = self.attributes.iter().positions(|a| a.matches(qualifier, column)).collect_vec();
		match hits.as_slice() {
			[] => Ok(None),
			[i] => Ok(Some(*i)),
			_ => Err(CheckError::AmbiguousAttribute(name.to_string())),
		}
	}

	pub fn requalified(&self, qualifier: &str) -> Vec<Attribute> {
		self.attributes.iter().map(|a| Attribute::new(Some(qualifier), &a.name, a.ty)).collect()
	}
}

impl<'c> Display for Table<'c> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "{}({}) <- [{}] {{", self.name, self.attributes.iter().format(", "), self.fathers.iter().format(", "))?;
		for row in &self.rows {
			let cells = row.cells.iter().format_with(", ", |c, g| g(&format_args!("({}, {:?})", c.null, c.value)));
			writeln!(indented(f).with_str("\t"), "{} | deleted: {}", cells, row.deleted)?;
		}
		write!(f, "}}")
	}
}

/// Membership of every row of a table in one group.
#[derive(Clone, Debug)]
pub struct Group<'c> {
	pub members: Vec<Bool<'c>>,
}

/// Where an expression is evaluated: a row of a table, optionally the group
/// it represents and the enclosing row of a correlated subquery.
#[derive(Clone, Copy)]
pub struct Frame<'a, 'c> {
	pub table: &'a Table<'c>,
	pub row: usize,
	pub group: Option<&'a Group<'c>>,
	pub outer: Option<&'a Frame<'a, 'c>>,
}

impl<'a, 'c> Frame<'a, 'c> {
	pub fn new(table: &'a Table<'c>, row: usize, outer: Option<&'a Frame<'a, 'c>>) -> Self {
		Frame { table, row, group: None, outer }
	}

	/// The same table at another row, outside any group.
	pub fn at(&self, row: usize) -> Self {
		Frame { table: self.table, row, group: None, outer: self.outer }
	}

	pub fn lookup(&self, name: &str, ctx: &Ctx<'c>) -> Result<Tri<'c>> {
		match self.table.resolve(name)? {
			Some(i) => Ok(self.table.rows.get(self.row).map(|row| row.cells[i].clone()).unwrap_or_else(|| Tri::null(ctx))),
			None => match self.outer {
				Some(outer) => outer.lookup(name, ctx),
				None => Err(CheckError::UnknownAttribute(name.to_string())),
			},
		}
	}

	pub fn attribute(&self, name: &str) -> Result<&'a Attribute> {
		match self.table.resolve(name)? {
			Some(i) => Ok(&self.table.attributes[i]),
			None => match self.outer {
				Some(outer) => outer.attribute(name),
				None => Err(CheckError::UnknownAttribute(name.to_string())),
			},
		}
	}
}

/// Per-check catalog: base tables, the CTEs bound around the plan being
/// compiled, and every relation derived while compiling the current pair of
/// queries.
#[derive(Default)]
pub struct Scope<'c> {
	bases: BTreeMap<String, Rc<Table<'c>>>,
	ctes: Vec<Rc<Table<'c>>>,
	derived: HashMap<String, Rc<Table<'c>>>,
	counter: usize,
}

impl<'c> Scope<'c> {
	pub fn add_base(&mut self, table: Rc<Table<'c>>) -> Result<()> {
		let key = table.name.to_ascii_uppercase();
		if self.bases.contains_key(&key) {
			return Err(CheckError::DuplicateTable(table.name.clone()));
		}
		self.bases.insert(key, table);
		Ok(())
	}

	pub fn base(&self, name: &str) -> Option<Rc<Table<'c>>> {
		self.bases.get(&name.to_ascii_uppercase()).cloned()
	}

	pub fn bases(&self) -> impl Iterator<Item = &Rc<Table<'c>>> {
		self.bases.values()
	}

	/// The innermost CTE named `name`, else the base table.
	pub fn get(&self, name: &str) -> Option<Rc<Table<'c>>> {
		let cte = self.ctes.iter().rev().find(|t| t.name.eq_ignore_ascii_case(name));
		cte.cloned().or_else(|| self.base(name))
	}

	/// Makes `cte` visible to scans until the matching [`Scope::unbind`].
	pub fn bind(&mut self, cte: Rc<Table<'c>>) {
		self.ctes.push(cte);
	}

	pub fn unbind(&mut self) {
		self.ctes.pop();
	}

	pub fn register(&mut self, table: Rc<Table<'c>>) {
		self.derived.insert(table.name.to_ascii_uppercase(), table);
	}

	pub fn fresh_name(&mut self, prefix: &str) -> String {
		self.counter += 1;
		format!("{}#{}", prefix, self.counter)
	}

	pub fn reset_derived(&mut self) {
		self.ctes.clear();
		self.derived.clear();
		self.counter = 0;
	}

	pub fn derived_len(&self) -> usize {
		self.derived.len()
	}
}

#[cfg(test)]
mod tests {
	use z3::{Config, Context, Solver};

	use super::*;

	fn table<'c>(ctx: &Ctx<'c>, name: &str, columns: &[&str]) -> Table<'c> {
		let row = Row {
			deleted: ctx.bool(false),
			cells: columns.iter().enumerate().map(|(i, _)| Tri::num(ctx, ctx.real(i as i64))).collect(),
		};
		Table {
			name: name.to_string(),
			attributes: columns.iter().map(|c| Attribute::new(Some(name), c, SqlType::Integer)).collect(),
			rows: vec![row],
			order: None,
			fathers: vec![],
			root: BTreeSet::from([name.to_string()]),
		}
	}

	#[test]
	fn resolves_qualified_and_ambiguous_names() {
		let z3_ctx = Context::new(&Config::new());
		let ctx = Ctx::new(&z3_ctx, Solver::new(&z3_ctx));
		let mut t = table(&ctx, "T", &["A", "B"]);
		assert_eq!(t.resolve("b").unwrap(), Some(1));
		assert_eq!(t.resolve("T.A").unwrap(), Some(0));
		assert_eq!(t.resolve("S.A").unwrap(), None);
		t.attributes.push(Attribute::new(Some("S"), "A", SqlType::Integer));
		assert!(matches!(t.resolve("A"), Err(CheckError::AmbiguousAttribute(_))));
		assert_eq!(t.resolve("S.A").unwrap(), Some(2));
	}

	#[test]
	fn frames_fall_back_to_the_outer_row() {
		let z3_ctx = Context::new(&Config::new());
		let ctx = Ctx::new(&z3_ctx, Solver::new(&z3_ctx));
		let outer_table = table(&ctx, "T", &["A"]);
		let inner_table = table(&ctx, "S", &["B"]);
		let outer = Frame::new(&outer_table, 0, None);
		let inner = Frame::new(&inner_table, 0, Some(&outer));
		assert!(inner.lookup("T.A", &ctx).is_ok());
		assert_eq!(inner.attribute("A").unwrap().qualifier.as_deref(), Some("T"));
		assert!(matches!(inner.lookup("C", &ctx), Err(CheckError::UnknownAttribute(_))));
	}

	#[test]
	fn derived_relations_are_dropped_on_reset() {
		let z3_ctx = Context::new(&Config::new());
		let ctx = Ctx::new(&z3_ctx, Solver::new(&z3_ctx));
		let mut scope = Scope::default();
		scope.add_base(Rc::new(table(&ctx, "T", &["A"]))).unwrap();
		assert!(matches!(scope.add_base(Rc::new(table(&ctx, "t", &["A"]))), Err(CheckError::DuplicateTable(_))));
		let name = scope.fresh_name("Filter");
		scope.register(Rc::new(table(&ctx, &name, &["A"])));
		assert_eq!(scope.derived_len(), 1);
		assert!(scope.get(&name).is_none());
		scope.reset_derived();
		assert_eq!(scope.derived_len(), 0);
		assert!(scope.get("T").is_some());
	}

	#[test]
	fn ctes_shadow_base_tables_only_while_bound() {
		let z3_ctx = Context::new(&Config::new());
		let ctx = Ctx::new(&z3_ctx, Solver::new(&z3_ctx));
		let mut scope = Scope::default();
		scope.add_base(Rc::new(table(&ctx, "T", &["A"]))).unwrap();
		scope.bind(Rc::new(table(&ctx, "T", &["X", "Y"])));
		scope.bind(Rc::new(table(&ctx, "t", &["Z"])));
		assert_eq!(scope.get("T").unwrap().arity(), 1);
		assert_eq!(scope.get("T").unwrap().attributes[0].name, "Z");
		scope.unbind();
		assert_eq!(scope.get("T").unwrap().arity(), 2);
		scope.unbind();
		assert_eq!(scope.get("T").unwrap().attributes[0].name, "A");
	}
}
