use std::fmt::{Display, Formatter, Write};

use indenter::indented;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::shared::{Domain, Literal, Operator};

/// Scalar, predicate and aggregate formula nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
	Attr { name: String },
	Star {
		#[serde(default)]
		qualifier: Option<String>,
	},
	Lit { value: Literal },
	Op { op: Operator, args: Vec<Expr> },
	/// Deterministic function known only by name.
	Func { name: String, args: Vec<Expr> },
	Typed { domain: Domain, arg: Box<Expr> },
	If { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
	Case {
		#[serde(default)]
		operand: Option<Box<Expr>>,
		whens: Vec<When>,
		#[serde(default)]
		otherwise: Option<Box<Expr>>,
	},
	Coalesce { args: Vec<Expr> },
	NullIf { left: Box<Expr>, right: Box<Expr> },
	Exists { subquery: Box<Relation> },
	InList { arg: Box<Expr>, list: Vec<Expr> },
	InSubquery { arg: Box<Expr>, subquery: Box<Relation> },
	ScalarSubquery { subquery: Box<Relation> },
	IsTrue { arg: Box<Expr> },
	IsFalse { arg: Box<Expr> },
	IsNotTrue { arg: Box<Expr> },
	IsNotFalse { arg: Box<Expr> },
	Abs { arg: Box<Expr> },
	Power { base: Box<Expr>, exponent: Box<Expr> },
	AnyValue { arg: Box<Expr> },
	FirstValue { arg: Box<Expr> },
	LastValue { arg: Box<Expr> },
	Agg(Aggregate),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct When {
	pub cond: Expr,
	pub then: Expr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
	Count,
	Sum,
	Avg,
	Min,
	Max,
	StddevPop,
	StddevSamp,
	VarPop,
	VarSamp,
}

impl AggFunc {
	pub fn name(&self) -> &'static str {
		match self {
			AggFunc::Count => "COUNT",
			AggFunc::Sum => "SUM",
			AggFunc::Avg => "AVG",
			AggFunc::Min => "MIN",
			AggFunc::Max => "MAX",
			AggFunc::StddevPop => "STDDEV_POP",
			AggFunc::StddevSamp => "STDDEV_SAMP",
			AggFunc::VarPop => "VAR_POP",
			AggFunc::VarSamp => "VAR_SAMP",
		}
	}
}

/// `func([DISTINCT] arg) [FILTER (WHERE filter)]`; `COUNT(*)` has no argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
	pub func: AggFunc,
	#[serde(default)]
	pub arg: Option<Box<Expr>>,
	#[serde(default)]
	pub distinct: bool,
	#[serde(default)]
	pub filter: Option<Box<Expr>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
	pub expr: Expr,
	#[serde(default)]
	pub alias: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
	pub expr: Expr,
	#[serde(default = "ascending")]
	pub ascending: bool,
}

fn ascending() -> bool {
	true
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
	Inner,
	Cross,
	Left,
	Right,
	Full,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOp {
	Union,
	UnionAll,
	Except,
	ExceptAll,
	Intersect,
	IntersectAll,
}

impl SetOp {
	pub fn name(&self) -> &'static str {
		match self {
			SetOp::Union => "Union",
			SetOp::UnionAll => "UnionAll",
			SetOp::Except => "Except",
			SetOp::ExceptAll => "ExceptAll",
			SetOp::Intersect => "Intersect",
			SetOp::IntersectAll => "IntersectAll",
		}
	}
}

/// Relational operator nodes; a compiled query is one of these trees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
	Scan {
		table: String,
		#[serde(default)]
		alias: Option<String>,
	},
	Alias { input: Box<Relation>, name: String },
	Filter { input: Box<Relation>, condition: Expr },
	Projection {
		input: Box<Relation>,
		items: Vec<Item>,
		#[serde(default)]
		group_by: Vec<Expr>,
		#[serde(default)]
		having: Option<Expr>,
	},
	Join {
		kind: JoinKind,
		left: Box<Relation>,
		right: Box<Relation>,
		#[serde(default)]
		on: Option<Expr>,
	},
	SetOp { op: SetOp, left: Box<Relation>, right: Box<Relation> },
	Distinct { input: Box<Relation> },
	OrderBy { input: Box<Relation>, keys: Vec<SortKey> },
	Limit {
		input: Box<Relation>,
		count: u64,
		#[serde(default)]
		offset: u64,
	},
	With { name: String, definition: Box<Relation>, body: Box<Relation> },
}

impl Expr {
	pub fn attr(name: &str) -> Self {
		Expr::Attr { name: name.to_string() }
	}

	pub fn lit(value: Literal) -> Self {
		Expr::Lit { value }
	}

	pub fn int(value: i64) -> Self {
		Expr::lit(Literal::Int(value))
	}

	pub fn string(value: &str) -> Self {
		Expr::lit(Literal::Str(value.to_string()))
	}

	pub fn null() -> Self {
		Expr::lit(Literal::Null)
	}

	pub fn op(op: Operator, args: Vec<Expr>) -> Self {
		Expr::Op { op, args }
	}

	pub fn binary(op: Operator, left: Expr, right: Expr) -> Self {
		Expr::Op { op, args: vec![left, right] }
	}

	pub fn typed(domain: Domain, arg: Expr) -> Self {
		Expr::Typed { domain, arg: Box::new(arg) }
	}

	pub fn agg(func: AggFunc, arg: Expr) -> Self {
		Expr::Agg(Aggregate { func, arg: Some(Box::new(arg)), distinct: false, filter: None })
	}

	pub fn count_star() -> Self {
		Expr::Agg(Aggregate { func: AggFunc::Count, arg: None, distinct: false, filter: None })
	}

	pub fn agg_distinct(func: AggFunc, arg: Expr) -> Self {
		Expr::Agg(Aggregate { func, arg: Some(Box::new(arg)), distinct: true, filter: None })
	}

	pub fn exists(subquery: Relation) -> Self {
		Expr::Exists { subquery: Box::new(subquery) }
	}

	/// Whether an aggregate occurs outside of nested subqueries.
	pub fn has_aggregate(&self) -> bool {
		match self {
			Expr::Agg(_) => true,
			Expr::Exists { .. } | Expr::ScalarSubquery { .. } => false,
			Expr::InSubquery { arg, .. } => arg.has_aggregate(),
			_ => self.children().any(Expr::has_aggregate),
		}
	}

	/// No attribute, subquery or aggregate below this node.
	pub fn is_constant(&self) -> bool {
		match self {
			Expr::Lit { .. } => true,
			Expr::Attr { .. } | Expr::Star { .. } | Expr::Agg(_) => false,
			Expr::Exists { .. } | Expr::InSubquery { .. } | Expr::ScalarSubquery { .. } => false,
			_ => self.children().all(Expr::is_constant),
		}
	}

	/// Direct scalar operands; subqueries are not descended into.
	pub fn children(&self) -> Box<dyn Iterator<Item = &Expr> + '_> {
		use std::iter::once;
		match self {
			Expr::Attr { .. } | Expr::Star { .. } | Expr::Lit { .. } => Box::new(std::iter::empty()),
			Expr::Exists { .. } | Expr::ScalarSubquery { .. } => Box::new(std::iter::empty()),
			Expr::Op { args, .. } | Expr::Func { args, .. } | Expr::Coalesce { args } => Box::new(args.iter()),
			Expr::Typed { arg, .. }
			| Expr::IsTrue { arg }
			| Expr::IsFalse { arg }
			| Expr::IsNotTrue { arg }
			| Expr::IsNotFalse { arg }
			| Expr::Abs { arg }
			| Expr::AnyValue { arg }
			| Expr::FirstValue { arg }
			| Expr::LastValue { arg }
			| Expr::InSubquery { arg, .. } => Box::new(once(arg.as_ref())),
			Expr::If { cond, then, otherwise } => {
				Box::new(once(cond.as_ref()).chain(once(then.as_ref())).chain(once(otherwise.as_ref())))
			},
			Expr::Case { operand, whens, otherwise } => Box::new(
				operand
					.iter()
					.map(Box::as_ref)
					.chain(whens.iter().flat_map(|w| once(&w.cond).chain(once(&w.then))))
					.chain(otherwise.iter().map(Box::as_ref)),
			),
			Expr::NullIf { left, right } => Box::new(once(left.as_ref()).chain(once(right.as_ref()))),
			Expr::Power { base, exponent } => Box::new(once(base.as_ref()).chain(once(exponent.as_ref()))),
			Expr::InList { arg, list } => Box::new(once(arg.as_ref()).chain(list.iter())),
			Expr::Agg(agg) => Box::new(agg.arg.iter().map(Box::as_ref).chain(agg.filter.iter().map(Box::as_ref))),
		}
	}
}

impl Relation {
	pub fn scan(table: &str) -> Self {
		Relation::Scan { table: table.to_string(), alias: None }
	}

	pub fn scan_as(table: &str, alias: &str) -> Self {
		Relation::Scan { table: table.to_string(), alias: Some(alias.to_string()) }
	}

	pub fn alias(self, name: &str) -> Self {
		Relation::Alias { input: Box::new(self), name: name.to_string() }
	}

	pub fn filter(self, condition: Expr) -> Self {
		Relation::Filter { input: Box::new(self), condition }
	}

	pub fn project(self, exprs: Vec<Expr>) -> Self {
		let items = exprs.into_iter().map(|expr| Item { expr, alias: None }).collect();
		Relation::Projection { input: Box::new(self), items, group_by: vec![], having: None }
	}

	pub fn group(self, exprs: Vec<Expr>, group_by: Vec<Expr>, having: Option<Expr>) -> Self {
		let items = exprs.into_iter().map(|expr| Item { expr, alias: None }).collect();
		Relation::Projection { input: Box::new(self), items, group_by, having }
	}

	pub fn join(self, kind: JoinKind, right: Relation, on: Option<Expr>) -> Self {
		Relation::Join { kind, left: Box::new(self), right: Box::new(right), on }
	}

	pub fn set_op(self, op: SetOp, right: Relation) -> Self {
		Relation::SetOp { op, left: Box::new(self), right: Box::new(right) }
	}

	pub fn distinct(self) -> Self {
		Relation::Distinct { input: Box::new(self) }
	}

	pub fn order_by(self, keys: Vec<(Expr, bool)>) -> Self {
		let keys = keys.into_iter().map(|(expr, ascending)| SortKey { expr, ascending }).collect();
		Relation::OrderBy { input: Box::new(self), keys }
	}

	pub fn limit(self, count: u64, offset: u64) -> Self {
		Relation::Limit { input: Box::new(self), count, offset }
	}
}

impl Display for Expr {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Expr::Attr { name } => write!(f, "{}", name),
			Expr::Star { qualifier: Some(q) } => write!(f, "{}.*", q),
			Expr::Star { qualifier: None } => write!(f, "*"),
			Expr::Lit { value } => write!(f, "{}", value),
			Expr::Op { op: Operator::Neg, args } => write!(f, "-({})", args.iter().format(", ")),
			Expr::Op { op: Operator::Not, args } => write!(f, "NOT ({})", args.iter().format(", ")),
			Expr::Op { op: op @ (Operator::IsNull | Operator::IsNotNull), args } => {
				write!(f, "({}) {}", args.iter().format(", "), op.symbol())
			},
			Expr::Op { op, args } => {
				let sep = format!(" {} ", op.symbol());
				write!(f, "({})", args.iter().format(&sep))
			},
			Expr::Func { name, args } => write!(f, "{}({})", name, args.iter().format(", ")),
			Expr::Typed { domain, arg } => write!(f, "{}({})", domain.name(), arg),
			Expr::If { cond, then, otherwise } => write!(f, "IF({}, {}, {})", cond, then, otherwise),
			Expr::Case { operand, whens, otherwise } => {
				write!(f, "CASE")?;
				if let Some(operand) = operand {
					write!(f, " {}", operand)?;
				}
				for When { cond, then } in whens {
					write!(f, " WHEN {} THEN {}", cond, then)?;
				}
				if let Some(otherwise) = otherwise {
					write!(f, " ELSE {}", otherwise)?;
				}
				write!(f, " END")
			},
			Expr::Coalesce { args } => write!(f, "COALESCE({})", args.iter().format(", ")),
			Expr::NullIf { left, right } => write!(f, "NULLIF({}, {})", left, right),
			Expr::Exists { subquery } => {
				let inner = subquery.to_string().replace('\n', " ");
				write!(f, "EXISTS ({})", inner)
			},
			Expr::InList { arg, list } => write!(f, "{} IN ({})", arg, list.iter().format(", ")),
			Expr::InSubquery { arg, subquery } => {
				write!(f, "{} IN ({})", arg, subquery.to_string().replace('\n', " "))
			},
			Expr::ScalarSubquery { subquery } => write!(f, "({})", subquery.to_string().replace('\n', " ")),
			Expr::IsTrue { arg } => write!(f, "({}) IS TRUE", arg),
			Expr::IsFalse { arg } => write!(f, "({}) IS FALSE", arg),
			Expr::IsNotTrue { arg } => write!(f, "({}) IS NOT TRUE", arg),
			Expr::IsNotFalse { arg } => write!(f, "({}) IS NOT FALSE", arg),
			Expr::Abs { arg } => write!(f, "ABS({})", arg),
			Expr::Power { base, exponent } => write!(f, "POWER({}, {})", base, exponent),
			Expr::AnyValue { arg } => write!(f, "ANY_VALUE({})", arg),
			Expr::FirstValue { arg } => write!(f, "FIRST_VALUE({})", arg),
			Expr::LastValue { arg } => write!(f, "LAST_VALUE({})", arg),
			Expr::Agg(agg) => write!(f, "{}", agg),
		}
	}
}

impl Display for Aggregate {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let distinct = if self.distinct { "DISTINCT " } else { "" };
		match &self.arg {
			Some(arg) => write!(f, "{}({}{})", self.func.name(), distinct, arg)?,
			None => write!(f, "{}(*)", self.func.name())?,
		}
		if let Some(filter) = &self.filter {
			write!(f, " FILTER (WHERE {})", filter)?;
		}
		Ok(())
	}
}

impl Display for Item {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match &self.alias {
			Some(alias) => write!(f, "{} AS {}", self.expr, alias),
			None => write!(f, "{}", self.expr),
		}
	}
}

impl Display for Relation {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		fn child(f: &mut Formatter<'_>, rel: &Relation) -> std::fmt::Result {
			writeln!(indented(f).with_str("\t"), "{}", rel)
		}
		match self {
			Relation::Scan { table, alias: Some(alias) } => write!(f, "Scan {} AS {}", table, alias),
			Relation::Scan { table, alias: None } => write!(f, "Scan {}", table),
			Relation::Alias { input, name } => {
				writeln!(f, "Alias {} {{", name)?;
				child(f, input)?;
				write!(f, "}}")
			},
			Relation::Filter { input, condition } => {
				writeln!(f, "Filter {} {{", condition)?;
				child(f, input)?;
				write!(f, "}}")
			},
			Relation::Projection { input, items, group_by, having } => {
				write!(f, "Projection [{}]", items.iter().format(", "))?;
				if !group_by.is_empty() {
					write!(f, " GroupBy [{}]", group_by.iter().format(", "))?;
				}
				if let Some(having) = having {
					write!(f, " Having {}", having)?;
				}
				writeln!(f, " {{")?;
				child(f, input)?;
				write!(f, "}}")
			},
			Relation::Join { kind, left, right, on } => {
				write!(f, "Join {:?}", kind)?;
				if let Some(on) = on {
					write!(f, " On {}", on)?;
				}
				writeln!(f, " {{")?;
				child(f, left)?;
				child(f, right)?;
				write!(f, "}}")
			},
			Relation::SetOp { op, left, right } => {
				writeln!(f, "{} {{", op.name())?;
				child(f, left)?;
				child(f, right)?;
				write!(f, "}}")
			},
			Relation::Distinct { input } => {
				writeln!(f, "Distinct {{")?;
				child(f, input)?;
				write!(f, "}}")
			},
			Relation::OrderBy { input, keys } => {
				let keys = keys.iter().format_with(", ", |k, g| {
					g(&format_args!("{} {}", k.expr, if k.ascending { "ASC" } else { "DESC" }))
				});
				writeln!(f, "OrderBy [{}] {{", keys)?;
				child(f, input)?;
				write!(f, "}}")
			},
			Relation::Limit { input, count, offset } => {
				writeln!(f, "Limit {} Offset {} {{", count, offset)?;
				child(f, input)?;
				write!(f, "}}")
			},
			Relation::With { name, definition, body } => {
				writeln!(f, "With {} {{", name)?;
				child(f, definition)?;
				writeln!(f, "}} In {{")?;
				child(f, body)?;
				write!(f, "}}")
			},
		}
	}
}
