use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use super::error::{CheckError, Result};
use super::shared::Domain;
use super::syntax::{AggFunc, Aggregate, Expr, JoinKind, Relation, SetOp, When};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Category {
	Value,
	Predicate,
	Aggregate,
	Relation,
}

/// Every formula kind a plan may contain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Tag {
	Attribute,
	Literal,
	Operator,
	SymFunc,
	Typed(Domain),
	If,
	Case,
	Coalesce,
	NullIf,
	Abs,
	Power,
	AnyValue,
	FirstValue,
	LastValue,
	ScalarSubquery,
	IsTrue,
	IsFalse,
	IsNotTrue,
	IsNotFalse,
	Exists,
	InList,
	InSubquery,
	Agg(AggFunc),
	Scan,
	Alias,
	Filter,
	Projection,
	Join(JoinKind),
	Set(SetOp),
	Distinct,
	OrderBy,
	Limit,
	With,
}

const DOMAINS: [Domain; 11] = [
	Domain::Integer,
	Domain::Double,
	Domain::Float,
	Domain::Boolean,
	Domain::Varchar,
	Domain::Date,
	Domain::Time,
	Domain::Timestamp,
	Domain::Decimal,
	Domain::Numeric,
	Domain::Upper,
];

const AGGREGATES: [AggFunc; 9] = [
	AggFunc::Count,
	AggFunc::Sum,
	AggFunc::Avg,
	AggFunc::Min,
	AggFunc::Max,
	AggFunc::StddevPop,
	AggFunc::StddevSamp,
	AggFunc::VarPop,
	AggFunc::VarSamp,
];

const JOINS: [JoinKind; 5] = [JoinKind::Inner, JoinKind::Cross, JoinKind::Left, JoinKind::Right, JoinKind::Full];

const SET_OPS: [SetOp; 6] =
	[SetOp::Union, SetOp::UnionAll, SetOp::Except, SetOp::ExceptAll, SetOp::Intersect, SetOp::IntersectAll];

impl Tag {
	pub fn all() -> Vec<Tag> {
		use Tag::*;
		let mut tags = vec![
			Attribute,
			Literal,
			Operator,
			SymFunc,
			If,
			Case,
			Coalesce,
			NullIf,
			Abs,
			Power,
			AnyValue,
			FirstValue,
			LastValue,
			ScalarSubquery,
			IsTrue,
			IsFalse,
			IsNotTrue,
			IsNotFalse,
			Exists,
			InList,
			InSubquery,
			Scan,
			Alias,
			Filter,
			Projection,
			Distinct,
			OrderBy,
			Limit,
			With,
		];
		tags.extend(DOMAINS.into_iter().map(Typed));
		tags.extend(AGGREGATES.into_iter().map(Agg));
		tags.extend(JOINS.into_iter().map(Join));
		tags.extend(SET_OPS.into_iter().map(Set));
		tags
	}

	pub fn name(&self) -> String {
		use Tag::*;
		match self {
			Attribute => "attribute".into(),
			Literal => "literal".into(),
			Operator => "operator".into(),
			SymFunc => "sym_func".into(),
			Typed(domain) => format!("typed_{}", domain.name().to_ascii_lowercase()),
			If => "if_predicate".into(),
			Case => "case_predicate".into(),
			Coalesce => "coalesce_predicate".into(),
			NullIf => "nullif_predicate".into(),
			Abs => "abs".into(),
			Power => "power".into(),
			AnyValue => "any_value".into(),
			FirstValue => "first_value".into(),
			LastValue => "last_value".into(),
			ScalarSubquery => "scalar_subquery".into(),
			IsTrue => "is_true".into(),
			IsFalse => "is_false".into(),
			IsNotTrue => "is_not_true".into(),
			IsNotFalse => "is_null_or_hold".into(),
			Exists => "exists".into(),
			InList => "in_list".into(),
			InSubquery => "in_subquery".into(),
			Agg(func) => format!("agg_{}", func.name().to_ascii_lowercase()),
			Scan => "scan".into(),
			Alias => "alias".into(),
			Filter => "filter".into(),
			Projection => "projection".into(),
			Join(kind) => format!("{}_join", format!("{:?}", kind).to_ascii_lowercase()),
			Set(SetOp::Union) => "union".into(),
			Set(SetOp::UnionAll) => "union_all".into(),
			Set(SetOp::Except) => "except".into(),
			Set(SetOp::ExceptAll) => "except_all".into(),
			Set(SetOp::Intersect) => "intersect".into(),
			Set(SetOp::IntersectAll) => "intersect_all".into(),
			Distinct => "distinct".into(),
			OrderBy => "orderby_tuple".into(),
			Limit => "limit".into(),
			With => "with".into(),
		}
	}

	pub fn category(&self) -> Category {
		use Tag::*;
		match self {
			Attribute | Literal | Operator | SymFunc | Typed(_) | If | Case | Coalesce | NullIf | Abs | Power
			| AnyValue | FirstValue | LastValue | ScalarSubquery => Category::Value,
			IsTrue | IsFalse | IsNotTrue | IsNotFalse | Exists | InList | InSubquery => Category::Predicate,
			Agg(_) => Category::Aggregate,
			Scan | Alias | Filter | Projection | Join(_) | Set(_) | Distinct | OrderBy | Limit | With => {
				Category::Relation
			},
		}
	}
}

impl Display for Tag {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.name())
	}
}

fn table() -> &'static HashMap<String, Tag> {
	static TABLE: OnceLock<HashMap<String, Tag>> = OnceLock::new();
	TABLE.get_or_init(|| Tag::all().into_iter().map(|tag| (tag.name(), tag)).collect())
}

pub fn lookup(name: &str) -> Option<Tag> {
	table().get(&name.to_ascii_lowercase()).copied()
}

/// A registry operand: either a scalar/predicate/aggregate node or a relation.
#[derive(Clone, Debug, PartialEq)]
pub enum Formula {
	Expr(Expr),
	Relation(Relation),
}

impl Formula {
	pub fn tag(&self) -> Tag {
		match self {
			Formula::Expr(e) => e.tag(),
			Formula::Relation(r) => r.tag(),
		}
	}
}

impl From<Expr> for Formula {
	fn from(e: Expr) -> Self {
		Formula::Expr(e)
	}
}

impl From<Relation> for Formula {
	fn from(r: Relation) -> Self {
		Formula::Relation(r)
	}
}

impl Expr {
	pub fn tag(&self) -> Tag {
		match self {
			Expr::Attr { .. } | Expr::Star { .. } => Tag::Attribute,
			Expr::Lit { .. } => Tag::Literal,
			Expr::Op { .. } => Tag::Operator,
			Expr::Func { .. } => Tag::SymFunc,
			Expr::Typed { domain, .. } => Tag::Typed(*domain),
			Expr::If { .. } => Tag::If,
			Expr::Case { .. } => Tag::Case,
			Expr::Coalesce { .. } => Tag::Coalesce,
			Expr::NullIf { .. } => Tag::NullIf,
			Expr::Exists { .. } => Tag::Exists,
			Expr::InList { .. } => Tag::InList,
			Expr::InSubquery { .. } => Tag::InSubquery,
			Expr::ScalarSubquery { .. } => Tag::ScalarSubquery,
			Expr::IsTrue { .. } => Tag::IsTrue,
			Expr::IsFalse { .. } => Tag::IsFalse,
			Expr::IsNotTrue { .. } => Tag::IsNotTrue,
			Expr::IsNotFalse { .. } => Tag::IsNotFalse,
			Expr::Abs { .. } => Tag::Abs,
			Expr::Power { .. } => Tag::Power,
			Expr::AnyValue { .. } => Tag::AnyValue,
			Expr::FirstValue { .. } => Tag::FirstValue,
			Expr::LastValue { .. } => Tag::LastValue,
			Expr::Agg(agg) => Tag::Agg(agg.func),
		}
	}
}

impl Relation {
	pub fn tag(&self) -> Tag {
		match self {
			Relation::Scan { .. } => Tag::Scan,
			Relation::Alias { .. } => Tag::Alias,
			Relation::Filter { .. } => Tag::Filter,
			Relation::Projection { .. } => Tag::Projection,
			Relation::Join { kind, .. } => Tag::Join(*kind),
			Relation::SetOp { op, .. } => Tag::Set(*op),
			Relation::Distinct { .. } => Tag::Distinct,
			Relation::OrderBy { .. } => Tag::OrderBy,
			Relation::Limit { .. } => Tag::Limit,
			Relation::With { .. } => Tag::With,
		}
	}
}

fn operands(tag: Tag, expected: &str, actual: usize) -> CheckError {
	CheckError::Operands { tag: tag.name(), expected: expected.to_string(), actual }
}

fn exprs(tag: Tag, operands: Vec<Formula>) -> Result<Vec<Expr>> {
	let actual = operands.len();
	operands
		.into_iter()
		.map(|f| match f {
			Formula::Expr(e) => Ok(e),
			Formula::Relation(_) => Err(self::operands(tag, "scalar operands", actual)),
		})
		.collect()
}

fn exactly<const N: usize>(tag: Tag, operands: Vec<Formula>) -> Result<[Expr; N]> {
	let actual = operands.len();
	let exprs = exprs(tag, operands)?;
	exprs.try_into().map_err(|_| self::operands(tag, &format!("{} operand(s)", N), actual))
}

fn boxed<const N: usize>(tag: Tag, operands: Vec<Formula>) -> Result<[Box<Expr>; N]> {
	Ok(exactly::<N>(tag, operands)?.map(Box::new))
}

/// Builds a node from its tag and operands, for tags whose node is fully
/// determined by its operands.
pub fn build(tag: Tag, operands: Vec<Formula>) -> Result<Formula> {
	use Tag::*;
	let actual = operands.len();
	let node: Formula = match tag {
		Attribute | Literal | Operator | SymFunc | Scan | Alias | Projection | OrderBy | Limit | With => {
			return Err(CheckError::Parameterized(tag.name()));
		},
		Typed(domain) => {
			let [arg] = boxed(tag, operands)?;
			Expr::Typed { domain, arg }.into()
		},
		If => {
			let [cond, then, otherwise] = boxed(tag, operands)?;
			Expr::If { cond, then, otherwise }.into()
		},
		Case => {
			let mut args = exprs(tag, operands)?;
			if args.len() < 2 {
				return Err(self::operands(tag, "WHEN/THEN pairs and an optional ELSE", actual));
			}
			let otherwise = if args.len() % 2 == 1 { args.pop().map(Box::new) } else { None };
			let mut args = args.into_iter();
			let mut whens = vec![];
			while let (Some(cond), Some(then)) = (args.next(), args.next()) {
				whens.push(When { cond, then });
			}
			Expr::Case { operand: None, whens, otherwise }.into()
		},
		Coalesce => {
			let args = exprs(tag, operands)?;
			if args.is_empty() {
				return Err(self::operands(tag, "at least one operand", actual));
			}
			Expr::Coalesce { args }.into()
		},
		NullIf => {
			let [left, right] = boxed(tag, operands)?;
			Expr::NullIf { left, right }.into()
		},
		Abs => {
			let [arg] = boxed(tag, operands)?;
			Expr::Abs { arg }.into()
		},
		Power => {
			let [base, exponent] = boxed(tag, operands)?;
			Expr::Power { base, exponent }.into()
		},
		AnyValue | FirstValue | LastValue | IsTrue | IsFalse | IsNotTrue | IsNotFalse => {
			let [arg] = boxed(tag, operands)?;
			match tag {
				AnyValue => Expr::AnyValue { arg },
				FirstValue => Expr::FirstValue { arg },
				LastValue => Expr::LastValue { arg },
				IsTrue => Expr::IsTrue { arg },
				IsFalse => Expr::IsFalse { arg },
				IsNotTrue => Expr::IsNotTrue { arg },
				_ => Expr::IsNotFalse { arg },
			}
			.into()
		},
		Agg(func) => {
			let mut args = exprs(tag, operands)?.into_iter();
			let arg = args.next().map(Box::new);
			let filter = args.next().map(Box::new);
			if args.next().is_some() || (arg.is_none() && func != AggFunc::Count) {
				return Err(self::operands(tag, "an argument and an optional filter", actual));
			}
			Expr::Agg(Aggregate { func, arg, distinct: false, filter }).into()
		},
		InList => {
			let mut args = exprs(tag, operands)?.into_iter();
			let arg = args.next().map(Box::new).ok_or_else(|| self::operands(tag, "a value and a list", actual))?;
			Expr::InList { arg, list: args.collect() }.into()
		},
		Exists | ScalarSubquery | Distinct => match <[Formula; 1]>::try_from(operands) {
			Ok([Formula::Relation(rel)]) => {
				let subquery = Box::new(rel);
				match tag {
					Exists => Expr::Exists { subquery }.into(),
					ScalarSubquery => Expr::ScalarSubquery { subquery }.into(),
					_ => Relation::Distinct { input: subquery }.into(),
				}
			},
			_ => return Err(self::operands(tag, "one relation", actual)),
		},
		InSubquery => match <[Formula; 2]>::try_from(operands) {
			Ok([Formula::Expr(arg), Formula::Relation(rel)]) => {
				Expr::InSubquery { arg: Box::new(arg), subquery: Box::new(rel) }.into()
			},
			_ => return Err(self::operands(tag, "a value and a relation", actual)),
		},
		Filter => match <[Formula; 2]>::try_from(operands) {
			Ok([Formula::Relation(input), Formula::Expr(condition)]) => {
				Relation::Filter { input: Box::new(input), condition }.into()
			},
			_ => return Err(self::operands(tag, "a relation and a condition", actual)),
		},
		Set(op) => match <[Formula; 2]>::try_from(operands) {
			Ok([Formula::Relation(left), Formula::Relation(right)]) => left.set_op(op, right).into(),
			_ => return Err(self::operands(tag, "two relations", actual)),
		},
		Join(kind) => {
			let mut operands = operands.into_iter();
			match (operands.next(), operands.next(), operands.next(), operands.next()) {
				(Some(Formula::Relation(left)), Some(Formula::Relation(right)), on, None) => {
					let on = match on {
						Some(Formula::Expr(on)) => Some(on),
						None => None,
						Some(Formula::Relation(_)) => {
							return Err(self::operands(tag, "two relations and an optional condition", actual));
						},
					};
					left.join(kind, right, on).into()
				},
				_ => return Err(self::operands(tag, "two relations and an optional condition", actual)),
			}
		},
	};
	Ok(node)
}

/// [`build`] for a tag given by its registry name, as an external visitor
/// reports it.
pub fn build_by_name(name: &str, operands: Vec<Formula>) -> Result<Formula> {
	let tag = lookup(name).ok_or_else(|| CheckError::UnknownTag(name.to_string()))?;
	build(tag, operands)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::shared::Operator;

	#[test]
	fn every_tag_is_registered_under_its_name() {
		let tags = Tag::all();
		assert_eq!(table().len(), tags.len());
		for tag in tags {
			assert_eq!(lookup(&tag.name()), Some(tag));
		}
		assert_eq!(lookup("coalesce_predicate"), Some(Tag::Coalesce));
		assert_eq!(lookup("AGG_AVG"), Some(Tag::Agg(AggFunc::Avg)));
		assert_eq!(lookup("except_all"), Some(Tag::Set(SetOp::ExceptAll)));
		assert_eq!(lookup("left_join"), Some(Tag::Join(JoinKind::Left)));
		assert_eq!(lookup("no_such_thing"), None);
	}

	#[test]
	fn categories() {
		assert_eq!(Tag::OrderBy.category(), Category::Relation);
		assert_eq!(Tag::Agg(AggFunc::StddevPop).category(), Category::Aggregate);
		assert_eq!(Tag::IsNotFalse.category(), Category::Predicate);
		assert_eq!(Tag::Typed(Domain::Date).category(), Category::Value);
	}

	#[test]
	fn builds_from_operands() {
		let coalesce = build(Tag::Coalesce, vec![Expr::null().into(), Expr::int(5).into()]).unwrap();
		assert_eq!(coalesce, Formula::Expr(Expr::Coalesce { args: vec![Expr::null(), Expr::int(5)] }));
		assert_eq!(coalesce.tag(), Tag::Coalesce);

		let case = build(Tag::Case, vec![Expr::attr("B").into(), Expr::int(1).into(), Expr::int(0).into()]).unwrap();
		match case {
			Formula::Expr(Expr::Case { whens, otherwise: Some(_), .. }) => assert_eq!(whens.len(), 1),
			other => panic!("unexpected {:?}", other),
		}

		let except = build(Tag::Set(SetOp::ExceptAll), vec![Relation::scan("T").into(), Relation::scan("T").into()]);
		assert_eq!(except.unwrap().tag(), Tag::Set(SetOp::ExceptAll));

		let count = build(Tag::Agg(AggFunc::Count), vec![]).unwrap();
		assert_eq!(count, Formula::Expr(Expr::count_star()));
	}

	#[test]
	fn rejects_bad_operands() {
		assert!(matches!(build(Tag::If, vec![Expr::int(1).into()]), Err(CheckError::Operands { .. })));
		assert!(matches!(build(Tag::Scan, vec![]), Err(CheckError::Parameterized(_))));
		assert!(matches!(
			build(Tag::Filter, vec![Expr::int(1).into(), Relation::scan("T").into()]),
			Err(CheckError::Operands { .. })
		));
		let op = Expr::binary(Operator::Add, Expr::int(1), Expr::int(2));
		assert!(matches!(build(Tag::Exists, vec![op.into()]), Err(CheckError::Operands { .. })));
		assert!(matches!(build(Tag::Agg(AggFunc::Sum), vec![]), Err(CheckError::Operands { .. })));
	}

	#[test]
	fn builds_by_registry_name() {
		let distinct = build_by_name("distinct", vec![Relation::scan("T").into()]);
		assert_eq!(distinct.unwrap(), Formula::Relation(Relation::scan("T").distinct()));
		let abs = build_by_name("ABS", vec![Expr::int(-1).into()]).unwrap();
		assert_eq!(abs.tag(), Tag::Abs);
		assert!(matches!(build_by_name("no_such_thing", vec![]), Err(CheckError::UnknownTag(_))));
	}
}
