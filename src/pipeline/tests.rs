//! End-to-end regressions: every case builds a schema, compiles two plans and
//! asserts the verdict of the bounded check.

use serde_json::json;
use z3::{Config, Context};

use super::constraint::{ColumnRef, Constraint};
use super::engine::{Environment, Settings, Verdict};
use super::error::CheckError;
use super::shared::{Dialect, Literal, Operator, SqlType};
use super::syntax::{AggFunc, Expr, JoinKind, Relation, SetOp};
use super::*;

fn input(schema: serde_json::Value, constraints: Vec<Constraint>, q1: Relation, q2: Relation) -> Input {
	let _ = env_logger::try_init();
	let schema = match schema {
		serde_json::Value::Object(map) => map,
		other => panic!("schema must be an object, got {}", other),
	};
	Input { schema, constraints, queries: (q1, q2), sql: Default::default(), settings: Settings::default() }
}

fn verdict(schema: serde_json::Value, constraints: Vec<Constraint>, q1: Relation, q2: Relation) -> Verdict {
	check(input(schema, constraints, q1, q2)).unwrap().verdict
}

fn primary(column: &str) -> Constraint {
	Constraint::Primary(vec![ColumnRef::new(column)])
}

fn attr(name: &str) -> Expr {
	Expr::attr(name)
}

fn falsum() -> Expr {
	Expr::lit(Literal::Bool(false))
}

fn t() -> serde_json::Value {
	json!({"T": {"A": "INT", "B": "INT"}})
}

#[test]
fn adding_zero_is_equivalent() {
	let q1 = Relation::scan("T").project(vec![attr("A")]);
	let q2 = Relation::scan("T").project(vec![Expr::binary(Operator::Add, attr("A"), Expr::int(0))]);
	assert_eq!(verdict(t(), vec![], q1, q2), Verdict::Equivalent);
}

#[test]
fn adding_one_is_not_equivalent() {
	let q1 = Relation::scan("T").project(vec![attr("A")]);
	let q2 = Relation::scan("T").project(vec![Expr::binary(Operator::Add, attr("A"), Expr::int(1))]);
	let report = check(input(t(), vec![], q1, q2)).unwrap();
	assert_eq!(report.verdict, Verdict::NotEquivalent);
	let cex = report.counterexample.expect("a counterexample is reported");
	assert_eq!(cex.tables.len(), 1);
	assert_ne!(cex.left, cex.right);
	assert!(report.render(false).contains(">>> Non-Equivalent!"));
	let timed = report.render(true);
	assert!(timed.contains("Time cost: ") && timed.ends_with("Found a counterexample!\n"));
	assert!(timed.starts_with(&cex.to_string()));
}

#[test]
fn counterexample_can_be_switched_off() {
	let q1 = Relation::scan("T").project(vec![attr("A")]);
	let q2 = Relation::scan("T").project(vec![attr("B")]);
	let mut problem = input(t(), vec![], q1, q2);
	problem.settings.show_counterexample = false;
	let report = check(problem).unwrap();
	assert_eq!(report.verdict, Verdict::NotEquivalent);
	assert!(report.counterexample.is_none());
}

#[test]
fn count_distinct_needs_a_primary_key() {
	let q1 = Relation::scan("T").project(vec![Expr::agg_distinct(AggFunc::Count, attr("A"))]);
	let q2 = Relation::scan("T").project(vec![Expr::agg(AggFunc::Count, attr("A"))]);
	assert_eq!(verdict(t(), vec![primary("T__A")], q1.clone(), q2.clone()), Verdict::Equivalent);
	assert_eq!(verdict(t(), vec![], q1, q2), Verdict::NotEquivalent);
}

#[test]
fn except_with_itself_is_empty() {
	let q1 = Relation::scan("T").set_op(SetOp::Except, Relation::scan("T"));
	let q2 = Relation::scan("T").filter(falsum());
	assert_eq!(verdict(t(), vec![], q1, q2), Verdict::Equivalent);
}

#[test]
fn except_all_keeps_multiplicities() {
	let twice = || Relation::scan("T").set_op(SetOp::UnionAll, Relation::scan("T"));
	let all = twice().set_op(SetOp::ExceptAll, Relation::scan("T"));
	assert_eq!(verdict(t(), vec![], all, Relation::scan("T")), Verdict::Equivalent);
	let set = twice().set_op(SetOp::Except, Relation::scan("T"));
	assert_eq!(verdict(t(), vec![], set, Relation::scan("T")), Verdict::NotEquivalent);
}

#[test]
fn except_removes_every_copy_found_on_the_right() {
	let twice = Relation::scan("T").set_op(SetOp::UnionAll, Relation::scan("T"));
	let set = twice.clone().set_op(SetOp::Except, Relation::scan("T"));
	assert_eq!(verdict(t(), vec![], set, Relation::scan("T").filter(falsum())), Verdict::Equivalent);
	let all = twice.set_op(SetOp::ExceptAll, Relation::scan("T"));
	assert_eq!(verdict(t(), vec![], all, Relation::scan("T").filter(falsum())), Verdict::NotEquivalent);
}

#[test]
fn ctes_shadow_tables_only_inside_their_body() {
	let emptied = Relation::With {
		name: "T".to_string(),
		definition: Box::new(Relation::scan("T").filter(falsum())),
		body: Box::new(Relation::scan("T")),
	};
	assert_eq!(verdict(t(), vec![], emptied.clone(), Relation::scan("T")), Verdict::NotEquivalent);
	assert_eq!(verdict(t(), vec![], emptied, Relation::scan("T").filter(falsum())), Verdict::Equivalent);
}

#[test]
fn intersect_removes_duplicates() {
	let q1 = Relation::scan("T").set_op(SetOp::Intersect, Relation::scan("T"));
	let q2 = Relation::scan("T").distinct();
	assert_eq!(verdict(t(), vec![], q1, q2), Verdict::Equivalent);
	let q1 = Relation::scan("T").set_op(SetOp::IntersectAll, Relation::scan("T"));
	assert_eq!(verdict(t(), vec![], q1, Relation::scan("T")), Verdict::Equivalent);
}

#[test]
fn outer_join_on_false_pads_every_row() {
	let schema = json!({"T": {"A": "INT"}, "S": {"B": "INT"}});
	let left = Relation::scan("T").join(JoinKind::Left, Relation::scan("S"), Some(falsum())).project(vec![attr("T.A")]);
	assert_eq!(verdict(schema.clone(), vec![], left, Relation::scan("T").project(vec![attr("A")])), Verdict::Equivalent);

	let inner = Relation::scan("T").join(JoinKind::Inner, Relation::scan("S"), Some(falsum())).project(vec![attr("T.A")]);
	let empty = Relation::scan("T").filter(falsum()).project(vec![attr("A")]);
	assert_eq!(verdict(schema.clone(), vec![], inner, empty), Verdict::Equivalent);

	let padded = Relation::scan("T")
		.join(JoinKind::Left, Relation::scan("S"), Some(falsum()))
		.filter(Expr::op(Operator::IsNull, vec![attr("S.B")]))
		.project(vec![attr("A")]);
	assert_eq!(verdict(schema, vec![], padded, Relation::scan("T").project(vec![attr("A")])), Verdict::Equivalent);
}

#[test]
fn limit_one_over_sorted_distinct_is_min() {
	let q1 = Relation::scan("T")
		.filter(Expr::op(Operator::IsNotNull, vec![attr("A")]))
		.project(vec![attr("A")])
		.distinct()
		.order_by(vec![(attr("A"), true)])
		.limit(1, 0);
	let count = Expr::agg(AggFunc::Count, attr("A"));
	let q2 = Relation::scan("T").group(
		vec![Expr::agg(AggFunc::Min, attr("A"))],
		vec![],
		Some(Expr::binary(Operator::Gt, count, Expr::int(0))),
	);
	assert_eq!(verdict(t(), vec![], q1, q2), Verdict::Equivalent);
}

#[test]
fn descending_limit_is_not_min() {
	let sorted = |ascending| {
		Relation::scan("T")
			.filter(Expr::op(Operator::IsNotNull, vec![attr("A")]))
			.project(vec![attr("A")])
			.order_by(vec![(attr("A"), ascending)])
			.limit(1, 0)
	};
	assert_eq!(verdict(t(), vec![], sorted(true), sorted(false)), Verdict::NotEquivalent);
}

#[test]
fn group_by_is_distinct() {
	let q1 = Relation::scan("T").group(vec![attr("A")], vec![attr("A")], None);
	let q2 = Relation::scan("T").project(vec![attr("A")]).distinct();
	assert_eq!(verdict(t(), vec![], q1, q2), Verdict::Equivalent);
}

#[test]
fn coalesce_falls_through_nulls() {
	let q1 = Relation::scan("T").project(vec![Expr::Coalesce { args: vec![Expr::null(), attr("A")] }]);
	let q2 = Relation::scan("T").project(vec![attr("A")]);
	assert_eq!(verdict(t(), vec![], q1, q2.clone()), Verdict::Equivalent);
	let q3 = Relation::scan("T").project(vec![Expr::Coalesce { args: vec![attr("A"), Expr::int(0)] }]);
	assert_eq!(verdict(t(), vec![], q3, q2), Verdict::NotEquivalent);
}

#[test]
fn correlated_exists_is_a_semi_join() {
	let schema = json!({"T": {"A": "INT"}, "S": {"B": "INT"}});
	let correlated = Relation::scan("S").filter(Expr::binary(Operator::Eq, attr("S.B"), attr("T.A")));
	let q1 = Relation::scan("T").filter(Expr::exists(correlated)).project(vec![attr("A")]);
	let q2 = Relation::scan("T")
		.filter(Expr::InSubquery {
			arg: Box::new(attr("A")),
			subquery: Box::new(Relation::scan("S").project(vec![attr("B")])),
		})
		.project(vec![attr("A")]);
	assert_eq!(verdict(schema, vec![], q1, q2), Verdict::Equivalent);
}

#[test]
fn foreign_keys_make_semi_joins_redundant() {
	let schema = json!({"T": {"A": "INT"}, "S": {"B": "INT"}});
	let q1 = Relation::scan("T")
		.filter(Expr::InSubquery {
			arg: Box::new(attr("A")),
			subquery: Box::new(Relation::scan("S").project(vec![attr("B")])),
		})
		.project(vec![attr("A")]);
	let q2 = Relation::scan("T").filter(Expr::op(Operator::IsNotNull, vec![attr("A")])).project(vec![attr("A")]);
	let fk = Constraint::Foreign(vec![ColumnRef::new("T__A"), ColumnRef::new("S__B")]);
	assert_eq!(verdict(schema.clone(), vec![fk], q1.clone(), q2.clone()), Verdict::Equivalent);
	assert_eq!(verdict(schema, vec![], q1, q2), Verdict::NotEquivalent);
}

#[test]
fn string_literals_are_distinct() {
	let schema = json!({"T": {"NAME": "VARCHAR(20)"}});
	let is_x = Expr::binary(Operator::Eq, attr("NAME"), Expr::string("x"));
	let not_y = Expr::binary(Operator::Ne, attr("NAME"), Expr::string("y"));
	let q1 = Relation::scan("T").filter(is_x.clone());
	let q2 = Relation::scan("T").filter(Expr::op(Operator::And, vec![is_x, not_y]));
	assert_eq!(verdict(schema, vec![], q1, q2), Verdict::Equivalent);
}

#[test]
fn queries_must_have_the_same_arity() {
	let q1 = Relation::scan("T").project(vec![attr("A")]);
	let q2 = Relation::scan("T");
	assert!(matches!(check(input(t(), vec![], q1, q2)), Err(CheckError::ArityMismatch { left: 1, right: 2 })));
}

#[test]
fn unknown_constraint_columns_are_fatal() {
	let q = Relation::scan("T");
	let err = check(input(t(), vec![primary("T__C")], q.clone(), q)).unwrap_err();
	assert!(matches!(err, CheckError::ConstraintColumn(_)));
}

#[test]
fn dialects_gate_mysql_only_functions() {
	let q1 = Relation::scan("T").project(vec![Expr::If {
		cond: Box::new(Expr::op(Operator::IsNull, vec![attr("A")])),
		then: Box::new(Expr::int(0)),
		otherwise: Box::new(attr("A")),
	}]);
	let q2 = Relation::scan("T").project(vec![Expr::Coalesce { args: vec![attr("A"), Expr::int(0)] }]);
	assert_eq!(verdict(t(), vec![], q1.clone(), q2.clone()), Verdict::Equivalent);
	let mut problem = input(t(), vec![], q1, q2);
	problem.settings.dialect = Dialect::Oracle;
	assert!(matches!(check(problem), Err(CheckError::Unsupported { .. })));
}

#[test]
fn identical_plans_are_still_compiled() {
	let q = Relation::scan("T").project(vec![attr("NO_SUCH")]);
	let err = check(input(t(), vec![], q.clone(), q)).unwrap_err();
	assert!(matches!(err, CheckError::UnknownAttribute(_)));

	let gated = Relation::scan("T").project(vec![Expr::If {
		cond: Box::new(falsum()),
		then: Box::new(attr("A")),
		otherwise: Box::new(attr("B")),
	}]);
	let mut problem = input(t(), vec![], gated.clone(), gated);
	problem.settings.dialect = Dialect::Oracle;
	assert!(matches!(check(problem), Err(CheckError::Unsupported { .. })));
}

#[test]
fn identical_plans_skip_the_solver() {
	let q = Relation::scan("T").project(vec![attr("A")]);
	let report = check(input(t(), vec![], q.clone(), q)).unwrap();
	assert_eq!(report.verdict, Verdict::Equivalent);
	assert!(report.stats.trivial);
}

#[test]
fn one_environment_checks_several_pairs() {
	let z3_ctx = Context::new(&Config::new());
	let mut env = Environment::new(&z3_ctx, Settings::default());
	let columns = vec![("A".to_string(), SqlType::Integer)];
	env.create_database(&columns, 2, "T").unwrap();
	env.save_checkpoints("setup");
	let a = Relation::scan("T").project(vec![attr("A")]);
	let doubled = Relation::scan("T").project(vec![Expr::binary(Operator::Mul, attr("A"), Expr::int(2))]);
	let summed = Relation::scan("T").project(vec![Expr::binary(Operator::Add, attr("A"), attr("A"))]);
	assert_eq!(env.analyze(&a, &doubled).unwrap(), Verdict::NotEquivalent);
	env.rollback("setup").unwrap();
	assert_eq!(env.analyze(&doubled, &summed).unwrap(), Verdict::Equivalent);
	assert!(env.counterexample.is_none());
}

#[test]
fn inputs_parse_from_json() {
	let text = r#"{
		"schema": {"T": {"A": "INT", "B": "VARCHAR(10)"}},
		"constraints": [{"primary": [{"value": "T__A"}]}],
		"queries": [
			{"kind": "projection", "input": {"kind": "scan", "table": "T"},
			 "items": [{"expr": {"kind": "agg", "func": "count", "arg": {"kind": "attr", "name": "A"}, "distinct": true}}]},
			{"kind": "projection", "input": {"kind": "scan", "table": "T"},
			 "items": [{"expr": {"kind": "agg", "func": "count"}}]}
		],
		"sql": ["SELECT COUNT(DISTINCT A) FROM T", "SELECT COUNT(*) FROM T"],
		"settings": {"bound_size": 3, "dialect": "psql"}
	}"#;
	let input: Input = serde_json::from_str(text).unwrap();
	assert_eq!(input.settings.bound_size, 3);
	assert_eq!(input.settings.dialect, Dialect::Postgresql);
	assert!(input.settings.show_counterexample);
	let tables = input.tables().unwrap();
	assert_eq!(tables[0].1, vec![("A".to_string(), SqlType::Integer), ("B".to_string(), SqlType::Varchar)]);
	let report = check(input).unwrap();
	assert_eq!(report.verdict, Verdict::Equivalent);
	assert_eq!(report.stats.bound_size, 3);
}
