use std::fmt::{Display, Formatter};
use std::str::FromStr;

use num::rational::Ratio;
use serde::{Deserialize, Serialize};

use super::error::CheckError;

pub trait Eval<S, T> {
	fn eval(self, source: S) -> T;
}

/// Column types as declared in a schema.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum SqlType {
	Integer,
	Real,
	Boolean,
	Varchar,
	Date,
	Time,
	Timestamp,
}

impl FromStr for SqlType {
	type Err = CheckError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let base = s.split('(').next().unwrap_or_default().trim().to_ascii_uppercase();
		let base = base.strip_suffix(" UNSIGNED").unwrap_or(&base);
		Ok(match base {
			"INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "MEDIUMINT" => SqlType::Integer,
			"DOUBLE" | "FLOAT" | "REAL" | "DECIMAL" | "NUMERIC" | "NUMBER" => SqlType::Real,
			"BOOL" | "BOOLEAN" => SqlType::Boolean,
			"VARCHAR" | "CHAR" | "TEXT" | "STRING" | "VARCHAR2" => SqlType::Varchar,
			"DATE" => SqlType::Date,
			"TIME" => SqlType::Time,
			"TIMESTAMP" | "DATETIME" => SqlType::Timestamp,
			_ => return Err(CheckError::UnknownType(s.to_string())),
		})
	}
}

impl TryFrom<String> for SqlType {
	type Error = CheckError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl Display for SqlType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			SqlType::Integer => "INTEGER",
			SqlType::Real => "REAL",
			SqlType::Boolean => "BOOLEAN",
			SqlType::Varchar => "VARCHAR",
			SqlType::Date => "DATE",
			SqlType::Time => "TIME",
			SqlType::Timestamp => "TIMESTAMP",
		};
		write!(f, "{}", name)
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
	Null,
	Int(i64),
	/// Exact decimal such as `"12.50"`.
	Decimal(String),
	Str(String),
	Bool(bool),
}

impl Literal {
	pub fn ty(&self) -> SqlType {
		match self {
			Literal::Null | Literal::Decimal(_) => SqlType::Real,
			Literal::Int(_) => SqlType::Integer,
			Literal::Str(_) => SqlType::Varchar,
			Literal::Bool(_) => SqlType::Boolean,
		}
	}
}

impl Display for Literal {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Literal::Null => write!(f, "NULL"),
			Literal::Int(i) => write!(f, "{}", i),
			Literal::Decimal(d) => write!(f, "{}", d),
			Literal::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
			Literal::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
		}
	}
}

/// Parses a plain decimal literal (`-12.050`) into an exact ratio.
pub fn parse_decimal(text: &str) -> Result<Ratio<i64>, CheckError> {
	let invalid = |reason: &str| CheckError::Literal { literal: text.to_string(), reason: reason.to_string() };
	let trimmed = text.trim();
	let (negative, digits) = match trimmed.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
	};
	let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
	if whole.is_empty() && frac.is_empty() {
		return Err(invalid("empty number"));
	}
	if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
		return Err(invalid("not a decimal number"));
	}
	let mut numer: i64 = 0;
	let mut denom: i64 = 1;
	for c in whole.chars().chain(frac.chars()) {
		let digit = i64::from(c as u8 - b'0');
		numer = numer.checked_mul(10).and_then(|n| n.checked_add(digit)).ok_or_else(|| invalid("out of range"))?;
	}
	for _ in frac.chars() {
		denom = denom.checked_mul(10).ok_or_else(|| invalid("too many decimals"))?;
	}
	let numer = if negative { -numer } else { numer };
	Ok(Ratio::new(numer, denom))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
	#[serde(alias = "+")]
	Add,
	#[serde(alias = "-")]
	Sub,
	#[serde(alias = "*")]
	Mul,
	#[serde(alias = "/")]
	Div,
	#[serde(alias = "%")]
	Mod,
	Neg,
	#[serde(alias = "=")]
	Eq,
	#[serde(alias = "<>", alias = "!=")]
	Ne,
	#[serde(alias = "<")]
	Lt,
	#[serde(alias = "<=")]
	Le,
	#[serde(alias = ">")]
	Gt,
	#[serde(alias = ">=")]
	Ge,
	#[serde(alias = "<=>")]
	NullSafeEq,
	And,
	Or,
	Not,
	IsNull,
	IsNotNull,
}

impl Operator {
	pub fn is_comparison(&self) -> bool {
		use Operator::*;
		matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
	}

	pub fn is_boolean(&self) -> bool {
		use Operator::*;
		self.is_comparison() || matches!(self, NullSafeEq | And | Or | Not | IsNull | IsNotNull)
	}

	pub fn symbol(&self) -> &'static str {
		use Operator::*;
		match self {
			Add => "+",
			Sub => "-",
			Mul => "*",
			Div => "/",
			Mod => "%",
			Neg => "-",
			Eq => "=",
			Ne => "<>",
			Lt => "<",
			Le => "<=",
			Gt => ">",
			Ge => ">=",
			NullSafeEq => "<=>",
			And => "AND",
			Or => "OR",
			Not => "NOT",
			IsNull => "IS NULL",
			IsNotNull => "IS NOT NULL",
		}
	}
}

/// Typed-domain wrappers. Most of them carry no interpreted theory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
	Integer,
	Double,
	Float,
	Boolean,
	Varchar,
	Date,
	Time,
	Timestamp,
	Decimal,
	Numeric,
	Upper,
}

impl Domain {
	pub fn name(&self) -> &'static str {
		match self {
			Domain::Integer => "INTEGER",
			Domain::Double => "DOUBLE",
			Domain::Float => "FLOAT",
			Domain::Boolean => "BOOLEAN",
			Domain::Varchar => "VARCHAR",
			Domain::Date => "DATE",
			Domain::Time => "TIME",
			Domain::Timestamp => "TIMESTAMP",
			Domain::Decimal => "DECIMAL",
			Domain::Numeric => "NUMERIC",
			Domain::Upper => "UPPER",
		}
	}

	pub fn ty(&self) -> SqlType {
		match self {
			Domain::Integer => SqlType::Integer,
			Domain::Double | Domain::Float | Domain::Decimal | Domain::Numeric => SqlType::Real,
			Domain::Boolean => SqlType::Boolean,
			Domain::Varchar | Domain::Upper => SqlType::Varchar,
			Domain::Date => SqlType::Date,
			Domain::Time => SqlType::Time,
			Domain::Timestamp => SqlType::Timestamp,
		}
	}
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
	All,
	#[default]
	Mysql,
	Mariadb,
	#[serde(alias = "psql")]
	Postgresql,
	Oracle,
}

impl Dialect {
	/// MySQL and MariaDB sort NULLs before every value, PostgreSQL and Oracle after.
	pub fn nulls_first_ascending(&self) -> bool {
		matches!(self, Dialect::All | Dialect::Mysql | Dialect::Mariadb)
	}

	pub fn is_mysql_family(&self) -> bool {
		matches!(self, Dialect::All | Dialect::Mysql | Dialect::Mariadb)
	}
}

impl FromStr for Dialect {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"all" => Ok(Dialect::All),
			"mysql" => Ok(Dialect::Mysql),
			"mariadb" => Ok(Dialect::Mariadb),
			"psql" | "postgresql" | "postgres" => Ok(Dialect::Postgresql),
			"oracle" => Ok(Dialect::Oracle),
			other => Err(format!("unknown dialect `{}`", other)),
		}
	}
}

impl Display for Dialect {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Dialect::All => "all",
			Dialect::Mysql => "mysql",
			Dialect::Mariadb => "mariadb",
			Dialect::Postgresql => "postgresql",
			Dialect::Oracle => "oracle",
		};
		write!(f, "{}", name)
	}
}

/// Splits `T.A` into its qualifier and column name.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
	match name.rsplit_once('.') {
		Some((qualifier, column)) => (Some(qualifier), column),
		None => (None, name),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_declared_types() {
		assert_eq!("int".parse::<SqlType>().unwrap(), SqlType::Integer);
		assert_eq!("VARCHAR(20)".parse::<SqlType>().unwrap(), SqlType::Varchar);
		assert_eq!("DECIMAL(10, 2)".parse::<SqlType>().unwrap(), SqlType::Real);
		assert_eq!("datetime".parse::<SqlType>().unwrap(), SqlType::Timestamp);
		assert!("BLOB".parse::<SqlType>().is_err());
	}

	#[test]
	fn decimals_are_exact() {
		assert_eq!(parse_decimal("12.50").unwrap(), Ratio::new(25, 2));
		assert_eq!(parse_decimal("-0.5").unwrap(), Ratio::new(-1, 2));
		assert_eq!(parse_decimal("7").unwrap(), Ratio::from_integer(7));
		assert!(parse_decimal("1e3").is_err());
		assert!(parse_decimal(".").is_err());
	}

	#[test]
	fn qualified_names() {
		assert_eq!(split_qualified("T.A"), (Some("T"), "A"));
		assert_eq!(split_qualified("A"), (None, "A"));
	}
}
