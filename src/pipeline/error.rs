use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckError>;

/// Everything that aborts an equivalence check before the solver gets a say.
///
/// Solver outcomes (including `unknown`) are not errors, see [`super::engine::Verdict`].
#[derive(Debug, Error)]
pub enum CheckError {
	#[error("unknown attribute `{0}`")]
	UnknownAttribute(String),

	#[error("ambiguous attribute `{0}`")]
	AmbiguousAttribute(String),

	#[error("unknown relation `{0}`")]
	UnknownRelation(String),

	#[error("table `{0}` is declared twice")]
	DuplicateTable(String),

	#[error("queries are not comparable: left yields {left} columns, right yields {right}")]
	ArityMismatch { left: usize, right: usize },

	#[error("set operation over {left} and {right} columns")]
	SetArity { left: usize, right: usize },

	#[error("`{construct}` is not supported by the {dialect} dialect")]
	Unsupported { construct: String, dialect: String },

	#[error("aggregate `{0}` used outside of a grouping context")]
	MisplacedAggregate(String),

	#[error("`*` is only allowed as a projection item")]
	MisplacedStar,

	#[error("invalid literal `{literal}`: {reason}")]
	Literal { literal: String, reason: String },

	#[error("unknown SQL type `{0}`")]
	UnknownType(String),

	#[error("malformed constraint: {0}")]
	Constraint(String),

	#[error("constraint refers to unknown column `{0}`")]
	ConstraintColumn(String),

	#[error("`{tag}` takes {expected}, got {actual}")]
	Operands { tag: String, expected: String, actual: usize },

	#[error("`{0}` cannot be built from operands alone")]
	Parameterized(String),

	#[error("unknown formula tag `{0}`")]
	UnknownTag(String),

	#[error("solver error: {0}")]
	Solver(String),
}
