// Expression module
// Condition predicates over variables, parameters and prior node status

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    DependencyContext, EvalError, Evaluator, ExpressionContext, ExpressionEngine, StatusContext,
};
pub use lexer::{segments, LexError, Segment};
pub use parser::{Expr, ExprParser, ParseExprError};
