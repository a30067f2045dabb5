//! Row expressions.

use eddy_core::{DataError, DataResult, DataType, Row, Value};
use std::fmt;
use std::sync::Arc;

type ExprFn = dyn Fn(&Row) -> DataResult<Value> + Send + Sync;

/// A per-row expression.
///
/// Expressions are pure: evaluating the same row twice yields the same
/// result, which is what lets a retraction reproduce the value that its
/// insertion produced.
#[derive(Clone)]
pub struct Expr(Arc<ExprFn>);

impl Expr {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Row) -> DataResult<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Reads a column.
    pub fn col(index: usize) -> Self {
        Self::new(move |row| {
            row.get(index)
                .cloned()
                .ok_or(DataError::MissingColumn { index })
        })
    }

    /// A constant.
    pub fn lit(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(move |_| Ok(value.clone()))
    }

    /// Applies an infallible function to one column.
    pub fn map_col<F>(index: usize, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::new(move |row| {
            row.get(index)
                .map(&f)
                .ok_or(DataError::MissingColumn { index })
        })
    }

    /// Evaluates the expression.
    #[inline]
    pub fn eval(&self, row: &Row) -> DataResult<Value> {
        (self.0)(row)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Expr")
    }
}

/// Integer division failing on a zero divisor.
pub fn checked_div(a: &Value, b: &Value) -> DataResult<Value> {
    match (a, b) {
        (_, Value::Int(0)) => Err(DataError::DivisionByZero),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.div_euclid(*y))),
        (x, y) => {
            let n = x.as_float().ok_or_else(|| DataError::coercion(x, DataType::Float))?;
            let d = y.as_float().ok_or_else(|| DataError::coercion(y, DataType::Float))?;
            if d == 0.0 {
                return Err(DataError::DivisionByZero);
            }
            Ok(Value::Float(n / d))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::row;

    #[test]
    fn test_col_and_lit() {
        let row = row![1i64, "a"];
        assert_eq!(Expr::col(1).eval(&row), Ok(Value::from("a")));
        assert_eq!(
            Expr::col(5).eval(&row),
            Err(DataError::MissingColumn { index: 5 })
        );
        assert_eq!(Expr::lit(3i64).eval(&row), Ok(Value::Int(3)));
    }

    #[test]
    fn test_checked_div() {
        assert_eq!(checked_div(&Value::Int(7), &Value::Int(2)), Ok(Value::Int(3)));
        assert_eq!(
            checked_div(&Value::Int(7), &Value::Int(0)),
            Err(DataError::DivisionByZero)
        );
        assert_eq!(
            checked_div(&Value::Float(1.0), &Value::Int(4)),
            Ok(Value::Float(0.25))
        );
        assert!(checked_div(&Value::from("x"), &Value::Int(1)).is_err());
    }
}
