//! Value Extraction
//!
//! Extractors turn the raw reply payload of a PID request into a typed value
//! for one consumer. Several consumers may read the same payload in
//! different ways; a failing extractor only affects its own consumer.

use crate::error::{ConfigError, ExtractError};
use evalexpr::{build_operator_tree, ContextWithMutableVariables, HashMapContext, Node, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Maximum number of bytes an index composition may combine
pub const MAX_COMPOSED_BYTES: usize = 4;

/// A pure function from reply payload to a typed value
pub trait Extract {
    /// Decoded value type
    type Output;

    /// Decode `payload`
    fn extract(&self, payload: &[u8]) -> Result<Self::Output, ExtractError>;
}

/// User supplied extraction closure
pub struct CustomFn<T>(Arc<dyn Fn(&[u8]) -> Result<T, ExtractError> + Send + Sync>);

impl<T> CustomFn<T> {
    /// Wrap a closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<T, ExtractError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Run the closure; a panic is reported as [`ExtractError::Panicked`]
    pub fn call(&self, payload: &[u8]) -> Result<T, ExtractError> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(payload))).unwrap_or(Err(ExtractError::Panicked))
    }
}

impl<T> Clone for CustomFn<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for CustomFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomFn(..)")
    }
}

/// Expression over the payload bytes, compiled once.
///
/// Payload bytes are bound as integers `b0`, `b1`, ... and the payload
/// length as `len`. Integer arithmetic stays integral, so write `/ 4.0`
/// where a fractional result is wanted.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    tree: Node,
}

impl Expression {
    /// Parse an expression
    pub fn compile(source: &str) -> Result<Self, ConfigError> {
        let tree = build_operator_tree(source).map_err(|e| ConfigError::InvalidExpression {
            expression: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            tree,
        })
    }

    /// Expression text as configured
    pub fn source(&self) -> &str {
        &self.source
    }

    fn evaluate(&self, payload: &[u8]) -> Result<Value, ExtractError> {
        let mut ctx = HashMapContext::new();
        ctx.set_value("len".to_string(), Value::Int(payload.len() as i64))
            .map_err(|e| ExtractError::Expression(e.to_string()))?;
        for (i, byte) in payload.iter().enumerate() {
            ctx.set_value(format!("b{i}"), Value::Int(*byte as i64))
                .map_err(|e| ExtractError::Expression(e.to_string()))?;
        }

        self.tree
            .eval_with_context(&ctx)
            .map_err(|e| ExtractError::Expression(e.to_string()))
    }
}

/// Numeric extraction policy
#[derive(Debug, Clone)]
pub enum NumericExtractor {
    /// Big-endian composition of 1 to 4 payload bytes
    Composed { indices: Vec<usize>, signed: bool },
    /// Configured expression
    Expression(Expression),
    /// Arbitrary closure
    Custom(CustomFn<f64>),
}

impl NumericExtractor {
    /// Index composition; `signed` sign-extends the first byte
    pub fn composed(indices: Vec<usize>, signed: bool) -> Result<Self, ConfigError> {
        if indices.is_empty() || indices.len() > MAX_COMPOSED_BYTES {
            return Err(ConfigError::IndexCount(indices.len()));
        }
        Ok(Self::Composed { indices, signed })
    }

    /// Expression extractor
    pub fn expression(source: &str) -> Result<Self, ConfigError> {
        Expression::compile(source).map(Self::Expression)
    }

    /// Closure extractor
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<f64, ExtractError> + Send + Sync + 'static,
    {
        Self::Custom(CustomFn::new(f))
    }
}

impl Extract for NumericExtractor {
    type Output = f64;

    fn extract(&self, payload: &[u8]) -> Result<f64, ExtractError> {
        match self {
            Self::Composed { indices, signed } => {
                compose(payload, indices, *signed).map(|v| v as f64)
            }
            Self::Expression(expr) => match expr.evaluate(payload)? {
                Value::Int(v) => Ok(v as f64),
                Value::Float(v) => Ok(v),
                Value::Boolean(v) => Ok(if v { 1.0 } else { 0.0 }),
                other => Err(ExtractError::UnexpectedType(format!("{other:?}"))),
            },
            Self::Custom(f) => f.call(payload),
        }
    }
}

/// Boolean extraction policy
#[derive(Debug, Clone)]
pub enum BinaryExtractor {
    /// `(payload[index] & mask) == mask`
    Masked { index: usize, mask: u8 },
    /// Configured expression; numbers map to `!= 0`
    Expression(Expression),
    /// Arbitrary closure
    Custom(CustomFn<bool>),
}

impl BinaryExtractor {
    /// Index-mask extractor
    pub fn masked(index: usize, mask: u8) -> Self {
        Self::Masked { index, mask }
    }

    /// Expression extractor
    pub fn expression(source: &str) -> Result<Self, ConfigError> {
        Expression::compile(source).map(Self::Expression)
    }

    /// Closure extractor
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<bool, ExtractError> + Send + Sync + 'static,
    {
        Self::Custom(CustomFn::new(f))
    }
}

impl Extract for BinaryExtractor {
    type Output = bool;

    fn extract(&self, payload: &[u8]) -> Result<bool, ExtractError> {
        match self {
            Self::Masked { index, mask } => {
                let byte = byte_at(payload, *index)?;
                Ok(byte & mask == *mask)
            }
            Self::Expression(expr) => match expr.evaluate(payload)? {
                Value::Boolean(v) => Ok(v),
                Value::Int(v) => Ok(v != 0),
                Value::Float(v) => Ok(v != 0.0),
                other => Err(ExtractError::UnexpectedType(format!("{other:?}"))),
            },
            Self::Custom(f) => f.call(payload),
        }
    }
}

/// Compose payload bytes big-endian in index order.
///
/// With `signed`, the first byte is read as `i8` and its sign extends into
/// the result; later bytes are always unsigned.
pub fn compose(payload: &[u8], indices: &[usize], signed: bool) -> Result<i64, ExtractError> {
    let mut value: i64 = 0;
    for (k, &index) in indices.iter().enumerate() {
        let byte = byte_at(payload, index)?;
        value = if k == 0 && signed {
            byte as i8 as i64
        } else {
            (value << 8) | byte as i64
        };
    }
    Ok(value)
}

fn byte_at(payload: &[u8], index: usize) -> Result<u8, ExtractError> {
    payload
        .get(index)
        .copied()
        .ok_or(ExtractError::IndexOutOfBounds {
            index,
            len: payload.len(),
        })
}
