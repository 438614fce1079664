use crate::core::errors::*;
use crate::core::value::Value;

/// The fixed operator set understood by `BTree::query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Every entry.
    Any,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    /// Between, inclusive on both ends.
    Bw,
    /// Between, exclusive on both ends.
    Bwx,
    Nbw,
    Nbwx,
    /// Starts with.
    Sw,
    Nsw,
    /// Member of a set.
    In,
    Nin,
}

impl Operator {
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Operator::Any => (0, Some(0)),
            Operator::Eq
            | Operator::Neq
            | Operator::Lt
            | Operator::Leq
            | Operator::Gt
            | Operator::Geq
            | Operator::Sw
            | Operator::Nsw => (1, Some(1)),
            Operator::Bw | Operator::Bwx | Operator::Nbw | Operator::Nbwx => (2, Some(2)),
            Operator::In | Operator::Nin => (1, None),
        }
    }
}

/// Receives matching entries from a query, in ascending order within each
/// visited leaf. Returning `false` stops the scan.
pub trait BTreeCallback {
    fn index_info(&mut self, value: &Value, pointer: i64) -> bool;
}

impl<F> BTreeCallback for F
where
    F: FnMut(&Value, i64) -> bool,
{
    fn index_info(&mut self, value: &Value, pointer: i64) -> bool {
        self(value, pointer)
    }
}

/// Smallest value greater than every value starting with `prefix`, if any.
fn prefix_successor(prefix: &Value) -> Option<Value> {
    let mut bytes = prefix.to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return Some(Value::from(bytes));
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct IndexQuery {
    operator: Operator,
    values: Vec<Value>,
    prefix_end: Option<Value>,
}

impl IndexQuery {
    /// Builds a query, checking the number of bound values. `In`/`Nin` sets
    /// are sorted and deduplicated.
    pub fn new(operator: Operator, mut values: Vec<Value>) -> Result<Self> {
        let (min, max) = operator.arity();
        if values.len() < min || max.is_some_and(|max| values.len() > max) {
            return Err(Error::BTree {
                fault: FaultCode::GenericError,
                message: format!(
                    "{:?} query takes {} value(s), got {}",
                    operator,
                    match max {
                        Some(max) if max == min => min.to_string(),
                        Some(max) => format!("{}..{}", min, max),
                        None => format!("at least {}", min),
                    },
                    values.len()
                ),
            });
        }

        if matches!(operator, Operator::In | Operator::Nin) {
            values.sort();
            values.dedup();
        }

        let prefix_end = match operator {
            Operator::Sw | Operator::Nsw => prefix_successor(&values[0]),
            _ => None,
        };

        Ok(Self {
            operator,
            values,
            prefix_end,
        })
    }

    fn single(operator: Operator, value: impl Into<Value>) -> Self {
        let value = value.into();
        let prefix_end = match operator {
            Operator::Sw | Operator::Nsw => prefix_successor(&value),
            _ => None,
        };
        Self {
            operator,
            values: vec![value],
            prefix_end,
        }
    }

    fn pair(operator: Operator, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self {
            operator,
            values: vec![low.into(), high.into()],
            prefix_end: None,
        }
    }

    pub fn any() -> Self {
        Self {
            operator: Operator::Any,
            values: Vec::new(),
            prefix_end: None,
        }
    }

    pub fn eq(value: impl Into<Value>) -> Self {
        Self::single(Operator::Eq, value)
    }

    pub fn neq(value: impl Into<Value>) -> Self {
        Self::single(Operator::Neq, value)
    }

    pub fn lt(value: impl Into<Value>) -> Self {
        Self::single(Operator::Lt, value)
    }

    pub fn leq(value: impl Into<Value>) -> Self {
        Self::single(Operator::Leq, value)
    }

    pub fn gt(value: impl Into<Value>) -> Self {
        Self::single(Operator::Gt, value)
    }

    pub fn geq(value: impl Into<Value>) -> Self {
        Self::single(Operator::Geq, value)
    }

    pub fn between(low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::pair(Operator::Bw, low, high)
    }

    pub fn between_exclusive(low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::pair(Operator::Bwx, low, high)
    }

    pub fn not_between(low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::pair(Operator::Nbw, low, high)
    }

    pub fn not_between_exclusive(low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::pair(Operator::Nbwx, low, high)
    }

    pub fn starts_with(prefix: impl Into<Value>) -> Self {
        Self::single(Operator::Sw, prefix)
    }

    pub fn not_starts_with(prefix: impl Into<Value>) -> Self {
        Self::single(Operator::Nsw, prefix)
    }

    pub fn in_set<I, V>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(Operator::In, values.into_iter().map(Into::into).collect())
    }

    pub fn not_in_set<I, V>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(Operator::Nin, values.into_iter().map(Into::into).collect())
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Exclusive upper end of the `Sw`/`Nsw` prefix range; `None` when the
    /// prefix is all `0xff` bytes (or the operator is not a prefix test).
    pub fn prefix_end(&self) -> Option<&Value> {
        self.prefix_end.as_ref()
    }

    fn first(&self) -> &Value {
        &self.values[0]
    }

    fn last(&self) -> &Value {
        &self.values[self.values.len() - 1]
    }

    /// Exact predicate applied to every leaf entry the scan reaches.
    pub fn test_value(&self, value: &Value) -> bool {
        match self.operator {
            Operator::Any => true,
            Operator::Eq => value == self.first(),
            Operator::Neq => value != self.first(),
            Operator::Lt => value < self.first(),
            Operator::Leq => value <= self.first(),
            Operator::Gt => value > self.first(),
            Operator::Geq => value >= self.first(),
            Operator::Bw => value >= self.first() && value <= self.last(),
            Operator::Bwx => value > self.first() && value < self.last(),
            Operator::Nbw => value < self.first() || value > self.last(),
            Operator::Nbwx => value <= self.first() || value >= self.last(),
            Operator::Sw => value.starts_with(self.first()),
            Operator::Nsw => !value.starts_with(self.first()),
            Operator::In => self.values.binary_search(value).is_ok(),
            Operator::Nin => self.values.binary_search(value).is_err(),
        }
    }

    /// Smallest value a match can have, for operators with a lower bound.
    pub(crate) fn lower_bound(&self) -> Option<&Value> {
        match self.operator {
            Operator::Eq
            | Operator::Gt
            | Operator::Geq
            | Operator::Bw
            | Operator::Bwx
            | Operator::Sw
            | Operator::In => Some(self.first()),
            _ => None,
        }
    }

    /// True once a leaf scan in ascending order can no longer find matches.
    pub(crate) fn past_upper(&self, value: &Value) -> bool {
        match self.operator {
            Operator::Eq | Operator::Lt | Operator::Leq => value > self.first(),
            Operator::Bw | Operator::Bwx | Operator::In => value > self.last(),
            Operator::Sw => self.prefix_end.as_ref().is_some_and(|end| value >= end),
            _ => false,
        }
    }
}
