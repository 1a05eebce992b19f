use std::fmt;
use std::sync::Arc;

use bson::{Bson, Document};
use regex::Regex;

/// Host-supplied predicate for `$where`. Receives the whole item.
pub type WherePredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// A recursive selector tree.
///
/// One node carries a flat conjunction of field constraints plus any number
/// of nested `$and` / `$or` branches; all three parts conjoin. The empty
/// node matches every item.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    pub fields: Vec<(String, FieldPredicate)>,
    pub and: Vec<Selector>,
    pub or: Vec<Selector>,
}

impl Selector {
    /// The selector that matches every item.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.and.is_empty() && self.or.is_empty()
    }

    /// Single-field equality, the most common shape.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self {
            fields: vec![(field.into(), FieldPredicate::Value(value.into()))],
            ..Self::default()
        }
    }

    /// Attach a `$where` predicate. Only reachable through the typed API;
    /// BSON parsing cannot produce one.
    pub fn and_where(mut self, predicate: WherePredicate) -> Self {
        self.fields
            .push((String::new(), FieldPredicate::Ops(vec![FieldOp::Where(predicate)])));
        self
    }

    /// Look up the predicate for a field in the flat part.
    pub fn field(&self, name: &str) -> Option<&FieldPredicate> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, predicate)| predicate)
    }
}

/// Constraint on a single field: a direct value (implicit `$eq`, with
/// array-contains semantics) or a conjunction of operators.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPredicate {
    Value(Bson),
    Ops(Vec<FieldOp>),
}

/// The closed field-operator set.
#[derive(Clone)]
pub enum FieldOp {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Not(Box<FieldPredicate>),
    Mod { divisor: i64, remainder: i64 },
    Regex(Regex),
    All(Vec<Bson>),
    ElemMatch(ElemMatch),
    Size(usize),
    BitsAllSet(u64),
    BitsAllClear(u64),
    BitsAnySet(u64),
    BitsAnyClear(u64),
    /// Case-insensitive substring search over string fields.
    Text(String),
    /// Structural check: `bsonType`/`type`, `required`, nested `properties`.
    JsonSchema(Document),
    /// Two-operand comparison over `"$field"` references and literals.
    Expr(Bson),
    /// Host closure over the whole item.
    Where(WherePredicate),
}

/// `$elemMatch` comes in two shapes: a sub-selector applied to array
/// elements that are documents, or an operator list applied to scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum ElemMatch {
    Selector(Box<Selector>),
    Ops(Vec<FieldOp>),
}

impl fmt::Debug for FieldOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldOp::Eq(v) => f.debug_tuple("Eq").field(v).finish(),
            FieldOp::Ne(v) => f.debug_tuple("Ne").field(v).finish(),
            FieldOp::Gt(v) => f.debug_tuple("Gt").field(v).finish(),
            FieldOp::Gte(v) => f.debug_tuple("Gte").field(v).finish(),
            FieldOp::Lt(v) => f.debug_tuple("Lt").field(v).finish(),
            FieldOp::Lte(v) => f.debug_tuple("Lte").field(v).finish(),
            FieldOp::In(v) => f.debug_tuple("In").field(v).finish(),
            FieldOp::Nin(v) => f.debug_tuple("Nin").field(v).finish(),
            FieldOp::Exists(b) => f.debug_tuple("Exists").field(b).finish(),
            FieldOp::Not(p) => f.debug_tuple("Not").field(p).finish(),
            FieldOp::Mod { divisor, remainder } => f
                .debug_struct("Mod")
                .field("divisor", divisor)
                .field("remainder", remainder)
                .finish(),
            FieldOp::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            FieldOp::All(v) => f.debug_tuple("All").field(v).finish(),
            FieldOp::ElemMatch(e) => f.debug_tuple("ElemMatch").field(e).finish(),
            FieldOp::Size(n) => f.debug_tuple("Size").field(n).finish(),
            FieldOp::BitsAllSet(m) => f.debug_tuple("BitsAllSet").field(m).finish(),
            FieldOp::BitsAllClear(m) => f.debug_tuple("BitsAllClear").field(m).finish(),
            FieldOp::BitsAnySet(m) => f.debug_tuple("BitsAnySet").field(m).finish(),
            FieldOp::BitsAnyClear(m) => f.debug_tuple("BitsAnyClear").field(m).finish(),
            FieldOp::Text(s) => f.debug_tuple("Text").field(s).finish(),
            FieldOp::JsonSchema(d) => f.debug_tuple("JsonSchema").field(d).finish(),
            FieldOp::Expr(e) => f.debug_tuple("Expr").field(e).finish(),
            FieldOp::Where(_) => f.write_str("Where(<fn>)"),
        }
    }
}

// Regex and Where carry no structural equality; compare Regex by pattern
// and Where by pointer identity.
impl PartialEq for FieldOp {
    fn eq(&self, other: &Self) -> bool {
        use FieldOp::*;
        match (self, other) {
            (Eq(a), Eq(b)) | (Ne(a), Ne(b)) | (Gt(a), Gt(b)) | (Gte(a), Gte(b))
            | (Lt(a), Lt(b)) | (Lte(a), Lte(b)) | (Expr(a), Expr(b)) => a == b,
            (In(a), In(b)) | (Nin(a), Nin(b)) | (All(a), All(b)) => a == b,
            (Exists(a), Exists(b)) => a == b,
            (Not(a), Not(b)) => a == b,
            (
                Mod { divisor: d1, remainder: r1 },
                Mod { divisor: d2, remainder: r2 },
            ) => d1 == d2 && r1 == r2,
            (Regex(a), Regex(b)) => a.as_str() == b.as_str(),
            (ElemMatch(a), ElemMatch(b)) => a == b,
            (Size(a), Size(b)) => a == b,
            (BitsAllSet(a), BitsAllSet(b))
            | (BitsAllClear(a), BitsAllClear(b))
            | (BitsAnySet(a), BitsAnySet(b))
            | (BitsAnyClear(a), BitsAnyClear(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (JsonSchema(a), JsonSchema(b)) => a == b,
            (Where(a), Where(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
