//! Runtime values of the probabilistic language.
//!
//! Values are immutable and share their payloads through `Arc`, so cloning
//! a value is cheap and a value can never reach itself.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    sync::{Arc, RwLock},
};

use faer::Mat;

use crate::{
    error::{Result, TraceError},
    node::NodeId,
    psp::Sp,
};

#[derive(Clone, Debug)]
pub enum Value {
    Number(f64),
    Atom(usize),
    Bool(bool),
    Symbol(Arc<str>),
    Nil,
    Pair(Arc<Value>, Arc<Value>),
    Vector(Arc<[f64]>),
    Matrix(Arc<MatrixValue>),
    Procedure(SpRef),
    Environment(Env),
}

/// A dense matrix, optionally known to be symmetric.
#[derive(Clone, Debug)]
pub struct MatrixValue {
    data: Mat<f64>,
    symmetric: bool,
}

impl MatrixValue {
    pub fn new(data: Mat<f64>) -> MatrixValue {
        MatrixValue {
            data,
            symmetric: false,
        }
    }

    /// Fails unless the matrix is square and equal to its transpose.
    pub fn symmetric(data: Mat<f64>) -> Result<MatrixValue> {
        let n = data.nrows();
        if data.ncols() != n {
            return Err(TraceError::domain(format!(
                "symmetric matrix must be square, got {}x{}",
                n,
                data.ncols()
            )));
        }
        for i in 0..n {
            for j in 0..i {
                if data[(i, j)] != data[(j, i)] {
                    return Err(TraceError::domain(format!(
                        "matrix is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }
        Ok(MatrixValue {
            data,
            symmetric: true,
        })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<MatrixValue> {
        let ncols = rows.first().map(|row| row.len()).unwrap_or(0);
        if rows.iter().any(|row| row.len() != ncols) {
            return Err(TraceError::domain("matrix rows have different lengths"));
        }
        let data = Mat::from_fn(rows.len(), ncols, |i, j| rows[i][j]);
        Ok(MatrixValue::new(data))
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[(row, col)]
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn data(&self) -> &Mat<f64> {
        &self.data
    }

    fn total_cmp(&self, other: &MatrixValue) -> Ordering {
        self.nrows()
            .cmp(&other.nrows())
            .then_with(|| self.ncols().cmp(&other.ncols()))
            .then_with(|| {
                for i in 0..self.nrows() {
                    for j in 0..self.ncols() {
                        let ord = self.get(i, j).total_cmp(&other.get(i, j));
                        if ord.is_ne() {
                            return ord;
                        }
                    }
                }
                Ordering::Equal
            })
    }
}

/// Reference to a stochastic procedure.
///
/// The procedure itself is immutable. Its sufficient statistics and the
/// families it requested live in the trace, keyed by `maker`, the node
/// whose application produced the procedure.
#[derive(Clone)]
pub struct SpRef {
    pub maker: NodeId,
    pub sp: Arc<Sp>,
}

impl SpRef {
    pub fn new(maker: NodeId, sp: Sp) -> SpRef {
        SpRef {
            maker,
            sp: Arc::new(sp),
        }
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.sp) as usize
    }
}

impl fmt::Debug for SpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpRef({}, made at node {})", self.sp.name(), self.maker)
    }
}

struct Frame {
    bindings: RwLock<BTreeMap<Arc<str>, NodeId>>,
    parent: Option<Env>,
}

/// A chain of frames binding symbols to trace nodes.
#[derive(Clone)]
pub struct Env(Arc<Frame>);

impl Env {
    pub fn new() -> Env {
        Env(Arc::new(Frame {
            bindings: RwLock::new(BTreeMap::new()),
            parent: None,
        }))
    }

    pub fn extend(&self, bindings: impl IntoIterator<Item = (Arc<str>, NodeId)>) -> Env {
        Env(Arc::new(Frame {
            bindings: RwLock::new(bindings.into_iter().collect()),
            parent: Some(self.clone()),
        }))
    }

    pub fn bind(&self, symbol: impl Into<Arc<str>>, node: NodeId) {
        self.0
            .bindings
            .write()
            .expect("Poisoned environment lock")
            .insert(symbol.into(), node);
    }

    pub fn unbind(&self, symbol: &str) -> Option<NodeId> {
        self.0
            .bindings
            .write()
            .expect("Poisoned environment lock")
            .remove(symbol)
    }

    pub fn find(&self, symbol: &str) -> Option<NodeId> {
        let mut frame = Some(self);
        while let Some(env) = frame {
            let found = env
                .0
                .bindings
                .read()
                .expect("Poisoned environment lock")
                .get(symbol)
                .copied();
            if found.is_some() {
                return found;
            }
            frame = env.0.parent.as_ref();
        }
        None
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings = self.0.bindings.read().expect("Poisoned environment lock");
        f.debug_struct("Env")
            .field("symbols", &bindings.keys().collect::<Vec<_>>())
            .field("has_parent", &self.0.parent.is_some())
            .finish()
    }
}

impl Value {
    pub fn symbol(name: &str) -> Value {
        Value::Symbol(name.into())
    }

    pub fn vector(values: Vec<f64>) -> Value {
        Value::Vector(values.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        items
            .into_iter()
            .rev()
            .fold(Value::Nil, |tail, head| {
                Value::Pair(Arc::new(head), Arc::new(tail))
            })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Atom(_) => "atom",
            Value::Bool(_) => "boolean",
            Value::Symbol(_) => "symbol",
            Value::Nil => "nil",
            Value::Pair(..) => "pair",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
            Value::Procedure(_) => "procedure",
            Value::Environment(_) => "environment",
        }
    }

    pub fn as_number(&self) -> Result<f64> {
        match self {
            Value::Number(x) => Ok(*x),
            other => Err(TraceError::type_mismatch("number", other.type_name())),
        }
    }

    pub fn as_atom(&self) -> Result<usize> {
        match self {
            Value::Atom(x) => Ok(*x),
            other => Err(TraceError::type_mismatch("atom", other.type_name())),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(x) => Ok(*x),
            other => Err(TraceError::type_mismatch("boolean", other.type_name())),
        }
    }

    pub fn as_symbol(&self) -> Result<&str> {
        match self {
            Value::Symbol(name) => Ok(name),
            other => Err(TraceError::type_mismatch("symbol", other.type_name())),
        }
    }

    pub fn as_vector(&self) -> Result<&[f64]> {
        match self {
            Value::Vector(values) => Ok(values),
            other => Err(TraceError::type_mismatch("vector", other.type_name())),
        }
    }

    pub fn as_matrix(&self) -> Result<&MatrixValue> {
        match self {
            Value::Matrix(matrix) => Ok(matrix),
            other => Err(TraceError::type_mismatch("matrix", other.type_name())),
        }
    }

    pub fn as_procedure(&self) -> Result<&SpRef> {
        match self {
            Value::Procedure(sp) => Ok(sp),
            other => Err(TraceError::type_mismatch("procedure", other.type_name())),
        }
    }

    pub fn as_environment(&self) -> Result<&Env> {
        match self {
            Value::Environment(env) => Ok(env),
            other => Err(TraceError::type_mismatch("environment", other.type_name())),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Elements of a proper list.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut rest = self;
        loop {
            match rest {
                Value::Nil => return Ok(items),
                Value::Pair(head, tail) => {
                    items.push((**head).clone());
                    rest = &**tail;
                }
                other => {
                    return Err(TraceError::type_mismatch(
                        "proper list",
                        other.type_name(),
                    ))
                }
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Number(_) => 0,
            Value::Atom(_) => 1,
            Value::Bool(_) => 2,
            Value::Symbol(_) => 3,
            Value::Nil => 4,
            Value::Pair(..) => 5,
            Value::Vector(_) => 6,
            Value::Matrix(_) => 7,
            Value::Procedure(_) => 8,
            Value::Environment(_) => 9,
        }
    }
}

fn total_cmp_slices(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.total_cmp(y))
        .find(|ord| ord.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

// Floats compare by `total_cmp`, so equality is bit equality and values
// can key ordered maps (scopes, blocks, family ids).
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Atom(a), Value::Atom(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Symbol(a), Value::Symbol(b)) => a.cmp(b),
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Pair(h1, t1), Value::Pair(h2, t2)) => h1.cmp(h2).then_with(|| t1.cmp(t2)),
            (Value::Vector(a), Value::Vector(b)) => total_cmp_slices(a, b),
            (Value::Matrix(a), Value::Matrix(b)) => a.total_cmp(b),
            (Value::Procedure(a), Value::Procedure(b)) => a
                .maker
                .cmp(&b.maker)
                .then_with(|| a.address().cmp(&b.address())),
            (Value::Environment(a), Value::Environment(b)) => a.address().cmp(&b.address()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for Value {}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::vector(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(x) => write!(f, "{}", x),
            Value::Atom(x) => write!(f, "a[{}]", x),
            Value::Bool(true) => write!(f, "true"),
            Value::Bool(false) => write!(f, "false"),
            Value::Symbol(name) => write!(f, "{}", name),
            Value::Nil => write!(f, "()"),
            Value::Pair(head, tail) => match self.to_vec() {
                Ok(items) => {
                    write!(f, "(")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{}", item)?;
                    }
                    write!(f, ")")
                }
                Err(_) => write!(f, "({} . {})", head, tail),
            },
            Value::Vector(values) => write!(f, "{:?}", values),
            Value::Matrix(matrix) => write!(f, "<matrix {}x{}>", matrix.nrows(), matrix.ncols()),
            Value::Procedure(sp) => write!(f, "<procedure {}>", sp.sp.name()),
            Value::Environment(_) => write!(f, "<environment>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lists_round_trip_through_pairs() {
        let list = Value::list(vec![Value::symbol("normal"), 0.0.into(), 1.0.into()]);
        assert_eq!(list.to_string(), "(normal 0 1)");
        let items = list.to_vec().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::symbol("normal"));
        assert!(Value::Nil.to_vec().unwrap().is_empty());
    }

    #[test]
    fn improper_list_is_a_type_error() {
        let pair = Value::Pair(Arc::new(1.0.into()), Arc::new(2.0.into()));
        assert!(matches!(
            pair.to_vec(),
            Err(TraceError::TypeMismatch { .. })
        ));
        assert_eq!(pair.to_string(), "(1 . 2)");
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Number(0.0), Value::Number(-0.0));
        assert!(Value::Number(1.0) < Value::Atom(0));
        assert!(Value::vector(vec![1.0]) < Value::vector(vec![1.0, 0.0]));
    }

    #[test]
    fn environments_chain_lookups() {
        let global = Env::new();
        global.bind("x", NodeId(1));
        let local = global.extend([(Arc::from("y"), NodeId(2))]);
        assert_eq!(local.find("x"), Some(NodeId(1)));
        assert_eq!(local.find("y"), Some(NodeId(2)));
        assert_eq!(global.find("y"), None);

        // Later bindings in an outer frame are visible to inner frames.
        global.bind("z", NodeId(3));
        assert_eq!(local.find("z"), Some(NodeId(3)));
        assert_eq!(global.unbind("z"), Some(NodeId(3)));
        assert_eq!(local.find("z"), None);
    }

    #[test]
    fn symmetric_matrix_is_checked() {
        let ok = MatrixValue::from_rows(&[vec![1.0, 0.5], vec![0.5, 2.0]]).unwrap();
        assert!(MatrixValue::symmetric(ok.data().clone()).is_ok());
        let bad = MatrixValue::from_rows(&[vec![1.0, 0.5], vec![0.4, 2.0]]).unwrap();
        assert!(MatrixValue::symmetric(bad.data().clone()).is_err());
        assert!(MatrixValue::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
