use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Time offset at which a variable enters an equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeOffset {
    /// Previous period, `t - 1`.
    Lag,
    /// Current period, `t`.
    Current,
    /// Next period, `t + 1`, inside the conditional expectation.
    Lead,
}

/// A declared variable at a specific time offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub var: usize,
    pub offset: TimeOffset,
}

/// Unary functions understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exp,
    Ln,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Abs,
    Signum,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Exp => "exp",
            Func::Ln => "ln",
            Func::Sqrt => "sqrt",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Abs => "abs",
            Func::Signum => "signum",
        }
    }

    pub fn eval(self, x: f64) -> f64 {
        match self {
            Func::Exp => x.exp(),
            Func::Ln => x.ln(),
            Func::Sqrt => x.sqrt(),
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Tan => x.tan(),
            Func::Abs => x.abs(),
            Func::Signum => x.signum(),
        }
    }
}

/// Expression node. `Expr` is the shared, immutable handle around this.
#[derive(Debug, PartialEq)]
pub(crate) enum Node {
    Const(f64),
    Var(VarRef),
    Param(usize),
    Neg(Expr),
    Add(Expr, Expr),
    Sub(Expr, Expr),
    Mul(Expr, Expr),
    Div(Expr, Expr),
    Pow(Expr, Expr),
    Call(Func, Expr),
}

/// Shared handle to an immutable expression tree.
///
/// Cloning is cheap: handles are reference counted, and derivative
/// construction reuses subtrees instead of copying them. The count is
/// atomic so models and their derivative tables can move across threads in
/// parameter sweeps. Constructors fold constants aggressively so that
/// derivatives of expressions which do not involve a variable collapse to
/// the zero constant. Structural sparsity therefore survives
/// differentiation and can be queried with [`Expr::is_zero`].
#[derive(Debug, Clone, PartialEq)]
pub struct Expr(Arc<Node>);

/// Marker returned when an operator has no derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonDifferentiable {
    pub operator: &'static str,
}

impl Expr {
    pub fn constant(value: f64) -> Self {
        Expr(Arc::new(Node::Const(value)))
    }

    pub fn var(index: usize, offset: TimeOffset) -> Self {
        Expr(Arc::new(Node::Var(VarRef { var: index, offset })))
    }

    pub fn var_ref(reference: VarRef) -> Self {
        Expr(Arc::new(Node::Var(reference)))
    }

    pub fn param(index: usize) -> Self {
        Expr(Arc::new(Node::Param(index)))
    }

    pub(crate) fn node(&self) -> &Node {
        &self.0
    }

    /// Address of the shared node, usable as an identity key for caches.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn as_const(&self) -> Option<f64> {
        match &*self.0 {
            Node::Const(c) => Some(*c),
            _ => None,
        }
    }

    fn is_const(&self, value: f64) -> bool {
        self.as_const() == Some(value)
    }

    /// True when the expression is the literal zero constant.
    pub fn is_zero(&self) -> bool {
        self.is_const(0.0)
    }

    pub fn pow(&self, exponent: &Expr) -> Expr {
        fold_pow(self, exponent)
    }

    pub fn powf(&self, exponent: f64) -> Expr {
        fold_pow(self, &Expr::constant(exponent))
    }

    pub fn exp(&self) -> Expr {
        fold_call(Func::Exp, self)
    }

    pub fn ln(&self) -> Expr {
        fold_call(Func::Ln, self)
    }

    pub fn sqrt(&self) -> Expr {
        fold_call(Func::Sqrt, self)
    }

    pub fn sin(&self) -> Expr {
        fold_call(Func::Sin, self)
    }

    pub fn cos(&self) -> Expr {
        fold_call(Func::Cos, self)
    }

    pub fn tan(&self) -> Expr {
        fold_call(Func::Tan, self)
    }

    pub fn abs(&self) -> Expr {
        fold_call(Func::Abs, self)
    }

    pub fn signum(&self) -> Expr {
        fold_call(Func::Signum, self)
    }

    /// Partial derivative with respect to `with`, as a new expression.
    ///
    /// Derivatives of subtrees that do not involve `with` collapse to the
    /// zero constant before any differentiability check, so `abs` and
    /// `signum` are allowed in parameter-only scale factors but fail as soon
    /// as they are differentiated through.
    pub fn diff(&self, with: VarRef) -> Result<Expr, NonDifferentiable> {
        let zero = Expr::constant(0.0);
        let one = Expr::constant(1.0);
        match &*self.0 {
            Node::Const(_) | Node::Param(_) => Ok(zero),
            Node::Var(v) => Ok(if *v == with { one } else { zero }),
            Node::Neg(a) => Ok(fold_neg(&a.diff(with)?)),
            Node::Add(a, b) => Ok(fold_add(&a.diff(with)?, &b.diff(with)?)),
            Node::Sub(a, b) => Ok(fold_sub(&a.diff(with)?, &b.diff(with)?)),
            Node::Mul(a, b) => {
                let da = a.diff(with)?;
                let db = b.diff(with)?;
                Ok(fold_add(&fold_mul(&da, b), &fold_mul(a, &db)))
            }
            Node::Div(a, b) => {
                let da = a.diff(with)?;
                let db = b.diff(with)?;
                let first = fold_div(&da, b);
                let second = fold_div(&fold_mul(a, &db), &fold_mul(b, b));
                Ok(fold_sub(&first, &second))
            }
            Node::Pow(a, b) => {
                let da = a.diff(with)?;
                let db = b.diff(with)?;
                if db.is_zero() {
                    if da.is_zero() {
                        return Ok(zero);
                    }
                    // power rule: b * a^(b - 1) * da
                    let shifted = fold_sub(b, &one);
                    Ok(fold_mul(&fold_mul(b, &fold_pow(a, &shifted)), &da))
                } else if da.is_zero() {
                    // c^b * ln(c) * db
                    Ok(fold_mul(
                        &fold_mul(self, &fold_call(Func::Ln, a)),
                        &db,
                    ))
                } else {
                    // a^b * (db * ln(a) + b * da / a)
                    let ln_term = fold_mul(&db, &fold_call(Func::Ln, a));
                    let ratio = fold_div(&fold_mul(b, &da), a);
                    Ok(fold_mul(self, &fold_add(&ln_term, &ratio)))
                }
            }
            Node::Call(f, a) => {
                let da = a.diff(with)?;
                if da.is_zero() {
                    return Ok(zero);
                }
                let two = Expr::constant(2.0);
                let outer = match f {
                    Func::Exp => fold_call(Func::Exp, a),
                    Func::Ln => fold_div(&one, a),
                    Func::Sqrt => fold_div(&one, &fold_mul(&two, &fold_call(Func::Sqrt, a))),
                    Func::Sin => fold_call(Func::Cos, a),
                    Func::Cos => fold_neg(&fold_call(Func::Sin, a)),
                    Func::Tan => fold_div(&one, &fold_pow(&fold_call(Func::Cos, a), &two)),
                    Func::Abs | Func::Signum => {
                        return Err(NonDifferentiable { operator: f.name() })
                    }
                };
                Ok(fold_mul(&outer, &da))
            }
        }
    }

    /// Collects every variable reference appearing in the tree.
    pub fn collect_var_refs(&self, out: &mut BTreeSet<VarRef>) {
        match &*self.0 {
            Node::Const(_) | Node::Param(_) => {}
            Node::Var(v) => {
                out.insert(*v);
            }
            Node::Neg(a) | Node::Call(_, a) => a.collect_var_refs(out),
            Node::Add(a, b) | Node::Sub(a, b) | Node::Mul(a, b) | Node::Div(a, b)
            | Node::Pow(a, b) => {
                a.collect_var_refs(out);
                b.collect_var_refs(out);
            }
        }
    }

    /// Collects every parameter index appearing in the tree.
    pub fn collect_params(&self, out: &mut BTreeSet<usize>) {
        match &*self.0 {
            Node::Const(_) | Node::Var(_) => {}
            Node::Param(i) => {
                out.insert(*i);
            }
            Node::Neg(a) | Node::Call(_, a) => a.collect_params(out),
            Node::Add(a, b) | Node::Sub(a, b) | Node::Mul(a, b) | Node::Div(a, b)
            | Node::Pow(a, b) => {
                a.collect_params(out);
                b.collect_params(out);
            }
        }
    }

    /// Direct tree-walk evaluation. The bytecode path in [`crate::evaluator`]
    /// is what the pipeline uses; this is the reference implementation the
    /// compiled form is checked against.
    pub fn eval(&self, value_of: &dyn Fn(VarRef) -> f64, params: &[f64]) -> f64 {
        match &*self.0 {
            Node::Const(c) => *c,
            Node::Var(v) => value_of(*v),
            Node::Param(i) => params[*i],
            Node::Neg(a) => -a.eval(value_of, params),
            Node::Add(a, b) => a.eval(value_of, params) + b.eval(value_of, params),
            Node::Sub(a, b) => a.eval(value_of, params) - b.eval(value_of, params),
            Node::Mul(a, b) => a.eval(value_of, params) * b.eval(value_of, params),
            Node::Div(a, b) => a.eval(value_of, params) / b.eval(value_of, params),
            Node::Pow(a, b) => a.eval(value_of, params).powf(b.eval(value_of, params)),
            Node::Call(f, a) => f.eval(a.eval(value_of, params)),
        }
    }

    fn precedence(&self) -> u8 {
        match &*self.0 {
            Node::Add(..) | Node::Sub(..) => 1,
            Node::Mul(..) | Node::Div(..) => 2,
            Node::Neg(..) => 3,
            Node::Pow(..) => 4,
            Node::Const(_) | Node::Var(_) | Node::Param(_) | Node::Call(..) => 5,
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        let prec = self.precedence();
        if prec < parent {
            write!(f, "(")?;
        }
        match &*self.0 {
            Node::Const(c) => write!(f, "{c}")?,
            Node::Var(v) => match v.offset {
                TimeOffset::Lag => write!(f, "v{}(-1)", v.var)?,
                TimeOffset::Current => write!(f, "v{}", v.var)?,
                TimeOffset::Lead => write!(f, "v{}(+1)", v.var)?,
            },
            Node::Param(i) => write!(f, "p{i}")?,
            Node::Neg(a) => {
                write!(f, "-")?;
                a.fmt_prec(f, prec + 1)?;
            }
            Node::Add(a, b) => {
                a.fmt_prec(f, prec)?;
                write!(f, " + ")?;
                b.fmt_prec(f, prec + 1)?;
            }
            Node::Sub(a, b) => {
                a.fmt_prec(f, prec)?;
                write!(f, " - ")?;
                b.fmt_prec(f, prec + 1)?;
            }
            Node::Mul(a, b) => {
                a.fmt_prec(f, prec)?;
                write!(f, " * ")?;
                b.fmt_prec(f, prec + 1)?;
            }
            Node::Div(a, b) => {
                a.fmt_prec(f, prec)?;
                write!(f, " / ")?;
                b.fmt_prec(f, prec + 1)?;
            }
            Node::Pow(a, b) => {
                a.fmt_prec(f, prec + 1)?;
                write!(f, "^")?;
                b.fmt_prec(f, prec)?;
            }
            Node::Call(func, a) => {
                write!(f, "{}(", func.name())?;
                a.fmt_prec(f, 0)?;
                write!(f, ")")?;
            }
        }
        if prec < parent {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, 0)
    }
}

pub(crate) fn fold_add(a: &Expr, b: &Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
        return Expr::constant(x + y);
    }
    if a.is_zero() {
        return b.clone();
    }
    if b.is_zero() {
        return a.clone();
    }
    Expr(Arc::new(Node::Add(a.clone(), b.clone())))
}

pub(crate) fn fold_sub(a: &Expr, b: &Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
        return Expr::constant(x - y);
    }
    if b.is_zero() {
        return a.clone();
    }
    if a.is_zero() {
        return fold_neg(b);
    }
    if Arc::ptr_eq(&a.0, &b.0) {
        return Expr::constant(0.0);
    }
    Expr(Arc::new(Node::Sub(a.clone(), b.clone())))
}

pub(crate) fn fold_mul(a: &Expr, b: &Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
        return Expr::constant(x * y);
    }
    if a.is_zero() || b.is_zero() {
        return Expr::constant(0.0);
    }
    if a.is_const(1.0) {
        return b.clone();
    }
    if b.is_const(1.0) {
        return a.clone();
    }
    Expr(Arc::new(Node::Mul(a.clone(), b.clone())))
}

pub(crate) fn fold_div(a: &Expr, b: &Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
        if y != 0.0 {
            return Expr::constant(x / y);
        }
    }
    if a.is_zero() && !b.is_zero() {
        return Expr::constant(0.0);
    }
    if b.is_const(1.0) {
        return a.clone();
    }
    Expr(Arc::new(Node::Div(a.clone(), b.clone())))
}

pub(crate) fn fold_pow(a: &Expr, b: &Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
        return Expr::constant(x.powf(y));
    }
    if b.is_zero() {
        return Expr::constant(1.0);
    }
    if b.is_const(1.0) {
        return a.clone();
    }
    if a.is_const(1.0) {
        return Expr::constant(1.0);
    }
    Expr(Arc::new(Node::Pow(a.clone(), b.clone())))
}

pub(crate) fn fold_neg(a: &Expr) -> Expr {
    if let Some(x) = a.as_const() {
        return Expr::constant(-x);
    }
    if let Node::Neg(inner) = &*a.0 {
        return inner.clone();
    }
    Expr(Arc::new(Node::Neg(a.clone())))
}

pub(crate) fn fold_call(f: Func, a: &Expr) -> Expr {
    if let Some(x) = a.as_const() {
        return Expr::constant(f.eval(x));
    }
    Expr(Arc::new(Node::Call(f, a.clone())))
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        fold_add(&self, &rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        fold_sub(&self, &rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        fold_mul(&self, &rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        fold_div(&self, &rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        fold_neg(&self)
    }
}
