use std::collections::HashMap;

use crate::error::{Result, SolveError};
use crate::symbolic::{Expr, Func, Node, VarRef};

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `f64` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the value of an evaluation column (by slot) onto the stack.
    /// Slots follow the column layout of the model.
    LoadCol(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes exp(a).
    Exp,
    /// Pops top value (a), pushes ln(a).
    Ln,
    /// Pops top value (a), pushes sqrt(a).
    Sqrt,
    /// Pops top value (a), pushes sin(a).
    Sin,
    /// Pops top value (a), pushes cos(a).
    Cos,
    /// Pops top value (a), pushes tan(a).
    Tan,
    /// Pops top value (a), pushes |a|.
    Abs,
    /// Pops top value (a), pushes sign(a).
    Signum,
}

/// A compiled sequence of operations.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based virtual machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run,
/// - `cols`: evaluation column values (read-only),
/// - `params`: parameter values (read-only),
/// - `stack`: a reusable buffer for intermediate computations.
///
/// Returns the value left on the stack.
pub struct VM;

impl VM {
    pub fn execute(bytecode: &Bytecode, cols: &[f64], params: &[f64], stack: &mut Vec<f64>) -> f64 {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(*val),
                OpCode::LoadCol(slot) => stack.push(cols[*slot]),
                OpCode::LoadParam(idx) => stack.push(params[*idx]),
                OpCode::Add => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a.powf(b));
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap();
                    stack.push(-a);
                }
                OpCode::Exp => {
                    let a = stack.pop().unwrap();
                    stack.push(a.exp());
                }
                OpCode::Ln => {
                    let a = stack.pop().unwrap();
                    stack.push(a.ln());
                }
                OpCode::Sqrt => {
                    let a = stack.pop().unwrap();
                    stack.push(a.sqrt());
                }
                OpCode::Sin => {
                    let a = stack.pop().unwrap();
                    stack.push(a.sin());
                }
                OpCode::Cos => {
                    let a = stack.pop().unwrap();
                    stack.push(a.cos());
                }
                OpCode::Tan => {
                    let a = stack.pop().unwrap();
                    stack.push(a.tan());
                }
                OpCode::Abs => {
                    let a = stack.pop().unwrap();
                    stack.push(a.abs());
                }
                OpCode::Signum => {
                    let a = stack.pop().unwrap();
                    stack.push(a.signum());
                }
            }
        }

        // The result is the last item on the stack. Compiled code always
        // leaves exactly one value.
        stack.pop().unwrap_or(0.0)
    }
}

/// Compiles an expression into postfix bytecode.
///
/// `columns` maps variable references onto evaluation slots. An unresolved
/// reference means the expression does not belong to the layout it is being
/// compiled against.
pub fn compile(expr: &Expr, columns: &HashMap<VarRef, usize>) -> Result<Bytecode> {
    let mut ops = Vec::new();
    compile_node(expr, columns, &mut ops)?;
    Ok(Bytecode { ops })
}

fn compile_node(expr: &Expr, columns: &HashMap<VarRef, usize>, ops: &mut Vec<OpCode>) -> Result<()> {
    match expr.node() {
        Node::Const(c) => ops.push(OpCode::LoadConst(*c)),
        Node::Var(v) => {
            let slot = columns
                .get(v)
                .copied()
                .ok_or_else(|| SolveError::InvalidModel {
                    reason: format!(
                        "variable {} at offset {:?} has no evaluation column",
                        v.var, v.offset
                    ),
                })?;
            ops.push(OpCode::LoadCol(slot));
        }
        Node::Param(i) => ops.push(OpCode::LoadParam(*i)),
        Node::Neg(a) => {
            compile_node(a, columns, ops)?;
            ops.push(OpCode::Neg);
        }
        Node::Add(a, b) => {
            compile_node(a, columns, ops)?;
            compile_node(b, columns, ops)?;
            ops.push(OpCode::Add);
        }
        Node::Sub(a, b) => {
            compile_node(a, columns, ops)?;
            compile_node(b, columns, ops)?;
            ops.push(OpCode::Sub);
        }
        Node::Mul(a, b) => {
            compile_node(a, columns, ops)?;
            compile_node(b, columns, ops)?;
            ops.push(OpCode::Mul);
        }
        Node::Div(a, b) => {
            compile_node(a, columns, ops)?;
            compile_node(b, columns, ops)?;
            ops.push(OpCode::Div);
        }
        Node::Pow(a, b) => {
            compile_node(a, columns, ops)?;
            compile_node(b, columns, ops)?;
            ops.push(OpCode::Pow);
        }
        Node::Call(f, a) => {
            compile_node(a, columns, ops)?;
            ops.push(match f {
                Func::Exp => OpCode::Exp,
                Func::Ln => OpCode::Ln,
                Func::Sqrt => OpCode::Sqrt,
                Func::Sin => OpCode::Sin,
                Func::Cos => OpCode::Cos,
                Func::Tan => OpCode::Tan,
                Func::Abs => OpCode::Abs,
                Func::Signum => OpCode::Signum,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{compile, VM};
    use crate::symbolic::{Expr, TimeOffset, VarRef};

    fn slot_map() -> HashMap<VarRef, usize> {
        let mut map = HashMap::new();
        map.insert(
            VarRef {
                var: 0,
                offset: TimeOffset::Current,
            },
            0,
        );
        map.insert(
            VarRef {
                var: 1,
                offset: TimeOffset::Lag,
            },
            1,
        );
        map
    }

    #[test]
    fn bytecode_matches_tree_evaluation() {
        let x = Expr::var(0, TimeOffset::Current);
        let y = Expr::var(1, TimeOffset::Lag);
        // x * ln(y) + exp(x / p0) - y^1.7
        let e = x.clone() * y.ln() + (x / Expr::param(0)).exp() - y.powf(1.7);

        let cols = [1.3, 2.4];
        let params = [0.7];
        let map = slot_map();
        let code = compile(&e, &map).expect("compiles");

        let mut stack = Vec::new();
        let got = VM::execute(&code, &cols, &params, &mut stack);
        let want = e.eval(
            &|r: VarRef| if r.var == 0 { cols[0] } else { cols[1] },
            &params,
        );
        assert!((got - want).abs() < 1e-14, "got {got}, want {want}");
    }

    #[test]
    fn stack_buffer_is_reusable_across_calls() {
        let x = Expr::var(0, TimeOffset::Current);
        let e = x.clone() * x.clone() + Expr::constant(1.0);
        let code = compile(&e, &slot_map()).expect("compiles");

        let mut stack = Vec::new();
        let first = VM::execute(&code, &[3.0, 0.0], &[], &mut stack);
        let second = VM::execute(&code, &[4.0, 0.0], &[], &mut stack);
        assert!((first - 10.0).abs() < 1e-15);
        assert!((second - 17.0).abs() < 1e-15);
    }

    #[test]
    fn unresolved_references_are_rejected() {
        let stray = Expr::var(7, TimeOffset::Lead);
        let err = compile(&stray, &slot_map()).expect_err("no slot for v7");
        let message = format!("{err}");
        assert!(message.contains("no evaluation column"), "got: {message}");
    }
}
