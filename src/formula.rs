//! A tiny arithmetic language for user-supplied iteration formulas.
//!
//! Formulas are written over the variables `x` (current orbit value),
//! `c` (the point's constant), `n` (iteration number), and `p` (the run
//! parameter), with `+ - * / ^`, parentheses, and a handful of complex
//! functions.  Parsing happens once, at engine configuration; evaluation
//! runs a flat postfix program against a fixed-size value stack, since
//! it sits on the hot path of every formula-kind orbit.

use num::Complex;

use calc::{CalcError, CalcResult};

const STACK_DEPTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Var {
    X,
    C,
    N,
    P,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Func {
    Sqrt,
    Abs,
    Exp,
    Ln,
    Sin,
    Cos,
    Atan,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Parsed expression tree.  Kept alongside the flattened code because
/// kernel generation lowers the tree, not the postfix form.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Num(f64),
    Var(Var),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    Num(f64),
    Load(Var),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Call(Func),
}

/// A parsed iteration formula, ready for repeated evaluation.
#[derive(Clone, Debug)]
pub struct Formula {
    ast: Expr,
    code: Vec<Op>,
}

impl Formula {
    /// Parses `src` into an evaluatable formula.
    ///
    /// Grammar, loosest binding first: `+ -`, then `* /`, then unary
    /// minus, then a right-associative `^`.  So `-x^2.0` is `-(x^2.0)`
    /// and `2.0^3.0^2.0` is `2.0^(3.0^2.0)`.
    pub fn parse(src: &str) -> CalcResult<Formula> {
        let mut p = Parser { src: src.as_bytes(), pos: 0 };
        let ast = p.expr()?;
        p.skip_ws();
        if p.pos != p.src.len() {
            return Err(CalcError::formula(p.pos, "unexpected trailing input"));
        }
        let mut code = Vec::new();
        flatten(&ast, &mut code);
        if max_depth(&code) > STACK_DEPTH {
            return Err(CalcError::formula(0, "expression too deep"));
        }
        Ok(Formula { ast, code })
    }

    /// Evaluates the formula.  `n` and `p` are widened to complex values
    /// with zero imaginary part.
    pub fn eval(&self, x: Complex<f64>, c: Complex<f64>, n: i32, p: f64) -> Complex<f64> {
        let mut stack = [Complex::new(0.0, 0.0); STACK_DEPTH];
        let mut top = 0usize;
        for op in &self.code {
            match *op {
                Op::Num(v) => {
                    stack[top] = Complex::new(v, 0.0);
                    top += 1;
                }
                Op::Load(var) => {
                    stack[top] = match var {
                        Var::X => x,
                        Var::C => c,
                        Var::N => Complex::new(n as f64, 0.0),
                        Var::P => Complex::new(p, 0.0),
                    };
                    top += 1;
                }
                Op::Neg => stack[top - 1] = -stack[top - 1],
                Op::Add => {
                    top -= 1;
                    stack[top - 1] = stack[top - 1] + stack[top];
                }
                Op::Sub => {
                    top -= 1;
                    stack[top - 1] = stack[top - 1] - stack[top];
                }
                Op::Mul => {
                    top -= 1;
                    stack[top - 1] = stack[top - 1] * stack[top];
                }
                Op::Div => {
                    top -= 1;
                    stack[top - 1] = stack[top - 1] / stack[top];
                }
                Op::Pow => {
                    top -= 1;
                    let e = stack[top];
                    let b = stack[top - 1];
                    stack[top - 1] = if e.im == 0.0 { b.powf(e.re) } else { b.powc(e) };
                }
                Op::Call(f) => {
                    let v = stack[top - 1];
                    stack[top - 1] = match f {
                        Func::Sqrt => v.sqrt(),
                        Func::Abs => Complex::new(v.norm(), 0.0),
                        Func::Exp => v.exp(),
                        Func::Ln => v.ln(),
                        Func::Sin => v.sin(),
                        Func::Cos => v.cos(),
                        Func::Atan => v.atan(),
                    };
                }
            }
        }
        stack[0]
    }

    pub(crate) fn ast(&self) -> &Expr {
        &self.ast
    }
}

fn flatten(e: &Expr, code: &mut Vec<Op>) {
    match *e {
        Expr::Num(v) => code.push(Op::Num(v)),
        Expr::Var(var) => code.push(Op::Load(var)),
        Expr::Neg(ref inner) => {
            flatten(inner, code);
            code.push(Op::Neg);
        }
        Expr::Bin(op, ref lhs, ref rhs) => {
            flatten(lhs, code);
            flatten(rhs, code);
            code.push(match op {
                BinOp::Add => Op::Add,
                BinOp::Sub => Op::Sub,
                BinOp::Mul => Op::Mul,
                BinOp::Div => Op::Div,
                BinOp::Pow => Op::Pow,
            });
        }
        Expr::Call(f, ref arg) => {
            flatten(arg, code);
            code.push(Op::Call(f));
        }
    }
}

fn max_depth(code: &[Op]) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for op in code {
        match *op {
            Op::Num(_) | Op::Load(_) => {
                depth += 1;
                if depth > max {
                    max = depth;
                }
            }
            Op::Neg | Op::Call(_) => {}
            _ => depth -= 1,
        }
    }
    max
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while let Some(&b) = self.src.get(self.pos) {
            if b == b' ' || b == b'\t' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).cloned()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> CalcResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            if self.eat(b'+') {
                let rhs = self.term()?;
                lhs = Expr::Bin(BinOp::Add, Box::new(lhs), Box::new(rhs));
            } else if self.eat(b'-') {
                let rhs = self.term()?;
                lhs = Expr::Bin(BinOp::Sub, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn term(&mut self) -> CalcResult<Expr> {
        let mut lhs = self.factor()?;
        loop {
            if self.eat(b'*') {
                let rhs = self.factor()?;
                lhs = Expr::Bin(BinOp::Mul, Box::new(lhs), Box::new(rhs));
            } else if self.eat(b'/') {
                let rhs = self.factor()?;
                lhs = Expr::Bin(BinOp::Div, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn factor(&mut self) -> CalcResult<Expr> {
        if self.eat(b'-') {
            Ok(Expr::Neg(Box::new(self.factor()?)))
        } else {
            self.power()
        }
    }

    fn power(&mut self) -> CalcResult<Expr> {
        let base = self.primary()?;
        if self.eat(b'^') {
            let exp = self.factor()?;
            Ok(Expr::Bin(BinOp::Pow, Box::new(base), Box::new(exp)))
        } else {
            Ok(base)
        }
    }

    fn primary(&mut self) -> CalcResult<Expr> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let e = self.expr()?;
                if !self.eat(b')') {
                    return Err(CalcError::formula(self.pos, "expected ')'"));
                }
                Ok(e)
            }
            Some(b) if b.is_ascii_digit() || b == b'.' => self.number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.ident(),
            _ => Err(CalcError::formula(self.pos, "expected a value")),
        }
    }

    fn digit_at(&self, i: usize) -> bool {
        match self.src.get(i) {
            Some(b) => b.is_ascii_digit(),
            None => false,
        }
    }

    fn number(&mut self) -> CalcResult<Expr> {
        let start = self.pos;
        while self.digit_at(self.pos) {
            self.pos += 1;
        }
        if self.src.get(self.pos) == Some(&b'.') {
            self.pos += 1;
            while self.digit_at(self.pos) {
                self.pos += 1;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]);
        match text.parse::<f64>() {
            Ok(v) => Ok(Expr::Num(v)),
            Err(_) => Err(CalcError::formula(start, "malformed number")),
        }
    }

    fn ident(&mut self) -> CalcResult<Expr> {
        let start = self.pos;
        while let Some(&b) = self.src.get(self.pos) {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let arg = self.expr()?;
            if !self.eat(b')') {
                return Err(CalcError::formula(self.pos, "expected ')'"));
            }
            let f = match name.as_str() {
                "sqrt" => Func::Sqrt,
                "abs" => Func::Abs,
                "exp" => Func::Exp,
                "ln" => Func::Ln,
                "sin" => Func::Sin,
                "cos" => Func::Cos,
                "atan" => Func::Atan,
                _ => {
                    return Err(CalcError::formula(
                        start,
                        format!("unknown function '{}'", name),
                    ))
                }
            };
            Ok(Expr::Call(f, Box::new(arg)))
        } else {
            let var = match name.as_str() {
                "x" => Var::X,
                "c" => Var::C,
                "n" => Var::N,
                "p" => Var::P,
                _ => {
                    return Err(CalcError::formula(
                        start,
                        format!("unknown variable '{}'", name),
                    ))
                }
            };
            Ok(Expr::Var(var))
        }
    }
}
