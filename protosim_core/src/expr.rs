//! Rule expression AST.
//!
//! Conditions, effects and validation rules are parsed once at load time
//! into this closed tree (see [`crate::parser`]) and evaluated against a set
//! of bindings (see [`crate::eval`]). Nothing is interpreted from text at
//! run time.

use crate::path::{Root, Segment, StatePath};
use protosim_env::Value;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Source symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// The comparison that holds exactly when `self` does not.
    pub fn negated_comparison(&self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Ne),
            BinaryOp::Ne => Some(BinaryOp::Eq),
            BinaryOp::Lt => Some(BinaryOp::Ge),
            BinaryOp::Ge => Some(BinaryOp::Lt),
            BinaryOp::Gt => Some(BinaryOp::Le),
            BinaryOp::Le => Some(BinaryOp::Gt),
            _ => None,
        }
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Min,
    Max,
    /// `exists(path)`: true when the path resolves
    Exists,
}

impl Builtin {
    /// Looks up a builtin by name.
    pub fn from_name(name: &str) -> Option<Builtin> {
        match name {
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            "exists" => Some(Builtin::Exists),
            _ => None,
        }
    }

    /// Number of arguments.
    pub fn arity(&self) -> usize {
        match self {
            Builtin::Min | Builtin::Max => 2,
            Builtin::Exists => 1,
        }
    }

    /// Source name.
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Exists => "exists",
        }
    }
}

/// A rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(StatePath),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

impl Expr {
    /// Builds a binary node.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Visits every path in the expression, including paths nested in
    /// index segments.
    pub fn visit_paths<'a>(&'a self, f: &mut dyn FnMut(&'a StatePath)) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(path) => visit_path(path, f),
            Expr::Unary(_, inner) => inner.visit_paths(f),
            Expr::Binary(_, lhs, rhs) => {
                lhs.visit_paths(f);
                rhs.visit_paths(f);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.visit_paths(f);
                }
            }
        }
    }

    /// Returns true if any path in the expression uses `root`.
    pub fn uses_root(&self, root: &Root) -> bool {
        let mut found = false;
        self.visit_paths(&mut |p| {
            if &p.root == root {
                found = true;
            }
        });
        found
    }

    /// Names of all parameters referenced as `params.<name>`.
    pub fn param_refs(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.visit_paths(&mut |p| {
            if p.root == Root::Params {
                if let Some(name) = p.head_field() {
                    names.push(name);
                }
            }
        });
        names
    }

    /// Splits a conjunction into its top-level conjuncts.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let mut out = lhs.conjuncts();
                out.extend(rhs.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Returns true if `self` and `other` can never both hold, judged
    /// syntactically: some conjunct of one is the negation of a conjunct of
    /// the other.
    pub fn contradicts(&self, other: &Expr) -> bool {
        let left = self.conjuncts();
        let right = other.conjuncts();
        left.iter().any(|a| right.iter().any(|b| negates(a, b)))
    }
}

fn visit_path<'a>(path: &'a StatePath, f: &mut dyn FnMut(&'a StatePath)) {
    f(path);
    for segment in &path.segments {
        if let Segment::Index(expr) = segment {
            expr.visit_paths(f);
        }
    }
}

fn negates(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Unary(UnaryOp::Not, inner), other) | (other, Expr::Unary(UnaryOp::Not, inner)) => {
            inner.as_ref() == other
        }
        (Expr::Binary(op_a, la, ra), Expr::Binary(op_b, lb, rb)) => {
            if la != lb || ra != rb {
                return false;
            }
            if op_a.negated_comparison() == Some(*op_b) {
                return true;
            }
            // `x == c1` vs `x == c2` with distinct literals
            matches!((op_a, ra.as_ref(), rb.as_ref()), (BinaryOp::Eq, Expr::Literal(_), Expr::Literal(_)))
                && op_b == &BinaryOp::Eq
                && ra != rb
        }
        _ => false,
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Path(p) => write!(f, "{}", p),
            Expr::Unary(UnaryOp::Not, inner) => write!(f, "!{}", inner),
            Expr::Unary(UnaryOp::Neg, inner) => write!(f, "-{}", inner),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Call(builtin, args) => {
                write!(f, "{}(", builtin.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_expr;

    #[test]
    fn test_param_refs_include_index_expressions() {
        let expr = parse_expr("pre.CDP.safes[params.safeId].debt + params.amount > 0").unwrap();
        let mut refs = expr.param_refs();
        refs.sort();
        assert_eq!(refs, vec!["amount", "safeId"]);
    }

    #[test]
    fn test_contradicts_negated_comparison() {
        let a = parse_expr("pre.CDP.safes[params.id].debt == 0 && pre.CDP.head == 0").unwrap();
        let b = parse_expr("pre.CDP.safes[params.id].debt == 0 && pre.CDP.head != 0").unwrap();
        let c = parse_expr("pre.CDP.safes[params.id].debt > 0").unwrap();
        let d = parse_expr("pre.CDP.safes[params.id].debt <= 0").unwrap();
        assert!(a.contradicts(&b));
        assert!(c.contradicts(&d));
        assert!(!a.contradicts(&c));
    }

    #[test]
    fn test_contradicts_distinct_literals_and_not() {
        let a = parse_expr("pre.CDP.mode == \"BOOTSTRAP\"").unwrap();
        let b = parse_expr("pre.CDP.mode == \"NORMAL\"").unwrap();
        let c = parse_expr("!(pre.CDP.mode == \"BOOTSTRAP\")").unwrap();
        assert!(a.contradicts(&b));
        assert!(a.contradicts(&c));
    }
}
