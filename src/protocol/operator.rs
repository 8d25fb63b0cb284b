//! Calc operators and their arities

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Number of operands an operator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Unary,
    Binary,
    /// One or more operands
    Variadic,
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Unary => count == 1,
            Arity::Binary => count == 2,
            Arity::Variadic => count >= 1,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Arity::Unary => "1",
            Arity::Binary => "2",
            Arity::Variadic => "at least 1",
        }
    }
}

/// Supported calc operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    FloorDiv,
    Min,
    Max,
    Sum,
    Neg,
    Abs,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
}

impl Operator {
    /// Canonical lowercase name, used on the wire and in cache keys
    pub fn name(self) -> &'static str {
        match self {
            Operator::Add => "add",
            Operator::Sub => "sub",
            Operator::Mul => "mul",
            Operator::Div => "div",
            Operator::Pow => "pow",
            Operator::Mod => "mod",
            Operator::FloorDiv => "floordiv",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::Sum => "sum",
            Operator::Neg => "neg",
            Operator::Abs => "abs",
            Operator::Sqrt => "sqrt",
            Operator::Sin => "sin",
            Operator::Cos => "cos",
            Operator::Tan => "tan",
            Operator::Exp => "exp",
            Operator::Log => "log",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Operator::Add
            | Operator::Sub
            | Operator::Mul
            | Operator::Div
            | Operator::Pow
            | Operator::Mod
            | Operator::FloorDiv => Arity::Binary,
            Operator::Min | Operator::Max | Operator::Sum => Arity::Variadic,
            Operator::Neg
            | Operator::Abs
            | Operator::Sqrt
            | Operator::Sin
            | Operator::Cos
            | Operator::Tan
            | Operator::Exp
            | Operator::Log => Arity::Unary,
        }
    }

    /// Operand order does not affect the result
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Mul | Operator::Min | Operator::Max | Operator::Sum
        )
    }

    /// Check that `count` operands fit this operator.
    pub fn check_arity(self, count: usize) -> Result<(), ProtocolError> {
        let arity = self.arity();
        if arity.accepts(count) {
            Ok(())
        } else {
            Err(ProtocolError::Arity {
                operator: self.name().to_string(),
                expected: arity.describe(),
                actual: count,
            })
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "add" | "+" => Operator::Add,
            "sub" | "-" => Operator::Sub,
            "mul" | "*" => Operator::Mul,
            "div" | "/" => Operator::Div,
            "pow" | "^" | "**" => Operator::Pow,
            "mod" | "%" => Operator::Mod,
            "floordiv" | "//" => Operator::FloorDiv,
            "min" => Operator::Min,
            "max" => Operator::Max,
            "sum" => Operator::Sum,
            "neg" => Operator::Neg,
            "abs" => Operator::Abs,
            "sqrt" => Operator::Sqrt,
            "sin" => Operator::Sin,
            "cos" => Operator::Cos,
            "tan" => Operator::Tan,
            "exp" => Operator::Exp,
            "log" => Operator::Log,
            _ => return Err(ProtocolError::UnknownOperator(s.to_string())),
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_symbols() {
        assert_eq!("add".parse::<Operator>().unwrap(), Operator::Add);
        assert_eq!(" ADD ".parse::<Operator>().unwrap(), Operator::Add);
        assert_eq!("+".parse::<Operator>().unwrap(), Operator::Add);
        assert_eq!("//".parse::<Operator>().unwrap(), Operator::FloorDiv);
        assert_eq!("**".parse::<Operator>().unwrap(), Operator::Pow);
    }

    #[test]
    fn test_unknown_operator() {
        let err = "frobnicate".parse::<Operator>().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownOperator("frobnicate".to_string()));
    }

    #[test]
    fn test_arity_checks() {
        assert!(Operator::Add.check_arity(2).is_ok());
        assert!(Operator::Add.check_arity(1).is_err());
        assert!(Operator::Sqrt.check_arity(1).is_ok());
        assert!(Operator::Sqrt.check_arity(2).is_err());
        assert!(Operator::Max.check_arity(5).is_ok());
        assert!(Operator::Max.check_arity(0).is_err());
    }

    #[test]
    fn test_commutativity() {
        assert!(Operator::Add.is_commutative());
        assert!(Operator::Sum.is_commutative());
        assert!(!Operator::Sub.is_commutative());
        assert!(!Operator::Div.is_commutative());
    }
}
