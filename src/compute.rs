//! Pure evaluation of request payloads
//!
//! The server is the single source of truth for results: calc payloads are
//! evaluated arithmetically, text payloads go through a [`TextGenerator`].

use crate::error::ProtocolError;
use crate::protocol::{number_value, Operator, Payload};
use serde_json::Value;

/// Deterministic text transform used for `text` requests
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String, ProtocolError>;
}

/// Default generator: echoes the trimmed prompt with a word count.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoGenerator;

impl TextGenerator for EchoGenerator {
    fn generate(&self, prompt: &str) -> Result<String, ProtocolError> {
        let prompt = prompt.trim();
        let words = prompt.split_whitespace().count();
        Ok(format!("[echo] {} ({} words)", prompt, words))
    }
}

/// Evaluate a payload into its JSON result.
pub fn evaluate(payload: &Payload, generator: &dyn TextGenerator) -> Result<Value, ProtocolError> {
    match payload {
        Payload::Calc { operator, operands } => {
            calculate(*operator, operands).map(number_value)
        }
        Payload::Text { prompt } => generator.generate(prompt).map(Value::String),
    }
}

/// Apply `operator` to `operands`.
pub fn calculate(operator: Operator, operands: &[f64]) -> Result<f64, ProtocolError> {
    operator.check_arity(operands.len())?;

    let result = match operator {
        Operator::Add => operands[0] + operands[1],
        Operator::Sub => operands[0] - operands[1],
        Operator::Mul => operands[0] * operands[1],
        Operator::Div => checked_divisor(operands[1]).map(|b| operands[0] / b)?,
        Operator::Pow => operands[0].powf(operands[1]),
        // result takes the sign of the divisor
        Operator::Mod => checked_divisor(operands[1]).map(|b| {
            let a = operands[0];
            a - b * (a / b).floor()
        })?,
        Operator::FloorDiv => checked_divisor(operands[1]).map(|b| (operands[0] / b).floor())?,
        Operator::Min => operands.iter().copied().fold(f64::INFINITY, f64::min),
        Operator::Max => operands.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Operator::Sum => {
            // fixed summation order: equal cache keys must give equal results
            let mut ordered = operands.to_vec();
            ordered.sort_by(|a, b| a.total_cmp(b));
            ordered.iter().sum()
        }
        Operator::Neg => -operands[0],
        Operator::Abs => operands[0].abs(),
        Operator::Sqrt => {
            if operands[0] < 0.0 {
                return Err(domain_error(operator));
            }
            operands[0].sqrt()
        }
        Operator::Sin => operands[0].sin(),
        Operator::Cos => operands[0].cos(),
        Operator::Tan => operands[0].tan(),
        Operator::Exp => operands[0].exp(),
        Operator::Log => {
            if operands[0] <= 0.0 {
                return Err(domain_error(operator));
            }
            operands[0].ln()
        }
    };

    if result.is_finite() {
        Ok(result)
    } else {
        Err(ProtocolError::Evaluation(format!(
            "{} produced a non-finite result",
            operator
        )))
    }
}

fn checked_divisor(b: f64) -> Result<f64, ProtocolError> {
    if b == 0.0 {
        Err(ProtocolError::Evaluation("division by zero".to_string()))
    } else {
        Ok(b)
    }
}

fn domain_error(operator: Operator) -> ProtocolError {
    ProtocolError::Evaluation(format!("math domain error in {}", operator))
}
