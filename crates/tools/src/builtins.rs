//! Built-in tools.
//!
//! The calculator and search tools are the reference contracts the
//! executor's text-protocol parsing is designed around: both accept a single
//! free-form parameter under more than one name, so a bare-string tool call
//! binds cleanly regardless of how the model spells the argument.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{JsonMap, ParamKind, Tool, ToolParam, ToolSpec, value_to_text};

fn arg_text<'a>(args: &'a JsonMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| args.get(*name))
        .map(value_to_text)
}

// ── calculator ───────────────────────────────────────────────────────────────

/// Evaluates arithmetic expressions library-side.  Non-throwing: parse and
/// evaluation failures come back as a `计算失败` text so the model can see
/// them and retry.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calculator".to_string(),
            description: "Evaluate a math expression (+, -, *, /, %, ^, parentheses)."
                .to_string(),
            params: vec![ToolParam::required(
                "input",
                ParamKind::String,
                "The expression to evaluate, e.g. (15+25)*3",
            )],
        }
    }

    async fn run(&self, args: &JsonMap) -> Result<String> {
        let Some(expression) = arg_text(args, &["input", "expression"]) else {
            return Ok("计算失败: 缺少表达式参数".to_string());
        };
        Ok(match eval_expression(&expression) {
            Ok(value) => format_number(value),
            Err(err) => format!("计算失败: {err}"),
        })
    }
}

/// Render without a trailing `.0` for integral results.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Recursive-descent evaluator over `+ - * / % ^`, parentheses, and unary
/// minus.  Power is right-associative.
pub fn eval_expression(input: &str) -> Result<f64, String> {
    let mut parser = ExprParser {
        chars: input.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
    };
    let value = parser.parse_sum()?;
    if parser.pos != parser.chars.len() {
        return Err(format!(
            "unexpected character '{}' at position {}",
            parser.chars[parser.pos], parser.pos
        ));
    }
    if !value.is_finite() {
        return Err("result is not finite".to_string());
    }
    Ok(value)
}

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn parse_sum(&mut self) -> Result<f64, String> {
        let mut value = self.parse_product()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.bump();
                    value += self.parse_product()?;
                }
                '-' => {
                    self.bump();
                    value -= self.parse_product()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_product(&mut self) -> Result<f64, String> {
        let mut value = self.parse_power()?;
        while let Some(op) = self.peek() {
            match op {
                '*' => {
                    self.bump();
                    value *= self.parse_power()?;
                }
                '/' => {
                    self.bump();
                    let rhs = self.parse_power()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= rhs;
                }
                '%' => {
                    self.bump();
                    let rhs = self.parse_power()?;
                    if rhs == 0.0 {
                        return Err("modulo by zero".to_string());
                    }
                    value %= rhs;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_atom()?;
        if self.peek() == Some('^') {
            self.bump();
            // Right-associative: 2^3^2 = 2^(3^2).
            let exponent = self.parse_power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let value = self.parse_sum()?;
                if self.bump() != Some(')') {
                    return Err("missing closing parenthesis".to_string());
                }
                Ok(value)
            }
            Some('-') => {
                self.bump();
                Ok(-self.parse_atom()?)
            }
            Some('+') => {
                self.bump();
                self.parse_atom()
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(c) => Err(format!("unexpected character '{c}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.bump();
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse()
            .map_err(|_| format!("invalid number '{literal}'"))
    }
}

// ── search ───────────────────────────────────────────────────────────────────

/// Injectable search backend: query in, result lines out.
pub type SearchFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Vec<String>> + Send>> + Send + Sync,
>;

/// Mock search tool.  Delegates to an injected backend when one is provided;
/// otherwise returns canned placeholder strings keyed on keyword detection.
/// Production deployments inject their own backend.
pub struct SearchTool {
    pub search_fn: Option<SearchFn>,
}

impl SearchTool {
    pub fn mock() -> Self {
        Self { search_fn: None }
    }

    pub fn with_backend(search_fn: SearchFn) -> Self {
        Self {
            search_fn: Some(search_fn),
        }
    }

    fn canned_results(query: &str) -> Vec<String> {
        let lower = query.to_lowercase();
        if lower.contains("weather") || lower.contains("天气") {
            vec![
                "Weather report placeholder: partly cloudy, 22°C.".to_string(),
                "Hourly forecast placeholder for the requested location.".to_string(),
            ]
        } else if lower.contains("news") || lower.contains("新闻") {
            vec![
                "News placeholder: top headlines for today.".to_string(),
                "News placeholder: technology section.".to_string(),
            ]
        } else if lower.contains("price") || lower.contains("stock") || lower.contains("价格") {
            vec!["Market data placeholder: quotes are delayed.".to_string()]
        } else {
            vec![format!("Search result placeholder for: {query}")]
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search".to_string(),
            description: "Search for information on the web (mock unless a backend is injected)."
                .to_string(),
            params: vec![ToolParam::required(
                "input",
                ParamKind::String,
                "The search query",
            )],
        }
    }

    async fn run(&self, args: &JsonMap) -> Result<String> {
        let Some(query) = arg_text(args, &["input", "query"]) else {
            anyhow::bail!("missing required param: input");
        };

        let results = match &self.search_fn {
            Some(backend) => backend(query.clone()).await,
            None => Self::canned_results(&query),
        };

        if results.is_empty() {
            return Ok(format!("No results for: {query}"));
        }
        Ok(results.join("\n"))
    }
}

// ── current_time ─────────────────────────────────────────────────────────────

/// Reports the current UTC time.  Registered by the demo binary.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_time".to_string(),
            description: "Get the current date and time (UTC).".to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &JsonMap) -> Result<String> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(key: &str, value: &str) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert(key.to_string(), json!(value));
        map
    }

    #[test]
    fn eval_basic_arithmetic() {
        assert_eq!(eval_expression("1+2*3").unwrap(), 7.0);
        assert_eq!(eval_expression("(15+25)*3").unwrap(), 120.0);
        assert_eq!(eval_expression("10/4").unwrap(), 2.5);
        assert_eq!(eval_expression("10%3").unwrap(), 1.0);
        assert_eq!(eval_expression("-3+5").unwrap(), 2.0);
        assert_eq!(eval_expression(" 2 ^ 3 ^ 2 ").unwrap(), 512.0);
    }

    #[test]
    fn eval_rejects_garbage() {
        assert!(eval_expression("").is_err());
        assert!(eval_expression("1+*2").is_err());
        assert!(eval_expression("(1+2").is_err());
        assert!(eval_expression("1/0").is_err());
        assert!(eval_expression("abc").is_err());
        assert!(eval_expression("1+2)").is_err());
    }

    #[tokio::test]
    async fn calculator_accepts_input_or_expression() {
        let tool = CalculatorTool;
        assert_eq!(tool.run(&args("input", "(15+25)*3")).await.unwrap(), "120");
        assert_eq!(tool.run(&args("expression", "7*6")).await.unwrap(), "42");
    }

    #[tokio::test]
    async fn calculator_failure_is_textual() {
        let tool = CalculatorTool;
        let output = tool.run(&args("input", "1+")).await.unwrap();
        assert!(output.starts_with("计算失败"), "got: {output}");
        let missing = tool.run(&JsonMap::new()).await.unwrap();
        assert!(missing.starts_with("计算失败"));
    }

    #[tokio::test]
    async fn search_canned_results_keyed_on_keywords() {
        let tool = SearchTool::mock();
        let weather = tool.run(&args("input", "weather in Paris")).await.unwrap();
        assert!(weather.contains("Weather"));
        let generic = tool.run(&args("query", "rust borrow checker")).await.unwrap();
        assert!(generic.contains("rust borrow checker"));
    }

    #[tokio::test]
    async fn search_uses_injected_backend() {
        let backend: SearchFn = Arc::new(|query: String| {
            Box::pin(async move { vec![format!("custom:{query}")] })
        });
        let tool = SearchTool::with_backend(backend);
        let output = tool.run(&args("input", "anything")).await.unwrap();
        assert_eq!(output, "custom:anything");
    }

    #[tokio::test]
    async fn current_time_is_rfc3339() {
        let output = CurrentTimeTool.run(&JsonMap::new()).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&output).is_ok());
    }
}
