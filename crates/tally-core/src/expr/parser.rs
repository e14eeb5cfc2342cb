//! Infix expression decomposition into a binary-operation task graph.
//!
//! Pipeline: tokenize -> shunting-yard (infix to postfix) -> evaluation
//! stack over the postfix stream, emitting one task per operator. Literal
//! operands become pre-completed stack nodes whose values are folded
//! directly into their consumer's operand slots; they are never persisted.
//! A pending sub-result instead leaves the slot empty and links the
//! producer's id into `dependencies` (left operand first).

use chrono::Utc;
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

use tally_db::models::Task;

/// Errors raised while decomposing an expression.
///
/// All of these reject the submission before anything is written, so a
/// stored expression is always structurally evaluable.
#[derive(Debug, Error)]
pub enum ExpressionParseError {
    #[error("expression is empty")]
    Empty,

    #[error("malformed numeric literal: {0:?}")]
    MalformedLiteral(String),

    #[error("unbalanced parentheses")]
    UnbalancedParens,

    #[error("operator {0:?} is missing an operand")]
    MissingOperand(String),

    #[error("expression does not reduce to a single value")]
    DanglingOperands,
}

/// Per-operation artificial delay, in milliseconds, attached to every
/// emitted task so workers can simulate computation cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayTable {
    pub addition_ms: i64,
    pub subtraction_ms: i64,
    pub multiplication_ms: i64,
    pub division_ms: i64,
}

impl DelayTable {
    /// Delay for a single operator token. Unknown tokens cost nothing.
    pub fn for_operation(&self, operation: &str) -> i64 {
        match operation {
            "+" => self.addition_ms,
            "-" => self.subtraction_ms,
            "*" => self.multiplication_ms,
            "/" => self.division_ms,
            _ => 0,
        }
    }
}

/// Result of decomposing an expression.
#[derive(Debug)]
pub enum TaskGraph {
    /// The expression was a lone literal; no tasks to run.
    Literal(f64),
    /// Operator tasks in emission order; the last one is the root.
    Operators(Vec<Task>),
}

/// An entry on the postfix evaluation stack: either a folded-away literal
/// (completed, value known) or a reference to an emitted operator task.
struct Node {
    id: String,
    completed: bool,
    result: Option<f64>,
}

/// Decompose an infix expression into its task graph.
pub fn decompose(
    expression_id: &str,
    text: &str,
    delays: &DelayTable,
) -> Result<TaskGraph, ExpressionParseError> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Err(ExpressionParseError::Empty);
    }
    let postfix = infix_to_postfix(tokens)?;

    let mut stack: Vec<Node> = Vec::new();
    let mut tasks: Vec<Task> = Vec::new();
    let now = Utc::now();

    for token in postfix {
        match token.as_str() {
            "+" | "-" | "*" | "/" => {
                let right = stack
                    .pop()
                    .ok_or_else(|| ExpressionParseError::MissingOperand(token.clone()))?;
                let left = stack
                    .pop()
                    .ok_or_else(|| ExpressionParseError::MissingOperand(token.clone()))?;

                let mut dependencies = Vec::new();
                if !left.completed {
                    dependencies.push(left.id.clone());
                }
                if !right.completed {
                    dependencies.push(right.id.clone());
                }

                let task = Task {
                    id: Uuid::new_v4().to_string(),
                    expression_id: expression_id.to_owned(),
                    seq: tasks.len() as i64,
                    operation: token.clone(),
                    operation_time: delays.for_operation(&token),
                    arg1: left.result,
                    arg2: right.result,
                    dependencies: Json(dependencies),
                    result: None,
                    completed: false,
                    is_processing: false,
                    created_at: now,
                    updated_at: now,
                };
                stack.push(Node {
                    id: task.id.clone(),
                    completed: false,
                    result: None,
                });
                tasks.push(task);
            }
            _ => {
                let value: f64 = token
                    .parse()
                    .map_err(|_| ExpressionParseError::MalformedLiteral(token.clone()))?;
                stack.push(Node {
                    id: Uuid::new_v4().to_string(),
                    completed: true,
                    result: Some(value),
                });
            }
        }
    }

    let root = match stack.pop() {
        Some(node) if stack.is_empty() => node,
        _ => return Err(ExpressionParseError::DanglingOperands),
    };

    if tasks.is_empty() {
        // A lone literal: the root node must carry its value.
        match root.result {
            Some(value) => Ok(TaskGraph::Literal(value)),
            None => Err(ExpressionParseError::DanglingOperands),
        }
    } else {
        Ok(TaskGraph::Operators(tasks))
    }
}

/// Left-to-right scan: whitespace separates, the five single-character
/// punctuation tokens stand alone, every other run of characters forms one
/// literal token. Literal validity is checked later, at parse time.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }
        if matches!(ch, '+' | '-' | '*' | '/' | '(' | ')') {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(ch.to_string());
        } else {
            current.push(ch);
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Binding strength; parentheses sit at zero so operators never pop past
/// an open paren.
fn precedence(token: &str) -> u8 {
    match token {
        "+" | "-" => 1,
        "*" | "/" => 2,
        _ => 0,
    }
}

/// Shunting-yard: all four operators are left-associative.
fn infix_to_postfix(tokens: Vec<String>) -> Result<Vec<String>, ExpressionParseError> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut stack: Vec<String> = Vec::new();

    for token in tokens {
        match token.as_str() {
            "+" | "-" | "*" | "/" => {
                while stack
                    .last()
                    .is_some_and(|top| precedence(top) >= precedence(&token))
                {
                    if let Some(top) = stack.pop() {
                        output.push(top);
                    }
                }
                stack.push(token);
            }
            "(" => stack.push(token),
            ")" => loop {
                match stack.pop() {
                    Some(top) if top == "(" => break,
                    Some(top) => output.push(top),
                    None => return Err(ExpressionParseError::UnbalancedParens),
                }
            },
            _ => output.push(token),
        }
    }

    while let Some(top) = stack.pop() {
        if top == "(" {
            return Err(ExpressionParseError::UnbalancedParens);
        }
        output.push(top);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postfix(text: &str) -> Vec<String> {
        infix_to_postfix(tokenize(text)).expect("should convert")
    }

    #[test]
    fn tokenize_splits_punctuation_and_literals() {
        assert_eq!(tokenize("2+10*3"), vec!["2", "+", "10", "*", "3"]);
        assert_eq!(tokenize("( 1.5 + 2 )"), vec!["(", "1.5", "+", "2", ")"]);
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[test]
    fn postfix_respects_precedence() {
        assert_eq!(postfix("2+2*2"), vec!["2", "2", "2", "*", "+"]);
        assert_eq!(postfix("2*2+2"), vec!["2", "2", "*", "2", "+"]);
    }

    #[test]
    fn postfix_is_left_associative() {
        assert_eq!(postfix("8-4-2"), vec!["8", "4", "-", "2", "-"]);
        assert_eq!(postfix("8/4/2"), vec!["8", "4", "/", "2", "/"]);
    }

    #[test]
    fn postfix_groups_parentheses() {
        assert_eq!(postfix("(1+2)*3"), vec!["1", "2", "+", "3", "*"]);
    }

    #[test]
    fn postfix_rejects_unbalanced_parens() {
        assert!(matches!(
            infix_to_postfix(tokenize("(1+2")),
            Err(ExpressionParseError::UnbalancedParens)
        ));
        assert!(matches!(
            infix_to_postfix(tokenize("1+2)")),
            Err(ExpressionParseError::UnbalancedParens)
        ));
    }

    #[test]
    fn decompose_single_operator() {
        let graph = decompose("e1", "2+3", &DelayTable::default()).expect("should decompose");
        let TaskGraph::Operators(tasks) = graph else {
            panic!("expected operator tasks");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].operation, "+");
        assert_eq!(tasks[0].arg1, Some(2.0));
        assert_eq!(tasks[0].arg2, Some(3.0));
        assert!(tasks[0].dependencies.is_empty());
        assert!(!tasks[0].completed);
    }

    #[test]
    fn decompose_links_dependency_for_nested_left_operand() {
        // "2+2*2": the multiply is independent, the add owes its left
        // operand to it and carries the static 2 on the right.
        let graph = decompose("e1", "2+2*2", &DelayTable::default()).expect("should decompose");
        let TaskGraph::Operators(tasks) = graph else {
            panic!("expected operator tasks");
        };
        assert_eq!(tasks.len(), 2);

        let multiply = &tasks[0];
        let add = &tasks[1];
        assert_eq!(multiply.operation, "*");
        assert_eq!(multiply.arg1, Some(2.0));
        assert_eq!(multiply.arg2, Some(2.0));
        assert!(multiply.dependencies.is_empty());

        assert_eq!(add.operation, "+");
        assert_eq!(add.arg1, Some(2.0));
        assert_eq!(add.arg2, None, "right operand owed by the multiply");
        assert_eq!(add.dependencies.0, vec![multiply.id.clone()]);
    }

    #[test]
    fn decompose_two_pending_operands() {
        let graph =
            decompose("e1", "(1+2)*(3+4)", &DelayTable::default()).expect("should decompose");
        let TaskGraph::Operators(tasks) = graph else {
            panic!("expected operator tasks");
        };
        assert_eq!(tasks.len(), 3);

        let multiply = &tasks[2];
        assert_eq!(multiply.operation, "*");
        assert_eq!(multiply.arg1, None);
        assert_eq!(multiply.arg2, None);
        assert_eq!(
            multiply.dependencies.0,
            vec![tasks[0].id.clone(), tasks[1].id.clone()],
            "left add first, right add second"
        );
    }

    #[test]
    fn decompose_pending_left_with_zero_right() {
        // The static right operand being zero must not confuse slot
        // assignment downstream: arg2 is present, arg1 is owed.
        let graph = decompose("e1", "(1+2)*0", &DelayTable::default()).expect("should decompose");
        let TaskGraph::Operators(tasks) = graph else {
            panic!("expected operator tasks");
        };
        let multiply = &tasks[1];
        assert_eq!(multiply.arg1, None);
        assert_eq!(multiply.arg2, Some(0.0));
        assert_eq!(multiply.dependencies.len(), 1);
    }

    #[test]
    fn decompose_lone_literal() {
        let graph = decompose("e1", "42", &DelayTable::default()).expect("should decompose");
        assert!(matches!(graph, TaskGraph::Literal(v) if v == 42.0));
    }

    #[test]
    fn decompose_applies_delay_table() {
        let delays = DelayTable {
            addition_ms: 100,
            subtraction_ms: 200,
            multiplication_ms: 300,
            division_ms: 400,
        };
        let graph = decompose("e1", "1+2*3", &delays).expect("should decompose");
        let TaskGraph::Operators(tasks) = graph else {
            panic!("expected operator tasks");
        };
        assert_eq!(tasks[0].operation_time, 300);
        assert_eq!(tasks[1].operation_time, 100);
    }

    #[test]
    fn decompose_rejects_empty() {
        assert!(matches!(
            decompose("e1", "   ", &DelayTable::default()),
            Err(ExpressionParseError::Empty)
        ));
    }

    #[test]
    fn decompose_rejects_malformed_literal() {
        assert!(matches!(
            decompose("e1", "1+abc", &DelayTable::default()),
            Err(ExpressionParseError::MalformedLiteral(_))
        ));
    }

    #[test]
    fn decompose_rejects_trailing_operator() {
        assert!(matches!(
            decompose("e1", "1+", &DelayTable::default()),
            Err(ExpressionParseError::MissingOperand(_))
        ));
    }

    #[test]
    fn decompose_rejects_adjacent_literals() {
        assert!(matches!(
            decompose("e1", "1 2", &DelayTable::default()),
            Err(ExpressionParseError::DanglingOperands)
        ));
    }
}
