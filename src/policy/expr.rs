//! Built-in policy expression evaluator.
//!
//! Policy functions are stored as source text and evaluated under a narrow
//! numeric contract: arguments are f64 scalars or f64 vectors, the result is
//! a single f64. The language is a minimal s-expression dialect: a
//! top-level `(lambda (params...) body)` over arithmetic, comparison and
//! vector-indexing builtins. There is deliberately no host access of any
//! kind: an expression sees its arguments and nothing else.
//!
//! Evaluation is budgeted three ways (source size, step count, wall clock);
//! exceeding any budget aborts the run. The engine treats an aborted run as
//! a policy `fail` and falls back to its built-in behaviour, so a bad
//! expression can never wedge recall.

use std::time::{Duration, Instant};

use crate::error::{MemoryError, MemoryResult};

use super::{Evaluator, Value};

/// Budget limits for a single evaluation.
#[derive(Debug, Clone)]
pub struct EvalLimits {
    /// Maximum source length in bytes.
    pub max_source_bytes: usize,
    /// Maximum recursion depth of the expression tree.
    pub max_depth: usize,
    /// Maximum number of evaluation steps.
    pub max_steps: u64,
    /// Wall-clock budget, checked at step boundaries.
    pub timeout: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 8 * 1024,
            max_depth: 64,
            max_steps: 100_000,
            timeout: Duration::from_secs(5),
        }
    }
}

/// The default expression evaluator.
#[derive(Debug, Clone, Default)]
pub struct ExprEvaluator {
    limits: EvalLimits,
}

impl ExprEvaluator {
    /// Create an evaluator with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an evaluator with a custom wall-clock budget.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            limits: EvalLimits {
                timeout,
                ..EvalLimits::default()
            },
        }
    }
}

impl Evaluator for ExprEvaluator {
    fn evaluate(&self, source: &str, args: &[Value]) -> MemoryResult<f64> {
        if source.len() > self.limits.max_source_bytes {
            return Err(MemoryError::EvalError {
                reason: format!(
                    "source exceeds {} bytes",
                    self.limits.max_source_bytes
                ),
            });
        }
        let program = parse_program(source)?;
        if program.params.len() != args.len() {
            return Err(MemoryError::EvalError {
                reason: format!(
                    "arity mismatch: expression takes {} arguments, got {}",
                    program.params.len(),
                    args.len()
                ),
            });
        }
        let mut ctx = EvalCtx {
            steps: 0,
            deadline: Instant::now() + self.limits.timeout,
            limits: &self.limits,
        };
        let mut env: Vec<(String, Value)> = program
            .params
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        let value = eval(&program.body, &mut env, &mut ctx, 0)?;
        match value {
            Value::Num(n) if n.is_finite() => Ok(n),
            Value::Num(_) => Err(MemoryError::EvalError {
                reason: "expression produced a non-finite number".to_string(),
            }),
            Value::Vec(_) => Err(MemoryError::EvalError {
                reason: "expression must return a number, not a vector".to_string(),
            }),
        }
    }
}

/// A parsed top-level lambda.
#[derive(Debug, Clone)]
struct Program {
    params: Vec<String>,
    body: Expr,
}

/// Expression tree.
#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Sym(String),
    List(Vec<Expr>),
}

struct EvalCtx<'a> {
    steps: u64,
    deadline: Instant,
    limits: &'a EvalLimits,
}

impl EvalCtx<'_> {
    fn tick(&mut self) -> MemoryResult<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(MemoryError::EvalTimeout);
        }
        // Checking the clock on every 1024th step keeps the fast path cheap.
        if self.steps % 1024 == 0 && Instant::now() > self.deadline {
            return Err(MemoryError::EvalTimeout);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

fn parse_program(source: &str) -> MemoryResult<Program> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let expr = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(err_parse("trailing tokens after expression"));
    }
    match expr {
        Expr::List(items) => {
            let mut it = items.into_iter();
            match it.next() {
                Some(Expr::Sym(ref s)) if s == "lambda" => {}
                _ => return Err(err_parse("top-level form must be (lambda (args...) body)")),
            }
            let params = match it.next() {
                Some(Expr::List(params)) => params
                    .into_iter()
                    .map(|p| match p {
                        Expr::Sym(s) => Ok(s),
                        _ => Err(err_parse("lambda parameters must be symbols")),
                    })
                    .collect::<MemoryResult<Vec<_>>>()?,
                _ => return Err(err_parse("lambda needs a parameter list")),
            };
            let body = it
                .next()
                .ok_or_else(|| err_parse("lambda needs a body"))?;
            if it.next().is_some() {
                return Err(err_parse("lambda takes exactly one body expression"));
            }
            Ok(Program { params, body })
        }
        _ => Err(err_parse("top-level form must be (lambda (args...) body)")),
    }
}

fn err_parse(reason: &str) -> MemoryError {
    MemoryError::EvalError {
        reason: reason.to_string(),
    }
}

fn tokenize(source: &str) -> MemoryResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in source.chars() {
        match ch {
            '(' | ')' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(ch.to_string());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ';' => break, // comment to end of source
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(err_parse("empty expression"));
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[String], pos: &mut usize) -> MemoryResult<Expr> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| err_parse("unexpected end of input"))?;
    *pos += 1;
    match token.as_str() {
        "(" => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(t) if t == ")" => {
                        *pos += 1;
                        return Ok(Expr::List(items));
                    }
                    Some(_) => items.push(parse_expr(tokens, pos)?),
                    None => return Err(err_parse("unbalanced parentheses")),
                }
            }
        }
        ")" => Err(err_parse("unexpected ')'")),
        atom => {
            if let Ok(n) = atom.parse::<f64>() {
                Ok(Expr::Num(n))
            } else {
                Ok(Expr::Sym(atom.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval(
    expr: &Expr,
    env: &mut Vec<(String, Value)>,
    ctx: &mut EvalCtx<'_>,
    depth: usize,
) -> MemoryResult<Value> {
    ctx.tick()?;
    if depth > ctx.limits.max_depth {
        return Err(MemoryError::EvalError {
            reason: "expression nesting too deep".to_string(),
        });
    }
    match expr {
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Sym(name) => env
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| MemoryError::EvalError {
                reason: format!("unbound symbol '{name}'"),
            }),
        Expr::List(items) => {
            let (head, rest) = items.split_first().ok_or_else(|| MemoryError::EvalError {
                reason: "cannot evaluate empty list".to_string(),
            })?;
            let op = match head {
                Expr::Sym(s) => s.as_str(),
                _ => {
                    return Err(MemoryError::EvalError {
                        reason: "operator position must be a symbol".to_string(),
                    })
                }
            };
            match op {
                "if" => {
                    if rest.len() != 3 {
                        return Err(MemoryError::EvalError {
                            reason: "if takes (if cond then else)".to_string(),
                        });
                    }
                    let cond = eval_num(&rest[0], env, ctx, depth + 1)?;
                    let branch = if cond != 0.0 { &rest[1] } else { &rest[2] };
                    eval(branch, env, ctx, depth + 1)
                }
                "and" => {
                    for item in rest {
                        if eval_num(item, env, ctx, depth + 1)? == 0.0 {
                            return Ok(Value::Num(0.0));
                        }
                    }
                    Ok(Value::Num(1.0))
                }
                "or" => {
                    for item in rest {
                        if eval_num(item, env, ctx, depth + 1)? != 0.0 {
                            return Ok(Value::Num(1.0));
                        }
                    }
                    Ok(Value::Num(0.0))
                }
                "let" => {
                    let bindings = match rest.first() {
                        Some(Expr::List(bindings)) => bindings,
                        _ => {
                            return Err(MemoryError::EvalError {
                                reason: "let takes (let ((name expr)...) body)".to_string(),
                            })
                        }
                    };
                    if rest.len() != 2 {
                        return Err(MemoryError::EvalError {
                            reason: "let takes exactly one body expression".to_string(),
                        });
                    }
                    let scope_base = env.len();
                    for binding in bindings {
                        match binding {
                            Expr::List(pair) if pair.len() == 2 => {
                                let name = match &pair[0] {
                                    Expr::Sym(s) => s.clone(),
                                    _ => {
                                        env.truncate(scope_base);
                                        return Err(MemoryError::EvalError {
                                            reason: "let binding name must be a symbol"
                                                .to_string(),
                                        });
                                    }
                                };
                                let value = match eval(&pair[1], env, ctx, depth + 1) {
                                    Ok(v) => v,
                                    Err(e) => {
                                        env.truncate(scope_base);
                                        return Err(e);
                                    }
                                };
                                env.push((name, value));
                            }
                            _ => {
                                env.truncate(scope_base);
                                return Err(MemoryError::EvalError {
                                    reason: "let bindings must be (name expr) pairs".to_string(),
                                });
                            }
                        }
                    }
                    let result = eval(&rest[1], env, ctx, depth + 1);
                    env.truncate(scope_base);
                    result
                }
                _ => {
                    let mut args = Vec::with_capacity(rest.len());
                    for item in rest {
                        args.push(eval(item, env, ctx, depth + 1)?);
                    }
                    apply_builtin(op, &args)
                }
            }
        }
    }
}

fn eval_num(
    expr: &Expr,
    env: &mut Vec<(String, Value)>,
    ctx: &mut EvalCtx<'_>,
    depth: usize,
) -> MemoryResult<f64> {
    match eval(expr, env, ctx, depth)? {
        Value::Num(n) => Ok(n),
        Value::Vec(_) => Err(MemoryError::EvalError {
            reason: "expected a number, got a vector".to_string(),
        }),
    }
}

fn apply_builtin(op: &str, args: &[Value]) -> MemoryResult<Value> {
    let nums = || -> MemoryResult<Vec<f64>> {
        args.iter()
            .map(|v| match v {
                Value::Num(n) => Ok(*n),
                Value::Vec(_) => Err(MemoryError::EvalError {
                    reason: format!("'{op}' takes numbers, got a vector"),
                }),
            })
            .collect()
    };
    let unary = |f: fn(f64) -> f64| -> MemoryResult<Value> {
        let ns = nums()?;
        if ns.len() != 1 {
            return Err(MemoryError::EvalError {
                reason: format!("'{op}' takes exactly one argument"),
            });
        }
        Ok(Value::Num(f(ns[0])))
    };
    let binary_cmp = |f: fn(f64, f64) -> bool| -> MemoryResult<Value> {
        let ns = nums()?;
        if ns.len() != 2 {
            return Err(MemoryError::EvalError {
                reason: format!("'{op}' takes exactly two arguments"),
            });
        }
        Ok(Value::Num(if f(ns[0], ns[1]) { 1.0 } else { 0.0 }))
    };

    match op {
        "+" => Ok(Value::Num(nums()?.iter().sum())),
        "*" => Ok(Value::Num(nums()?.iter().product())),
        "-" => {
            let ns = nums()?;
            match ns.split_first() {
                Some((first, [])) => Ok(Value::Num(-first)),
                Some((first, rest)) => Ok(Value::Num(rest.iter().fold(*first, |a, b| a - b))),
                None => Err(MemoryError::EvalError {
                    reason: "'-' needs at least one argument".to_string(),
                }),
            }
        }
        "/" => {
            let ns = nums()?;
            match ns.split_first() {
                Some((first, rest)) if !rest.is_empty() => {
                    Ok(Value::Num(rest.iter().fold(*first, |a, b| a / b)))
                }
                _ => Err(MemoryError::EvalError {
                    reason: "'/' needs at least two arguments".to_string(),
                }),
            }
        }
        "min" => {
            let ns = nums()?;
            ns.iter()
                .cloned()
                .reduce(f64::min)
                .map(Value::Num)
                .ok_or_else(|| MemoryError::EvalError {
                    reason: "'min' needs at least one argument".to_string(),
                })
        }
        "max" => {
            let ns = nums()?;
            ns.iter()
                .cloned()
                .reduce(f64::max)
                .map(Value::Num)
                .ok_or_else(|| MemoryError::EvalError {
                    reason: "'max' needs at least one argument".to_string(),
                })
        }
        "abs" => unary(f64::abs),
        "exp" => unary(f64::exp),
        "ln" => unary(f64::ln),
        "log2" => unary(f64::log2),
        "sqrt" => unary(f64::sqrt),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "not" => unary(|n| if n == 0.0 { 1.0 } else { 0.0 }),
        "pow" => {
            let ns = nums()?;
            if ns.len() != 2 {
                return Err(MemoryError::EvalError {
                    reason: "'pow' takes exactly two arguments".to_string(),
                });
            }
            Ok(Value::Num(ns[0].powf(ns[1])))
        }
        "clamp" => {
            let ns = nums()?;
            if ns.len() != 3 {
                return Err(MemoryError::EvalError {
                    reason: "'clamp' takes (clamp x lo hi)".to_string(),
                });
            }
            Ok(Value::Num(ns[0].clamp(ns[1], ns[2])))
        }
        "<" => binary_cmp(|a, b| a < b),
        "<=" => binary_cmp(|a, b| a <= b),
        ">" => binary_cmp(|a, b| a > b),
        ">=" => binary_cmp(|a, b| a >= b),
        "=" => binary_cmp(|a, b| a == b),
        "len" => match args {
            [Value::Vec(v)] => Ok(Value::Num(v.len() as f64)),
            _ => Err(MemoryError::EvalError {
                reason: "'len' takes exactly one vector".to_string(),
            }),
        },
        "nth" => match args {
            [Value::Vec(v), Value::Num(i)] => {
                let idx = *i;
                if idx.is_finite() && idx >= 0.0 && (idx as usize) < v.len() {
                    Ok(Value::Num(v[idx as usize]))
                } else {
                    Err(MemoryError::EvalError {
                        reason: format!("'nth' index {idx} out of range (len {})", v.len()),
                    })
                }
            }
            _ => Err(MemoryError::EvalError {
                reason: "'nth' takes (nth vec index)".to_string(),
            }),
        },
        other => Err(MemoryError::EvalError {
            reason: format!("unknown operator '{other}'"),
        }),
    }
}
