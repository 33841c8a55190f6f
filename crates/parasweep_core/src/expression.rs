use crate::traits::Scalar;
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeSet, HashMap};

/// OpCodes for the stack-based virtual machine that evaluates transition values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a parameter (by index) onto the stack.
    /// Indices follow the parameter order of the model.
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
    /// Pops top two values (b, a), pushes min(a, b).
    Min,
    /// Pops top two values (b, a), pushes max(a, b).
    Max,
    /// Pops top value (a), pushes sqrt(a).
    Sqrt,
    /// Pops top value (a), pushes exp(a).
    Exp,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// A compiled sequence of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn constant(value: f64) -> Self {
        Self {
            ops: vec![OpCode::LoadConst(value)],
        }
    }

    /// True when the result does not depend on any parameter.
    pub fn is_constant(&self) -> bool {
        !self.ops.iter().any(|op| matches!(op, OpCode::LoadParam(_)))
    }
}

/// Stateless stack machine; `execute` receives everything it needs.
pub struct VM;

impl VM {
    /// Executes `bytecode` against `params`, using `stack` as scratch space.
    pub fn execute<T: Scalar>(bytecode: &Bytecode, params: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap_or_else(T::nan));
                }
                OpCode::LoadParam(idx) => {
                    stack.push(params[*idx]);
                }
                OpCode::Add => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a.powf(b));
                }
                OpCode::Min => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a.min(b));
                }
                OpCode::Max => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a.max(b));
                }
                OpCode::Sqrt => {
                    let a = pop(stack);
                    stack.push(a.sqrt());
                }
                OpCode::Exp => {
                    let a = pop(stack);
                    stack.push(a.exp());
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
            }
        }

        pop(stack)
    }
}

fn pop<T>(stack: &mut Vec<T>) -> T {
    stack
        .pop()
        .expect("compiled bytecode keeps the stack balanced")
}

fn pop_pair<T>(stack: &mut Vec<T>) -> (T, T) {
    let b = pop(stack);
    let a = pop(stack);
    (a, b)
}

// --- AST & Compiler ---

/// Abstract syntax tree of a value expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Identifier(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn sum(self, other: Expr) -> Expr {
        Expr::Binary(Box::new(self), '+', Box::new(other))
    }

    /// Every identifier the expression mentions.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_identifiers(&mut names);
        names
    }

    fn collect_identifiers(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Identifier(name) => {
                names.insert(name.clone());
            }
            Expr::Binary(left, _, right) => {
                left.collect_identifiers(names);
                right.collect_identifiers(names);
            }
            Expr::Unary(_, operand) => operand.collect_identifiers(names),
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_identifiers(names);
                }
            }
        }
    }
}

/// Compiles an [`Expr`] into [`Bytecode`].
/// Parameters resolve to indices; constants are inlined as literals.
pub struct Compiler {
    pub param_map: HashMap<String, usize>,
    pub constants: HashMap<String, f64>,
}

impl Compiler {
    pub fn new(param_names: &[String], constants: &HashMap<String, f64>) -> Self {
        let mut param_map = HashMap::new();
        for (i, name) in param_names.iter().enumerate() {
            param_map.insert(name.clone(), i);
        }

        Self {
            param_map,
            constants: constants.clone(),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Identifier(name) => {
                if let Some(&value) = self.constants.get(name) {
                    ops.push(OpCode::LoadConst(value));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else {
                    bail!("Unknown constant or parameter `{}`.", name);
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => bail!("Unknown binary operator `{}`.", op),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("Unknown unary operator `{}`.", op),
                }
            }
            Expr::Call(func, args) => {
                let (arity, opcode) = match func.as_str() {
                    "sqrt" => (1, OpCode::Sqrt),
                    "exp" => (1, OpCode::Exp),
                    "min" => (2, OpCode::Min),
                    "max" => (2, OpCode::Max),
                    _ => bail!("Unknown function `{}`.", func),
                };
                if args.len() != arity {
                    bail!(
                        "Function `{}` expects {} argument(s), got {}.",
                        func,
                        arity,
                        args.len()
                    );
                }
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(opcode);
            }
        }
        Ok(())
    }
}

/// Evaluates a parameter-free expression using the given constants.
pub fn evaluate_constant(expr: &Expr, constants: &HashMap<String, f64>) -> Result<f64> {
    let bytecode = Compiler::new(&[], constants).compile(expr)?;
    let mut stack = Vec::with_capacity(16);
    Ok(VM::execute::<f64>(&bytecode, &[], &mut stack))
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        bail!("Empty expression.");
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        bail!("Unexpected trailing token {:?} in `{}`.", token, input);
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Comma,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent part: e.g. 1e-3, 2.5E+4
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                    i = j;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| anyhow!("Invalid number `{}`.", text))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                ',' => Token::Comma,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => bail!("Unexpected character `{}` in `{}`.", c, input),
            });
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(anyhow!("Expected ')'.")),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative: a^b^c = a^(b^c); binds tighter than unary minus.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let mut args = vec![self.parse_expression()?];
                    while let Some(Token::Comma) = self.peek() {
                        self.consume();
                        args.push(self.parse_expression()?);
                    }
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Identifier(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(anyhow!("Unexpected token {:?}.", token)),
            None => Err(anyhow!("Unexpected end of expression.")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_with(input: &str, params: &[&str], constants: &[(&str, f64)]) -> Result<Bytecode> {
        let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        let constants: HashMap<String, f64> = constants
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        Compiler::new(&params, &constants).compile(&parse(input)?)
    }

    fn run(code: &Bytecode, params: &[f64]) -> f64 {
        let mut stack = Vec::new();
        VM::execute(code, params, &mut stack)
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn evaluates_parametric_probability() {
        let code = compile_with("1 - p*q", &["p", "q"], &[]).expect("compiles");
        assert!((run(&code, &[0.5, 0.4]) - 0.8).abs() < 1e-12);
        assert!(!code.is_constant());
    }

    #[test]
    fn inlines_constants() {
        let code = compile_with("N * 0.1 + 2e-1", &[], &[("N", 3.0)]).expect("compiles");
        assert!(code.is_constant());
        assert!((run(&code, &[]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn power_binds_tighter_than_negation() {
        let code = compile_with("-p^2", &["p"], &[]).expect("compiles");
        assert_eq!(run(&code, &[3.0]), -9.0);
        let code = compile_with("2^3^2", &[], &[]).expect("compiles");
        assert_eq!(run(&code, &[]), 512.0);
    }

    #[test]
    fn supports_functions() {
        let code = compile_with("min(p, 1 - p) + max(0, sqrt(4)) * exp(0)", &["p"], &[])
            .expect("compiles");
        assert!((run(&code, &[0.7]) - 2.3).abs() < 1e-12);
    }

    #[test]
    fn reports_bad_input() {
        assert_err_contains(compile_with("p + r", &["p"], &[]), "Unknown constant or parameter `r`");
        assert_err_contains(compile_with("log(p)", &["p"], &[]), "Unknown function `log`");
        assert_err_contains(compile_with("min(p)", &["p"], &[]), "expects 2 argument(s)");
        assert_err_contains(parse("p $ q"), "Unexpected character");
        assert_err_contains(parse("(p + q"), "Expected ')'");
        assert_err_contains(parse("p q"), "trailing token");
        assert_err_contains(parse("   "), "Empty expression");
    }

    #[test]
    fn collects_identifiers() {
        let expr = parse("a * (b + max(c, a))").expect("parses");
        let names: Vec<String> = expr.identifiers().into_iter().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
