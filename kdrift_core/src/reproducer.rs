use bincode::{Decode, Encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::LazyLock;

static NUMERIC_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:0[xX][0-9a-fA-F]+|[0-9]+)\b").ok());

/// An ordered sequence of operations (syscall invocations or packet lines) that
/// replays a crash. Order is significant and always preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode)]
#[serde(transparent)]
pub struct Reproducer {
    ops: Vec<String>,
}

/// A numeric literal inside one operation of a reproducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericToken {
    /// Index of the operation holding the literal.
    pub op_index: usize,
    /// Zero-based argument position inside the call's parentheses, if the
    /// literal sits inside them.
    pub arg_index: Option<usize>,
    /// Byte span of the literal within the operation text.
    pub span: Range<usize>,
    pub value: u64,
    pub hex: bool,
}

impl Reproducer {
    pub fn new(ops: Vec<String>) -> Self {
        Self { ops }
    }

    /// Parses program text: one operation per line, blank lines and `#` comments dropped.
    pub fn from_program_text(text: &str) -> Self {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    pub fn to_program_text(&self) -> String {
        let mut text = self.ops.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    pub fn ops(&self) -> &[String] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<String> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// A copy with the operations in `range` removed.
    pub fn without_range(&self, range: Range<usize>) -> Reproducer {
        let end = range.end.min(self.ops.len());
        let start = range.start.min(end);
        let mut ops = Vec::with_capacity(self.ops.len() - (end - start));
        ops.extend_from_slice(&self.ops[..start]);
        ops.extend_from_slice(&self.ops[end..]);
        Reproducer { ops }
    }

    /// The call name of operation `op_index`, without any `rN = ` result binding.
    pub fn operation_name(&self, op_index: usize) -> &str {
        let Some(op) = self.ops.get(op_index) else {
            return "";
        };
        let call = match op.split_once('=') {
            Some((lhs, rhs)) if !lhs.contains('(') => rhs.trim_start(),
            _ => op.as_str(),
        };
        let name_end = call.find('(').unwrap_or(call.len());
        call[..name_end].trim()
    }

    /// Every standalone decimal or hex literal, in operation order then text order.
    /// Literals that overflow `u64` are skipped.
    pub fn numeric_tokens(&self) -> Vec<NumericToken> {
        let Some(regex) = NUMERIC_TOKEN.as_ref() else {
            return Vec::new();
        };
        let mut tokens = Vec::new();
        for (op_index, op) in self.ops.iter().enumerate() {
            for found in regex.find_iter(op) {
                let literal = found.as_str();
                let (value, hex) = match literal
                    .strip_prefix("0x")
                    .or_else(|| literal.strip_prefix("0X"))
                {
                    Some(digits) => (u64::from_str_radix(digits, 16), true),
                    None => (literal.parse::<u64>(), false),
                };
                let Ok(value) = value else {
                    continue;
                };
                tokens.push(NumericToken {
                    op_index,
                    arg_index: argument_position(op, found.start()),
                    span: found.range(),
                    value,
                    hex,
                });
            }
        }
        tokens
    }

    /// A copy with `token` replaced by `value`, keeping the token's radix.
    pub fn with_value(&self, token: &NumericToken, value: u64) -> Reproducer {
        let mut ops = self.ops.clone();
        if let Some(op) = ops.get_mut(token.op_index) {
            if token.span.end <= op.len() {
                let literal = if token.hex {
                    format!("{value:#x}")
                } else {
                    value.to_string()
                };
                op.replace_range(token.span.clone(), &literal);
            }
        }
        Reproducer { ops }
    }
}

impl From<Vec<String>> for Reproducer {
    fn from(ops: Vec<String>) -> Self {
        Self::new(ops)
    }
}

impl From<Vec<&str>> for Reproducer {
    fn from(ops: Vec<&str>) -> Self {
        ops.into_iter().map(str::to_string).collect()
    }
}

impl FromIterator<String> for Reproducer {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

fn argument_position(op: &str, offset: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut arg = 0usize;
    let mut in_string = false;
    for ch in op[..offset].chars() {
        match ch {
            '\'' | '"' => in_string = !in_string,
            _ if in_string => {}
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 1 => arg += 1,
            _ => {}
        }
    }
    (depth >= 1).then_some(arg)
}
