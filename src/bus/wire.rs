use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};

use crate::bus::address::Address;

pub const PROTOCOL_VERSION: &str = "mbus/1.0";

/// A single argument value on the wire. The grammar distinguishes symbols
///  (leading-alphabetic, whitespace-terminated), double-quoted strings,
///  integers, floats and parenthesized lists. Lists nest, and a quoted string
///  may contain literal parentheses.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Symbol(String),
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<WireValue>),
}

impl Display for WireValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WireValue::Symbol(s) => write!(f, "{}", s),
            WireValue::Str(s) => write!(f, "{}", encode_str(s)),
            WireValue::Int(n) => write!(f, "{}", n),
            WireValue::Float(x) => {
                // keep the decimal point so the value reparses as a float
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                }
                else {
                    write!(f, "{}", x)
                }
            }
            WireValue::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One (command, argument-list) pair, e.g. `mbus.waiting ("tok")`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<WireValue>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<WireValue>) -> Command {
        Command {
            name: name.into(),
            args,
        }
    }
}

/// The in-memory representation of one datagram. Transient - it exists only
///  during send / receive processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub seq: u64,
    pub reliable: bool,
    pub source: Address,
    pub dest: Address,
    pub acks: Vec<u64>,
    pub commands: Vec<Command>,
}

impl Message {
    /// `mbus/1.0 <seq> <R|U> (<src>) (<dst>) (<ack-seqs>)\n<cmd> (<args>)\n...`
    ///
    /// Piggybacked command lines precede the primary command; the caller is
    ///  expected to order `commands` accordingly.
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{} {} {} ({}) ({}) (",
            PROTOCOL_VERSION,
            self.seq,
            if self.reliable { 'R' } else { 'U' },
            self.source,
            self.dest,
        );

        for (i, ack) in self.acks.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&ack.to_string());
        }
        out.push_str(")\n");

        for cmd in &self.commands {
            out.push_str(&cmd.name);
            out.push_str(" (");
            for (i, arg) in cmd.args.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&arg.to_string());
            }
            out.push_str(")\n");
        }
        out
    }

    pub fn parse(input: &str) -> anyhow::Result<Message> {
        let mut cur = Cursor::new(input);

        cur.skip_ws();
        let version = cur.take_token();
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {:?}", version);
        }

        cur.skip_ws();
        let seq = cur
            .take_token()
            .parse::<u64>()
            .map_err(|e| anyhow!("invalid sequence number: {}", e))?;

        cur.skip_ws();
        let reliable = match cur.take_token() {
            "R" => true,
            "U" => false,
            other => bail!("invalid reliability flag {:?}", other),
        };

        cur.skip_ws();
        let source = Address::parse(cur.parse_paren_raw()?);
        cur.skip_ws();
        let dest = Address::parse(cur.parse_paren_raw()?);

        cur.skip_ws();
        let acks = cur
            .parse_paren_raw()?
            .split_whitespace()
            .map(|t| {
                t.parse::<u64>()
                    .map_err(|e| anyhow!("invalid ack sequence number {:?}: {}", t, e))
            })
            .collect::<anyhow::Result<Vec<u64>>>()?;

        let mut commands = Vec::new();
        loop {
            cur.skip_ws();
            if cur.at_end() {
                break;
            }

            match cur.peek() {
                Some(c) if c.is_ascii_alphabetic() => {}
                other => bail!("expected a command name, found {:?}", other),
            }
            let name = cur.take_token().to_string();

            cur.skip_ws();
            if cur.peek() != Some('(') {
                bail!("command {:?} is missing its argument list", name);
            }
            let args = cur.parse_list()?;

            commands.push(Command { name, args });
        }

        Ok(Message {
            seq,
            reliable,
            source,
            dest,
            acks,
            commands,
        })
    }
}

/// Quotes a string for the wire. Embedded quotes and spaces are escaped as
///  `\"` and `\ `; a backslash escapes itself so that [decode_str] is an
///  exact inverse for every input.
pub fn encode_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == ' ' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Inverse of [encode_str]: expects the surrounding quotes and resolves
///  `\x` to `x` for any `x`.
pub fn decode_str(s: &str) -> anyhow::Result<String> {
    let mut cur = Cursor::new(s);
    if cur.peek() != Some('"') {
        bail!("quoted string must start with '\"'");
    }
    let decoded = cur.parse_string()?;
    if !cur.at_end() {
        bail!("trailing characters after closing quote");
    }
    Ok(decoded)
}

/// Recursive-descent parser state: an immutable input slice and a cursor.
pub(crate) struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a str) -> Cursor<'a> {
        Cursor { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.bump();
        }
    }

    /// Consumes and returns the maximal run of non-whitespace characters.
    fn take_token(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().map(|c| !c.is_whitespace()).unwrap_or(false) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    /// Parses one value; the cursor must be at its first character.
    fn parse_value(&mut self) -> anyhow::Result<WireValue> {
        match self.peek() {
            Some('(') => Ok(WireValue::List(self.parse_list()?)),
            Some('"') => Ok(WireValue::Str(self.parse_string()?)),
            Some(c) if c.is_ascii_alphabetic() => Ok(WireValue::Symbol(self.take_token().to_string())),
            Some(_) => {
                let token = self.take_token();
                if token.contains('.') {
                    Ok(WireValue::Float(
                        token
                            .parse::<f64>()
                            .map_err(|e| anyhow!("invalid float {:?}: {}", token, e))?,
                    ))
                }
                else {
                    Ok(WireValue::Int(
                        token
                            .parse::<i64>()
                            .map_err(|e| anyhow!("invalid integer {:?}: {}", token, e))?,
                    ))
                }
            }
            None => bail!("unexpected end of input, expected a value"),
        }
    }

    /// Parses a parenthesized list of values; the cursor must be at `(`.
    fn parse_list(&mut self) -> anyhow::Result<Vec<WireValue>> {
        match self.bump() {
            Some('(') => {}
            other => bail!("expected '(', found {:?}", other),
        }

        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(')') => {
                    self.bump();
                    return Ok(items);
                }
                Some(_) => items.push(self.parse_value()?),
                None => bail!("unbalanced parentheses: list is not closed"),
            }
        }
    }

    /// Parses a double-quoted string; the cursor must be at the opening `"`.
    fn parse_string(&mut self) -> anyhow::Result<String> {
        match self.bump() {
            Some('"') => {}
            other => bail!("expected '\"', found {:?}", other),
        }

        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(escaped) => out.push(escaped),
                    None => bail!("dangling escape at end of input"),
                },
                Some('"') => return Ok(out),
                Some(c) => out.push(c),
                None => bail!("unterminated string"),
            }
        }
    }

    /// Returns the raw text between a balanced pair of parentheses, honoring
    ///  nested parentheses and quoted strings (so a quoted string may contain
    ///  literal parentheses). The cursor must be at the opening `(`.
    fn parse_paren_raw(&mut self) -> anyhow::Result<&'a str> {
        match self.bump() {
            Some('(') => {}
            other => bail!("expected '(', found {:?}", other),
        }

        let start = self.pos;
        let mut depth = 1usize;
        let mut in_string = false;
        let mut escaped = false;

        while let Some(c) = self.bump() {
            if in_string {
                if escaped {
                    escaped = false;
                }
                else if c == '\\' {
                    escaped = true;
                }
                else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(&self.input[start..self.pos - 1]);
                    }
                }
                _ => {}
            }
        }
        bail!("unbalanced parentheses: missing closing ')'");
    }
}
