//! Permission rule chains.
//!
//! A chain is parsed once from a chmod-like specification such as
//! `og-x,og+rD,u=rwX,g+rw` or `0644,a+X` and then rewrites the nine
//! permission bits of every mode handed to [`PermChain::apply`].
//!
//! Rules run left to right and each sees the mode produced by the previous
//! one, but symbolic operands (`u`, `g`, `o`, `X`, `D`) always read the mode
//! the chain was originally given.

use crate::error::ConfigError;
use std::str::FromStr;

/// The nine owner/group/other permission bits.
pub const PERM_MASK: u32 = 0o777;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;

/// True if the file type bits of `mode` denote a directory.
pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// True if the file type bits of `mode` denote a symbolic link.
pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Spreads one rwx triad into all three classes, e.g. `5` -> `0555`.
fn triad_to_all(perms: u32) -> u32 {
    let perms = perms & 0o7;
    perms | (perms << 3) | (perms << 6)
}

/// Which kinds of inode a symbolic rule touches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppliesTo {
    Files,
    Directories,
    Both,
}

impl AppliesTo {
    fn matches(self, mode: u32) -> bool {
        match self {
            Self::Both => true,
            Self::Files => !is_dir_mode(mode),
            Self::Directories => is_dir_mode(mode),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operator {
    /// `=`
    Assign,
    /// `+`
    Add,
    /// `-`
    Remove,
}

/// Right-hand side symbol of a symbolic rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    Read,
    Write,
    Execute,
    /// `X`: execute if the original is a directory or already executable.
    ExecuteIfAny,
    /// `D`: execute for directories only.
    ExecuteIfDir,
    /// `s`: accepted and ignored.
    SetId,
    /// `t`: accepted and ignored.
    Sticky,
    CopyUser,
    CopyGroup,
    CopyOther,
}

impl Operand {
    fn from_char(ch: char) -> Option<Self> {
        Some(match ch {
            'r' => Self::Read,
            'w' => Self::Write,
            'x' => Self::Execute,
            'X' => Self::ExecuteIfAny,
            'D' => Self::ExecuteIfDir,
            's' => Self::SetId,
            't' => Self::Sticky,
            'u' => Self::CopyUser,
            'g' => Self::CopyGroup,
            'o' => Self::CopyOther,
            _ => return None,
        })
    }

    /// Bits this operand stands for, in all three classes, given the
    /// chain's original input mode.
    fn resolve(self, original: u32) -> u32 {
        match self {
            Self::Read => 0o444,
            Self::Write => 0o222,
            Self::Execute => 0o111,
            Self::ExecuteIfAny => {
                if is_dir_mode(original) || original & 0o111 != 0 {
                    0o111
                } else {
                    0
                }
            }
            Self::ExecuteIfDir => {
                if is_dir_mode(original) {
                    0o111
                } else {
                    0
                }
            }
            Self::SetId | Self::Sticky => 0,
            Self::CopyUser => triad_to_all(original >> 6),
            Self::CopyGroup => triad_to_all(original >> 3),
            Self::CopyOther => triad_to_all(original),
        }
    }
}

/// One link of a [`PermChain`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PermRule {
    Symbolic {
        /// Subset of [`PERM_MASK`] selected by the `u`/`g`/`o`/`a` prefix.
        mask: u32,
        op: Operator,
        operands: Vec<Operand>,
        applies_to: AppliesTo,
    },
    /// Literal replacement of the nine permission bits.
    Octal { mode: u32 },
}

impl PermRule {
    fn apply(&self, current: u32, original: u32) -> u32 {
        match self {
            Self::Octal { mode } => (current & !PERM_MASK) | mode,
            Self::Symbolic {
                mask,
                op,
                operands,
                applies_to,
            } => {
                // Applicability follows the evolving mode; type bits never
                // change inside a chain so this equals the original's type.
                if !applies_to.matches(current) {
                    return current;
                }
                let bits = operands
                    .iter()
                    .fold(0, |acc, operand| acc | operand.resolve(original))
                    & mask;
                match op {
                    Operator::Assign => (current & !mask) | bits,
                    Operator::Add => current | bits,
                    Operator::Remove => current & !bits,
                }
            }
        }
    }
}

/// Ordered, immutable list of permission rules.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PermChain {
    rules: Vec<PermRule>,
}

impl PermChain {
    /// An empty chain; [`apply`](Self::apply) returns its input unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma- or colon-separated specification.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut chain = Self::new();
        chain.append(spec)?;
        Ok(chain)
    }

    /// Appends the rules of `spec`. On error the chain is left untouched.
    pub fn append(&mut self, spec: &str) -> Result<(), ConfigError> {
        let rules = parse_rules(spec)?;
        self.rules.extend(rules);
        Ok(())
    }

    /// Runs every rule over `mode` and returns the result.
    pub fn apply(&self, mode: u32) -> u32 {
        self.rules
            .iter()
            .fold(mode, |current, rule| rule.apply(current, mode))
    }

    pub fn rules(&self) -> &[PermRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

impl FromStr for PermChain {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_rules(spec: &str) -> Result<Vec<PermRule>, ConfigError> {
    let mut clauses: Vec<&str> = spec.split(|c: char| c == ',' || c == ':').collect();
    // A single trailing separator is tolerated, as is the empty spec.
    if clauses.last().is_some_and(|c| c.is_empty()) {
        clauses.pop();
    }
    clauses
        .into_iter()
        .map(|clause| parse_clause(spec, clause))
        .collect()
}

fn parse_clause(spec: &str, clause: &str) -> Result<PermRule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPermSpec {
        spec: spec.to_string(),
        reason,
    };

    if clause.is_empty() {
        return Err(invalid("empty clause".to_string()));
    }

    if clause.starts_with(|c: char| c.is_ascii_digit()) {
        return match u32::from_str_radix(clause, 8) {
            Ok(mode) if mode <= PERM_MASK => Ok(PermRule::Octal { mode }),
            _ => Err(invalid(format!("'{clause}' is not an octal mode up to 0777"))),
        };
    }

    let mut mask = 0;
    let mut files = false;
    let mut dirs = false;
    let mut op = None;

    let mut chars = clause.chars();
    for ch in chars.by_ref() {
        match ch {
            'u' => mask |= 0o700,
            'g' => mask |= 0o070,
            'o' => mask |= 0o007,
            'a' => mask = PERM_MASK,
            'f' => files = true,
            'd' => dirs = true,
            '=' => {
                op = Some(Operator::Assign);
                break;
            }
            '+' => {
                op = Some(Operator::Add);
                break;
            }
            '-' => {
                op = Some(Operator::Remove);
                break;
            }
            other => {
                return Err(invalid(format!(
                    "unexpected '{other}' before operator in '{clause}'"
                )))
            }
        }
    }

    let op = op.ok_or_else(|| invalid(format!("'{clause}' has no operator")))?;

    let mut operands = Vec::new();
    for ch in chars {
        let operand = Operand::from_char(ch)
            .ok_or_else(|| invalid(format!("unexpected operand '{ch}' in '{clause}'")))?;
        if !operands.contains(&operand) {
            operands.push(operand);
        }
    }

    // Only a bare leading operator selects everyone; `f-x` alone selects nobody.
    if clause.starts_with(['=', '+', '-']) {
        mask = PERM_MASK;
    }

    let applies_to = match (files, dirs) {
        (true, false) => AppliesTo::Files,
        (false, true) => AppliesTo::Directories,
        _ => AppliesTo::Both,
    };

    Ok(PermRule::Symbolic {
        mask,
        op,
        operands,
        applies_to,
    })
}
