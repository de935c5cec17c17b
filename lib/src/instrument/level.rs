//! Level expressions
//!
//! A probe can be restricted to fire only when its trace's level field compares a certain way
//! against a threshold. The accepted syntax is a comparison operator followed by an integer:
//!
//! | Syntax | Fires when     |
//! |--------|----------------|
//! | `N`    | `level >= N`   |
//! | `=N`   | `level == N`   |
//! | `>N`   | `level > N`    |
//! | `>=N`  | `level >= N`   |
//! | `<N`   | `level < N`    |
//! | `<=N`  | `level <= N`   |

use crate::jvm::code::OrdComparison;
use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LevelOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Condition on the trace level
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Level {
    pub op: LevelOp,
    pub threshold: i32,
}

impl Level {
    /// Is the condition satisfied by this level?
    pub fn accepts(&self, level: i32) -> bool {
        match self.op {
            LevelOp::Eq => level == self.threshold,
            LevelOp::Gt => level > self.threshold,
            LevelOp::Ge => level >= self.threshold,
            LevelOp::Lt => level < self.threshold,
            LevelOp::Le => level <= self.threshold,
        }
    }

    /// `if_icmp*` comparison which jumps when the condition does _not_ hold
    ///
    /// The gate pushes the level then the threshold, so this is the negation of `level op
    /// threshold`.
    pub fn skip_comparison(&self) -> OrdComparison {
        match self.op {
            LevelOp::Eq => OrdComparison::NE,
            LevelOp::Gt => OrdComparison::LE,
            LevelOp::Ge => OrdComparison::LT,
            LevelOp::Lt => OrdComparison::GE,
            LevelOp::Le => OrdComparison::GT,
        }
    }

    /// Does this condition hold for every level the runtime hands out?
    ///
    /// Levels start at 0 and are never negative, so `>= 0` needs no gate.
    pub fn is_trivial(&self) -> bool {
        matches!(self.op, LevelOp::Ge) && self.threshold <= 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadLevel(pub String);

impl FromStr for Level {
    type Err = BadLevel;

    fn from_str(expression: &str) -> Result<Level, BadLevel> {
        let expression = expression.trim();
        let (op, threshold) = if let Some(rest) = expression.strip_prefix(">=") {
            (LevelOp::Ge, rest)
        } else if let Some(rest) = expression.strip_prefix("<=") {
            (LevelOp::Le, rest)
        } else if let Some(rest) = expression.strip_prefix('>') {
            (LevelOp::Gt, rest)
        } else if let Some(rest) = expression.strip_prefix('<') {
            (LevelOp::Lt, rest)
        } else if let Some(rest) = expression.strip_prefix('=') {
            (LevelOp::Eq, rest)
        } else {
            (LevelOp::Ge, expression)
        };
        let threshold = threshold
            .trim()
            .parse::<i32>()
            .map_err(|_| BadLevel(String::from(expression)))?;
        Ok(Level { op, threshold })
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            LevelOp::Eq => "=",
            LevelOp::Gt => ">",
            LevelOp::Ge => ">=",
            LevelOp::Lt => "<",
            LevelOp::Le => "<=",
        };
        write!(f, "{}{}", op, self.threshold)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn level(expression: &str) -> Level {
        expression.parse().unwrap()
    }

    #[test]
    fn parsing() {
        assert_eq!(level("3"), Level { op: LevelOp::Ge, threshold: 3 });
        assert_eq!(level(">=3"), Level { op: LevelOp::Ge, threshold: 3 });
        assert_eq!(level("> 3"), Level { op: LevelOp::Gt, threshold: 3 });
        assert_eq!(level("<-1"), Level { op: LevelOp::Lt, threshold: -1 });
        assert_eq!(level("<=10"), Level { op: LevelOp::Le, threshold: 10 });
        assert_eq!(level("=2"), Level { op: LevelOp::Eq, threshold: 2 });
        assert!("".parse::<Level>().is_err());
        assert!(">=x".parse::<Level>().is_err());
        assert!("=>1".parse::<Level>().is_err());
        assert_eq!(level("<=10").to_string(), "<=10");
    }

    #[test]
    fn skip_comparison_negates() {
        let ops = [LevelOp::Eq, LevelOp::Gt, LevelOp::Ge, LevelOp::Lt, LevelOp::Le];
        for op in ops {
            let condition = Level { op, threshold: 2 };
            for current in 0..5 {
                let skips = match condition.skip_comparison() {
                    OrdComparison::EQ => current == 2,
                    OrdComparison::NE => current != 2,
                    OrdComparison::LT => current < 2,
                    OrdComparison::LE => current <= 2,
                    OrdComparison::GT => current > 2,
                    OrdComparison::GE => current >= 2,
                };
                assert_eq!(skips, !condition.accepts(current), "{} at {}", condition, current);
            }
        }
    }

    #[test]
    fn trivial_levels() {
        assert!(level(">=0").is_trivial());
        assert!(level("0").is_trivial());
        assert!(!level(">=1").is_trivial());
        assert!(!level("<=0").is_trivial());
    }
}
