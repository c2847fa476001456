//! Canonical command frame and descriptor types.

use ember_common::error::{EmberError, EmberResult};

/// Option flags carried by a [`CommandSpec`].
pub mod opt {
    /// Command only reads its keys; intent locks are shared.
    pub const READONLY: u32 = 1;
    /// Command operates on every shard through whole-shard locks.
    pub const GLOBAL_TRANS: u32 = 1 << 1;
    /// Command is an explicitly queued multi-command batch; keys are locked
    /// incrementally, statement by statement.
    pub const MULTI_BATCH: u32 = 1 << 2;
    /// Command is a scripted multi-operation; all keys are locked ahead.
    pub const MULTI_SCRIPT: u32 = 1 << 3;
    /// Command may suspend on missing data and be woken by a writer.
    pub const BLOCKING: u32 = 1 << 4;
}

/// Command payload representation used between callers and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command name in uppercase canonical form (e.g. `SET`, `MGET`).
    pub name: String,
    /// Raw byte arguments preserving wire-level payload. The command name is
    /// not part of this list.
    pub args: Vec<Vec<u8>>,
}

impl CommandFrame {
    /// Creates a command frame from a command name and argument list.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Arity constraints for a command, counted over [`CommandFrame::args`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandArity {
    /// Command must have exactly this many arguments.
    Exact(usize),
    /// Command must have at least this many arguments.
    AtLeast(usize),
}

/// Location of key arguments inside a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpan {
    /// Command carries no key arguments.
    None,
    /// Keys occupy a fixed range: zero-based `first`, signed `last`
    /// (negative values count back from the end of the argument list, `-1`
    /// being the final argument), and a stride of 1 or 2 (2 for key/value
    /// pairs).
    Range { first: u16, last: i16, step: u8 },
    /// Script-style commands: the argument at `count_index` holds the number
    /// of keys, which immediately follow it.
    Counted { count_index: u16 },
}

/// Immutable command descriptor consumed by the transaction coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Canonical uppercase command name.
    pub name: &'static str,
    /// Bitwise OR of [`opt`] flags.
    pub opt_mask: u32,
    /// Arity constraint used for lightweight input validation.
    pub arity: CommandArity,
    /// Key-argument layout.
    pub keys: KeySpan,
}

impl CommandSpec {
    /// Returns the key stride declared by this command (1 when it has no
    /// keyed range).
    #[must_use]
    pub const fn key_arg_step(&self) -> u8 {
        match self.keys {
            KeySpan::Range { step, .. } => step,
            KeySpan::None | KeySpan::Counted { .. } => 1,
        }
    }

    /// Returns whether `mask` bits are all set in the option mask.
    #[must_use]
    pub const fn has_opt(&self, mask: u32) -> bool {
        self.opt_mask & mask == mask
    }
}

/// Resolved key range of one command invocation.
///
/// `start == end == args.len()` models a zero-key invocation (e.g. a script
/// called without keys): the transaction selects no shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndex {
    /// Index of the first key argument.
    pub start: usize,
    /// One past the last argument of the key range (values included for
    /// stride-2 commands).
    pub end: usize,
    /// Distance between consecutive keys: 1, or 2 for key/value pairs.
    pub step: usize,
}

impl KeyIndex {
    /// Resolves the key range of `args` for the given command descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error when the argument count violates the declared arity,
    /// when a fixed key range does not fit the argument list, or when a
    /// script key count is not a valid number.
    pub fn determine(spec: &CommandSpec, args: &[Vec<u8>]) -> EmberResult<Self> {
        match spec.arity {
            CommandArity::Exact(count) if args.len() != count => {
                return Err(EmberError::InvalidArgs("argument count must match arity"));
            }
            CommandArity::AtLeast(count) if args.len() < count => {
                return Err(EmberError::InvalidArgs("too few arguments for command"));
            }
            CommandArity::Exact(_) | CommandArity::AtLeast(_) => {}
        }

        match spec.keys {
            KeySpan::None => Ok(Self {
                start: args.len(),
                end: args.len(),
                step: 1,
            }),
            KeySpan::Range { first, last, step } => {
                let start = usize::from(first);
                let end = if last >= 0 {
                    usize::from(last.unsigned_abs()) + 1
                } else {
                    let back = usize::from(last.unsigned_abs()) - 1;
                    args.len()
                        .checked_sub(back)
                        .ok_or(EmberError::InvalidArgs("key range exceeds argument list"))?
                };
                if start > end || end > args.len() {
                    return Err(EmberError::InvalidArgs("key range exceeds argument list"));
                }
                if step == 2 && !(end - start).is_multiple_of(2) {
                    return Err(EmberError::InvalidArgs(
                        "key/value command requires an even argument span",
                    ));
                }
                Ok(Self {
                    start,
                    end,
                    step: usize::from(step),
                })
            }
            KeySpan::Counted { count_index } => {
                let index = usize::from(count_index);
                let raw = args
                    .get(index)
                    .ok_or(EmberError::InvalidArgs("missing script key count"))?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| EmberError::InvalidArgs("script key count is not numeric"))?;
                let count: usize = text
                    .parse()
                    .map_err(|_| EmberError::InvalidArgs("script key count is not numeric"))?;
                let start = index + 1;
                let end = start
                    .checked_add(count)
                    .filter(|end| *end <= args.len())
                    .ok_or(EmberError::InvalidArgs("key range exceeds argument list"))?;
                // Zero-key scripts keep start == end == args.len() semantics
                // only when no further arguments follow; a populated tail
                // still yields an empty range, which routes to no shard.
                Ok(Self {
                    start,
                    end,
                    step: 1,
                })
            }
        }
    }

    /// Returns whether the resolved range selects no keys.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns whether the range spans exactly one key.
    #[must_use]
    pub const fn is_single_key(&self) -> bool {
        self.start + self.step >= self.end && !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandArity, CommandSpec, KeyIndex, KeySpan, opt};
    use googletest::prelude::*;
    use rstest::rstest;

    const SET: CommandSpec = CommandSpec {
        name: "SET",
        opt_mask: 0,
        arity: CommandArity::AtLeast(2),
        keys: KeySpan::Range {
            first: 0,
            last: 0,
            step: 1,
        },
    };

    const MGET: CommandSpec = CommandSpec {
        name: "MGET",
        opt_mask: opt::READONLY,
        arity: CommandArity::AtLeast(1),
        keys: KeySpan::Range {
            first: 0,
            last: -1,
            step: 1,
        },
    };

    const MSET: CommandSpec = CommandSpec {
        name: "MSET",
        opt_mask: 0,
        arity: CommandArity::AtLeast(2),
        keys: KeySpan::Range {
            first: 0,
            last: -1,
            step: 2,
        },
    };

    const EVAL: CommandSpec = CommandSpec {
        name: "EVAL",
        opt_mask: opt::MULTI_SCRIPT,
        arity: CommandArity::AtLeast(2),
        keys: KeySpan::Counted { count_index: 1 },
    };

    fn args(values: &[&str]) -> Vec<Vec<u8>> {
        values.iter().map(|value| value.as_bytes().to_vec()).collect()
    }

    #[rstest]
    fn set_resolves_single_leading_key() {
        let index = KeyIndex::determine(&SET, &args(&["k", "v"])).expect("SET args are valid");
        assert_that!(index, eq(KeyIndex { start: 0, end: 1, step: 1 }));
        assert_that!(index.is_single_key(), eq(true));
    }

    #[rstest]
    fn mget_resolves_full_argument_span() {
        let index =
            KeyIndex::determine(&MGET, &args(&["a", "b", "c"])).expect("MGET args are valid");
        assert_that!(index, eq(KeyIndex { start: 0, end: 3, step: 1 }));
        assert_that!(index.is_single_key(), eq(false));
    }

    #[rstest]
    fn mset_resolves_pairs_with_stride_two() {
        let index =
            KeyIndex::determine(&MSET, &args(&["a", "1", "b", "2"])).expect("MSET args are valid");
        assert_that!(index, eq(KeyIndex { start: 0, end: 4, step: 2 }));
    }

    #[rstest]
    fn mset_rejects_odd_argument_span() {
        let result = KeyIndex::determine(&MSET, &args(&["a", "1", "b"]));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn eval_resolves_counted_keys() {
        let index = KeyIndex::determine(&EVAL, &args(&["script", "2", "k1", "k2", "extra"]))
            .expect("EVAL args are valid");
        assert_that!(index, eq(KeyIndex { start: 2, end: 4, step: 1 }));
    }

    #[rstest]
    fn eval_with_zero_keys_selects_nothing() {
        let index =
            KeyIndex::determine(&EVAL, &args(&["script", "0"])).expect("EVAL args are valid");
        assert_that!(index.is_empty(), eq(true));
    }

    #[rstest]
    fn eval_rejects_overlong_key_count() {
        let result = KeyIndex::determine(&EVAL, &args(&["script", "9", "k1"]));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn arity_violations_are_rejected() {
        let result = KeyIndex::determine(&SET, &args(&["k"]));
        assert_that!(result.is_err(), eq(true));
    }
}
