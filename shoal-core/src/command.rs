//! Command descriptors consumed by the transaction coordinator.
//!
//! The full command registry (parsing, handlers, replies) lives outside this workspace; the
//! coordinator only needs the per-command metadata below to classify keys and choose lock modes.

use shoal_common::error::{ShoalError, ShoalResult};

/// Command option bits carried by [`CommandId::opt_mask`].
pub mod opt {
    /// Command only reads its keys; per-key intent locks are taken in SHARED mode.
    pub const READONLY: u32 = 1;
    /// Command mutates its keys.
    pub const WRITE: u32 = 1 << 1;
    /// Command may suspend on its keys and be awoken by concurrent mutations.
    pub const BLOCKING: u32 = 1 << 2;
    /// Command serializes against every shard through the coarse shard lock.
    pub const GLOBAL_TRANS: u32 = 1 << 3;
    /// Command participates in transactions without touching keys.
    pub const NO_KEY_TRANSACTIONAL: u32 = 1 << 4;
    /// The argument before the first key carries the key count (EVAL-style layouts).
    pub const VARIADIC_KEYS: u32 = 1 << 5;
}

/// Static descriptor of one command.
///
/// `first_key`/`last_key`/`key_step` follow the classic command-table convention: positions are
/// indices into the full argument vector whose slot 0 is the command name, and a negative
/// `last_key` counts from the tail (`-1` is the last argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandId {
    name: &'static str,
    opt_mask: u32,
    first_key: usize,
    last_key: i32,
    key_step: usize,
}

impl CommandId {
    /// Creates a command descriptor.
    #[must_use]
    pub const fn new(
        name: &'static str,
        opt_mask: u32,
        first_key: usize,
        last_key: i32,
        key_step: usize,
    ) -> Self {
        Self {
            name,
            opt_mask,
            first_key,
            last_key,
            key_step,
        }
    }

    /// Canonical uppercase command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Raw option bitset, see [`opt`].
    #[must_use]
    pub fn opt_mask(&self) -> u32 {
        self.opt_mask
    }

    /// Returns whether any of the given option bits is set.
    #[must_use]
    pub fn has_opt(&self, mask: u32) -> bool {
        (self.opt_mask & mask) != 0
    }

    /// Distance between consecutive keys in the argument vector (2 for key/value layouts).
    #[must_use]
    pub fn key_arg_step(&self) -> usize {
        self.key_step
    }
}

/// Resolved key range inside a concrete argument vector.
///
/// `start == end` means the command carries no keys for this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndex {
    /// Index of the first key argument.
    pub start: usize,
    /// One past the last key (or paired value) argument.
    pub end: usize,
    /// Distance between consecutive keys inside `[start, end)`.
    pub step: usize,
}

impl KeyIndex {
    /// Returns whether the range selects at least one key.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.start < self.end
    }
}

/// Resolves the key range of `cid` inside `args` (`args[0]` is the command name).
///
/// # Errors
///
/// Returns [`ShoalError::KeyLayout`] when the argument vector is too short for the descriptor,
/// when a variadic key count is malformed, or when the selected range does not divide evenly by
/// the key step.
pub fn determine_keys(cid: &CommandId, args: &[Vec<u8>]) -> ShoalResult<KeyIndex> {
    if cid.has_opt(opt::NO_KEY_TRANSACTIONAL) || cid.first_key == 0 {
        return Ok(KeyIndex {
            start: args.len(),
            end: args.len(),
            step: 1,
        });
    }

    let step = cid.key_step;
    if step != 1 && step != 2 {
        return Err(ShoalError::KeyLayout(format!(
            "{}: key step {step} is not supported",
            cid.name
        )));
    }

    if cid.has_opt(opt::VARIADIC_KEYS) {
        let count_pos = cid.first_key - 1;
        let Some(raw) = args.get(count_pos) else {
            return Err(ShoalError::KeyLayout(format!(
                "{}: missing key count argument",
                cid.name
            )));
        };
        let count = std::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.parse::<usize>().ok())
            .ok_or_else(|| ShoalError::KeyLayout(format!("{}: bad key count", cid.name)))?;

        let start = cid.first_key;
        let end = start + count * step;
        if end > args.len() {
            return Err(ShoalError::KeyLayout(format!(
                "{}: key count {count} exceeds the argument vector",
                cid.name
            )));
        }
        return Ok(KeyIndex { start, end, step });
    }

    let start = cid.first_key;
    let last = if cid.last_key < 0 {
        let from_tail = usize::try_from(-i64::from(cid.last_key))
            .expect("negative last_key fits into usize after negation");
        args.len().checked_sub(from_tail)
    } else {
        Some(usize::try_from(cid.last_key).expect("non-negative last_key fits into usize"))
    };
    let Some(last) = last else {
        return Err(ShoalError::KeyLayout(format!(
            "{}: argument vector is too short",
            cid.name
        )));
    };
    let end = last + 1;

    if start > last || end > args.len() {
        return Err(ShoalError::KeyLayout(format!(
            "{}: key range [{start}, {end}) does not fit {} arguments",
            cid.name,
            args.len()
        )));
    }
    if (end - start) % step != 0 {
        return Err(ShoalError::KeyLayout(format!(
            "{}: key range [{start}, {end}) is not a whole number of key/value pairs",
            cid.name
        )));
    }

    Ok(KeyIndex { start, end, step })
}

#[cfg(test)]
mod tests {
    use super::{CommandId, determine_keys, opt};
    use googletest::prelude::*;
    use rstest::rstest;

    fn arg_vec(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    #[rstest]
    fn single_key_command_selects_one_key() {
        let set = CommandId::new("SET", opt::WRITE, 1, 1, 1);
        let index = determine_keys(&set, &arg_vec(&["SET", "k", "v"])).expect("layout is valid");
        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(2_usize));
        assert_that!(index.has_keys(), eq(true));
    }

    #[rstest]
    fn tail_relative_last_key_spans_all_keys() {
        let mget = CommandId::new("MGET", opt::READONLY, 1, -1, 1);
        let index =
            determine_keys(&mget, &arg_vec(&["MGET", "a", "b", "c"])).expect("layout is valid");
        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(4_usize));
    }

    #[rstest]
    fn step_two_layout_includes_values() {
        let mset = CommandId::new("MSET", opt::WRITE, 1, -1, 2);
        let index = determine_keys(&mset, &arg_vec(&["MSET", "k1", "v1", "k2", "v2"]))
            .expect("layout is valid");
        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(5_usize));
        assert_that!(index.step, eq(2_usize));
    }

    #[rstest]
    fn step_two_layout_rejects_dangling_key() {
        let mset = CommandId::new("MSET", opt::WRITE, 1, -1, 2);
        let result = determine_keys(&mset, &arg_vec(&["MSET", "k1", "v1", "k2"]));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn blocking_command_excludes_trailing_timeout() {
        let blpop = CommandId::new("BLPOP", opt::WRITE | opt::BLOCKING, 1, -2, 1);
        let index =
            determine_keys(&blpop, &arg_vec(&["BLPOP", "x", "y", "0"])).expect("layout is valid");
        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(3_usize));
    }

    #[rstest]
    #[case(&["EVAL", "return 1", "2", "k1", "k2", "extra"], 3, 5)]
    #[case(&["EVAL", "return 1", "0"], 3, 3)]
    fn variadic_layout_reads_key_count(
        #[case] args: &[&str],
        #[case] start: usize,
        #[case] end: usize,
    ) {
        let eval = CommandId::new("EVAL", opt::WRITE | opt::VARIADIC_KEYS, 3, 0, 1);
        let index = determine_keys(&eval, &arg_vec(args)).expect("layout is valid");
        assert_that!(index.start, eq(start));
        assert_that!(index.end, eq(end));
    }

    #[rstest]
    fn variadic_layout_rejects_overlong_count() {
        let eval = CommandId::new("EVAL", opt::WRITE | opt::VARIADIC_KEYS, 3, 0, 1);
        let result = determine_keys(&eval, &arg_vec(&["EVAL", "return 1", "3", "k1"]));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn no_key_command_yields_empty_range() {
        let ping = CommandId::new("PING", opt::NO_KEY_TRANSACTIONAL, 0, 0, 1);
        let index = determine_keys(&ping, &arg_vec(&["PING"])).expect("layout is valid");
        assert_that!(index.has_keys(), eq(false));
    }
}
