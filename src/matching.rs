use std::any::Any;

use crate::comparator::Comparator;
use crate::runtime::{RunResult, RuntimeError};

/// Upper bound on `${n}` match values retained from one test.
pub const MAX_MATCH_VALUES: usize = 32;

/// Accumulates captured match values for one match attempt. The set only
/// replaces the interpreter's current values when the attempt succeeds and
/// the containing test commits; a failed match leaves the previous set
/// intact.
#[derive(Default)]
pub struct MatchValuesBuilder {
    values: Vec<Vec<u8>>,
}

impl MatchValuesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn add(&mut self, value: Vec<u8>) {
        if self.values.len() < MAX_MATCH_VALUES {
            self.values.push(value);
        }
    }

    /// Skipped captures advance the index and read back as empty strings.
    pub fn skip(&mut self, count: usize) {
        for _ in 0..count {
            self.add(Vec::new());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn finish(self) -> Vec<Vec<u8>> {
        self.values
    }
}

/// Per-test state handed to a match type for each attempted key.
pub struct MatchContext<'s> {
    pub comparator: &'s dyn Comparator,
    /// Match-type private state allocated by `init`, e.g. the regex cache.
    pub state: &'s mut Option<Box<dyn Any>>,
    /// Capture target, present only when match values are enabled for the
    /// running script. Populated only on a successful match.
    pub capture: Option<&'s mut MatchValuesBuilder>,
}

/// The policy governing how a value is compared to a key list.
pub trait MatchType: Send + Sync {
    fn identifier(&self) -> &'static str;

    /// Checks the chosen comparator against this match type's constraints.
    fn validate_comparator(&self, _cmp: &dyn Comparator) -> Result<(), String> {
        Ok(())
    }

    /// Allocates per-session state; dropped when the session ends.
    fn init(&self) -> Option<Box<dyn Any>> {
        None
    }

    fn matches(
        &self,
        ctx: &mut MatchContext<'_>,
        value: &[u8],
        key: &[u8],
        key_index: usize,
    ) -> RunResult<bool>;
}

/// One match session per test instruction: iterates the key list for each
/// tested value and short-circuits on the first hit.
pub struct MatchSession<'s> {
    match_type: &'s dyn MatchType,
    comparator: &'s dyn Comparator,
    keys: Vec<Vec<u8>>,
    state: Option<Box<dyn Any>>,
    capture_enabled: bool,
    captured: Option<Vec<Vec<u8>>>,
    matched: bool,
}

impl<'s> MatchSession<'s> {
    pub fn new(
        match_type: &'s dyn MatchType,
        comparator: &'s dyn Comparator,
        keys: Vec<Vec<u8>>,
        capture_enabled: bool,
    ) -> RunResult<Self> {
        match_type
            .validate_comparator(comparator)
            .map_err(|message| RuntimeError::Script { line: 0, message })?;
        let state = match_type.init();
        Ok(Self {
            match_type,
            comparator,
            keys,
            state,
            capture_enabled,
            captured: None,
            matched: false,
        })
    }

    /// Matches one value against every key, in key order.
    pub fn match_value(&mut self, value: &[u8]) -> RunResult<bool> {
        for key_index in 0..self.keys.len() {
            let mut builder = MatchValuesBuilder::new();
            let hit = {
                let mut ctx = MatchContext {
                    comparator: self.comparator,
                    state: &mut self.state,
                    capture: if self.capture_enabled { Some(&mut builder) } else { None },
                };
                self.match_type.matches(&mut ctx, value, &self.keys[key_index], key_index)?
            };
            if hit {
                if self.capture_enabled && !builder.is_empty() {
                    self.captured = Some(builder.finish());
                }
                self.matched = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn matched(&self) -> bool {
        self.matched
    }

    /// Ends the session, returning the overall result and any values to
    /// commit into the interpreter's match-value register.
    pub fn finish(self) -> (bool, Option<Vec<Vec<u8>>>) {
        let captured = if self.matched { self.captured } else { None };
        (self.matched, captured)
    }
}

/* Core match types */

pub struct IsMatchType;

impl MatchType for IsMatchType {
    fn identifier(&self) -> &'static str {
        "is"
    }

    fn matches(
        &self,
        ctx: &mut MatchContext<'_>,
        value: &[u8],
        key: &[u8],
        _key_index: usize,
    ) -> RunResult<bool> {
        Ok(ctx.comparator.equals(value, key))
    }
}

pub struct ContainsMatchType;

impl MatchType for ContainsMatchType {
    fn identifier(&self) -> &'static str {
        "contains"
    }

    fn validate_comparator(&self, cmp: &dyn Comparator) -> Result<(), String> {
        if cmp.supports_substring() {
            Ok(())
        } else {
            Err(format!(
                "the {} comparator does not support substring matching as required by :contains",
                cmp.identifier()
            ))
        }
    }

    fn matches(
        &self,
        ctx: &mut MatchContext<'_>,
        value: &[u8],
        key: &[u8],
        _key_index: usize,
    ) -> RunResult<bool> {
        Ok(contains_match(ctx.comparator, value, key))
    }
}

/// Naive sliding-window substring scan; the leftmost occurrence wins.
fn contains_match(cmp: &dyn Comparator, value: &[u8], key: &[u8]) -> bool {
    if key.is_empty() {
        return true;
    }
    if key.len() > value.len() {
        return false;
    }
    for start in 0..=(value.len() - key.len()) {
        if value[start..start + key.len()]
            .iter()
            .zip(key)
            .all(|(&v, &k)| cmp.char_equals(v, k))
        {
            return true;
        }
    }
    false
}

pub struct MatchesMatchType;

impl MatchType for MatchesMatchType {
    fn identifier(&self) -> &'static str {
        "matches"
    }

    fn validate_comparator(&self, cmp: &dyn Comparator) -> Result<(), String> {
        if cmp.supports_substring() {
            Ok(())
        } else {
            Err(format!(
                "the {} comparator does not support substring matching as required by :matches",
                cmp.identifier()
            ))
        }
    }

    fn matches(
        &self,
        ctx: &mut MatchContext<'_>,
        value: &[u8],
        key: &[u8],
        _key_index: usize,
    ) -> RunResult<bool> {
        let mut spans = Vec::new();
        let want_spans = ctx.capture.is_some();
        let matched = glob_match(ctx.comparator, value, key, want_spans.then_some(&mut spans));
        if matched && let Some(builder) = ctx.capture.as_deref_mut() {
            builder.reset();
            builder.add(value.to_vec());
            for (start, end) in spans {
                builder.add(value[start..end].to_vec());
            }
        }
        Ok(matched)
    }
}

/// Glob match per the Sieve `:matches` wildcard rules: `*` spans any run of
/// characters (greedy, backtracking), `?` exactly one, `\*`/`\?` escape to
/// literals. Each wildcard expansion is recorded left to right.
fn glob_match(
    cmp: &dyn Comparator,
    value: &[u8],
    key: &[u8],
    spans: Option<&mut Vec<(usize, usize)>>,
) -> bool {
    let mut scratch = Vec::new();
    let spans = match spans {
        Some(spans) => spans,
        None => &mut scratch,
    };
    spans.clear();
    glob_rec(cmp, value, 0, key, 0, spans)
}

fn glob_rec(
    cmp: &dyn Comparator,
    value: &[u8],
    start: usize,
    key: &[u8],
    key_start: usize,
    spans: &mut Vec<(usize, usize)>,
) -> bool {
    let mut vi = start;
    let mut ki = key_start;
    loop {
        if ki == key.len() {
            return vi == value.len();
        }
        match key[ki] {
            b'*' => {
                let depth = spans.len();
                let mut take = value.len() - vi;
                loop {
                    spans.push((vi, vi + take));
                    if glob_rec(cmp, value, vi + take, key, ki + 1, spans) {
                        return true;
                    }
                    spans.truncate(depth);
                    if take == 0 {
                        return false;
                    }
                    take -= 1;
                }
            }
            b'?' => {
                if vi >= value.len() {
                    return false;
                }
                spans.push((vi, vi + 1));
                vi += 1;
                ki += 1;
            }
            b'\\' if ki + 1 < key.len() => {
                if vi >= value.len() || !cmp.char_equals(value[vi], key[ki + 1]) {
                    return false;
                }
                vi += 1;
                ki += 2;
            }
            literal => {
                if vi >= value.len() || !cmp.char_equals(value[vi], literal) {
                    return false;
                }
                vi += 1;
                ki += 1;
            }
        }
    }
}

pub static MATCH_IS: IsMatchType = IsMatchType;
pub static MATCH_CONTAINS: ContainsMatchType = ContainsMatchType;
pub static MATCH_MATCHES: MatchesMatchType = MatchesMatchType;

/// Fixed core match-type table; the operand code byte indexes it.
pub fn core_match_types() -> &'static [&'static dyn MatchType] {
    static TABLE: [&'static dyn MatchType; 3] = [&MATCH_IS, &MATCH_CONTAINS, &MATCH_MATCHES];
    &TABLE
}
