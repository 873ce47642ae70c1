//! The `regex` extension: the `:regex` match type over POSIX-style
//! extended regular expressions. Keys compile lazily on first use and are
//! cached by key index for the rest of the match session; the cache dies
//! with the session.

use std::collections::HashMap;

use regex::bytes::{Regex, RegexBuilder};

use crate::comparator::Comparator;
use crate::extension::Extension;
use crate::matching::{MatchContext, MatchType};
use crate::runtime::{RunResult, RuntimeError};

pub const NAME: &str = "regex";

pub struct ExtRegex;

impl Extension for ExtRegex {
    fn name(&self) -> &'static str {
        NAME
    }

    fn match_types(&self) -> &[&'static dyn MatchType] {
        static TYPES: [&'static dyn MatchType; 1] = [&REGEX_MATCH];
        &TYPES
    }
}

#[derive(Default)]
struct RegexState {
    compiled: HashMap<usize, Regex>,
}

pub struct RegexMatchType;

static REGEX_MATCH: RegexMatchType = RegexMatchType;

impl MatchType for RegexMatchType {
    fn identifier(&self) -> &'static str {
        "regex"
    }

    fn validate_comparator(&self, cmp: &dyn Comparator) -> Result<(), String> {
        match cmp.identifier() {
            "i;octet" | "i;ascii-casemap" => Ok(()),
            other => Err(format!(
                "regex match type only supports i;octet and i;ascii-casemap comparators, not {other}"
            )),
        }
    }

    fn init(&self) -> Option<Box<dyn std::any::Any>> {
        Some(Box::new(RegexState::default()))
    }

    fn matches(
        &self,
        ctx: &mut MatchContext<'_>,
        value: &[u8],
        key: &[u8],
        key_index: usize,
    ) -> RunResult<bool> {
        let case_insensitive = ctx.comparator.identifier() == "i;ascii-casemap";
        let state = ctx
            .state
            .as_mut()
            .and_then(|state| state.downcast_mut::<RegexState>())
            .ok_or_else(|| RuntimeError::corrupt("regex match state missing"))?;

        if !state.compiled.contains_key(&key_index) {
            let pattern = std::str::from_utf8(key).map_err(|_| RuntimeError::Script {
                line: 0,
                message: "regular expression is not valid UTF-8".to_string(),
            })?;
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|err| RuntimeError::Script {
                    line: 0,
                    message: format!("invalid regular expression for regex match: {err}"),
                })?;
            state.compiled.insert(key_index, regex);
        }
        let regex = &state.compiled[&key_index];

        match ctx.capture.as_deref_mut() {
            Some(builder) => {
                let Some(captures) = regex.captures(value) else {
                    return Ok(false);
                };
                builder.reset();
                // Group 0 is the whole match; unmatched groups read back as
                // empty strings.
                for index in 0..captures.len() {
                    match captures.get(index) {
                        Some(group) => builder.add(group.as_bytes().to_vec()),
                        None => builder.skip(1),
                    }
                }
                Ok(true)
            }
            None => Ok(regex.is_match(value)),
        }
    }
}
