//! Plugin contract
//!
//! A plugin turns one time expression into an absolute UTC instant relative
//! to a caller-supplied `now`. It returns `Ok(None)` for input it does not
//! recognize; errors and panics are contained by the registry and count as
//! "no match" for that plugin only.

use chrono::{DateTime, Utc};
use mend_core::{ClusterId, Generation};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Parsing entry point exposed by every installed module
pub trait TimeParserPlugin: Send + Sync + fmt::Debug {
    /// Interpret `input` relative to `now`
    ///
    /// # Errors
    /// `PluginError` when the input matched but could not be evaluated.
    fn parse(&self, input: &str, now: DateTime<Utc>)
        -> Result<Option<DateTime<Utc>>, PluginError>;

    /// One-line description of what the plugin covers
    fn description(&self) -> &str {
        ""
    }
}

/// Internal failure of a plugin on one input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// A captured value could not be interpreted
    #[error("invalid {group} capture: {value:?}")]
    InvalidCapture { group: &'static str, value: String },

    /// The computed instant is not representable
    #[error("computed time out of range")]
    OutOfRange,

    #[error("{0}")]
    Other(String),
}

/// Where a successful parse came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSource {
    Plugin(ClusterId),
    /// `now` / `asap` keyword fallback
    Builtin,
}

/// Result of a successful registry parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub value: DateTime<Utc>,
    pub source: MatchSource,
    /// Generation that served the call
    pub generation: Generation,
}

/// How one guarded plugin call ended
#[derive(Debug)]
pub(crate) enum CallResult {
    Matched(DateTime<Utc>),
    Declined,
    Failed(PluginError),
    Panicked(String),
}

/// Call a plugin, containing errors and panics
pub(crate) fn call_guarded(
    plugin: &dyn TimeParserPlugin,
    input: &str,
    now: DateTime<Utc>,
) -> CallResult {
    match panic::catch_unwind(AssertUnwindSafe(|| plugin.parse(input, now))) {
        Ok(Ok(Some(value))) => CallResult::Matched(value),
        Ok(Ok(None)) => CallResult::Declined,
        Ok(Err(e)) => CallResult::Failed(e),
        Err(payload) => CallResult::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug)]
    struct Exploding;

    impl TimeParserPlugin for Exploding {
        fn parse(&self, input: &str, _now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, PluginError> {
            match input {
                "boom" => panic!("boom"),
                "err" => Err(PluginError::Other("bad".to_string())),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn guarded_call_contains_panics() {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        assert!(matches!(
            call_guarded(&Exploding, "boom", now),
            CallResult::Panicked(msg) if msg == "boom"
        ));
        assert!(matches!(
            call_guarded(&Exploding, "err", now),
            CallResult::Failed(PluginError::Other(_))
        ));
        assert!(matches!(
            call_guarded(&Exploding, "other", now),
            CallResult::Declined
        ));
        assert_eq!(Exploding.description(), "");
    }
}
