//! Rule modules
//!
//! Generated module source is a TOML document of ordered regex rules,
//! compiled once at load time:
//!
//! ```toml
//! description = "Relative day offsets"
//!
//! [[rule]]
//! pattern = '^tomorrow$'
//! offset = { days = 1 }
//!
//! [[rule]]
//! pattern = '^in (?P<amount>\d+) (?P<unit>minute|hour|day|week)s?$'
//! ```
//!
//! # Evaluation
//! Input is normalized (see [`normalize`]) and matched case-insensitively.
//! The first matching rule decides. Its effects apply in order:
//! 1. fixed `offset` (weeks, days, hours, minutes)
//! 2. `amount` × `unit` captures
//! 3. `weekday` capture: next strictly-later occurrence
//! 4. time of day from `at = "HH:MM"` or `hour`/`minute`/`meridiem`
//!    captures, seconds zeroed

use crate::plugin::{PluginError, TimeParserPlugin};
use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use mend_core::{ClusterId, ModuleLoadError};
use regex::{Captures, Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Turns module source into a callable plugin
pub trait ModuleCompiler: Send + Sync + fmt::Debug {
    /// # Errors
    /// `ModuleLoadError` if the source is malformed or breaks the plugin
    /// contract.
    fn compile(
        &self,
        cluster_id: &ClusterId,
        module_source: &str,
    ) -> Result<Arc<dyn TimeParserPlugin>, ModuleLoadError>;
}

/// Compiler for TOML rule modules
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleModuleCompiler;

impl ModuleCompiler for RuleModuleCompiler {
    fn compile(
        &self,
        cluster_id: &ClusterId,
        module_source: &str,
    ) -> Result<Arc<dyn TimeParserPlugin>, ModuleLoadError> {
        Ok(Arc::new(RuleModule::compile(cluster_id, module_source)?))
    }
}

/// Canonical form of an input before rules see it
///
/// Trimmed, lowercased, trailing `.,!?` stripped, inner whitespace runs
/// collapsed to one space.
#[must_use]
pub fn normalize(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    lowered
        .trim_end_matches(&['.', ',', '!', '?'][..])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleDoc {
    #[serde(default)]
    description: String,
    #[serde(default, rename = "rule")]
    rules: Vec<RuleDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDoc {
    pattern: String,
    #[serde(default)]
    offset: Offset,
    #[serde(default)]
    at: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Offset {
    weeks: i64,
    days: i64,
    hours: i64,
    minutes: i64,
}

impl Offset {
    fn to_delta(self) -> Option<TimeDelta> {
        TimeDelta::try_weeks(self.weeks)?
            .checked_add(&TimeDelta::try_days(self.days)?)?
            .checked_add(&TimeDelta::try_hours(self.hours)?)?
            .checked_add(&TimeDelta::try_minutes(self.minutes)?)
    }
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    offset: TimeDelta,
    at: Option<NaiveTime>,
}

/// A compiled rule module
#[derive(Debug)]
pub struct RuleModule {
    cluster_id: ClusterId,
    description: String,
    rules: Vec<Rule>,
}

impl RuleModule {
    /// Compile and check module source
    ///
    /// # Errors
    /// - `ModuleLoadError::EmptySource` for blank source
    /// - `ModuleLoadError::Syntax` for malformed TOML or a bad regex
    /// - `ModuleLoadError::Contract` for no rules, inconsistent captures,
    ///   a bad `at`, or an unrepresentable offset
    pub fn compile(cluster_id: &ClusterId, source: &str) -> Result<Self, ModuleLoadError> {
        if source.trim().is_empty() {
            return Err(ModuleLoadError::EmptySource {
                cluster_id: cluster_id.clone(),
                what: "module",
            });
        }

        let doc: ModuleDoc = toml::from_str(source).map_err(|e| ModuleLoadError::Syntax {
            cluster_id: cluster_id.clone(),
            message: e.message().to_string(),
        })?;

        let contract = |message: String| ModuleLoadError::Contract {
            cluster_id: cluster_id.clone(),
            message,
        };

        if doc.rules.is_empty() {
            return Err(contract("module defines no rules".to_string()));
        }

        let mut rules = Vec::with_capacity(doc.rules.len());
        for (n, rule) in doc.rules.into_iter().enumerate() {
            let n = n + 1;
            let regex = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| ModuleLoadError::Syntax {
                    cluster_id: cluster_id.clone(),
                    message: format!("rule {n}: {e}"),
                })?;

            let names: BTreeSet<&str> = regex.capture_names().flatten().collect();
            let has = |name: &str| names.contains(name);
            if has("amount") != has("unit") {
                return Err(contract(format!(
                    "rule {n}: `amount` and `unit` captures must appear together"
                )));
            }
            if (has("minute") || has("meridiem")) && !has("hour") {
                return Err(contract(format!(
                    "rule {n}: `minute` and `meridiem` captures require `hour`"
                )));
            }
            if rule.at.is_some() && has("hour") {
                return Err(contract(format!(
                    "rule {n}: `at` conflicts with an `hour` capture"
                )));
            }

            let at = match rule.at.as_deref() {
                Some(text) => Some(
                    NaiveTime::parse_from_str(text, "%H:%M")
                        .map_err(|e| contract(format!("rule {n}: bad `at` {text:?}: {e}")))?,
                ),
                None => None,
            };
            let offset = rule
                .offset
                .to_delta()
                .ok_or_else(|| contract(format!("rule {n}: offset out of range")))?;

            rules.push(Rule { regex, offset, at });
        }

        Ok(Self {
            cluster_id: cluster_id.clone(),
            description: doc.description,
            rules,
        })
    }

    #[inline]
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    #[inline]
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl TimeParserPlugin for RuleModule {
    fn parse(
        &self,
        input: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PluginError> {
        let text = normalize(input);
        for rule in &self.rules {
            if let Some(caps) = rule.regex.captures(&text) {
                return rule.apply(&caps, now).map(Some);
            }
        }
        Ok(None)
    }

    fn description(&self) -> &str {
        &self.description
    }
}

impl Rule {
    fn apply(&self, caps: &Captures<'_>, now: DateTime<Utc>) -> Result<DateTime<Utc>, PluginError> {
        let mut t = shift(now, self.offset)?;

        if let (Some(amount), Some(unit)) = (caps.name("amount"), caps.name("unit")) {
            let n = parse_amount(amount.as_str())?;
            t = shift(t, unit_delta(unit.as_str(), n)?)?;
        }

        if let Some(day) = caps.name("weekday") {
            let target = parse_weekday(day.as_str())?;
            let current = i64::from(t.weekday().num_days_from_monday());
            let wanted = i64::from(target.num_days_from_monday());
            let ahead = match (wanted - current).rem_euclid(7) {
                0 => 7,
                d => d,
            };
            t = shift(t, TimeDelta::days(ahead))?;
        }

        let time = match (self.at, caps.name("hour")) {
            (Some(at), _) => Some(at),
            (None, Some(hour)) => Some(clock_time(
                hour.as_str(),
                caps.name("minute").map(|m| m.as_str()),
                caps.name("meridiem").map(|m| m.as_str()),
            )?),
            (None, None) => None,
        };
        if let Some(time) = time {
            t = t.date_naive().and_time(time).and_utc();
        }

        Ok(t)
    }
}

fn shift(t: DateTime<Utc>, delta: TimeDelta) -> Result<DateTime<Utc>, PluginError> {
    t.checked_add_signed(delta).ok_or(PluginError::OutOfRange)
}

fn invalid(group: &'static str, value: &str) -> PluginError {
    PluginError::InvalidCapture {
        group,
        value: value.to_string(),
    }
}

fn parse_amount(text: &str) -> Result<i64, PluginError> {
    let n = match text.trim() {
        "a" | "an" | "one" => 1,
        "two" | "a couple of" | "couple of" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        digits => digits.parse().map_err(|_| invalid("amount", text))?,
    };
    Ok(n)
}

fn unit_delta(unit: &str, n: i64) -> Result<TimeDelta, PluginError> {
    let unit = unit.trim();
    let singular = unit.strip_suffix('s').unwrap_or(unit);
    let delta = match singular {
        "min" | "minute" => TimeDelta::try_minutes(n),
        "hr" | "hour" => TimeDelta::try_hours(n),
        "day" => TimeDelta::try_days(n),
        "wk" | "week" => TimeDelta::try_weeks(n),
        "fortnight" => n.checked_mul(2).and_then(TimeDelta::try_weeks),
        _ => return Err(invalid("unit", unit)),
    };
    delta.ok_or(PluginError::OutOfRange)
}

fn parse_weekday(text: &str) -> Result<Weekday, PluginError> {
    let day = match text.trim() {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" | "tues" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" | "thurs" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return Err(invalid("weekday", text)),
    };
    Ok(day)
}

fn clock_time(
    hour: &str,
    minute: Option<&str>,
    meridiem: Option<&str>,
) -> Result<NaiveTime, PluginError> {
    let mut h: u32 = hour.trim().parse().map_err(|_| invalid("hour", hour))?;
    let m: u32 = match minute.filter(|m| !m.is_empty()) {
        Some(m) => m.trim().parse().map_err(|_| invalid("minute", m))?,
        None => 0,
    };

    match meridiem.map(|m| m.trim().replace('.', "")) {
        Some(mer) if !mer.is_empty() => {
            if !(1..=12).contains(&h) {
                return Err(invalid("hour", hour));
            }
            match mer.as_str() {
                "am" if h == 12 => h = 0,
                "am" => {}
                "pm" if h < 12 => h += 12,
                "pm" => {}
                _ => return Err(invalid("meridiem", &mer)),
            }
        }
        _ => {}
    }

    NaiveTime::from_hms_opt(h, m, 0).ok_or_else(|| invalid("hour", hour))
}
