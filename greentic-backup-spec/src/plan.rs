use crate::error::{Error, Result};
use crate::names::{PlanName, VaultName};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Upper bound accepted for a retention window (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Cron trigger evaluated in UTC.
///
/// Accepts the backup service's field order `minute hour day-of-month month
/// day-of-week [year]`, optionally wrapped in `cron(...)`. Exactly one of the
/// two day fields must be `?`. Besides ranges, lists and steps, day-of-month
/// takes `L`, `LW` and `<day>W`, and day-of-week takes `<dow>L` and
/// `<dow>#<n>`; those forms stand alone in their field.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    expression: String,
    compiled: cron::Schedule,
    day: Option<DayRule>,
}

/// Upper bound on candidate days inspected when a calendar day rule is active.
const DAY_SCAN_LIMIT: usize = 20_000;

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };
        let (normalized, day) = normalize(expression).map_err(invalid)?;
        let compiled =
            cron::Schedule::from_str(&normalized).map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            compiled,
            day,
        })
    }

    /// Expression as written by the operator.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next firing strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Some(rule) = &self.day else {
            return self.compiled.after(after).next();
        };
        let mut cursor = *after;
        for _ in 0..DAY_SCAN_LIMIT {
            let candidate = self.compiled.after(&cursor).next()?;
            if rule.matches(candidate.date_naive()) {
                return Some(candidate);
            }
            cursor = candidate.date_naive().and_hms_opt(23, 59, 59)?.and_utc();
        }
        None
    }

    /// The next `count` firings strictly after `after`.
    pub fn upcoming(&self, after: &DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut firings = Vec::with_capacity(count);
        let mut cursor = *after;
        while firings.len() < count {
            match self.next_after(&cursor) {
                Some(next) => {
                    firings.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        firings
    }
}

/// Calendar day forms the `cron` crate cannot express. When one is present
/// both day fields compile to `*` and candidates are filtered by date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayRule {
    /// `L`
    LastDay,
    /// `LW`
    LastWeekday,
    /// `15W`
    NearestWeekday(u32),
    /// `6L`: last Friday of the month.
    LastOfWeekday(Weekday),
    /// `2#1`: first Monday of the month.
    NthWeekday(Weekday, u32),
}

impl DayRule {
    fn matches(self, date: NaiveDate) -> bool {
        let Some(last) = last_day_of_month(date) else {
            return false;
        };
        match self {
            DayRule::LastDay => date.day() == last,
            DayRule::LastWeekday => {
                date.with_day(last).map(weekday_on_or_before) == Some(date)
            }
            DayRule::NearestWeekday(day) => {
                day <= last && date.with_day(day).map(|d| nearest_weekday(d, last)) == Some(date)
            }
            DayRule::LastOfWeekday(weekday) => {
                date.weekday() == weekday && date.day() + 7 > last
            }
            DayRule::NthWeekday(weekday, nth) => {
                date.weekday() == weekday && (date.day() - 1) / 7 + 1 == nth
            }
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> Option<u32> {
    let (year, month) = match date.month() {
        12 => (date.year() + 1, 1),
        month => (date.year(), month + 1),
    };
    NaiveDate::from_ymd_opt(year, month, 1)?
        .pred_opt()
        .map(|day| day.day())
}

fn weekday_on_or_before(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date - Duration::days(2),
        _ => date,
    }
}

/// Weekday closest to `date` without leaving its month.
fn nearest_weekday(date: NaiveDate, last: u32) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat if date.day() == 1 => date + Duration::days(2),
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun if date.day() == last => date - Duration::days(2),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// `1`..`7` counts from Sunday, as the backup service does.
fn parse_weekday(value: &str) -> std::result::Result<Weekday, String> {
    let weekday = match value.to_ascii_uppercase().as_str() {
        "1" | "SUN" => Weekday::Sun,
        "2" | "MON" => Weekday::Mon,
        "3" | "TUE" => Weekday::Tue,
        "4" | "WED" => Weekday::Wed,
        "5" | "THU" => Weekday::Thu,
        "6" | "FRI" => Weekday::Fri,
        "7" | "SAT" => Weekday::Sat,
        _ => return Err(format!("unknown day of week `{value}`")),
    };
    Ok(weekday)
}

fn parse_day_of_month(value: &str) -> std::result::Result<Option<DayRule>, String> {
    let upper = value.to_ascii_uppercase();
    if upper == "L" {
        return Ok(Some(DayRule::LastDay));
    }
    if upper == "LW" {
        return Ok(Some(DayRule::LastWeekday));
    }
    if let Some(day) = upper.strip_suffix('W') {
        return match day.parse::<u32>() {
            Ok(day @ 1..=31) => Ok(Some(DayRule::NearestWeekday(day))),
            _ => Err(format!("`W` needs a single day of month, got `{value}`")),
        };
    }
    if upper.contains(['L', 'W']) {
        return Err(format!("`L` and `W` must stand alone in day-of-month, got `{value}`"));
    }
    Ok(None)
}

fn parse_day_of_week(value: &str) -> std::result::Result<Option<DayRule>, String> {
    if let Some((weekday, nth)) = value.split_once('#') {
        let weekday = parse_weekday(weekday)?;
        return match nth.parse::<u32>() {
            Ok(nth @ 1..=5) => Ok(Some(DayRule::NthWeekday(weekday, nth))),
            _ => Err(format!("`#` needs an occurrence between 1 and 5, got `{value}`")),
        };
    }
    let upper = value.to_ascii_uppercase();
    if let Some(weekday) = upper.strip_suffix('L') {
        if weekday.is_empty() {
            return Err("`L` in day-of-week needs a day, e.g. `6L`".to_string());
        }
        return parse_weekday(weekday).map(|weekday| Some(DayRule::LastOfWeekday(weekday)));
    }
    Ok(None)
}

fn normalize(expression: &str) -> std::result::Result<(String, Option<DayRule>), String> {
    let trimmed = expression.trim();
    let inner = match trimmed.strip_prefix("cron(") {
        Some(rest) => rest
            .strip_suffix(')')
            .ok_or_else(|| "unterminated cron( wrapper".to_string())?,
        None => trimmed,
    };

    let fields: Vec<&str> = inner.split_whitespace().collect();
    let (minute, hour, dom, month, dow, year) = match fields.as_slice() {
        [minute, hour, dom, month, dow] => (*minute, *hour, *dom, *month, *dow, "*"),
        [minute, hour, dom, month, dow, year] => (*minute, *hour, *dom, *month, *dow, *year),
        other => {
            return Err(format!(
                "expected 5 or 6 fields (minute hour day-of-month month day-of-week [year]), found {}",
                other.len()
            ));
        }
    };
    for (field, value) in [("minute", minute), ("hour", hour), ("month", month), ("year", year)] {
        if value.contains('?') {
            return Err(format!("`?` is only allowed in the day fields, found in {field}"));
        }
    }
    for (field, value) in [("day-of-month", dom), ("day-of-week", dow)] {
        if value != "?" && value.contains('?') {
            return Err(format!("`?` must stand alone in {field}"));
        }
    }

    let day = match (dom, dow) {
        ("?", "?") => return Err("only one of day-of-month and day-of-week may be `?`".into()),
        ("?", dow) => parse_day_of_week(dow)?,
        (dom, "?") => parse_day_of_month(dom)?,
        _ => return Err("one of day-of-month and day-of-week must be `?`".into()),
    };
    let (dom, dow) = match (day, dom, dow) {
        (Some(_), _, _) => ("*", "*"),
        (None, "?", dow) => ("*", dow),
        (None, dom, _) => (dom, "*"),
    };

    Ok((format!("0 {minute} {hour} {dom} {month} {dow} {year}"), day))
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.expression).finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Schedule {}

impl Hash for Schedule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.expression.hash(state);
    }
}

impl TryFrom<String> for Schedule {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(value: Schedule) -> Self {
        value.expression
    }
}

/// Number of days a recovery point survives after its own creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RetentionDays(u32);

impl RetentionDays {
    pub fn new(days: i64) -> Result<Self> {
        if days <= 0 || days > i64::from(MAX_RETENTION_DAYS) {
            return Err(Error::InvalidRetention {
                days,
                max: MAX_RETENTION_DAYS,
            });
        }
        Ok(Self(days as u32))
    }

    pub fn days(&self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for RetentionDays {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RetentionDays> for i64 {
    fn from(value: RetentionDays) -> Self {
        i64::from(value.0)
    }
}

/// Raw, unvalidated rule as written in a manifest or passed by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub schedule: String,
    pub vault: String,
    pub retention_days: i64,
}

impl RuleSpec {
    pub fn new(schedule: impl Into<String>, vault: impl Into<String>, retention_days: i64) -> Self {
        Self {
            schedule: schedule.into(),
            vault: vault.into(),
            retention_days,
        }
    }

    pub fn validate(&self) -> Result<BackupRule> {
        let schedule = Schedule::parse(&self.schedule)?;
        let retention = RetentionDays::new(self.retention_days)?;
        let target_vault = VaultName::new(self.vault.clone())?;
        Ok(BackupRule {
            schedule,
            target_vault,
            retention,
        })
    }
}

/// One scheduling rule of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupRule {
    pub schedule: Schedule,
    pub target_vault: VaultName,
    pub retention: RetentionDays,
}

impl BackupRule {
    /// Rule names are derived from the plan name and the 1-based rule position.
    pub fn derived_name(plan: &PlanName, index: usize) -> String {
        format!("{plan}-rule-{}", index + 1)
    }

    /// Expiry of a recovery point created at `created_at` under this rule.
    pub fn expires_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::days(i64::from(self.retention.days()))
    }
}

/// A named, ordered set of scheduling rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPlan {
    pub name: PlanName,
    #[serde(default)]
    pub rules: Vec<BackupRule>,
}

impl BackupPlan {
    pub fn new(name: PlanName, rules: Vec<BackupRule>) -> Self {
        Self { name, rules }
    }

    /// A plan without rules is valid but never fires.
    pub fn is_inert(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules paired with their derived names.
    pub fn named_rules(&self) -> impl Iterator<Item = (String, &BackupRule)> {
        self.rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| (BackupRule::derived_name(&self.name, idx), rule))
    }

    /// Vaults referenced by the plan's rules, in rule order without repeats.
    pub fn target_vaults(&self) -> Vec<&VaultName> {
        let mut out: Vec<&VaultName> = Vec::new();
        for rule in &self.rules {
            if !out.contains(&&rule.target_vault) {
                out.push(&rule.target_vault);
            }
        }
        out
    }
}

/// A plan as registered with the backup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanHandle {
    pub id: String,
    pub plan: BackupPlan,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_five_and_six_field_expressions() {
        for expr in [
            "0 3 * * ?",
            "0 3 * * ? *",
            "cron(0 3 * * ? *)",
            "30 */6 ? * 2-6",
            "cron(0 12 L * ? *)",
            "cron(0 5 ? * MON#1 *)",
            "cron(0 0 1W * ? *)",
            "0 0 LW * ?",
            "0 22 ? * 6L",
        ] {
            Schedule::parse(expr).unwrap_or_else(|err| panic!("{expr}: {err}"));
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in [
            "",
            "not a cron",
            "0 3 * *",
            "0 3 * * ? * *",
            "abc 3 * * ?",
            "cron(0 3 * * ?",
            "* * * * * *",
            "0 3 ? * ?",
            "0 3 1 * MON",
            "0 ? * * ?",
            "0 0 L,15 * ?",
            "0 0 32W * ?",
            "0 0 ? * MON#6",
            "0 0 ? * L",
            "0 0 ? * XYZ#1",
        ] {
            let err = Schedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, Error::InvalidSchedule { .. }),
                "{expr} produced {err:?}"
            );
        }
    }

    #[test]
    fn next_firing_is_utc() {
        let schedule = Schedule::parse("0 3 * * ?").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap();
        let next = schedule.next_after(&now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
        assert_eq!(schedule.upcoming(&now, 3).len(), 3);
    }

    #[test]
    fn last_day_of_month_tracks_month_length() {
        let schedule = Schedule::parse("cron(0 12 L * ? *)").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 13, 0, 0).unwrap();
        assert_eq!(
            schedule.upcoming(&start, 2),
            [
                Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn nth_and_last_weekday_of_month() {
        // June 2024 starts on a Saturday.
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let first_monday = Schedule::parse("cron(0 5 ? * MON#1 *)").unwrap();
        assert_eq!(
            first_monday.next_after(&start),
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 5, 0, 0).unwrap())
        );
        let last_friday = Schedule::parse("0 22 ? * 6L").unwrap();
        assert_eq!(
            last_friday.next_after(&start),
            Some(Utc.with_ymd_and_hms(2024, 6, 28, 22, 0, 0).unwrap())
        );
    }

    #[test]
    fn nearest_weekday_stays_inside_the_month() {
        let start = Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap();
        // 2024-06-01 is a Saturday, so `1W` moves forward to Monday the 3rd.
        let first = Schedule::parse("cron(0 0 1W * ? *)").unwrap();
        assert_eq!(
            first.next_after(&start),
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap())
        );
        // 2024-06-30 is a Sunday, so `LW` falls back to Friday the 28th.
        let last = Schedule::parse("0 0 LW * ?").unwrap();
        assert_eq!(
            last.next_after(&start),
            Some(Utc.with_ymd_and_hms(2024, 6, 28, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn unreachable_day_rule_yields_no_firing() {
        let schedule = Schedule::parse("0 0 30W 2 ? 2024").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(schedule.next_after(&start), None);
        assert!(schedule.upcoming(&start, 3).is_empty());
    }

    #[test]
    fn retention_must_be_positive() {
        assert!(RetentionDays::new(14).is_ok());
        assert!(matches!(
            RetentionDays::new(0),
            Err(Error::InvalidRetention { days: 0, .. })
        ));
        assert!(RetentionDays::new(-3).is_err());
        assert!(RetentionDays::new(i64::from(MAX_RETENTION_DAYS) + 1).is_err());
    }

    #[test]
    fn expiry_is_relative_to_creation() {
        let rule = RuleSpec::new("0 3 * * ?", "vault-a", 14).validate().unwrap();
        let created = Utc.with_ymd_and_hms(2024, 1, 10, 3, 0, 0).unwrap();
        assert_eq!(
            rule.expires_at(created),
            Utc.with_ymd_and_hms(2024, 1, 24, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn rule_names_are_derived_from_plan() {
        let name = PlanName::new("daily_two_weeks").unwrap();
        let rule = RuleSpec::new("0 3 * * ?", "vault-a", 14).validate().unwrap();
        let plan = BackupPlan::new(name, vec![rule.clone(), rule]);
        let names: Vec<String> = plan.named_rules().map(|(name, _)| name).collect();
        assert_eq!(names, ["daily_two_weeks-rule-1", "daily_two_weeks-rule-2"]);
        assert_eq!(plan.target_vaults().len(), 1);
    }

    #[test]
    fn plan_roundtrips_through_yaml() {
        let yaml = "name: daily\nrules:\n  - schedule: 0 3 * * ?\n    target_vault: vault-a\n    retention: 14\n";
        let plan: BackupPlan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(plan.rules[0].retention.days(), 14);
        assert_eq!(plan.rules[0].schedule.expression(), "0 3 * * ?");
    }
}
