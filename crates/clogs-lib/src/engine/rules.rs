//! Health rules
//!
//! Threshold rules compare the samples of one metric against a constant.
//! Log pattern rules match log text with a regular expression. Both are
//! compiled and validated once at startup; an invalid rule is a [`ConfigError`].

use crate::error::ConfigError;
use crate::models::HealthStatus;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Comparison applied between a sample value and a rule threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }

    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            "==" | "=" => Ok(Comparator::Eq),
            "!=" => Ok(Comparator::Ne),
            other => Err(format!("unknown comparator `{other}`")),
        }
    }
}

impl TryFrom<String> for Comparator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Comparator> for String {
    fn from(value: Comparator) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a firing rule imposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Degraded,
    Unhealthy,
}

impl Severity {
    pub fn status(&self) -> HealthStatus {
        match self {
            Severity::Degraded => HealthStatus::Degraded,
            Severity::Unhealthy => HealthStatus::Unhealthy,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "degraded" => Ok(Severity::Degraded),
            "unhealthy" => Ok(Severity::Unhealthy),
            other => Err(format!("severity must be `degraded` or `unhealthy`, got `{other}`")),
        }
    }
}

/// A compiled metric threshold rule
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: String,
    pub op: Comparator,
    pub threshold: f64,
    /// The violation must hold continuously for at least this long
    pub sustain: Duration,
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn new(metric: impl Into<String>, op: Comparator, threshold: f64, severity: Severity) -> Self {
        Self {
            metric: metric.into(),
            op,
            threshold,
            sustain: Duration::ZERO,
            severity,
        }
    }

    pub fn sustained_for(mut self, sustain: Duration) -> Self {
        self.sustain = sustain;
        self
    }

    pub fn violated_by(&self, value: f64) -> bool {
        self.op.holds(value, self.threshold)
    }

    fn validate(self, source: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThresholdRule {
            rule: source.to_string(),
            reason: reason.to_string(),
        };
        if self.metric.trim().is_empty() {
            return Err(invalid("metric name is empty"));
        }
        if !self.threshold.is_finite() {
            return Err(invalid("threshold must be a finite number"));
        }
        Ok(self)
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.op, self.threshold)?;
        if !self.sustain.is_zero() {
            write!(f, " for {}s", self.sustain.as_secs())?;
        }
        write!(f, " -> {}", self.severity.status())
    }
}

fn expression_regex() -> &'static Regex {
    static EXPR: OnceLock<Regex> = OnceLock::new();
    EXPR.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<metric>[A-Za-z_][\w.\-]*)\s*(?P<op>>=|<=|==|!=|>|<|=)\s*(?P<value>-?\d+(?:\.\d+)?)\s*%?\s*(?:for\s+(?P<dur>\d+)\s*(?P<unit>ms|s|m|h)?\s*)?(?:->\s*(?P<sev>[A-Za-z]+)\s*)?$",
        )
        .expect("threshold expression regex is valid")
    })
}

/// Parses the compact form `cpu > 90 for 60s -> degraded`.
/// The `for` clause is optional and severity defaults to degraded.
impl FromStr for ThresholdRule {
    type Err = ConfigError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidThresholdRule {
            rule: expr.to_string(),
            reason,
        };

        let caps = expression_regex()
            .captures(expr)
            .ok_or_else(|| invalid("expected `<metric> <op> <value> [for <n>[ms|s|m|h]] [-> <severity>]`".into()))?;

        let op: Comparator = caps["op"].parse().map_err(invalid)?;
        let threshold: f64 = caps["value"]
            .parse()
            .map_err(|e| invalid(format!("bad threshold: {e}")))?;

        let sustain = match caps.name("dur") {
            Some(dur) => {
                let n: u64 = dur
                    .as_str()
                    .parse()
                    .map_err(|e| invalid(format!("bad duration: {e}")))?;
                match caps.name("unit").map(|u| u.as_str()).unwrap_or("s") {
                    "ms" => Duration::from_millis(n),
                    "m" => Duration::from_secs(n * 60),
                    "h" => Duration::from_secs(n * 3600),
                    _ => Duration::from_secs(n),
                }
            }
            None => Duration::ZERO,
        };

        let severity = match caps.name("sev") {
            Some(sev) => sev.as_str().parse().map_err(invalid)?,
            None => Severity::Degraded,
        };

        ThresholdRule::new(&caps["metric"], op, threshold, severity)
            .sustained_for(sustain)
            .validate(expr)
    }
}

/// Threshold rule as written in configuration: an expression or a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdRuleSpec {
    Expression(String),
    Structured {
        metric: String,
        op: Comparator,
        threshold: f64,
        #[serde(default)]
        for_secs: u64,
        #[serde(default)]
        severity: Option<Severity>,
    },
}

impl ThresholdRuleSpec {
    pub fn compile(&self) -> Result<ThresholdRule, ConfigError> {
        match self {
            ThresholdRuleSpec::Expression(expr) => expr.parse(),
            ThresholdRuleSpec::Structured {
                metric,
                op,
                threshold,
                for_secs,
                severity,
            } => {
                let rule = ThresholdRule::new(
                    metric.clone(),
                    *op,
                    *threshold,
                    severity.unwrap_or(Severity::Degraded),
                )
                .sustained_for(Duration::from_secs(*for_secs));
                let source = rule.to_string();
                rule.validate(&source)
            }
        }
    }
}

/// Log pattern rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPatternSpec {
    pub name: String,
    pub pattern: String,
    /// Only match lines with this level (case-insensitive)
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
}

/// A compiled log pattern rule
#[derive(Debug, Clone)]
pub struct LogPatternRule {
    pub name: String,
    pub regex: Regex,
    pub level: Option<String>,
    pub severity: Severity,
}

impl LogPatternRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidLogPattern {
            name: name.clone(),
            source,
        })?;
        Ok(Self {
            name,
            regex,
            level: None,
            severity: Severity::Unhealthy,
        })
    }

    pub fn matches(&self, text: &str, level: Option<&str>) -> bool {
        if let Some(wanted) = &self.level {
            match level {
                Some(level) if level.eq_ignore_ascii_case(wanted) => {}
                _ => return false,
            }
        }
        self.regex.is_match(text)
    }
}

impl LogPatternSpec {
    pub fn compile(&self) -> Result<LogPatternRule, ConfigError> {
        let name = if self.name.trim().is_empty() {
            self.pattern.clone()
        } else {
            self.name.clone()
        };
        let mut rule = LogPatternRule::new(name, &self.pattern)?;
        rule.level = self.level.clone().filter(|l| !l.is_empty());
        rule.severity = self.severity.unwrap_or(Severity::Unhealthy);
        Ok(rule)
    }
}

/// All health rules, compiled
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub thresholds: Vec<ThresholdRule>,
    pub log_patterns: Vec<LogPatternRule>,
}

impl RuleSet {
    /// Compile configured rules; the first invalid rule aborts
    pub fn compile(
        thresholds: &[ThresholdRuleSpec],
        log_patterns: &[LogPatternSpec],
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            thresholds: thresholds
                .iter()
                .map(ThresholdRuleSpec::compile)
                .collect::<Result<_, _>>()?,
            log_patterns: log_patterns
                .iter()
                .map(LogPatternSpec::compile)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn with_threshold(mut self, rule: ThresholdRule) -> Self {
        self.thresholds.push(rule);
        self
    }

    pub fn with_log_pattern(mut self, rule: LogPatternRule) -> Self {
        self.log_patterns.push(rule);
        self
    }

    /// Whether any threshold rule reads this metric
    pub fn watches(&self, metric: &str) -> bool {
        self.thresholds.iter().any(|rule| rule.metric == metric)
    }

    /// Most severe log rule matching a line, if any
    pub fn match_log(&self, text: &str, level: Option<&str>) -> Option<&LogPatternRule> {
        self.log_patterns
            .iter()
            .filter(|rule| rule.matches(text, level))
            .max_by_key(|rule| rule.severity == Severity::Unhealthy)
    }
}
