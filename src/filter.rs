//! Administrator filter rules gating driver installs.
//!
//! Rules come from configuration as a single string, parsed once at startup.
//! Format: rules separated by `|`, each rule five `,`-separated fields
//! `class,vid,pid,version_bcd,allow` where `-1` is a wildcard, e.g.
//!
//! ```text
//! 0x03,-1,-1,-1,0|-1,-1,-1,-1,1
//! ```
//!
//! denies HID-class devices and allows everything else. The check is pure:
//! the first rule matching a class triplet decides it, a triplet matching no
//! rule is allowed, and one denied triplet denies the whole device. With no
//! rules configured every device is allowed.

use std::str::FromStr;

/// Class/subclass/protocol triplet, device-level or per-interface, as
/// reported by device enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassTriplet {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Errors raised while parsing a rule string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterParseError {
    /// A rule did not have exactly five fields.
    #[error("rule {index}: expected 5 fields, got {fields}")]
    FieldCount { index: usize, fields: usize },

    /// A field was not a valid integer.
    #[error("rule {index}: invalid value {value:?}")]
    BadValue { index: usize, value: String },

    /// A field was outside its permitted range.
    #[error("rule {index}: value {value} out of range for {field}")]
    OutOfRange {
        index: usize,
        field: &'static str,
        value: i64,
    },
}

/// One parsed filter rule. `None` fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FilterRule {
    class: Option<u8>,
    vid: Option<u16>,
    pid: Option<u16>,
    version_bcd: Option<u16>,
    allow: bool,
}

impl FilterRule {
    fn matches(&self, class: u8, vid: u16, pid: u16, version_bcd: Option<u16>) -> bool {
        if self.class.is_some_and(|c| c != class) {
            return false;
        }
        if self.vid.is_some_and(|v| v != vid) {
            return false;
        }
        if self.pid.is_some_and(|p| p != pid) {
            return false;
        }
        // version absent from the enumeration path matches as wildcard
        if let (Some(want), Some(have)) = (self.version_bcd, version_bcd) {
            if want != have {
                return false;
            }
        }
        true
    }
}

/// Immutable set of parsed rules, loaded exactly once at process start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRuleSet {
    rules: Vec<FilterRule>,
}

impl FilterRuleSet {
    /// Parses a rule string.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterParseError`] naming the first offending rule.
    pub fn parse(rule_string: &str) -> Result<Self, FilterParseError> {
        let mut rules = Vec::new();
        for (index, rule) in rule_string
            .split('|')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .enumerate()
        {
            rules.push(Self::parse_rule(index, rule)?);
        }
        Ok(Self { rules })
    }

    fn parse_rule(index: usize, rule: &str) -> Result<FilterRule, FilterParseError> {
        let fields: Vec<&str> = rule.split(',').map(str::trim).collect();
        if fields.len() != 5 {
            return Err(FilterParseError::FieldCount {
                index,
                fields: fields.len(),
            });
        }
        let class = parse_field(index, "class", fields[0], 0xFF)?;
        let vid = parse_field(index, "vid", fields[1], 0xFFFF)?;
        let pid = parse_field(index, "pid", fields[2], 0xFFFF)?;
        let version_bcd = parse_field(index, "version", fields[3], 0xFFFF)?;
        let allow = match fields[4] {
            "0" => false,
            "1" => true,
            other => {
                return Err(FilterParseError::BadValue {
                    index,
                    value: other.to_string(),
                })
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let class = class.map(|v| v as u8);
        Ok(FilterRule {
            class,
            vid,
            pid,
            version_bcd,
            allow,
        })
    }

    fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First-match verdict for one class triplet; no match means allowed.
    fn check_triplet(&self, triplet: ClassTriplet, vid: u16, pid: u16) -> Verdict {
        for rule in &self.rules {
            if rule.matches(triplet.class, vid, pid, None) {
                return if rule.allow { Verdict::Allow } else { Verdict::Deny };
            }
        }
        Verdict::Allow
    }
}

/// Parses one rule field: `-1` is a wildcard, anything else a decimal or
/// `0x`-prefixed integer within `max`.
fn parse_field(
    index: usize,
    field: &'static str,
    value: &str,
    max: i64,
) -> Result<Option<u16>, FilterParseError> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        i64::from_str(value)
    }
    .map_err(|_| FilterParseError::BadValue {
        index,
        value: value.to_string(),
    })?;
    if parsed == -1 {
        return Ok(None);
    }
    if parsed < 0 || parsed > max {
        return Err(FilterParseError::OutOfRange {
            index,
            field,
            value: parsed,
        });
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Some(parsed as u16))
}

/// Install-gating policy, read-only after startup and shared by all
/// connection workers.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    rules: FilterRuleSet,
}

impl FilterPolicy {
    /// Builds the policy from the configured rule string, if any.
    ///
    /// A parse failure is logged and treated as "no rules": a broker that
    /// refuses every install because of a policy typo is worse than one that
    /// falls back to default-allow, since an install still takes an explicit
    /// client request.
    #[must_use]
    pub fn from_config(rule_string: Option<&str>) -> Self {
        let rules = match rule_string {
            None => FilterRuleSet::default(),
            Some(s) => match FilterRuleSet::parse(s) {
                Ok(rules) => {
                    tracing::info!(rules = rules.rules.len(), "Loaded filter rules");
                    rules
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid filter rules, falling back to allow-all");
                    FilterRuleSet::default()
                }
            },
        };
        Self { rules }
    }

    /// Checks a device against the rules.
    ///
    /// Composite devices (non-empty `interface_triplets`) are judged on
    /// their interfaces; otherwise on the device-level triplet. Any denied
    /// triplet denies the device.
    #[must_use]
    pub fn check(
        &self,
        vid: u16,
        pid: u16,
        device_triplet: ClassTriplet,
        interface_triplets: &[ClassTriplet],
    ) -> Verdict {
        if self.rules.is_empty() {
            return Verdict::Allow;
        }
        if interface_triplets.is_empty() {
            return self.rules.check_triplet(device_triplet, vid, pid);
        }
        for triplet in interface_triplets {
            if self.rules.check_triplet(*triplet, vid, pid) == Verdict::Deny {
                return Verdict::Deny;
            }
        }
        Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triplet(class: u8) -> ClassTriplet {
        ClassTriplet {
            class,
            subclass: 0,
            protocol: 0,
        }
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = FilterPolicy::from_config(None);
        assert_eq!(policy.check(0x1234, 0x5678, triplet(0x03), &[]), Verdict::Allow);
    }

    #[test]
    fn parse_accepts_hex_and_decimal() {
        let rules = FilterRuleSet::parse("0x03,-1,-1,-1,0|8,0x04b4,2184,-1,1").unwrap();
        assert_eq!(rules.rules.len(), 2);
        assert_eq!(rules.rules[0].class, Some(3));
        assert!(!rules.rules[0].allow);
        assert_eq!(rules.rules[1].vid, Some(0x04b4));
        assert_eq!(rules.rules[1].pid, Some(0x0888));
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert_eq!(
            FilterRuleSet::parse("1,2,3,4").unwrap_err(),
            FilterParseError::FieldCount {
                index: 0,
                fields: 4
            }
        );
    }

    #[test]
    fn parse_rejects_out_of_range_class() {
        assert!(matches!(
            FilterRuleSet::parse("0x1ff,-1,-1,-1,1").unwrap_err(),
            FilterParseError::OutOfRange { field: "class", .. }
        ));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = FilterPolicy::from_config(Some("0x03,-1,-1,-1,0|-1,-1,-1,-1,1"));
        assert_eq!(policy.check(1, 2, triplet(0x03), &[]), Verdict::Deny);
        assert_eq!(policy.check(1, 2, triplet(0x08), &[]), Verdict::Allow);
    }

    #[test]
    fn unmatched_triplet_is_allowed() {
        let policy = FilterPolicy::from_config(Some("0x03,-1,-1,-1,0"));
        assert_eq!(policy.check(1, 2, triplet(0x09), &[]), Verdict::Allow);
    }

    #[test]
    fn denied_interface_denies_composite_device() {
        let policy = FilterPolicy::from_config(Some("0x03,-1,-1,-1,0"));
        // device-level triplet would pass, but one interface is HID
        let interfaces = [triplet(0x08), triplet(0x03)];
        assert_eq!(policy.check(1, 2, triplet(0x00), &interfaces), Verdict::Deny);
    }

    #[test]
    fn vid_pid_scoped_rule() {
        let policy = FilterPolicy::from_config(Some("-1,0x04b4,0x0888,-1,0"));
        assert_eq!(policy.check(0x04b4, 0x0888, triplet(0), &[]), Verdict::Deny);
        assert_eq!(policy.check(0x04b4, 0x0889, triplet(0), &[]), Verdict::Allow);
    }

    #[test]
    fn malformed_rules_fail_open() {
        let policy = FilterPolicy::from_config(Some("not,a,rule"));
        assert_eq!(policy.check(1, 2, triplet(0x03), &[]), Verdict::Allow);
    }
}
