//! Translation of a [`Resources`] value into systemd unit properties.
//!
//! Pure code: nothing here touches the kernel or the bus, so a
//! translation failure is guaranteed to happen before any state changes.
//! Unset fields (zero values) emit no property at all; writing a zero
//! would clobber whatever systemd currently has.

use zbus::zvariant::{Array, StructureBuilder, Type, Value};

use super::config::{DeviceRule, DeviceType, Resources};
use crate::error::{CgroupError, Result};
use crate::systemd::{prop, Property};

/// 100ms, the kernel default CFS period, in microseconds.
const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// systemd's USEC_INFINITY, meaning an unlimited quota.
const USEC_INFINITY: u64 = u64::MAX;

/// Map resource limits to the property set understood by systemd.
///
/// Fails without emitting anything if a device rule or range list cannot
/// be expressed; partial property lists are never returned.
pub fn translate(r: &Resources) -> Result<Vec<Property>> {
    let mut properties = device_properties(&r.devices)?;

    if r.memory != 0 {
        properties.push(prop("MemoryLimit", r.memory as u64));
    }
    if r.cpu_shares != 0 {
        properties.push(prop("CPUShares", r.cpu_shares));
    }
    add_cpu_quota(&mut properties, r.cpu_quota, r.cpu_period);
    if r.blkio_weight != 0 {
        properties.push(prop("BlockIOWeight", r.blkio_weight as u64));
    }
    if r.pids_limit > 0 || r.pids_limit == -1 {
        let limit = if r.pids_limit == -1 {
            u64::MAX
        } else {
            r.pids_limit as u64
        };
        properties.push(prop("TasksMax", limit));
    }
    add_cpuset(&mut properties, &r.cpuset_cpus, &r.cpuset_mems)?;

    Ok(properties)
}

/// Emit `CPUQuotaPerSecUSec` when either quota or period is set. A quota
/// of -1 maps to USEC_INFINITY (explicitly unlimited), which is distinct
/// from emitting nothing (unset, keep systemd's current value).
fn add_cpu_quota(properties: &mut Vec<Property>, quota: i64, period: u64) {
    if quota == 0 && period == 0 {
        return;
    }
    let mut quota_per_sec = USEC_INFINITY;
    if quota > 0 {
        let period = if period == 0 { DEFAULT_CPU_PERIOD } else { period };
        quota_per_sec = (quota as u64).saturating_mul(1_000_000) / period;
        // systemd stores the quota at 10ms resolution; round up so the
        // container never gets less CPU than asked for.
        if quota_per_sec % 10_000 != 0 {
            quota_per_sec = (quota_per_sec / 10_000 + 1) * 10_000;
        }
    }
    properties.push(prop("CPUQuotaPerSecUSec", quota_per_sec));
}

fn add_cpuset(properties: &mut Vec<Property>, cpus: &str, mems: &str) -> Result<()> {
    if !cpus.is_empty() {
        properties.push(prop("AllowedCPUs", range_to_bits(cpus)?));
    }
    if !mems.is_empty() {
        properties.push(prop("AllowedMemoryNodes", range_to_bits(mems)?));
    }
    Ok(())
}

/// Convert a range list such as `0-3,7` into the byte mask systemd
/// expects for AllowedCPUs/AllowedMemoryNodes: bit N of byte N/8 set for
/// each selected id.
pub(crate) fn range_to_bits(ranges: &str) -> Result<Vec<u8>> {
    let malformed = || CgroupError::Translation(format!("invalid range list {:?}", ranges));

    let mut bits: Vec<u8> = Vec::new();
    for part in ranges.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(malformed());
        }
        let (start, end) = match part.split_once('-') {
            Some((lo, hi)) => (
                lo.trim().parse::<u64>().map_err(|_| malformed())?,
                hi.trim().parse::<u64>().map_err(|_| malformed())?,
            ),
            None => {
                let id = part.parse::<u64>().map_err(|_| malformed())?;
                (id, id)
            }
        };
        if start > end {
            return Err(malformed());
        }
        for id in start..=end {
            let byte = (id / 8) as usize;
            if bits.len() <= byte {
                bits.resize(byte + 1, 0);
            }
            bits[byte] |= 1 << (id % 8);
        }
    }
    Ok(bits)
}

/// Translate the ordered device rule list into `DevicePolicy` plus
/// `DeviceAllow` entries.
///
/// systemd's device interface is an allow list: deny is the default under
/// the `strict` policy, so deny rules emit nothing unless they reset the
/// whole list (a wildcard deny), and a deny that would narrow an earlier
/// allow cannot be expressed and is rejected.
fn device_properties(rules: &[DeviceRule]) -> Result<Vec<Property>> {
    let mut policy = "strict";
    let mut allow: Vec<(String, String)> = Vec::new();

    for rule in rules {
        if rule.allow {
            if rule.matches_all() {
                // Allow everything: flip the policy and drop the now
                // redundant entries.
                policy = "auto";
                allow.clear();
                continue;
            }
            allow.push((device_path(rule)?, device_perms(rule)?));
        } else if rule.matches_all() {
            // Wildcard deny resets the group to default-deny; entries
            // emitted before it are dead and dropped to preserve the
            // source ordering semantics.
            policy = "strict";
            allow.clear();
        } else if !allow.is_empty() || policy == "auto" {
            return Err(CgroupError::Translation(format!(
                "deny rule {:?} after an allow rule cannot be expressed as a systemd allow list",
                rule.cgroup_string()
            )));
        }
        // A deny rule before any allow is already the default.
    }

    let mut properties = vec![prop("DevicePolicy", policy)];
    if !allow.is_empty() {
        properties.push(Property {
            name: "DeviceAllow".to_string(),
            value: device_allow_value(&allow)?,
        });
    }
    Ok(properties)
}

fn device_path(rule: &DeviceRule) -> Result<String> {
    let kind = match rule.dev_type {
        DeviceType::Char => "char",
        DeviceType::Block => "block",
        DeviceType::All => {
            return Err(CgroupError::Translation(format!(
                "device rule {:?} mixes the all-devices type with concrete numbers",
                rule.cgroup_string()
            )))
        }
    };
    match (rule.major, rule.minor) {
        // The kernel exposes /dev/char and /dev/block trees keyed by
        // major:minor, which systemd resolves for DeviceAllow.
        (Some(major), Some(minor)) => Ok(format!("/dev/{}/{}:{}", kind, major, minor)),
        _ => Err(CgroupError::Translation(format!(
            "device rule {:?} uses a wildcard systemd cannot express",
            rule.cgroup_string()
        ))),
    }
}

fn device_perms(rule: &DeviceRule) -> Result<String> {
    let perms = rule.permissions();
    if perms.is_empty() {
        return Err(CgroupError::Translation(format!(
            "device rule {:?} grants no access",
            rule.cgroup_string()
        )));
    }
    Ok(perms)
}

/// Build the `a(ss)` DeviceAllow value from (path, permissions) pairs.
fn device_allow_value(entries: &[(String, String)]) -> Result<Value<'static>> {
    let mut array = Array::new(<(String, String)>::signature());
    for (path, perms) in entries {
        let entry = StructureBuilder::new()
            .add_field(path.clone())
            .add_field(perms.clone())
            .build();
        array
            .append(Value::Structure(entry))
            .map_err(|e| CgroupError::Translation(format!("encoding device rules: {}", e)))?;
    }
    Ok(Value::Array(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::config::DeviceRule;

    fn names(props: &[Property]) -> Vec<&str> {
        props.iter().map(|p| p.name.as_str()).collect()
    }

    fn find<'a>(props: &'a [Property], name: &str) -> Option<&'a Property> {
        props.iter().find(|p| p.name == name)
    }

    fn allow_rule(major: i64, minor: i64) -> DeviceRule {
        DeviceRule {
            dev_type: DeviceType::Char,
            major: Some(major),
            minor: Some(minor),
            read: true,
            write: true,
            mknod: false,
            allow: true,
        }
    }

    #[test]
    fn test_zero_resources_emit_only_device_policy() {
        let props = translate(&Resources::default()).unwrap();
        assert_eq!(names(&props), vec!["DevicePolicy"]);
    }

    #[test]
    fn test_nonzero_fields_are_emitted() {
        let r = Resources {
            memory: 64 * 1024 * 1024,
            cpu_shares: 512,
            blkio_weight: 500,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "MemoryLimit").unwrap().value,
            Value::from(64u64 * 1024 * 1024)
        );
        assert_eq!(find(&props, "CPUShares").unwrap().value, Value::from(512u64));
        assert_eq!(
            find(&props, "BlockIOWeight").unwrap().value,
            Value::from(500u64)
        );
    }

    #[test]
    fn test_pids_limit_zero_is_omitted() {
        let props = translate(&Resources::default()).unwrap();
        assert!(find(&props, "TasksMax").is_none());
    }

    #[test]
    fn test_pids_limit_positive_and_unlimited() {
        let r = Resources {
            pids_limit: 100,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(find(&props, "TasksMax").unwrap().value, Value::from(100u64));

        let r = Resources {
            pids_limit: -1,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "TasksMax").unwrap().value,
            Value::from(u64::MAX)
        );
    }

    #[test]
    fn test_cpu_quota_unset_emits_nothing() {
        let props = translate(&Resources::default()).unwrap();
        assert!(find(&props, "CPUQuotaPerSecUSec").is_none());
    }

    #[test]
    fn test_cpu_quota_unlimited_vs_unset() {
        let r = Resources {
            cpu_quota: -1,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "CPUQuotaPerSecUSec").unwrap().value,
            Value::from(u64::MAX)
        );
    }

    #[test]
    fn test_cpu_quota_rounds_up_to_10ms() {
        // A full core over a 100ms period is exactly 1s/s, already aligned.
        let r = Resources {
            cpu_quota: 100_000,
            cpu_period: 100_000,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "CPUQuotaPerSecUSec").unwrap().value,
            Value::from(1_000_000u64)
        );

        // Half a millisecond per period is 5000us/sec and rounds up to
        // the next 10ms step.
        let r = Resources {
            cpu_quota: 500,
            cpu_period: 100_000,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "CPUQuotaPerSecUSec").unwrap().value,
            Value::from(10_000u64)
        );

        // quota 10001us over 100ms is 100010us/sec, rounded up to 110000.
        let r = Resources {
            cpu_quota: 10_001,
            cpu_period: 100_000,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "CPUQuotaPerSecUSec").unwrap().value,
            Value::from(110_000u64)
        );
    }

    #[test]
    fn test_cpu_period_without_quota_is_unlimited() {
        let r = Resources {
            cpu_period: 50_000,
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "CPUQuotaPerSecUSec").unwrap().value,
            Value::from(u64::MAX)
        );
    }

    #[test]
    fn test_range_to_bits() {
        assert_eq!(range_to_bits("0").unwrap(), vec![0b0000_0001]);
        assert_eq!(range_to_bits("0-3").unwrap(), vec![0b0000_1111]);
        assert_eq!(range_to_bits("0-3,7").unwrap(), vec![0b1000_1111]);
        assert_eq!(range_to_bits("8").unwrap(), vec![0, 0b0000_0001]);
        assert_eq!(range_to_bits("1,9").unwrap(), vec![0b0000_0010, 0b0000_0010]);
    }

    #[test]
    fn test_range_to_bits_rejects_garbage() {
        assert!(range_to_bits("").is_err());
        assert!(range_to_bits("a-b").is_err());
        assert!(range_to_bits("3-1").is_err());
        assert!(range_to_bits("1,,2").is_err());
    }

    #[test]
    fn test_cpuset_emitted_only_when_set() {
        let props = translate(&Resources::default()).unwrap();
        assert!(find(&props, "AllowedCPUs").is_none());
        assert!(find(&props, "AllowedMemoryNodes").is_none());

        let r = Resources {
            cpuset_cpus: "0-1".to_string(),
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(
            find(&props, "AllowedCPUs").unwrap().value,
            Value::from(vec![0b0000_0011u8])
        );
        assert!(find(&props, "AllowedMemoryNodes").is_none());
    }

    #[test]
    fn test_device_allow_preserves_order() {
        let r = Resources {
            devices: vec![allow_rule(1, 3), allow_rule(1, 5)],
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(find(&props, "DevicePolicy").unwrap().value, Value::from("strict"));
        let allow = find(&props, "DeviceAllow").unwrap();
        let rendered = format!("{:?}", allow.value);
        let first = rendered.find("/dev/char/1:3").unwrap();
        let second = rendered.find("/dev/char/1:5").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_wildcard_allow_flips_policy_to_auto() {
        let r = Resources {
            devices: vec![DeviceRule {
                dev_type: DeviceType::All,
                major: None,
                minor: None,
                read: true,
                write: true,
                mknod: true,
                allow: true,
            }],
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(find(&props, "DevicePolicy").unwrap().value, Value::from("auto"));
        assert!(find(&props, "DeviceAllow").is_none());
    }

    #[test]
    fn test_malformed_device_rule_fails_without_partial_output() {
        let r = Resources {
            memory: 4096,
            devices: vec![DeviceRule {
                dev_type: DeviceType::Char,
                major: None,
                minor: Some(3),
                read: true,
                write: false,
                mknod: false,
                allow: true,
            }],
            ..Default::default()
        };
        let err = translate(&r).unwrap_err();
        assert!(matches!(err, CgroupError::Translation(_)));
    }

    #[test]
    fn test_device_rule_without_access_is_rejected() {
        let r = Resources {
            devices: vec![DeviceRule {
                dev_type: DeviceType::Char,
                major: Some(1),
                minor: Some(3),
                read: false,
                write: false,
                mknod: false,
                allow: true,
            }],
            ..Default::default()
        };
        assert!(translate(&r).is_err());
    }

    #[test]
    fn test_deny_after_allow_is_rejected() {
        let r = Resources {
            devices: vec![
                allow_rule(1, 3),
                DeviceRule {
                    dev_type: DeviceType::Char,
                    major: Some(1),
                    minor: Some(3),
                    read: true,
                    write: true,
                    mknod: false,
                    allow: false,
                },
            ],
            ..Default::default()
        };
        assert!(translate(&r).is_err());
    }

    #[test]
    fn test_leading_wildcard_deny_is_default() {
        let r = Resources {
            devices: vec![
                DeviceRule {
                    dev_type: DeviceType::All,
                    major: None,
                    minor: None,
                    read: true,
                    write: true,
                    mknod: true,
                    allow: false,
                },
                allow_rule(1, 3),
            ],
            ..Default::default()
        };
        let props = translate(&r).unwrap();
        assert_eq!(find(&props, "DevicePolicy").unwrap().value, Value::from("strict"));
        assert!(find(&props, "DeviceAllow").is_some());
    }
}
