/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use http::HeaderName;
use humanize_rs::ParseError;
use yaml_rust::{Yaml, yaml};

pub(crate) fn foreach_kv<F>(map: &yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in map.iter() {
        if let Yaml::String(key) = k {
            f(key, v).context(format!("failed to parse value of key {key}"))?;
        } else {
            return Err(anyhow!("hash key {k:?} is not a string"));
        }
    }
    Ok(())
}

pub(crate) fn as_string(v: &Yaml) -> anyhow::Result<String> {
    match v {
        Yaml::String(s) => Ok(s.to_string()),
        Yaml::Integer(i) => Ok(i.to_string()),
        _ => Err(anyhow!("yaml value type for string should be 'string'")),
    }
}

pub(crate) fn as_bool(v: &Yaml) -> anyhow::Result<bool> {
    match v {
        Yaml::Boolean(b) => Ok(*b),
        Yaml::String(s) => match s.to_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(true),
            "off" | "false" | "no" | "0" => Ok(false),
            _ => Err(anyhow!("invalid yaml string value for 'bool': {s}")),
        },
        Yaml::Integer(i) => Ok(*i != 0),
        _ => Err(anyhow!(
            "yaml value type for 'bool' should be 'boolean' / 'string' / 'integer'"
        )),
    }
}

pub(crate) fn as_u16(v: &Yaml) -> anyhow::Result<u16> {
    match v {
        Yaml::String(s) => Ok(u16::from_str(s)?),
        Yaml::Integer(i) => Ok(u16::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'u16' should be 'string' or 'integer'"
        )),
    }
}

pub(crate) fn as_u32(v: &Yaml) -> anyhow::Result<u32> {
    match v {
        Yaml::String(s) => Ok(u32::from_str(s)?),
        Yaml::Integer(i) => Ok(u32::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'u32' should be 'string' or 'integer'"
        )),
    }
}

pub(crate) fn as_usize(v: &Yaml) -> anyhow::Result<usize> {
    match v {
        Yaml::String(s) => {
            let v = s.parse::<humanize_rs::bytes::Bytes>()?;
            Ok(v.size())
        }
        Yaml::Integer(i) => Ok(usize::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for humanize usize should be 'string' or 'integer'"
        )),
    }
}

pub(crate) fn as_duration(v: &Yaml) -> anyhow::Result<Duration> {
    match v {
        Yaml::String(value) => match humanize_rs::duration::parse(value) {
            Ok(v) => Ok(v),
            Err(ParseError::MissingUnit) => {
                if let Ok(u) = u64::from_str(value) {
                    Ok(Duration::from_secs(u))
                } else {
                    Err(anyhow!("invalid duration string"))
                }
            }
            Err(e) => Err(anyhow!("invalid humanize duration string: {e}")),
        },
        Yaml::Integer(value) => {
            let u = u64::try_from(*value).map_err(|e| anyhow!("invalid u64 value: {e}"))?;
            Ok(Duration::from_secs(u))
        }
        _ => Err(anyhow!(
            "yaml value type for humanize duration should be 'string' or 'integer'"
        )),
    }
}

pub(crate) fn as_header_name(v: &Yaml) -> anyhow::Result<HeaderName> {
    let s = as_string(v)?;
    HeaderName::from_str(&s).map_err(|e| anyhow!("invalid http header name {s}: {e}"))
}

pub(crate) fn as_list<T, F>(v: &Yaml, f: F) -> anyhow::Result<Vec<T>>
where
    F: Fn(&Yaml) -> anyhow::Result<T>,
{
    match v {
        Yaml::Array(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for (i, v) in seq.iter().enumerate() {
                out.push(f(v).context(format!("invalid value for element #{i}"))?);
            }
            Ok(out)
        }
        _ => Ok(vec![f(v)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_duration() {
        let v = Yaml::String("1h2m".to_string());
        assert_eq!(as_duration(&v).unwrap(), Duration::from_secs(3600 + 120));

        let v = Yaml::String("100ms".to_string());
        assert_eq!(as_duration(&v).unwrap(), Duration::from_millis(100));

        let v = Yaml::Integer(2);
        assert_eq!(as_duration(&v).unwrap(), Duration::from_secs(2));

        let v = Yaml::Integer(-1);
        assert!(as_duration(&v).is_err());
    }

    #[test]
    fn t_usize() {
        let v = Yaml::String("4KB".to_string());
        assert_eq!(as_usize(&v).unwrap(), 4000);

        let v = Yaml::Integer(4096);
        assert_eq!(as_usize(&v).unwrap(), 4096);
    }

    #[test]
    fn t_bool() {
        assert!(as_bool(&Yaml::Boolean(true)).unwrap());
        assert!(as_bool(&Yaml::String("on".to_string())).unwrap());
        assert!(!as_bool(&Yaml::String("off".to_string())).unwrap());
        assert!(as_bool(&Yaml::Array(Vec::new())).is_err());
    }

    #[test]
    fn t_list() {
        let v = Yaml::Array(vec![Yaml::Integer(302), Yaml::Integer(307)]);
        assert_eq!(as_list(&v, as_u16).unwrap(), vec![302, 307]);

        let v = Yaml::Integer(302);
        assert_eq!(as_list(&v, as_u16).unwrap(), vec![302]);
    }
}
