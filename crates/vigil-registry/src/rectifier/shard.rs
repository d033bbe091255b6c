//! Account shard space
//!
//! Accounts hash into `[0, max_shards)`. A rectifier process owns a set of
//! shards given as `ALL`, a list (`5,7,9`), ranges (`1-5,10-15`) or any mix.

use md5::{Digest, Md5};
use vigil_common::ValidationError;

pub const ALL_SHARDS: &str = "ALL";

/// Stable shard of an account: first four digest bytes, big-endian, modulo `max_shards`
pub fn compute_shard(account_id: &str, max_shards: u32) -> u32 {
    let digest = Md5::digest(account_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % max_shards.max(1)
}

/// Parse a shard assignment into a sorted, de-duplicated list
pub fn parse_shards(spec: &str, max_shards: u32) -> Result<Vec<u32>, ValidationError> {
    let spec = spec.trim();
    if spec.eq_ignore_ascii_case(ALL_SHARDS) {
        return Ok((0..max_shards).collect());
    }

    let parse = |s: &str| -> Result<u32, ValidationError> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| ValidationError::new("shards", format!("'{}' is not a shard number", s.trim())))?;
        if value >= max_shards {
            return Err(ValidationError::new(
                "shards",
                format!("shard {value} is outside [0, {max_shards})"),
            ));
        }
        Ok(value)
    };

    let mut shards = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(ValidationError::new(
                        "shards",
                        format!("range '{part}' is reversed"),
                    ));
                }
                shards.extend(start..=end);
            }
            None => shards.push(parse(part)?),
        }
    }
    if shards.is_empty() {
        return Err(ValidationError::new("shards", "no shards given"));
    }
    shards.sort_unstable();
    shards.dedup();
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_shard() {
        assert_eq!(parse_shards("5", 512).unwrap(), vec![5]);
    }

    #[test]
    fn test_list() {
        assert_eq!(parse_shards("5,7,9,32", 512).unwrap(), vec![5, 7, 9, 32]);
    }

    #[test]
    fn test_range() {
        assert_eq!(parse_shards("1-5", 512).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_multiple_ranges() {
        assert_eq!(
            parse_shards("1-5,10-15", 512).unwrap(),
            vec![1, 2, 3, 4, 5, 10, 11, 12, 13, 14, 15]
        );
    }

    #[test]
    fn test_mixed_with_spaces() {
        assert_eq!(
            parse_shards("1, 3, 4,5,6 -12, 19", 512).unwrap(),
            vec![1, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 19]
        );
    }

    #[test]
    fn test_unordered_input_is_sorted() {
        assert_eq!(
            parse_shards("12-15,8,4,7,1-3", 512).unwrap(),
            vec![1, 2, 3, 4, 7, 8, 12, 13, 14, 15]
        );
    }

    #[test]
    fn test_duplicates_removed() {
        assert_eq!(parse_shards("3,1-4,3", 512).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_all() {
        assert_eq!(parse_shards("ALL", 10).unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(parse_shards("all", 4).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_invalid() {
        assert!(parse_shards("", 512).is_err());
        assert!(parse_shards("x", 512).is_err());
        assert!(parse_shards("5-1", 512).is_err());
        assert!(parse_shards("512", 512).is_err());
    }

    #[test]
    fn test_compute_shard_is_stable() {
        assert_eq!(compute_shard("acc1", 512), compute_shard("acc1", 512));
    }

    proptest! {
        #[test]
        fn prop_compute_shard_in_range(account in "[a-z0-9]{1,32}", max in 1u32..2048) {
            prop_assert!(compute_shard(&account, max) < max);
        }
    }
}
