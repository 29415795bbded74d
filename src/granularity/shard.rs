use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Static partition count of the metric address space.
pub const NUMBER_OF_SHARDS: u32 = 128;

/// Parses a shard set: either `ALL` or a comma separated list such as
/// `"0,1,5"`. The result is sorted and deduplicated.
pub fn parse_shards(s: &str) -> Result<Vec<u32>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok((0..NUMBER_OF_SHARDS).collect());
    }

    let mut shards = BTreeSet::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let shard: u32 = part
            .parse()
            .with_context(|| format!("invalid shard {part:?}"))?;
        if shard >= NUMBER_OF_SHARDS {
            bail!("shard {shard} out of range (max {})", NUMBER_OF_SHARDS - 1);
        }
        shards.insert(shard);
    }

    if shards.is_empty() {
        bail!("shard list {s:?} is empty");
    }

    Ok(shards.into_iter().collect())
}

/// Maps a metric's stable identifier onto a shard.
pub fn compute_shard(locator: &str) -> u32 {
    let digest = Sha256::digest(locator.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % NUMBER_OF_SHARDS
}
