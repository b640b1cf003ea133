//! Bucket ranges: stable hash partitions of the package space.
//!
//! Every package lands in one of [`BUCKET_COUNT`] buckets. A bucket-range
//! scan reprocesses the newest leaf of every package in the selected buckets
//! instead of walking a commit window.

use std::{collections::BTreeSet, fmt, str::FromStr};

use async_trait::async_trait;

use crate::{
    catalog::CatalogLeafItem,
    error::{CatalogScanError, Result},
};

pub const BUCKET_COUNT: u16 = 1000;

/// Inclusive range of buckets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BucketRange {
    min: u16,
    max: u16,
}

impl BucketRange {
    pub fn new(min: u16, max: u16) -> Result<Self> {
        if min >= BUCKET_COUNT {
            return Err(CatalogScanError::InvalidArgument(format!(
                "bucket range min {min} must be below {BUCKET_COUNT}"
            )));
        }
        if max >= BUCKET_COUNT || max < min {
            return Err(CatalogScanError::InvalidArgument(format!(
                "bucket range max {max} must be within [{min}, {BUCKET_COUNT})"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn buckets(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }

    /// Parse comma separated ranges such as `"0-99,250"`, preserving order.
    pub fn parse_ranges(value: &str) -> Result<Vec<BucketRange>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn parse_buckets(value: &str) -> Result<Vec<u16>> {
        Ok(Self::parse_ranges(value)?
            .iter()
            .flat_map(BucketRange::buckets)
            .collect())
    }

    /// Compact a set of buckets into the canonical range text. Returns `None`
    /// for an empty set.
    pub fn buckets_to_ranges(
        buckets: impl IntoIterator<Item = u16>,
    ) -> Result<Option<String>> {
        let sorted: BTreeSet<u16> = buckets.into_iter().collect();
        if let Some(&bad) = sorted.iter().find(|&&b| b >= BUCKET_COUNT) {
            return Err(CatalogScanError::InvalidArgument(format!(
                "bucket {bad} must be below {BUCKET_COUNT}"
            )));
        }

        let mut ranges: Vec<BucketRange> = Vec::new();
        for bucket in sorted {
            match ranges.last_mut() {
                Some(last) if last.max + 1 == bucket => last.max = bucket,
                _ => ranges.push(BucketRange {
                    min: bucket,
                    max: bucket,
                }),
            }
        }

        if ranges.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            ranges
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        ))
    }
}

impl fmt::Display for BucketRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

impl FromStr for BucketRange {
    type Err = CatalogScanError;

    fn from_str(value: &str) -> Result<Self> {
        let parse = |raw: &str| {
            raw.trim().parse::<u16>().map_err(|_| {
                CatalogScanError::InvalidArgument(format!(
                    "'{value}' is not a bucket or bucket range"
                ))
            })
        };
        match value.split_once('-') {
            Some((min, max)) => BucketRange::new(parse(min)?, parse(max)?),
            None => {
                let bucket = parse(value)?;
                BucketRange::new(bucket, bucket)
            }
        }
    }
}

/// Supplies the newest leaf of every package in a bucket.
#[async_trait]
pub trait BucketedPackageSource: Send + Sync {
    async fn packages_in_bucket(
        &self,
        bucket: u16,
    ) -> anyhow::Result<Vec<CatalogLeafItem>>;
}
