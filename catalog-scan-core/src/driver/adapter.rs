use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::error;

use super::{BatchLeafDriver, LeafBatchResult, LeafOutcome, SingleLeafDriver};
use crate::scan::LeafScan;

/// Runs a [`SingleLeafDriver`] behind the batch contract, one leaf after
/// another. A lone leaf propagates its error; in larger batches a failing
/// leaf is reported and the rest continue.
pub struct SingleLeafBatchAdapter {
    inner: Arc<dyn SingleLeafDriver>,
    try_again_later: Duration,
}

impl fmt::Debug for SingleLeafBatchAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleLeafBatchAdapter")
            .field("try_again_later", &self.try_again_later)
            .finish_non_exhaustive()
    }
}

impl SingleLeafBatchAdapter {
    pub fn new(inner: Arc<dyn SingleLeafDriver>, try_again_later: Duration) -> Self {
        Self {
            inner,
            try_again_later,
        }
    }
}

#[async_trait]
impl BatchLeafDriver for SingleLeafBatchAdapter {
    async fn process_leaves(
        &self,
        leaves: &[LeafScan],
    ) -> anyhow::Result<LeafBatchResult> {
        let mut result = LeafBatchResult::default();
        for leaf in leaves {
            match self.inner.process_leaf(leaf).await {
                Ok(LeafOutcome::Success) => {}
                Ok(LeafOutcome::TryAgainLater) => result
                    .try_again_later
                    .push((leaf.leaf_id.clone(), self.try_again_later)),
                Err(err) if leaves.len() == 1 => return Err(err),
                Err(err) => {
                    error!(
                        package_id = %leaf.package_id,
                        package_version = %leaf.package_version,
                        "leaf failed: {err:#}"
                    );
                    result.failed.push(leaf.leaf_id.clone());
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        catalog::{CatalogLeafItem, LeafType},
        registry::DriverName,
        scan::LeafParent,
    };

    struct ByUrl;

    #[async_trait]
    impl SingleLeafDriver for ByUrl {
        async fn process_leaf(&self, leaf: &LeafScan) -> anyhow::Result<LeafOutcome> {
            match leaf.url.as_str() {
                "later" => Ok(LeafOutcome::TryAgainLater),
                "broken" => anyhow::bail!("broken leaf"),
                _ => Ok(LeafOutcome::Success),
            }
        }
    }

    fn leaves(urls: &[&str]) -> Vec<LeafScan> {
        let driver = DriverName::new("LoadPackageArchive");
        let now = Utc::now();
        let parent = LeafParent {
            storage_suffix: "s",
            scan_id: "scan",
            page_id: "P0000000000",
            driver: &driver,
            min: now,
            max: now,
            bucket_ranges: None,
            page_url: None,
        };
        urls.iter()
            .enumerate()
            .map(|(rank, url)| {
                let item = CatalogLeafItem {
                    url: url.to_string(),
                    leaf_type: LeafType::PackageDetails,
                    commit_id: "c".into(),
                    commit_timestamp: now,
                    package_id: "Pkg".into(),
                    package_version: format!("{rank}.0.0"),
                };
                LeafScan::from_item(parent, format!("L{rank}"), &item)
            })
            .collect()
    }

    #[tokio::test]
    async fn batch_reports_each_leaf() {
        let adapter = SingleLeafBatchAdapter::new(Arc::new(ByUrl), Duration::from_secs(7));
        let result = adapter
            .process_leaves(&leaves(&["ok", "later", "broken"]))
            .await
            .unwrap();
        assert_eq!(result.failed, vec!["L2".to_string()]);
        assert_eq!(
            result.try_again_later,
            vec![("L1".to_string(), Duration::from_secs(7))]
        );
    }

    #[tokio::test]
    async fn lone_leaf_propagates_its_error() {
        let adapter = SingleLeafBatchAdapter::new(Arc::new(ByUrl), Duration::from_secs(7));
        assert!(adapter.process_leaves(&leaves(&["broken"])).await.is_err());
    }
}
