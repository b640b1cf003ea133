//! Read model of the remote catalog and the clients that fetch it.
//!
//! The catalog is an append-only change feed: an index lists pages, each
//! page lists leaves, and every leaf records one package change at a commit
//! timestamp.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LeafType {
    /// The package was created or its metadata changed.
    PackageDetails,
    /// The package was deleted.
    PackageDelete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogPageItem {
    pub url: String,
    pub commit_id: String,
    pub commit_timestamp: DateTime<Utc>,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogLeafItem {
    pub url: String,
    pub leaf_type: LeafType,
    pub commit_id: String,
    pub commit_timestamp: DateTime<Utc>,
    pub package_id: String,
    pub package_version: String,
}

impl CatalogLeafItem {
    /// Case-insensitive package identity.
    pub fn identity(&self) -> (String, String) {
        (
            self.package_id.to_lowercase(),
            self.package_version.to_lowercase(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogIndex {
    /// Timestamp of the newest commit in the catalog.
    pub commit_timestamp: DateTime<Utc>,
    pub items: Vec<CatalogPageItem>,
}

impl CatalogIndex {
    /// Pages that may hold leaves in `(min, max]`, oldest first. The first
    /// page past `max` is included because pages overlap at their edges.
    pub fn pages_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Vec<&CatalogPageItem> {
        let mut upper: Vec<_> = self
            .items
            .iter()
            .filter(|page| page.commit_timestamp > min)
            .collect();
        upper.sort_by_key(|page| page.commit_timestamp);

        let mut pages = Vec::new();
        for page in upper {
            pages.push(page);
            if page.commit_timestamp > max {
                break;
            }
        }
        pages
    }

    /// Stable rank of every page by `(commit timestamp, url)`.
    pub fn page_ranks(&self) -> HashMap<&str, usize> {
        ranks(self.items.iter().map(|p| (p.commit_timestamp, p.url.as_str())))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogPage {
    pub url: String,
    pub items: Vec<CatalogLeafItem>,
}

impl CatalogPage {
    /// Leaves with a commit timestamp in `(min, max]`, ordered by commit
    /// timestamp, then package id and version. With `exclude_redundant` only
    /// the newest leaf per package identity is kept.
    pub fn leaves_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        exclude_redundant: bool,
    ) -> Vec<&CatalogLeafItem> {
        let mut leaves: Vec<_> = self
            .items
            .iter()
            .filter(|leaf| {
                leaf.commit_timestamp > min && leaf.commit_timestamp <= max
            })
            .collect();
        leaves.sort_by_key(|leaf| leaf.commit_timestamp);

        if exclude_redundant {
            let mut latest: HashMap<(String, String), &CatalogLeafItem> =
                HashMap::new();
            for leaf in leaves {
                latest.insert(leaf.identity(), leaf);
            }
            leaves = latest.into_values().collect();
        }

        leaves.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.identity().cmp(&b.identity()))
        });
        leaves
    }

    /// Stable rank of every leaf by `(commit timestamp, url)`.
    pub fn leaf_ranks(&self) -> HashMap<&str, usize> {
        ranks(self.items.iter().map(|l| (l.commit_timestamp, l.url.as_str())))
    }
}

fn ranks<'a>(
    items: impl Iterator<Item = (DateTime<Utc>, &'a str)>,
) -> HashMap<&'a str, usize> {
    let mut keyed: Vec<_> = items.collect();
    keyed.sort();
    keyed
        .into_iter()
        .enumerate()
        .map(|(rank, (_, url))| (url, rank))
        .collect()
}

/// Fetches documents from the remote catalog.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_catalog_index(&self) -> anyhow::Result<CatalogIndex>;

    async fn get_catalog_page(&self, url: &str) -> anyhow::Result<CatalogPage>;
}

/// Reads watermarks published outside this engine, such as the catalog's
/// own commit cursor.
#[async_trait]
pub trait RemoteCursorClient: Send + Sync {
    async fn get_cursor(&self, name: &str) -> anyhow::Result<DateTime<Utc>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn leaf(url: &str, minute: u32, id: &str, version: &str) -> CatalogLeafItem {
        CatalogLeafItem {
            url: url.to_string(),
            leaf_type: LeafType::PackageDetails,
            commit_id: format!("c{minute}"),
            commit_timestamp: at(minute),
            package_id: id.to_string(),
            package_version: version.to_string(),
        }
    }

    fn page(url: &str, minute: u32) -> CatalogPageItem {
        CatalogPageItem {
            url: url.to_string(),
            commit_id: format!("c{minute}"),
            commit_timestamp: at(minute),
            count: 1,
        }
    }

    #[test]
    fn pages_in_bounds_include_one_page_past_max() {
        let index = CatalogIndex {
            commit_timestamp: at(40),
            items: vec![
                page("p3", 30),
                page("p0", 5),
                page("p1", 10),
                page("p2", 20),
                page("p4", 40),
            ],
        };
        let urls: Vec<_> = index
            .pages_in_bounds(at(5), at(15))
            .into_iter()
            .map(|p| p.url.as_str())
            .collect();
        assert_eq!(urls, vec!["p1", "p2"]);
    }

    #[test]
    fn redundant_leaves_keep_the_newest_commit() {
        let page = CatalogPage {
            url: "page".into(),
            items: vec![
                leaf("a1", 1, "Newtonsoft.Json", "1.0.0"),
                leaf("b1", 2, "NuGet.Core", "2.0.0"),
                leaf("a2", 3, "newtonsoft.json", "1.0.0"),
                leaf("c1", 9, "Out.Of.Range", "1.0.0"),
            ],
        };

        let all: Vec<_> = page
            .leaves_in_bounds(at(0), at(5), false)
            .into_iter()
            .map(|l| l.url.as_str())
            .collect();
        assert_eq!(all, vec!["a1", "b1", "a2"]);

        let latest: Vec<_> = page
            .leaves_in_bounds(at(0), at(5), true)
            .into_iter()
            .map(|l| l.url.as_str())
            .collect();
        assert_eq!(latest, vec!["b1", "a2"]);
    }

    #[test]
    fn leaf_ranks_follow_commit_order() {
        let page = CatalogPage {
            url: "page".into(),
            items: vec![leaf("z", 2, "A", "1"), leaf("y", 1, "B", "1")],
        };
        let ranks = page.leaf_ranks();
        assert_eq!(ranks["y"], 0);
        assert_eq!(ranks["z"], 1);
    }
}
