use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::backoff::{leaf_delay, total_attempts};
use crate::{
    context::ScanContext,
    driver::{BatchLeafDriver, LeafDriver, LeafOutcome, SingleLeafDriver},
    error::{CatalogScanError, Result},
    events::ScanEvent,
    queue::{LeafScanMessage, ScanMessage},
    registry::DriverName,
    scan::LeafScan,
};

/// One delivered leaf message.
#[derive(Clone, Debug)]
pub struct LeafDelivery {
    pub message: LeafScanMessage,
    pub dequeue_count: u32,
}

/// Classification of a processed batch. Messages in no list completed.
#[derive(Clone, Debug, Default)]
pub struct LeafBatchOutcome {
    pub failed: Vec<LeafScanMessage>,
    pub try_again_later: Vec<(LeafScanMessage, Duration)>,
    pub no_matching_scan: Vec<LeafScanMessage>,
    /// Already moved to the dead-letter destination.
    pub poison: Vec<LeafScanMessage>,
}

type Work = Vec<(LeafScanMessage, LeafScan, u32)>;

/// Drives leaf scans to completion.
///
/// Messages are grouped by page so each group's rows come back with a single
/// range query. Storage conflicts never fail a message; they reschedule it.
#[derive(Clone)]
pub struct LeafScanProcessor {
    context: ScanContext,
}

impl fmt::Debug for LeafScanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafScanProcessor").finish_non_exhaustive()
    }
}

impl LeafScanProcessor {
    pub fn new(context: ScanContext) -> Self {
        Self { context }
    }

    /// Process a batch of deliveries. A batch of exactly one message returns
    /// driver errors instead of reporting the message as failed.
    pub async fn process(
        &self,
        deliveries: &[LeafDelivery],
    ) -> Result<LeafBatchOutcome> {
        let throw_on_error = deliveries.len() == 1;
        let mut outcome = LeafBatchOutcome::default();
        let mut poison: Vec<(LeafScanMessage, u32)> = Vec::new();
        let mut completed = 0usize;
        let mut driver_seen: Option<DriverName> = None;

        let mut groups: BTreeMap<(&str, &str, &str), Vec<&LeafDelivery>> =
            BTreeMap::new();
        for delivery in deliveries {
            let message = &delivery.message;
            groups
                .entry((
                    message.storage_suffix.as_str(),
                    message.scan_id.as_str(),
                    message.page_id.as_str(),
                ))
                .or_default()
                .push(delivery);
        }

        for ((storage_suffix, scan_id, page_id), group) in groups {
            let by_driver = self
                .categorize(
                    storage_suffix,
                    scan_id,
                    page_id,
                    &group,
                    &mut outcome,
                    &mut poison,
                )
                .await?;

            if by_driver.len() > 1 {
                return Err(CatalogScanError::InvalidState(format!(
                    "leaf scans of {scan_id}/{page_id} name more than one driver"
                )));
            }

            for (driver, work) in by_driver {
                info!(
                    driver = %driver,
                    count = work.len(),
                    "starting leaf scan batch"
                );
                completed += match self.context.drivers.leaf_driver(driver.as_str())? {
                    LeafDriver::Batch(batch) => {
                        self.process_batch(
                            storage_suffix,
                            batch.as_ref(),
                            work,
                            &mut outcome,
                            throw_on_error,
                        )
                        .await?
                    }
                    LeafDriver::Single(single) => {
                        self.process_one_by_one(
                            single,
                            work,
                            &mut outcome,
                            throw_on_error,
                        )
                        .await?
                    }
                };
                driver_seen = Some(driver);
            }
        }

        self.report(deliveries.len(), &outcome, &poison);

        for (message, attempt_count) in poison {
            error!(
                scan_id = %message.scan_id,
                leaf_id = %message.leaf_id,
                attempt_count,
                "moving leaf scan message to the poison queue"
            );
            self.context
                .queue
                .dead_letter(ScanMessage::Leaf(message.clone()))
                .await?;
            self.context
                .publish(ScanEvent::LeafPoisoned {
                    message: message.clone(),
                    attempt_count,
                })
                .await;
            outcome.poison.push(message);
        }

        self.context
            .publish(ScanEvent::LeafBatchProcessed {
                driver: driver_seen,
                completed,
                failed: outcome.failed.len(),
                try_again_later: outcome.try_again_later.len(),
                no_matching_scan: outcome.no_matching_scan.len(),
                poison: outcome.poison.len(),
            })
            .await;

        Ok(outcome)
    }

    async fn categorize(
        &self,
        storage_suffix: &str,
        scan_id: &str,
        page_id: &str,
        group: &[&LeafDelivery],
        outcome: &mut LeafBatchOutcome,
        poison: &mut Vec<(LeafScanMessage, u32)>,
    ) -> Result<BTreeMap<DriverName, Work>> {
        let leaf_config = &self.context.config.leaf;

        // Redelivery and fan-out recovery can put one leaf in a batch twice.
        // Keep the most delivered copy; the others complete as no-ops.
        let mut unique: BTreeMap<&str, &LeafDelivery> = BTreeMap::new();
        for delivery in group {
            let leaf_id = delivery.message.leaf_id.as_str();
            match unique.get(leaf_id) {
                Some(kept) => {
                    debug!(leaf_id, "leaf scan message appears more than once in the batch");
                    if delivery.dequeue_count > kept.dequeue_count {
                        unique.insert(leaf_id, delivery);
                    }
                }
                None => {
                    unique.insert(leaf_id, delivery);
                }
            }
        }
        let group: Vec<&LeafDelivery> = unique.into_values().collect();
        let leaf_ids: Vec<&str> =
            group.iter().map(|d| d.message.leaf_id.as_str()).collect();

        let scans = match self
            .context
            .storage
            .get_leaf_scans(storage_suffix, scan_id, page_id, &leaf_ids)
            .await
        {
            Ok(scans) => scans,
            Err(CatalogScanError::TableNotFound(_)) => {
                outcome
                    .no_matching_scan
                    .extend(group.iter().map(|d| d.message.clone()));
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        let mut by_driver: BTreeMap<DriverName, Work> = BTreeMap::new();
        for delivery in &group {
            let message = &delivery.message;
            let Some(scan) = scans.get(&message.leaf_id) else {
                outcome.no_matching_scan.push(message.clone());
                continue;
            };

            if total_attempts(scan.attempt_count, delivery.dequeue_count)
                > leaf_config.max_attempts
            {
                poison.push((message.clone(), scan.attempt_count));
                continue;
            }

            if let Some(next_attempt) = scan.next_attempt
                && let Ok(remaining) = (next_attempt - now).to_std()
                && !remaining.is_zero()
            {
                let wait = (remaining + leaf_config.clock_skew())
                    .min(leaf_config.max_wait());
                outcome.try_again_later.push((message.clone(), wait));
                continue;
            }

            by_driver.entry(scan.driver.clone()).or_default().push((
                message.clone(),
                scan.clone(),
                delivery.dequeue_count,
            ));
        }

        Ok(by_driver)
    }

    fn start_attempt(&self, scan: &mut LeafScan, dequeue_count: u32) {
        let backoff = &self.context.config.backoff;
        scan.start_attempt(Utc::now(), |attempt_count| {
            let delay =
                leaf_delay(backoff, total_attempts(attempt_count, dequeue_count));
            chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
        });
    }

    /// Returns how many leaves completed.
    async fn process_batch(
        &self,
        storage_suffix: &str,
        driver: &dyn BatchLeafDriver,
        work: Work,
        outcome: &mut LeafBatchOutcome,
        throw_on_error: bool,
    ) -> Result<usize> {
        let storage = &self.context.storage;
        let conflict_delay = self.context.config.leaf.try_again_later();

        let mut messages: HashMap<String, LeafScanMessage> = HashMap::new();
        let mut scans = Vec::with_capacity(work.len());
        for (message, mut scan, dequeue_count) in work {
            self.start_attempt(&mut scan, dequeue_count);
            messages.insert(scan.leaf_id.clone(), message);
            scans.push(scan);
        }

        match storage.replace_leaf_scans(storage_suffix, &mut scans).await {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                warn!(
                    "another worker holds or completed a leaf scan in the batch; trying again later"
                );
                outcome.try_again_later.extend(
                    messages.into_values().map(|message| (message, conflict_delay)),
                );
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        let result = match driver.process_leaves(&scans).await {
            Ok(result) => result,
            Err(err) if !throw_on_error => {
                error!("leaf scan batch failed: {err:#}");
                outcome.failed.extend(messages.into_values());
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };

        let deferred: HashMap<&str, Duration> = result
            .try_again_later
            .iter()
            .map(|(leaf_id, delay)| (leaf_id.as_str(), *delay))
            .collect();
        let failed: HashSet<&str> =
            result.failed.iter().map(String::as_str).collect();

        let now = Utc::now();
        let mut retry = Vec::new();
        let mut done = Vec::new();
        for mut scan in scans {
            if let Some(delay) = deferred.get(scan.leaf_id.as_str()) {
                scan.reset_attempt(now);
                if let Some(message) = messages.remove(&scan.leaf_id) {
                    outcome.try_again_later.push((message, *delay));
                }
                retry.push(scan);
            } else if failed.contains(scan.leaf_id.as_str()) {
                if let Some(message) = messages.remove(&scan.leaf_id) {
                    outcome.failed.push(message);
                }
            } else {
                done.push(scan);
            }
        }

        if !retry.is_empty()
            && let Err(err) =
                storage.replace_leaf_scans(storage_suffix, &mut retry).await
        {
            if !err.is_conflict() {
                return Err(err);
            }
            warn!("deferred leaf scans changed underneath us; they keep their attempt");
        }

        if done.is_empty() {
            return Ok(0);
        }
        match storage.delete_leaf_scans(storage_suffix, &mut done).await {
            Ok(()) => Ok(done.len()),
            Err(err) if err.is_conflict() => {
                warn!(
                    "another worker changed a completed leaf scan; trying again later"
                );
                outcome.try_again_later.extend(
                    done.iter()
                        .filter_map(|scan| messages.remove(&scan.leaf_id))
                        .map(|message| (message, conflict_delay)),
                );
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    async fn process_one_by_one(
        &self,
        driver: Arc<dyn SingleLeafDriver>,
        work: Work,
        outcome: &mut LeafBatchOutcome,
        throw_on_error: bool,
    ) -> Result<usize> {
        let storage = &self.context.storage;
        let conflict_delay = self.context.config.leaf.try_again_later();
        let mut completed = 0;

        for (message, mut scan, dequeue_count) in work {
            info!(
                driver = %scan.driver,
                package_id = %scan.package_id,
                package_version = %scan.package_version,
                "starting leaf scan"
            );

            self.start_attempt(&mut scan, dequeue_count);
            match storage.replace_leaf_scan(&mut scan).await {
                Ok(()) => {}
                Err(CatalogScanError::EntityNotFound { .. }) => {
                    warn!(leaf_id = %scan.leaf_id, "leaf scan was already completed");
                    continue;
                }
                Err(err) if err.is_conflict() => {
                    warn!(leaf_id = %scan.leaf_id, "leaf scan is being processed elsewhere; trying again later");
                    outcome.try_again_later.push((message, conflict_delay));
                    continue;
                }
                Err(err) => return Err(err),
            }

            let result = match driver.process_leaf(&scan).await {
                Ok(result) => result,
                Err(err) if !throw_on_error => {
                    error!(
                        package_id = %scan.package_id,
                        package_version = %scan.package_version,
                        "leaf scan failed: {err:#}"
                    );
                    outcome.failed.push(message);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match result {
                LeafOutcome::Success => match storage.delete_leaf_scan(&scan).await {
                    Ok(()) => {
                        debug!(leaf_id = %scan.leaf_id, "completed leaf scan");
                        completed += 1;
                    }
                    Err(CatalogScanError::EntityNotFound { .. }) => {}
                    Err(err) if err.is_conflict() => {
                        outcome.try_again_later.push((message, conflict_delay));
                    }
                    Err(err) => return Err(err),
                },
                LeafOutcome::TryAgainLater => {
                    scan.reset_attempt(Utc::now());
                    match storage.replace_leaf_scan(&mut scan).await {
                        Ok(()) => {
                            outcome.try_again_later.push((message, conflict_delay));
                        }
                        Err(CatalogScanError::EntityNotFound { .. }) => {}
                        Err(err) if err.is_conflict() => {
                            outcome.try_again_later.push((message, conflict_delay));
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        Ok(completed)
    }

    fn report(
        &self,
        total: usize,
        outcome: &LeafBatchOutcome,
        poison: &[(LeafScanMessage, u32)],
    ) {
        if !outcome.no_matching_scan.is_empty() {
            warn!(
                count = outcome.no_matching_scan.len(),
                total,
                "leaf scan messages had no matching leaf scan"
            );
        }
        if !outcome.failed.is_empty() {
            error!(count = outcome.failed.len(), total, "leaf scans failed");
        }
        if let (Some(min), Some(max)) = (
            outcome.try_again_later.iter().map(|(_, d)| *d).min(),
            outcome.try_again_later.iter().map(|(_, d)| *d).max(),
        ) {
            warn!(
                count = outcome.try_again_later.len(),
                total,
                "leaf scans will be tried again in {min:?} to {max:?}"
            );
        }
        if !poison.is_empty() {
            error!(
                count = poison.len(),
                total,
                "leaf scans will be moved to the poison queue"
            );
        }
    }
}
