//! The Engine turns reports into deduplicated, continuously-updated
//! notifications.
//!
//! `Engine::dispatch()` fans each damage of a report out to the subscribers
//! of the damaged asset, and processes each (asset, subscriber) entry as an
//! independent task. Processing of an entry:
//!
//! 1. Acquires the entry's lease, waiting a bounded time. If the wait
//!    elapses the unit is dropped: the next damage of the asset retries.
//! 2. Atomically merges the damage into the entry's Tally.
//! 3. Compares the StateHash of the merged Tally with that of the last
//!    delivered notification. Equal hashes require no delivery.
//! 4. Otherwise, edits the delivered notification or creates one if there
//!    is none, and records the new hash and handle. A delivery which
//!    doesn't complete well within the lease hold is abandoned.
//! 5. Releases the lease.
//!
//! A permanent delivery failure unsubscribes the subscriber from the index
//! and removes the entry. Transient failures are logged, and the next
//! distinct state of the entry retries its delivery.
use crate::keys::{AssetKey, EntryKey, SubscriberId};
use crate::lease::Lease;
use crate::notifier::{AlertMessage, DeliveryError, Notifier};
use crate::render::Summary;
use crate::report::{Asset, Report};
use crate::store::{AggregationStore, LeaseManager, SubscriptionIndex};
use crate::tally::Contribution;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Maximum duration for which an entry's lease is held.
    /// It must exceed the worst-case time to merge and deliver.
    pub lease_hold: Duration,
    /// Maximum duration to wait for a contended lease.
    pub lease_wait: Duration,
}

impl EngineConfig {
    /// Portion of `lease_hold` reserved for recording a delivery and
    /// releasing the lease. Deliveries must complete before it begins.
    fn lease_margin(&self) -> Duration {
        self.lease_hold / 5
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_hold: Duration::from_secs(5),
            lease_wait: Duration::from_secs(3),
        }
    }
}

/// RecoveryEvent is published when the engine changes subscriptions in
/// response to a delivery failure, so that collaborators may persist it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// The subscriber's endpoint is gone, and it was removed from `assets`.
    Unsubscribed {
        subscriber: SubscriberId,
        assets: Vec<AssetKey>,
    },
    /// The subscriber's endpoint moved to a new identity.
    Migrated {
        from: SubscriberId,
        to: SubscriberId,
    },
}

/// Outcome of processing one damage for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Edited,
    /// The merged state was already delivered.
    Unchanged,
    /// The entry's lease could not be acquired in time.
    Contended,
    /// The store failed, and the damage was not (or may not have been) merged.
    StoreFailed,
    /// A transient failure prevented delivery of the merged state.
    DeliveryFailed,
    Unsubscribed,
    Migrated,
}

/// Tallied Outcomes of a dispatched report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub created: usize,
    pub edited: usize,
    pub unchanged: usize,
    pub contended: usize,
    pub failed: usize,
    pub unsubscribed: usize,
    pub migrated: usize,
}

impl DispatchStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Edited => self.edited += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Contended => self.contended += 1,
            Outcome::StoreFailed | Outcome::DeliveryFailed => self.failed += 1,
            Outcome::Unsubscribed => self.unsubscribed += 1,
            Outcome::Migrated => self.migrated += 1,
        }
    }
}

pub struct Engine<S, L, I, N> {
    store: S,
    leases: L,
    index: I,
    notifier: N,
    config: EngineConfig,
    recovery: Option<tokio::sync::mpsc::UnboundedSender<RecoveryEvent>>,
}

impl<S, L, I, N> Engine<S, L, I, N>
where
    S: AggregationStore,
    L: LeaseManager,
    I: SubscriptionIndex,
    N: Notifier,
{
    pub fn new(store: S, leases: L, index: I, notifier: N, config: EngineConfig) -> Self {
        Self {
            store,
            leases,
            index,
            notifier,
            config,
            recovery: None,
        }
    }

    /// Publish RecoveryEvents to `tx`.
    pub fn with_recovery_feed(
        mut self,
        tx: tokio::sync::mpsc::UnboundedSender<RecoveryEvent>,
    ) -> Self {
        self.recovery = Some(tx);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Dispatch all damages of `report` to their subscribers, returning once
    /// every unit of work has completed.
    pub async fn dispatch(self: &Arc<Self>, report: Arc<Report>) -> DispatchStats {
        let mut stats = DispatchStats::default();

        // Resolve contributions and their subscribers concurrently.
        let lookups = report
            .damages
            .iter()
            .enumerate()
            .filter_map(|(index, damage)| {
                let Some((asset, attacker)) = report.resolve(damage) else {
                    tracing::warn!(?damage, "skipping damage with unresolved references");
                    return None;
                };
                let contribution = Contribution::from_damage(&report, index, damage)?;

                tracing::info!(
                    asset = %asset.name,
                    attacker = %attacker.name,
                    resonators = damage.resonators,
                    mods = damage.mods,
                    links = damage.links.len(),
                    "damage on {} by {}",
                    asset.name,
                    attacker.name,
                );
                Some(async move {
                    let subscribers = self.index.subscribers_of(&asset.key).await;
                    (asset, contribution, subscribers)
                })
            });
        let lookups = futures::future::join_all(lookups).await;

        let mut units = tokio::task::JoinSet::new();

        for (asset, contribution, subscribers) in lookups {
            let subscribers = match subscribers {
                Ok(subscribers) => subscribers,
                Err(err) => {
                    tracing::warn!(asset = %asset.key, ?err, "failed to fetch subscribers of asset");
                    stats.failed += 1;
                    continue;
                }
            };
            let asset = Arc::new(asset.clone());
            let contribution = Arc::new(contribution);

            for subscriber in subscribers {
                let (engine, asset, contribution) =
                    (self.clone(), asset.clone(), contribution.clone());

                units.spawn(async move {
                    engine
                        .process_damage(&asset, &contribution, subscriber)
                        .await
                });
            }
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(outcome) => stats.record(outcome),
                Err(err) => {
                    tracing::error!(?err, "damage processing task failed");
                    stats.failed += 1;
                }
            }
        }
        tracing::debug!(?stats, "dispatched report");

        stats
    }

    /// Process one damage `contribution` on `asset` for `subscriber`.
    #[tracing::instrument(skip_all, fields(asset = %asset.key, %subscriber))]
    pub async fn process_damage(
        &self,
        asset: &Asset,
        contribution: &Contribution,
        subscriber: SubscriberId,
    ) -> Outcome {
        let key = EntryKey::new(asset.key, subscriber);

        let lease = match Lease::acquire(
            &self.leases,
            key.lease_key(),
            self.config.lease_hold,
            self.config.lease_wait,
        )
        .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::info!(entry = %key, "entry lease is contended (dropping damage)");
                return Outcome::Contended;
            }
            Err(err) => {
                tracing::warn!(entry = %key, ?err, "failed to acquire entry lease");
                return Outcome::StoreFailed;
            }
        };

        // Deliveries which outlive the lease would race a successor holder.
        let deadline = tokio::time::Instant::now() + self.config.lease_hold
            - self.config.lease_margin();

        let outcome = self
            .merge_and_deliver(&key, asset, contribution, deadline)
            .await;

        if let Err(err) = lease.release().await {
            tracing::warn!(entry = %key, ?err, "failed to release entry lease (it will expire)");
        }
        outcome
    }

    async fn merge_and_deliver(
        &self,
        key: &EntryKey,
        asset: &Asset,
        contribution: &Contribution,
        deadline: tokio::time::Instant,
    ) -> Outcome {
        let merged = match self.store.merge(key, contribution).await {
            Ok(merged) => merged,
            Err(err) => {
                tracing::warn!(entry = %key, ?err, "failed to merge damage (skipping delivery)");
                return Outcome::StoreFailed;
            }
        };

        let hash = merged.tally.state_hash();
        if merged.state_hash.as_ref() == Some(&hash) {
            tracing::debug!(entry = %key, %hash, "merged state is unchanged");
            return Outcome::Unchanged;
        }

        let message = AlertMessage::new(asset, Summary::from_tally(&merged.tally));
        let subscriber = &key.subscriber;

        let delivery = async {
            match &merged.handle {
                Some(handle) => self
                    .notifier
                    .edit(subscriber, handle, &message)
                    .await
                    .map(|()| (handle.clone(), Outcome::Edited)),
                None => self
                    .notifier
                    .create(subscriber, &message)
                    .await
                    .map(|handle| (handle, Outcome::Created)),
            }
        };
        let delivered = match tokio::time::timeout_at(deadline, delivery).await {
            Ok(delivered) => delivered,
            Err(_elapsed) => Err(DeliveryError::Transient(
                "delivery did not complete within the entry lease".to_string(),
            )),
        };

        match delivered {
            Ok((handle, outcome)) => {
                if let Err(err) = self.store.record_delivery(key, &hash, &handle).await {
                    tracing::warn!(entry = %key, %handle, ?err, "failed to record delivered alert");
                }
                outcome
            }
            Err(DeliveryError::Permanent(reason)) => self.unsubscribe(key, &reason).await,
            Err(DeliveryError::Migrated(to)) => self.migrate(key, to).await,
            Err(DeliveryError::Transient(reason)) => {
                tracing::warn!(
                    entry = %key,
                    %reason,
                    editing = merged.handle.is_some(),
                    "failed to deliver alert (will retry on next change)"
                );
                Outcome::DeliveryFailed
            }
        }
    }

    async fn unsubscribe(&self, key: &EntryKey, reason: &str) -> Outcome {
        let subscriber = &key.subscriber;

        let assets = match self.index.remove_subscriber(subscriber).await {
            Ok(assets) => assets,
            Err(err) => {
                tracing::error!(entry = %key, ?err, "failed to remove subscriber from index");
                // Fall back to removing only the failing subscription.
                match self.index.remove(&key.asset, subscriber).await {
                    Ok(true) => vec![key.asset],
                    Ok(false) => Vec::new(),
                    Err(err) => {
                        tracing::error!(entry = %key, ?err, "failed to remove subscription from index");
                        Vec::new()
                    }
                }
            }
        };
        if let Err(err) = self.store.remove(key).await {
            tracing::warn!(entry = %key, ?err, "failed to remove aggregation entry");
        }

        tracing::warn!(
            %subscriber,
            %reason,
            assets = assets.len(),
            "subscriber endpoint is gone, removed its subscriptions"
        );
        self.publish(RecoveryEvent::Unsubscribed {
            subscriber: subscriber.clone(),
            assets,
        });

        Outcome::Unsubscribed
    }

    async fn migrate(&self, key: &EntryKey, to: SubscriberId) -> Outcome {
        let from = &key.subscriber;

        match self.index.migrate(from, &to).await {
            Ok(moved) => tracing::info!(%from, %to, moved, "subscriber endpoint migrated"),
            Err(err) => {
                tracing::error!(%from, %to, ?err, "failed to migrate subscriber in index")
            }
        }
        // The entry's handle refers to a message of the former endpoint.
        if let Err(err) = self.store.remove(key).await {
            tracing::warn!(entry = %key, ?err, "failed to remove aggregation entry");
        }
        self.publish(RecoveryEvent::Migrated {
            from: from.clone(),
            to,
        });

        Outcome::Migrated
    }

    fn publish(&self, event: RecoveryEvent) {
        if let Some(tx) = &self.recovery {
            if tx.send(event).is_err() {
                tracing::warn!("recovery feed is closed, dropping recovery event");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notifier::MessageHandle;
    use crate::store::memory::{MemoryAggregationStore, MemoryIndex, MemoryLeases};

    /// Notifier whose subscribers are all gone.
    struct Gone;

    impl Notifier for Gone {
        async fn create<'s>(
            &'s self,
            _subscriber: &'s SubscriberId,
            _message: &'s AlertMessage,
        ) -> Result<MessageHandle, DeliveryError> {
            Err(DeliveryError::Permanent("bot was blocked by the user".to_string()))
        }

        async fn edit<'s>(
            &'s self,
            _subscriber: &'s SubscriberId,
            _handle: &'s MessageHandle,
            _message: &'s AlertMessage,
        ) -> Result<(), DeliveryError> {
            Err(DeliveryError::Permanent("bot was blocked by the user".to_string()))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unsubscription_is_logged() {
        let report = Arc::new(crate::report::test::fixture());
        let asset = report.assets["p1"].key;

        let engine = Arc::new(Engine::new(
            MemoryAggregationStore::new(Duration::from_secs(60)),
            MemoryLeases::default(),
            MemoryIndex::default(),
            Gone,
            EngineConfig::default(),
        ));
        engine.index().add(&asset, &"chat".into()).await.unwrap();

        let stats = engine.dispatch(report).await;
        assert_eq!(stats.unsubscribed, 1);

        assert!(logs_contain("damage on Tour Eiffel by raider"));
        assert!(logs_contain("subscriber endpoint is gone"));
        assert!(logs_contain("bot was blocked by the user"));
        assert!(engine.index().subscribers_of(&asset).await.unwrap().is_empty());
    }
}
