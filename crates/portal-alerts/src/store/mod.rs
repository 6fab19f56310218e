//! Shared state of the alerting engine.
//!
//! Three stores are shared by every engine instance:
//!
//! - An `AggregationStore` owns the running Tally of each (asset, subscriber)
//!   entry, along with the hash and handle of its last delivered notification.
//!   Its `merge` is the correctness boundary for concurrent reports: it must
//!   read, merge, and write an entry as one indivisible step with respect to
//!   all writers of that entry, from any process.
//! - A `LeaseManager` grants time-bounded exclusive leases, which serialize
//!   the create-or-edit side effect that follows a merge.
//! - A `SubscriptionIndex` maps assets to their subscribers, keyed by
//!   coordinates so that assets without a persisted record may be watched.
//!
//! A `Persistence` layer is the relational source of truth for assets and
//! subscriptions. The engine never reads or writes it: it is consumed only
//! to resync the index and to apply collaborator mutations.
//!
//! `memory` implementations serve tests and single-process use, and
//! `postgres` implementations are shared across processes.
use crate::keys::{AssetKey, EntryKey, SubscriberId};
use crate::notifier::MessageHandle;
use crate::report::Report;
use crate::tally::{Contribution, StateHash, Tally};
use std::collections::BTreeSet;
use std::future::Future;

pub mod memory;
pub mod postgres;

/// Merged is the state of an entry immediately after a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub tally: Tally,
    /// Hash of the last delivered state, if any was delivered this window.
    pub state_hash: Option<StateHash>,
    /// Handle of the notification delivered this window, if any.
    pub handle: Option<MessageHandle>,
}

pub trait AggregationStore: Send + Sync + 'static {
    /// Atomically merge `contribution` into the entry at `key`, creating or
    /// rolling over the entry as required, and return its merged state.
    fn merge<'s>(
        &'s self,
        key: &'s EntryKey,
        contribution: &'s Contribution,
    ) -> impl Future<Output = anyhow::Result<Merged>> + Send + 's;

    /// Record that the state identified by `hash` was delivered as `handle`.
    fn record_delivery<'s>(
        &'s self,
        key: &'s EntryKey,
        hash: &'s StateHash,
        handle: &'s MessageHandle,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 's;

    /// Remove the entry at `key`. Removing an absent entry is a no-op.
    fn remove<'s>(&'s self, key: &'s EntryKey)
        -> impl Future<Output = anyhow::Result<()>> + Send + 's;

    /// Remove entries whose aggregation window has lapsed, returning their count.
    fn sweep(&self) -> impl Future<Output = anyhow::Result<usize>> + Send + '_;
}

/// LeaseToken proves ownership of a lease and is required to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseToken(pub uuid::Uuid);

pub trait LeaseManager: Clone + Send + Sync + 'static {
    /// Attempt to acquire the lease named by `key` for at most `hold`.
    /// Returns None if the lease is currently held by another owner.
    fn try_acquire<'s>(
        &'s self,
        key: &'s str,
        hold: std::time::Duration,
    ) -> impl Future<Output = anyhow::Result<Option<LeaseToken>>> + Send + 's;

    /// Release the lease named by `key`, if it's still held under `token`.
    /// Returns false if the lease had already expired or been re-acquired.
    fn release<'s>(
        &'s self,
        key: &'s str,
        token: LeaseToken,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send + 's;
}

/// Snapshot of the complete set of subscriptions, by asset.
pub type Subscriptions = Vec<(AssetKey, Vec<SubscriberId>)>;

/// Counts of a SubscriptionIndex's contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub subscriptions: usize,
    pub assets: usize,
}

pub trait SubscriptionIndex: Send + Sync + 'static {
    fn subscribers_of<'s>(
        &'s self,
        asset: &'s AssetKey,
    ) -> impl Future<Output = anyhow::Result<BTreeSet<SubscriberId>>> + Send + 's;

    /// Add a subscription, returning false if it already existed.
    fn add<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send + 's;

    /// Remove a subscription, returning false if it didn't exist.
    fn remove<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send + 's;

    /// Remove every subscription of `subscriber`, returning the affected assets.
    fn remove_subscriber<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<Vec<AssetKey>>> + Send + 's;

    /// Move every subscription of `from` to `to`, returning the moved count.
    fn migrate<'s>(
        &'s self,
        from: &'s SubscriberId,
        to: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 's;

    /// Atomically replace the entire index content with `snapshot`.
    fn replace_all(
        &self,
        snapshot: Subscriptions,
    ) -> impl Future<Output = anyhow::Result<IndexStats>> + Send + '_;
}

/// Resync `index` from the authoritative subscriptions of `persistence`.
pub async fn resync<I: SubscriptionIndex, P: Persistence>(
    index: &I,
    persistence: &P,
) -> anyhow::Result<IndexStats> {
    let snapshot = persistence.all_subscriptions().await?;
    let stats = index.replace_all(snapshot).await?;

    tracing::info!(
        subscriptions = stats.subscriptions,
        assets = stats.assets,
        "loaded subscriptions"
    );
    Ok(stats)
}

/// Persistence is the relational store of assets and subscriptions.
pub trait Persistence: Send + Sync + 'static {
    fn all_subscriptions(&self) -> impl Future<Output = anyhow::Result<Subscriptions>> + Send + '_;

    /// Upsert all assets of `report`, keyed on their name and address.
    fn upsert_assets<'s>(
        &'s self,
        report: &'s Report,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 's;

    /// Subscribe to the persisted asset at `asset`.
    /// Returns false if no such asset is known.
    fn subscribe<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send + 's;

    fn unsubscribe<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send + 's;

    /// Remove all subscriptions of `subscriber`, returning their count.
    fn unsubscribe_all<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 's;

    /// Move all subscriptions of `from` to `to`, returning their count.
    fn migrate<'s>(
        &'s self,
        from: &'s SubscriberId,
        to: &'s SubscriberId,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 's;
}
