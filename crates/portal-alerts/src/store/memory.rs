use super::{
    AggregationStore, IndexStats, LeaseManager, LeaseToken, Merged, Persistence,
    SubscriptionIndex, Subscriptions,
};
use crate::keys::{AssetKey, EntryKey, SubscriberId};
use crate::notifier::MessageHandle;
use crate::report::Report;
use crate::tally::{AggregationEntry, Contribution, StateHash};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// In-process AggregationStore. Merges are atomic under a single mutex.
#[derive(Debug, Clone)]
pub struct MemoryAggregationStore {
    entries: Arc<Mutex<HashMap<EntryKey, AggregationEntry>>>,
    window: Duration,
}

impl MemoryAggregationStore {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Default::default(),
            window,
        }
    }

    /// Current entry at `key`, if any.
    pub fn entry(&self, key: &EntryKey) -> Option<AggregationEntry> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl AggregationStore for MemoryAggregationStore {
    async fn merge<'s>(
        &'s self,
        key: &'s EntryKey,
        contribution: &'s Contribution,
    ) -> anyhow::Result<Merged> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| AggregationEntry::new(now));
        entry.merge(contribution, now, self.window);

        Ok(Merged {
            tally: entry.tally.clone(),
            state_hash: entry.state_hash.clone(),
            handle: entry.handle.clone(),
        })
    }

    async fn record_delivery<'s>(
        &'s self,
        key: &'s EntryKey,
        hash: &'s StateHash,
        handle: &'s MessageHandle,
    ) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(key) {
            entry.state_hash = Some(hash.clone());
            entry.handle = Some(handle.clone());
        }
        Ok(())
    }

    async fn remove<'s>(&'s self, key: &'s EntryKey) -> anyhow::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn sweep(&self) -> anyhow::Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        let before = entries.len();
        entries.retain(|_key, entry| !entry.is_idle(now, self.window));
        Ok(before - entries.len())
    }
}

/// In-process LeaseManager.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeases {
    leases: Arc<Mutex<HashMap<String, (LeaseToken, Instant)>>>,
}

impl MemoryLeases {
    pub fn is_held(&self, key: &str) -> bool {
        let leases = self.leases.lock().unwrap();
        matches!(leases.get(key), Some((_, expires)) if *expires > Instant::now())
    }
}

impl LeaseManager for MemoryLeases {
    async fn try_acquire<'s>(
        &'s self,
        key: &'s str,
        hold: Duration,
    ) -> anyhow::Result<Option<LeaseToken>> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap();

        match leases.get(key) {
            Some((_, expires)) if *expires > now => Ok(None),
            _ => {
                let token = LeaseToken(uuid::Uuid::new_v4());
                leases.insert(key.to_string(), (token, now + hold));
                Ok(Some(token))
            }
        }
    }

    async fn release<'s>(&'s self, key: &'s str, token: LeaseToken) -> anyhow::Result<bool> {
        let mut leases = self.leases.lock().unwrap();

        match leases.get(key) {
            Some((held, expires)) if *held == token => {
                let live = *expires > Instant::now();
                leases.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }
}

/// In-process SubscriptionIndex.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    subscriptions: Arc<Mutex<BTreeMap<AssetKey, BTreeSet<SubscriberId>>>>,
}

impl SubscriptionIndex for MemoryIndex {
    async fn subscribers_of<'s>(
        &'s self,
        asset: &'s AssetKey,
    ) -> anyhow::Result<BTreeSet<SubscriberId>> {
        let subscriptions = self.subscriptions.lock().unwrap();
        Ok(subscriptions.get(asset).cloned().unwrap_or_default())
    }

    async fn add<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> anyhow::Result<bool> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        Ok(subscriptions
            .entry(*asset)
            .or_default()
            .insert(subscriber.clone()))
    }

    async fn remove<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> anyhow::Result<bool> {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let Some(subscribers) = subscriptions.get_mut(asset) else {
            return Ok(false);
        };
        let removed = subscribers.remove(subscriber);

        if subscribers.is_empty() {
            subscriptions.remove(asset);
        }
        Ok(removed)
    }

    async fn remove_subscriber<'s>(
        &'s self,
        subscriber: &'s SubscriberId,
    ) -> anyhow::Result<Vec<AssetKey>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let mut assets = Vec::new();
        subscriptions.retain(|asset, subscribers| {
            if subscribers.remove(subscriber) {
                assets.push(*asset);
            }
            !subscribers.is_empty()
        });
        Ok(assets)
    }

    async fn migrate<'s>(
        &'s self,
        from: &'s SubscriberId,
        to: &'s SubscriberId,
    ) -> anyhow::Result<usize> {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let mut moved = 0;
        for subscribers in subscriptions.values_mut() {
            if subscribers.remove(from) {
                subscribers.insert(to.clone());
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn replace_all(&self, snapshot: Subscriptions) -> anyhow::Result<IndexStats> {
        let mut replaced: BTreeMap<AssetKey, BTreeSet<SubscriberId>> = BTreeMap::new();
        for (asset, subscribers) in snapshot {
            replaced.entry(asset).or_default().extend(subscribers);
        }
        replaced.retain(|_asset, subscribers| !subscribers.is_empty());

        let stats = IndexStats {
            subscriptions: replaced.values().map(BTreeSet::len).sum(),
            assets: replaced.len(),
        };
        *self.subscriptions.lock().unwrap() = replaced;

        Ok(stats)
    }
}

/// In-process Persistence of assets and their subscriptions.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<Mutex<PersistenceInner>>,
}

#[derive(Debug, Default)]
struct PersistenceInner {
    // Assets keyed on (name, address), and their last-seen location.
    assets: BTreeMap<(String, String), AssetKey>,
    subscriptions: BTreeMap<AssetKey, BTreeSet<SubscriberId>>,
}

impl MemoryPersistence {
    pub fn asset_count(&self) -> usize {
        self.inner.lock().unwrap().assets.len()
    }
}

impl Persistence for MemoryPersistence {
    async fn all_subscriptions(&self) -> anyhow::Result<Subscriptions> {
        let inner = self.inner.lock().unwrap();

        Ok(inner
            .subscriptions
            .iter()
            .filter(|(_, subscribers)| !subscribers.is_empty())
            .map(|(asset, subscribers)| (*asset, subscribers.iter().cloned().collect()))
            .collect())
    }

    async fn upsert_assets<'s>(&'s self, report: &'s Report) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        for asset in report.assets.values() {
            inner
                .assets
                .insert((asset.name.clone(), asset.address.clone()), asset.key);
        }
        Ok(report.assets.len())
    }

    async fn subscribe<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.assets.values().any(|known| known == asset) {
            return Ok(false);
        }
        inner
            .subscriptions
            .entry(*asset)
            .or_default()
            .insert(subscriber.clone());
        Ok(true)
    }

    async fn unsubscribe<'s>(
        &'s self,
        asset: &'s AssetKey,
        subscriber: &'s SubscriberId,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();

        Ok(inner
            .subscriptions
            .get_mut(asset)
            .is_some_and(|subscribers| subscribers.remove(subscriber)))
    }

    async fn unsubscribe_all<'s>(&'s self, subscriber: &'s SubscriberId) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        Ok(inner
            .subscriptions
            .values_mut()
            .filter_map(|subscribers| subscribers.remove(subscriber).then_some(()))
            .count())
    }

    async fn migrate<'s>(
        &'s self,
        from: &'s SubscriberId,
        to: &'s SubscriberId,
    ) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        let mut moved = 0;
        for subscribers in inner.subscriptions.values_mut() {
            if subscribers.remove(from) {
                subscribers.insert(to.clone());
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sub(id: &str) -> SubscriberId {
        SubscriberId::new(id)
    }

    #[tokio::test]
    async fn test_index_mutations_are_idempotent() {
        let index = MemoryIndex::default();
        let (a, b) = (AssetKey::new(1, 1), AssetKey::new(2, 2));

        assert!(index.add(&a, &sub("x")).await.unwrap());
        assert!(!index.add(&a, &sub("x")).await.unwrap());
        assert!(index.add(&a, &sub("y")).await.unwrap());
        assert!(index.add(&b, &sub("y")).await.unwrap());

        assert!(!index.remove(&a, &sub("z")).await.unwrap());
        assert!(!index.remove(&AssetKey::new(9, 9), &sub("x")).await.unwrap());
        assert!(index.remove(&a, &sub("x")).await.unwrap());
        assert!(!index.remove(&a, &sub("x")).await.unwrap());

        assert_eq!(
            index.subscribers_of(&a).await.unwrap(),
            [sub("y")].into_iter().collect()
        );

        assert_eq!(index.migrate(&sub("y"), &sub("w")).await.unwrap(), 2);
        assert_eq!(index.migrate(&sub("y"), &sub("w")).await.unwrap(), 0);
        assert_eq!(index.remove_subscriber(&sub("w")).await.unwrap(), vec![a, b]);
        assert!(index.subscribers_of(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_replace_all() {
        let index = MemoryIndex::default();
        let (a, b) = (AssetKey::new(1, 1), AssetKey::new(2, 2));
        index.add(&a, &sub("stale")).await.unwrap();

        let stats = index
            .replace_all(vec![
                (b, vec![sub("x"), sub("y")]),
                (AssetKey::new(3, 3), vec![]),
            ])
            .await
            .unwrap();

        assert_eq!(
            stats,
            IndexStats {
                subscriptions: 2,
                assets: 1
            }
        );
        assert!(index.subscribers_of(&a).await.unwrap().is_empty());
        assert_eq!(index.subscribers_of(&b).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_leases_exclude_until_released_or_expired() {
        let leases = MemoryLeases::default();
        let hold = Duration::from_secs(30);

        let token = leases.try_acquire("k", hold).await.unwrap().unwrap();
        assert!(leases.try_acquire("k", hold).await.unwrap().is_none());
        assert!(leases.try_acquire("other", hold).await.unwrap().is_some());

        // A foreign token cannot release the lease.
        let foreign = LeaseToken(uuid::Uuid::new_v4());
        assert!(!leases.release("k", foreign).await.unwrap());
        assert!(leases.is_held("k"));

        assert!(leases.release("k", token).await.unwrap());
        assert!(!leases.release("k", token).await.unwrap());

        // Leases self-expire after their hold.
        let short = leases
            .try_acquire("k", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(short.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!leases.is_held("k"));
        assert!(leases.try_acquire("k", hold).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_aggregation_merge_and_sweep() {
        let store = MemoryAggregationStore::new(Duration::from_millis(50));
        let key = EntryKey::new(AssetKey::new(1, 1), sub("x"));
        let contribution = Contribution {
            fingerprint: "f1".to_string(),
            attacker: "raider".to_string(),
            resonators: 2,
            mods: 1,
            links: 0,
            neutralized: false,
        };

        let merged = store.merge(&key, &contribution).await.unwrap();
        assert_eq!(merged.tally.resonators, 2);
        assert_eq!(merged.handle, None);

        let hash = merged.tally.state_hash();
        store
            .record_delivery(&key, &hash, &MessageHandle::new("7"))
            .await
            .unwrap();

        let merged = store.merge(&key, &contribution).await.unwrap();
        assert_eq!(merged.tally.resonators, 2);
        assert_eq!(merged.state_hash, Some(hash));
        assert_eq!(merged.handle, Some(MessageHandle::new("7")));

        assert_eq!(store.sweep().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.sweep().await.unwrap(), 1);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_persistence_subscriptions() {
        let persistence = MemoryPersistence::default();
        let report = crate::report::test::fixture();
        let eiffel = report.assets["p1"].key;

        // Unknown assets cannot be subscribed.
        assert!(!persistence.subscribe(&eiffel, &sub("x")).await.unwrap());

        assert_eq!(persistence.upsert_assets(&report).await.unwrap(), 2);
        assert_eq!(persistence.upsert_assets(&report).await.unwrap(), 2);
        assert_eq!(persistence.asset_count(), 2);

        assert!(persistence.subscribe(&eiffel, &sub("x")).await.unwrap());
        assert!(persistence.subscribe(&eiffel, &sub("y")).await.unwrap());
        assert_eq!(persistence.migrate(&sub("y"), &sub("z")).await.unwrap(), 1);
        assert!(persistence.unsubscribe(&eiffel, &sub("x")).await.unwrap());
        assert!(!persistence.unsubscribe(&eiffel, &sub("x")).await.unwrap());

        assert_eq!(
            persistence.all_subscriptions().await.unwrap(),
            vec![(eiffel, vec![sub("z")])]
        );
        assert_eq!(persistence.unsubscribe_all(&sub("z")).await.unwrap(), 1);
        assert!(persistence.all_subscriptions().await.unwrap().is_empty());
    }
}
