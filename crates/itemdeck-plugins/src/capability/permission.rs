//! Permission manager
//!
//! Tracks the state of every (plugin, capability) pair and persists the
//! decisions in the grants store. Only capabilities declared by a plugin's
//! current manifest are ever reported as usable.

use super::{Capability, CapabilityAccess, Tier};
use crate::clock::{Clock, SystemClock};
use crate::error::{PluginError, PluginResult};
use crate::storage::{IndexValue, KvStore, StoredRecord, Table, index};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// State of one (plugin, capability) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    NotRequested,
    PendingConsent,
    Granted,
    Denied,
    /// Imposed by the capability matrix, terminal
    Blocked,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequested => "not-requested",
            Self::PendingConsent => "pending-consent",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub plugin_id: String,
    pub capability: Capability,
    pub state: PermissionState,
    /// Tier the decision was made under
    pub tier: Tier,
    pub updated_at: DateTime<Utc>,
}

/// Capabilities of one plugin grouped by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSnapshot {
    pub plugin_id: String,
    pub granted: BTreeSet<Capability>,
    pub pending_consent: BTreeSet<Capability>,
    pub denied: BTreeSet<Capability>,
    pub blocked: BTreeSet<Capability>,
}

/// Asks the user whether a capability may be granted
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn confirm(&self, plugin_id: &str, capability: Capability) -> bool;
}

/// Prompt that always gives the same answer
#[derive(Debug, Clone, Copy)]
pub struct FixedConsent(pub bool);

#[async_trait]
impl ConsentPrompt for FixedConsent {
    async fn confirm(&self, _plugin_id: &str, _capability: Capability) -> bool {
        self.0
    }
}

#[derive(Debug, Clone)]
struct PluginProfile {
    tier: Tier,
    declared: BTreeSet<Capability>,
}

fn grant_key(plugin_id: &str, capability: Capability) -> String {
    format!("{}::{}", plugin_id, capability)
}

/// Grants, revokes and persists per-plugin capability decisions
pub struct PermissionManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    profiles: RwLock<HashMap<String, PluginProfile>>,
}

impl PermissionManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Register or re-register a plugin with its current tier and declared
    /// capabilities.
    ///
    /// Persisted grants for capabilities no longer declared are dropped.
    /// Declared capabilities without a decision for this tier are evaluated
    /// against the matrix: allowed ones are granted, consent ones become
    /// pending, blocked ones are blocked.
    pub async fn sync_plugin(
        &self,
        plugin_id: &str,
        tier: Tier,
        declared: &BTreeSet<Capability>,
    ) -> PluginResult<PermissionSnapshot> {
        self.profiles.write().await.insert(
            plugin_id.to_string(),
            PluginProfile {
                tier,
                declared: declared.clone(),
            },
        );

        let mut existing: HashMap<Capability, PermissionRecord> = HashMap::new();
        for record in self.load_records(plugin_id).await? {
            if declared.contains(&record.capability) && record.tier == tier {
                existing.insert(record.capability, record);
            } else {
                tracing::debug!(
                    plugin_id = %plugin_id,
                    capability = %record.capability,
                    "Dropping stale capability decision"
                );
                self.store
                    .delete(Table::Grants, &grant_key(plugin_id, record.capability))
                    .await?;
            }
        }

        for &capability in declared {
            let decided = existing.get(&capability).map(|r| r.state);
            let state = match (capability.access_for(tier), decided) {
                (CapabilityAccess::Blocked, _) => PermissionState::Blocked,
                (_, Some(state)) if state != PermissionState::Blocked => continue,
                (CapabilityAccess::Allowed, _) => PermissionState::Granted,
                (CapabilityAccess::Consent, _) => PermissionState::PendingConsent,
            };
            if decided != Some(state) {
                self.persist(plugin_id, capability, state, tier).await?;
            }
        }

        self.snapshot(plugin_id).await
    }

    /// Effective state used for runtime checks.
    ///
    /// Undeclared capabilities and pairs without a decision read as denied.
    pub async fn query(&self, plugin_id: &str, capability: Capability) -> PluginResult<PermissionState> {
        if !self.is_declared(plugin_id, capability).await {
            return Ok(PermissionState::Denied);
        }
        Ok(match self.state(plugin_id, capability).await? {
            PermissionState::NotRequested => PermissionState::Denied,
            state => state,
        })
    }

    /// Raw persisted state
    pub async fn state(&self, plugin_id: &str, capability: Capability) -> PluginResult<PermissionState> {
        Ok(self
            .load_record(plugin_id, capability)
            .await?
            .map(|record| record.state)
            .unwrap_or(PermissionState::NotRequested))
    }

    /// Ask for a capability, prompting the user when the matrix requires
    /// consent and no decision exists yet
    pub async fn request(
        &self,
        plugin_id: &str,
        capability: Capability,
        prompt: &dyn ConsentPrompt,
    ) -> PluginResult<PermissionState> {
        let Some(profile) = self.profile(plugin_id).await else {
            return Ok(PermissionState::Denied);
        };
        if !profile.declared.contains(&capability) {
            return Ok(PermissionState::Denied);
        }

        match self.state(plugin_id, capability).await? {
            PermissionState::NotRequested => {}
            PermissionState::PendingConsent => {
                return self.prompt(plugin_id, capability, profile.tier, prompt).await;
            }
            settled => return Ok(settled),
        }

        let state = match capability.access_for(profile.tier) {
            CapabilityAccess::Allowed => PermissionState::Granted,
            CapabilityAccess::Blocked => PermissionState::Blocked,
            CapabilityAccess::Consent => {
                self.persist(plugin_id, capability, PermissionState::PendingConsent, profile.tier)
                    .await?;
                return self.prompt(plugin_id, capability, profile.tier, prompt).await;
            }
        };
        self.persist(plugin_id, capability, state, profile.tier).await?;
        Ok(state)
    }

    async fn prompt(
        &self,
        plugin_id: &str,
        capability: Capability,
        tier: Tier,
        prompt: &dyn ConsentPrompt,
    ) -> PluginResult<PermissionState> {
        tracing::debug!(plugin_id = %plugin_id, capability = %capability, "Awaiting consent");
        let state = if prompt.confirm(plugin_id, capability).await {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        self.persist(plugin_id, capability, state, tier).await?;
        Ok(state)
    }

    /// Explicit user grant. Re-runs the matrix check, so a blocked
    /// capability can never become granted.
    pub async fn grant(&self, plugin_id: &str, capability: Capability) -> PluginResult<PermissionState> {
        let profile = self
            .profile(plugin_id)
            .await
            .filter(|p| p.declared.contains(&capability))
            .ok_or_else(|| PluginError::capability_denied(plugin_id, capability))?;

        if capability.access_for(profile.tier) == CapabilityAccess::Blocked {
            self.persist(plugin_id, capability, PermissionState::Blocked, profile.tier)
                .await?;
            tracing::warn!(
                plugin_id = %plugin_id,
                capability = %capability,
                tier = %profile.tier,
                "Refused to grant blocked capability"
            );
            return Err(PluginError::capability_denied(plugin_id, capability));
        }

        self.persist(plugin_id, capability, PermissionState::Granted, profile.tier)
            .await?;
        tracing::info!(plugin_id = %plugin_id, capability = %capability, "Capability granted");
        Ok(PermissionState::Granted)
    }

    /// Explicit user denial; blocked stays blocked. Nothing is recorded for
    /// an unknown plugin or an undeclared capability.
    pub async fn deny(&self, plugin_id: &str, capability: Capability) -> PluginResult<PermissionState> {
        let Some(profile) = self.profile(plugin_id).await else {
            return Ok(PermissionState::Denied);
        };
        if !profile.declared.contains(&capability) {
            return Ok(PermissionState::Denied);
        }

        let current = self.state(plugin_id, capability).await?;
        if current == PermissionState::Blocked {
            return Ok(current);
        }
        self.persist(plugin_id, capability, PermissionState::Denied, profile.tier)
            .await?;
        Ok(PermissionState::Denied)
    }

    /// Return a granted pair to not-requested. Returns false when the pair
    /// was not granted.
    pub async fn revoke(&self, plugin_id: &str, capability: Capability) -> PluginResult<bool> {
        if self.state(plugin_id, capability).await? != PermissionState::Granted {
            return Ok(false);
        }
        self.store
            .delete(Table::Grants, &grant_key(plugin_id, capability))
            .await?;
        tracing::info!(plugin_id = %plugin_id, capability = %capability, "Capability revoked");
        Ok(true)
    }

    /// Runtime gate for capability-dependent features
    pub async fn require(&self, plugin_id: &str, capability: Capability) -> PluginResult<()> {
        match self.query(plugin_id, capability).await? {
            PermissionState::Granted => Ok(()),
            _ => Err(PluginError::capability_denied(plugin_id, capability)),
        }
    }

    pub async fn snapshot(&self, plugin_id: &str) -> PluginResult<PermissionSnapshot> {
        let mut snapshot = PermissionSnapshot {
            plugin_id: plugin_id.to_string(),
            ..Default::default()
        };
        let declared = self
            .profile(plugin_id)
            .await
            .map(|p| p.declared)
            .unwrap_or_default();

        for capability in declared {
            match self.query(plugin_id, capability).await? {
                PermissionState::Granted => snapshot.granted.insert(capability),
                PermissionState::PendingConsent => snapshot.pending_consent.insert(capability),
                PermissionState::Blocked => snapshot.blocked.insert(capability),
                PermissionState::Denied | PermissionState::NotRequested => {
                    snapshot.denied.insert(capability)
                }
            };
        }
        Ok(snapshot)
    }

    /// Every persisted decision for a plugin
    pub async fn records(&self, plugin_id: &str) -> PluginResult<Vec<PermissionRecord>> {
        self.load_records(plugin_id).await
    }

    /// Drop all decisions for an uninstalled plugin
    pub async fn forget_plugin(&self, plugin_id: &str) -> PluginResult<u64> {
        self.profiles.write().await.remove(plugin_id);
        let records = self
            .store
            .list_by_index(Table::Grants, index::PLUGIN_ID, &IndexValue::from(plugin_id))
            .await?;
        let mut removed = 0;
        for record in records {
            if self.store.delete(Table::Grants, &record.key).await? {
                removed += 1;
            }
        }
        tracing::debug!(plugin_id = %plugin_id, count = removed, "Forgot capability decisions");
        Ok(removed)
    }

    async fn profile(&self, plugin_id: &str) -> Option<PluginProfile> {
        self.profiles.read().await.get(plugin_id).cloned()
    }

    async fn is_declared(&self, plugin_id: &str, capability: Capability) -> bool {
        self.profiles
            .read()
            .await
            .get(plugin_id)
            .is_some_and(|p| p.declared.contains(&capability))
    }

    async fn persist(
        &self,
        plugin_id: &str,
        capability: Capability,
        state: PermissionState,
        tier: Tier,
    ) -> PluginResult<()> {
        let record = PermissionRecord {
            plugin_id: plugin_id.to_string(),
            capability,
            state,
            tier,
            updated_at: self.clock.now(),
        };
        let stored = StoredRecord::new(grant_key(plugin_id, capability), serde_json::to_vec(&record)?)
            .with_index(index::PLUGIN_ID, plugin_id);
        self.store.put(Table::Grants, stored).await
    }

    async fn load_record(
        &self,
        plugin_id: &str,
        capability: Capability,
    ) -> PluginResult<Option<PermissionRecord>> {
        let key = grant_key(plugin_id, capability);
        match self.store.get(Table::Grants, &key).await? {
            Some(stored) => self.decode(stored).await,
            None => Ok(None),
        }
    }

    async fn load_records(&self, plugin_id: &str) -> PluginResult<Vec<PermissionRecord>> {
        let stored = self
            .store
            .list_by_index(Table::Grants, index::PLUGIN_ID, &IndexValue::from(plugin_id))
            .await?;
        let mut records = Vec::with_capacity(stored.len());
        for record in stored {
            records.extend(self.decode(record).await?);
        }
        Ok(records)
    }

    /// Corrupt records are dropped and read as missing
    async fn decode(&self, stored: StoredRecord) -> PluginResult<Option<PermissionRecord>> {
        match serde_json::from_slice::<PermissionRecord>(&stored.payload) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(key = %stored.key, error = %err, "Discarding corrupt capability record");
                self.store.delete(Table::Grants, &stored.key).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> PermissionManager {
        PermissionManager::new(Arc::new(MemoryStore::new()))
    }

    fn caps(list: &[Capability]) -> BTreeSet<Capability> {
        list.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_builtin_storage_local_auto_granted() {
        let pm = manager();
        let snapshot = pm
            .sync_plugin("org.itemdeck.theme-retro", Tier::Builtin, &caps(&[Capability::StorageLocal]))
            .await
            .unwrap();

        assert!(snapshot.granted.contains(&Capability::StorageLocal));
        assert_eq!(
            pm.query("org.itemdeck.theme-retro", Capability::StorageLocal).await.unwrap(),
            PermissionState::Granted
        );
    }

    #[tokio::test]
    async fn test_undeclared_capability_is_denied() {
        let pm = manager();
        pm.sync_plugin("org.example.theme", Tier::Builtin, &caps(&[Capability::StorageLocal]))
            .await
            .unwrap();

        assert_eq!(
            pm.query("org.example.theme", Capability::FetchExternal).await.unwrap(),
            PermissionState::Denied
        );
        assert!(pm.grant("org.example.theme", Capability::FetchExternal).await.is_err());
        assert_eq!(
            pm.query("org.unknown.plugin", Capability::StorageLocal).await.unwrap(),
            PermissionState::Denied
        );
    }

    #[tokio::test]
    async fn test_deny_records_nothing_for_unknown_pairs() {
        let pm = manager();
        assert_eq!(
            pm.deny("org.unknown.plugin", Capability::StorageLocal).await.unwrap(),
            PermissionState::Denied
        );
        assert!(pm.records("org.unknown.plugin").await.unwrap().is_empty());

        pm.sync_plugin("org.example.quiet", Tier::Community, &caps(&[Capability::UiOverlay]))
            .await
            .unwrap();
        let before = pm.records("org.example.quiet").await.unwrap().len();
        assert_eq!(
            pm.deny("org.example.quiet", Capability::FetchExternal).await.unwrap(),
            PermissionState::Denied
        );
        assert_eq!(pm.records("org.example.quiet").await.unwrap().len(), before);

        assert_eq!(
            pm.deny("org.example.quiet", Capability::UiOverlay).await.unwrap(),
            PermissionState::Denied
        );
        assert_eq!(
            pm.query("org.example.quiet", Capability::UiOverlay).await.unwrap(),
            PermissionState::Denied
        );
    }

    #[tokio::test]
    async fn test_consent_capability_starts_pending() {
        let pm = manager();
        let snapshot = pm
            .sync_plugin("org.example.overlay", Tier::Community, &caps(&[Capability::UiOverlay]))
            .await
            .unwrap();
        assert!(snapshot.pending_consent.contains(&Capability::UiOverlay));

        let state = pm
            .request("org.example.overlay", Capability::UiOverlay, &FixedConsent(true))
            .await
            .unwrap();
        assert_eq!(state, PermissionState::Granted);
        assert!(pm.require("org.example.overlay", Capability::UiOverlay).await.is_ok());
    }

    #[tokio::test]
    async fn test_consent_refused_is_denied() {
        let pm = manager();
        pm.sync_plugin("org.example.sync", Tier::Community, &caps(&[Capability::StorageSync]))
            .await
            .unwrap();

        let state = pm
            .request("org.example.sync", Capability::StorageSync, &FixedConsent(false))
            .await
            .unwrap();
        assert_eq!(state, PermissionState::Denied);
        assert!(matches!(
            pm.require("org.example.sync", Capability::StorageSync).await,
            Err(PluginError::CapabilityDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_revoke_then_query_is_denied() {
        let pm = manager();
        pm.sync_plugin("org.example.theme", Tier::Official, &caps(&[Capability::UiModal]))
            .await
            .unwrap();
        assert_eq!(
            pm.query("org.example.theme", Capability::UiModal).await.unwrap(),
            PermissionState::Granted
        );

        assert!(pm.revoke("org.example.theme", Capability::UiModal).await.unwrap());
        assert_eq!(
            pm.state("org.example.theme", Capability::UiModal).await.unwrap(),
            PermissionState::NotRequested
        );
        assert_eq!(
            pm.query("org.example.theme", Capability::UiModal).await.unwrap(),
            PermissionState::Denied
        );
        assert!(!pm.revoke("org.example.theme", Capability::UiModal).await.unwrap());

        assert_eq!(
            pm.grant("org.example.theme", Capability::UiModal).await.unwrap(),
            PermissionState::Granted
        );
    }

    #[tokio::test]
    async fn test_blocked_capability_never_granted() {
        let pm = manager();
        let snapshot = pm
            .sync_plugin("org.example.cleaner", Tier::Community, &caps(&[Capability::CollectionDelete]))
            .await
            .unwrap();
        assert!(snapshot.blocked.contains(&Capability::CollectionDelete));

        assert!(pm.grant("org.example.cleaner", Capability::CollectionDelete).await.is_err());
        assert_eq!(
            pm.request("org.example.cleaner", Capability::CollectionDelete, &FixedConsent(true))
                .await
                .unwrap(),
            PermissionState::Blocked
        );
        assert!(!pm.revoke("org.example.cleaner", Capability::CollectionDelete).await.unwrap());
        assert_eq!(
            pm.deny("org.example.cleaner", Capability::CollectionDelete).await.unwrap(),
            PermissionState::Blocked
        );
        assert_eq!(
            pm.query("org.example.cleaner", Capability::CollectionDelete).await.unwrap(),
            PermissionState::Blocked
        );
    }

    #[tokio::test]
    async fn test_resync_drops_undeclared_grants() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let pm = PermissionManager::new(store.clone());
        pm.sync_plugin(
            "org.example.deck",
            Tier::Official,
            &caps(&[Capability::StorageLocal, Capability::UiToolbar]),
        )
        .await
        .unwrap();
        assert_eq!(store.count(Table::Grants).await.unwrap(), 2);

        let snapshot = pm
            .sync_plugin(
                "org.example.deck",
                Tier::Official,
                &caps(&[Capability::StorageLocal, Capability::FetchExternal]),
            )
            .await
            .unwrap();

        assert!(snapshot.granted.contains(&Capability::StorageLocal));
        assert!(snapshot.pending_consent.contains(&Capability::FetchExternal));
        assert!(!snapshot.granted.contains(&Capability::UiToolbar));
        assert_eq!(
            pm.state("org.example.deck", Capability::UiToolbar).await.unwrap(),
            PermissionState::NotRequested
        );
    }

    #[tokio::test]
    async fn test_user_decisions_survive_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let declared = caps(&[Capability::CollectionWrite]);

        let first = PermissionManager::new(store.clone());
        first
            .sync_plugin("org.example.editor", Tier::Community, &declared)
            .await
            .unwrap();
        first
            .grant("org.example.editor", Capability::CollectionWrite)
            .await
            .unwrap();

        let second = PermissionManager::new(store);
        let snapshot = second
            .sync_plugin("org.example.editor", Tier::Community, &declared)
            .await
            .unwrap();
        assert!(snapshot.granted.contains(&Capability::CollectionWrite));
    }

    #[tokio::test]
    async fn test_tier_change_reevaluates() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let pm = PermissionManager::new(store);
        let declared = caps(&[Capability::UiModal]);

        pm.sync_plugin("org.example.popup", Tier::Official, &declared)
            .await
            .unwrap();
        let snapshot = pm
            .sync_plugin("org.example.popup", Tier::Community, &declared)
            .await
            .unwrap();
        assert!(snapshot.pending_consent.contains(&Capability::UiModal));
    }

    #[tokio::test]
    async fn test_prompt_only_consulted_when_pending() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl ConsentPrompt for Counting {
            async fn confirm(&self, _plugin_id: &str, _capability: Capability) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let pm = manager();
        pm.sync_plugin(
            "org.example.mixed",
            Tier::Community,
            &caps(&[Capability::StorageLocal, Capability::UiNotifications]),
        )
        .await
        .unwrap();

        let prompt = Counting(AtomicUsize::new(0));
        pm.request("org.example.mixed", Capability::StorageLocal, &prompt)
            .await
            .unwrap();
        pm.request("org.example.mixed", Capability::UiNotifications, &prompt)
            .await
            .unwrap();
        pm.request("org.example.mixed", Capability::UiNotifications, &prompt)
            .await
            .unwrap();
        assert_eq!(prompt.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forget_plugin_removes_records() {
        let pm = manager();
        pm.sync_plugin(
            "org.example.gone",
            Tier::Builtin,
            &caps(&[Capability::StorageLocal, Capability::AudioPlay]),
        )
        .await
        .unwrap();

        assert_eq!(pm.forget_plugin("org.example.gone").await.unwrap(), 2);
        assert!(pm.records("org.example.gone").await.unwrap().is_empty());
        assert_eq!(
            pm.query("org.example.gone", Capability::StorageLocal).await.unwrap(),
            PermissionState::Denied
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_missing() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store
            .put(
                Table::Grants,
                StoredRecord::new(grant_key("org.example.bad", Capability::AudioPlay), b"{".to_vec())
                    .with_index(index::PLUGIN_ID, "org.example.bad"),
            )
            .await
            .unwrap();

        let pm = PermissionManager::new(store.clone());
        assert_eq!(
            pm.state("org.example.bad", Capability::AudioPlay).await.unwrap(),
            PermissionState::NotRequested
        );
        assert_eq!(store.count(Table::Grants).await.unwrap(), 0);
    }
}
