use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User identifier, provided by the authentication subsystem.
///
/// Every queued operation is owned by exactly one user; ownership never
/// changes after enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a new UserId.
    ///
    /// Returns `None` if the ID is empty or exceeds 100 characters.
    #[must_use]
    pub fn new(id: String) -> Option<Self> {
        if id.is_empty() || id.len() > 100 {
            return None;
        }
        Some(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserId::new(s.to_string()).ok_or("Invalid user ID")
    }
}

/// Cooperative identifier (the organizational scope terrain agents work in).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CooperativeId(String);

impl CooperativeId {
    #[must_use]
    pub fn new(id: String) -> Option<Self> {
        if id.is_empty() || id.len() > 100 {
            return None;
        }
        Some(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CooperativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CooperativeId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CooperativeId::new(s.to_string()).ok_or("Invalid cooperative ID")
    }
}

/// The entity tables the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Planteurs,
    ChefPlanteurs,
    Warehouses,
    Deliveries,
}

impl EntityTable {
    pub const ALL: [EntityTable; 4] = [
        EntityTable::Planteurs,
        EntityTable::ChefPlanteurs,
        EntityTable::Warehouses,
        EntityTable::Deliveries,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planteurs => "planteurs",
            Self::ChefPlanteurs => "chef_planteurs",
            Self::Warehouses => "warehouses",
            Self::Deliveries => "deliveries",
        }
    }

    /// Default operation priority for mutations against this table.
    ///
    /// Deliveries carry money and are drained first; identity tables come
    /// next; warehouse edits are routine.
    #[must_use]
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Deliveries => Priority::Critical,
            Self::Planteurs | Self::ChefPlanteurs => Priority::High,
            Self::Warehouses => Priority::Normal,
        }
    }

    /// True for the terrain-critical tables that are always fully synced
    /// and never evicted.
    #[must_use]
    pub fn is_tier1(&self) -> bool {
        matches!(
            self,
            Self::Planteurs | Self::ChefPlanteurs | Self::Warehouses
        )
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityTable {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planteurs" => Ok(Self::Planteurs),
            "chef_planteurs" => Ok(Self::ChefPlanteurs),
            "warehouses" => Ok(Self::Warehouses),
            "deliveries" => Ok(Self::Deliveries),
            _ => Err("Unknown entity table"),
        }
    }
}

/// Mutation kind carried by a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err("Unknown operation type"),
        }
    }
}

/// Drain priority. Declaration order is the drain order: `Critical` sorts
/// before `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used for ordered persistence; lower drains first.
    #[must_use]
    pub fn rank(&self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    #[must_use]
    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err("Unknown priority"),
        }
    }
}

/// Queue-op status. Removal from the queue ("dequeued") is not a status;
/// a dequeued op no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Failed,
    NeedsReview,
    PendingAuth,
}

impl OperationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
            Self::PendingAuth => "pending_auth",
        }
    }

    /// Whether the `self -> next` edge exists in the op state machine.
    ///
    /// Dequeue is modelled separately (row deletion), so this only covers
    /// status-to-status edges.
    #[must_use]
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Syncing)
                | (Self::Syncing, Self::Failed)
                | (Self::Syncing, Self::NeedsReview)
                | (Self::Failed, Self::Pending)
                | (Self::NeedsReview, Self::Pending)
                | (Self::Pending, Self::PendingAuth)
                | (Self::Failed, Self::PendingAuth)
                | (Self::PendingAuth, Self::Pending)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "failed" => Ok(Self::Failed),
            "needs_review" => Ok(Self::NeedsReview),
            "pending_auth" => Ok(Self::PendingAuth),
            _ => Err("Unknown operation status"),
        }
    }
}

/// Local sync status of a cached delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSyncStatus {
    Synced,
    PendingSync,
    Conflict,
}

impl RecordSyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingSync => "pending_sync",
            Self::Conflict => "conflict",
        }
    }
}

impl FromStr for RecordSyncStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending_sync" => Ok(Self::PendingSync),
            "conflict" => Ok(Self::Conflict),
            _ => Err("Unknown record sync status"),
        }
    }
}

/// Delivery retention tier, recomputed from delivery age.
///
/// Tier 1 is never evicted; Tier 2 is recent history; Tier 3 is the first
/// to go under storage pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryTier {
    Tier1,
    Tier2,
    Tier3,
}

impl DeliveryTier {
    /// Tier from days since delivery: `< 8 -> 1; < 31 -> 2; else 3`.
    #[must_use]
    pub fn for_age_days(days: i64) -> Self {
        if days < 8 {
            Self::Tier1
        } else if days < 31 {
            Self::Tier2
        } else {
            Self::Tier3
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Tier1 => 1,
            Self::Tier2 => 2,
            Self::Tier3 => 3,
        }
    }

    #[must_use]
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::Tier1),
            2 => Some(Self::Tier2),
            3 => Some(Self::Tier3),
            _ => None,
        }
    }
}

/// Storage quota band, monotone in used percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    Normal,
    Warning,
    Purging,
    Emergency,
}

impl StorageState {
    /// Band edges: `[0,80) normal | [80,90) warning | [90,98) purging |
    /// [98,..] emergency`.
    #[must_use]
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 98.0 {
            Self::Emergency
        } else if percent >= 90.0 {
            Self::Purging
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Normal
        }
    }

    /// Writes are refused only in the emergency band.
    #[must_use]
    pub fn writes_allowed(&self) -> bool {
        !matches!(self, Self::Emergency)
    }
}

/// Composed, user-visible degraded mode. Ordered by priority: the first
/// matching mode wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedMode {
    ReadOnlyStorage,
    ReadOnlyAuth,
    QueuePressure,
    Normal,
}

impl DegradedMode {
    /// Queue pressure is a warning only; field agents must keep working.
    #[must_use]
    pub fn blocks_creation(&self) -> bool {
        matches!(self, Self::ReadOnlyStorage | Self::ReadOnlyAuth)
    }
}

/// Aggregate sync status shown next to the sync button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDisplayState {
    Synced,
    Pending,
    Error,
}

impl SyncDisplayState {
    /// `error` dominates `pending` dominates `synced`.
    #[must_use]
    pub fn compose(pending_count: u64, error_count: u64) -> Self {
        if error_count > 0 {
            Self::Error
        } else if pending_count > 0 {
            Self::Pending
        } else {
            Self::Synced
        }
    }
}

/// Structured error attached to a failed queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// HTTP-like status code; `None` for transport-level failures.
    pub code: Option<u16>,
    pub message: String,
}

impl OperationError {
    #[must_use]
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Per-field view of a detected conflict, surfaced to the review UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    pub local_value: serde_json::Value,
    pub server_value: serde_json::Value,
    pub is_critical: bool,
}

/// Conflict payload stored on an op in `needs_review`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub server_version: i64,
    pub client_version: i64,
    pub server_updated_at: Option<DateTime<Utc>>,
    pub server_updated_by: Option<String>,
    pub fields: Vec<FieldConflict>,
}

impl ConflictInfo {
    #[must_use]
    pub fn critical_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.is_critical)
            .map(|f| f.field.as_str())
            .collect()
    }
}

/// The central queue record: one durably stored local mutation awaiting
/// reconciliation with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Queue-local UUID.
    pub id: String,
    /// SHA-256 of `user_id:table:type:client_id:created_at`; unique across
    /// the queue.
    pub idempotency_key: String,
    pub op_type: OperationType,
    pub table: EntityTable,
    pub record_id: String,
    /// Equals `record_id` at create time.
    pub client_id: String,
    /// Null until the server confirms the create.
    pub server_id: Option<String>,
    pub user_id: UserId,
    pub cooperative_id: CooperativeId,
    /// Intended new field values.
    pub data: serde_json::Value,
    /// Three-way-merge base; null for CREATE.
    pub base_snapshot: Option<serde_json::Value>,
    pub base_updated_at: Option<DateTime<Utc>>,
    pub row_version: Option<i64>,
    pub priority: Priority,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub error: Option<OperationError>,
    pub conflict_info: Option<ConflictInfo>,
}

impl QueuedOperation {
    /// A failed op is eligible again once its retry deadline has passed.
    #[must_use]
    pub fn is_drainable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }
}

/// Cached entity row shared by the Tier-1 tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub id: String,
    pub cooperative_id: CooperativeId,
    pub code: Option<String>,
    pub name: String,
    /// Deterministic function of `name`: lowercased, diacritics stripped,
    /// whitespace collapsed.
    pub name_norm: String,
    /// Planteurs only: assignment to a chef-planteur, if any.
    pub chef_planteur_id: Option<String>,
    /// Planteurs only: cultivated surface in hectares.
    pub surface_ha: Option<f64>,
    pub data: serde_json::Value,
    pub validation_warnings: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Cached delivery row; tiered and eviction-aware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: String,
    pub cooperative_id: CooperativeId,
    pub planteur_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
    pub data: serde_json::Value,
    pub tier: DeliveryTier,
    pub status: RecordSyncStatus,
    pub updated_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Per-table delta-sync bookmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub table: EntityTable,
    pub last_updated_at: DateTime<Utc>,
    /// Tiebreak for records sharing `last_updated_at`; lexicographic.
    pub last_id: String,
    pub record_count: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Cursor at the epoch: the next fetch is a full sync.
    #[must_use]
    pub fn epoch(table: EntityTable) -> Self {
        Self {
            table,
            last_updated_at: DateTime::<Utc>::UNIX_EPOCH,
            last_id: String::new(),
            record_count: 0,
            last_sync_at: None,
            last_full_sync_at: None,
        }
    }

    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.last_sync_at {
            Some(at) => now - at > max_age,
            None => true,
        }
    }
}

/// Durable client-id to server-id association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub client_id: String,
    pub server_id: String,
    pub table: EntityTable,
    pub mapped_at: DateTime<Utc>,
}

/// Classified error-log entry; the log is a bounded ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Sync,
    Storage,
    Network,
    Validation,
    Migration,
    General,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Migration => "migration",
            Self::General => "general",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "storage" => Ok(Self::Storage),
            "network" => Ok(Self::Network),
            "validation" => Ok(Self::Validation),
            "migration" => Ok(Self::Migration),
            "general" => Ok(Self::General),
            _ => Err("Unknown error kind"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub stack: Option<String>,
}

/// Opaque app-state KV record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_rejects_empty_and_oversized() {
        assert!(UserId::new(String::new()).is_none());
        assert!(UserId::new("x".repeat(101)).is_none());
        assert!(UserId::new("agent-7".to_string()).is_some());
    }

    #[test]
    fn test_table_round_trip() {
        for table in EntityTable::ALL {
            assert_eq!(table.as_str().parse::<EntityTable>().unwrap(), table);
        }
    }

    #[test]
    fn test_default_priority_by_table() {
        assert_eq!(
            EntityTable::Deliveries.default_priority(),
            Priority::Critical
        );
        assert_eq!(EntityTable::Planteurs.default_priority(), Priority::High);
        assert_eq!(
            EntityTable::ChefPlanteurs.default_priority(),
            Priority::High
        );
        assert_eq!(EntityTable::Warehouses.default_priority(), Priority::Normal);
    }

    #[test]
    fn test_priority_drain_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::from_rank(Priority::Low.rank()), Some(Priority::Low));
    }

    #[test]
    fn test_status_machine_legal_edges() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Failed));
        assert!(Syncing.can_transition_to(NeedsReview));
        assert!(Failed.can_transition_to(Pending));
        assert!(NeedsReview.can_transition_to(Pending));
        assert!(Pending.can_transition_to(PendingAuth));
        assert!(Failed.can_transition_to(PendingAuth));
        assert!(PendingAuth.can_transition_to(Pending));
    }

    #[test]
    fn test_status_machine_illegal_edges() {
        use OperationStatus::*;
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(NeedsReview));
        assert!(!Syncing.can_transition_to(PendingAuth));
        assert!(!NeedsReview.can_transition_to(Failed));
        assert!(!PendingAuth.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Syncing));
    }

    #[test]
    fn test_delivery_tier_boundaries() {
        assert_eq!(DeliveryTier::for_age_days(0), DeliveryTier::Tier1);
        assert_eq!(DeliveryTier::for_age_days(7), DeliveryTier::Tier1);
        assert_eq!(DeliveryTier::for_age_days(8), DeliveryTier::Tier2);
        assert_eq!(DeliveryTier::for_age_days(30), DeliveryTier::Tier2);
        assert_eq!(DeliveryTier::for_age_days(31), DeliveryTier::Tier3);
        assert_eq!(DeliveryTier::for_age_days(365), DeliveryTier::Tier3);
    }

    #[test]
    fn test_storage_state_bands() {
        assert_eq!(StorageState::from_percent(0.0), StorageState::Normal);
        assert_eq!(StorageState::from_percent(79.9), StorageState::Normal);
        assert_eq!(StorageState::from_percent(80.0), StorageState::Warning);
        assert_eq!(StorageState::from_percent(89.9), StorageState::Warning);
        assert_eq!(StorageState::from_percent(90.0), StorageState::Purging);
        assert_eq!(StorageState::from_percent(97.9), StorageState::Purging);
        assert_eq!(StorageState::from_percent(98.0), StorageState::Emergency);
        assert_eq!(StorageState::from_percent(100.0), StorageState::Emergency);
        assert!(!StorageState::Emergency.writes_allowed());
        assert!(StorageState::Purging.writes_allowed());
    }

    #[test]
    fn test_sync_display_state_compose() {
        assert_eq!(SyncDisplayState::compose(0, 0), SyncDisplayState::Synced);
        assert_eq!(SyncDisplayState::compose(3, 0), SyncDisplayState::Pending);
        assert_eq!(SyncDisplayState::compose(3, 1), SyncDisplayState::Error);
        assert_eq!(SyncDisplayState::compose(0, 1), SyncDisplayState::Error);
    }

    #[test]
    fn test_cursor_epoch_and_staleness() {
        let cursor = SyncCursor::epoch(EntityTable::Planteurs);
        assert_eq!(cursor.last_updated_at, DateTime::<Utc>::UNIX_EPOCH);
        assert!(cursor.last_id.is_empty());

        let now = Utc::now();
        assert!(cursor.is_stale(now, chrono::Duration::hours(24)));

        let fresh = SyncCursor {
            last_sync_at: Some(now - chrono::Duration::hours(1)),
            ..cursor
        };
        assert!(!fresh.is_stale(now, chrono::Duration::hours(24)));
    }

    #[test]
    fn test_drainable_failed_op_waits_for_deadline() {
        let now = Utc::now();
        let mut op = sample_op();
        op.status = OperationStatus::Failed;
        op.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!op.is_drainable(now));

        op.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(op.is_drainable(now));

        op.next_retry_at = None;
        assert!(!op.is_drainable(now));
    }

    #[test]
    fn test_queued_operation_serde_round_trip() {
        let op = sample_op();
        let json = serde_json::to_string(&op).unwrap();
        let back: QueuedOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(op, back);
    }

    fn sample_op() -> QueuedOperation {
        QueuedOperation {
            id: "4f2f3c1e-0000-4000-8000-000000000001".to_string(),
            idempotency_key: "abc".to_string(),
            op_type: OperationType::Update,
            table: EntityTable::Deliveries,
            record_id: "rec-1".to_string(),
            client_id: "rec-1".to_string(),
            server_id: None,
            user_id: "agent-7".parse().unwrap(),
            cooperative_id: "coop-1".parse().unwrap(),
            data: serde_json::json!({"weight_kg": 120}),
            base_snapshot: Some(serde_json::json!({"weight_kg": 100})),
            base_updated_at: Some(Utc::now()),
            row_version: Some(3),
            priority: Priority::Critical,
            status: OperationStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            created_at: Utc::now(),
            queued_at: Utc::now(),
            error: None,
            conflict_info: None,
        }
    }
}
