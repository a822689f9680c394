//! Typed ID aliases for every entity in the store.

use super::id::Id;

pub struct TenantEntity;
pub struct ProjectEntity;
pub struct JobEntity;
pub struct JobAttemptEntity;
pub struct JobResultEntity;
pub struct EventEntity;
pub struct TriggerRuleEntity;
pub struct TriggerFireEntity;
pub struct RunEntity;
pub struct ManifestEntity;
pub struct AuditEntryEntity;
pub struct PolicyTokenEntity;

pub type TenantId = Id<TenantEntity>;
pub type ProjectId = Id<ProjectEntity>;
pub type JobId = Id<JobEntity>;
pub type JobAttemptId = Id<JobAttemptEntity>;
pub type JobResultId = Id<JobResultEntity>;
pub type EventId = Id<EventEntity>;
pub type TriggerRuleId = Id<TriggerRuleEntity>;
pub type TriggerFireId = Id<TriggerFireEntity>;
pub type RunId = Id<RunEntity>;
pub type ManifestId = Id<ManifestEntity>;
pub type AuditEntryId = Id<AuditEntryEntity>;
pub type PolicyTokenId = Id<PolicyTokenEntity>;
