//! 条件更新原语
//!
//! 所有状态变化都表达为 `JobGuard` + `JobMutation`：只有当任务当前的
//! `(state, owner[, last_heartbeat_at])` 与 guard 完全一致时，mutation 才会生效。

use chrono::{DateTime, Utc};

use crate::entities::{ExitInfo, Job, JobState};

/// 心跳时间的匹配方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartbeatGuard {
    Any,
    Exactly(Option<DateTime<Utc>>),
}

/// 条件更新的期望值
#[derive(Debug, Clone, PartialEq)]
pub struct JobGuard {
    pub state: JobState,
    pub owner: Option<String>,
    pub last_heartbeat: HeartbeatGuard,
}

impl JobGuard {
    pub fn new(state: JobState, owner: Option<String>) -> Self {
        Self {
            state,
            owner,
            last_heartbeat: HeartbeatGuard::Any,
        }
    }

    pub fn queued() -> Self {
        Self::new(JobState::Queued, None)
    }

    pub fn owned<S: Into<String>>(state: JobState, owner: S) -> Self {
        Self::new(state, Some(owner.into()))
    }

    /// 精确匹配观察到的三元组，Sweeper 使用
    pub fn observed(job: &Job) -> Self {
        Self {
            state: job.state,
            owner: job.owner.clone(),
            last_heartbeat: HeartbeatGuard::Exactly(job.last_heartbeat_at),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.state != self.state || job.owner != self.owner {
            return false;
        }
        match self.last_heartbeat {
            HeartbeatGuard::Any => true,
            HeartbeatGuard::Exactly(expected) => job.last_heartbeat_at == expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobMutation {
    /// Queued -> Claimed，租约从认领时刻开始
    Claim { worker_id: String, at: DateTime<Utc> },
    /// Claimed -> Running
    Start { at: DateTime<Utc> },
    /// 刷新租约
    Heartbeat { at: DateTime<Utc> },
    /// 进入终态，保留 owner 记录
    Finish {
        state: JobState,
        exit_info: ExitInfo,
        at: DateTime<Utc>,
    },
    /// 租约过期回到队列，attempt_count += 1
    Requeue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(Job),
    Conflict,
}

impl CasOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CasOutcome::Conflict)
    }

    pub fn applied(self) -> Option<Job> {
        match self {
            CasOutcome::Applied(job) => Some(job),
            CasOutcome::Conflict => None,
        }
    }
}

impl JobMutation {
    pub fn name(&self) -> &'static str {
        match self {
            JobMutation::Claim { .. } => "claim",
            JobMutation::Start { .. } => "start",
            JobMutation::Heartbeat { .. } => "heartbeat",
            JobMutation::Finish { .. } => "finish",
            JobMutation::Requeue => "requeue",
        }
    }

    pub fn target_state(&self, current: JobState) -> JobState {
        match self {
            JobMutation::Claim { .. } => JobState::Claimed,
            JobMutation::Start { .. } => JobState::Running,
            JobMutation::Heartbeat { .. } => current,
            JobMutation::Finish { state, .. } => *state,
            JobMutation::Requeue => JobState::Queued,
        }
    }

    /// 状态机是否允许从 `current` 执行该 mutation
    pub fn is_legal_from(&self, current: JobState) -> bool {
        match self {
            JobMutation::Heartbeat { .. } => current.is_leased(),
            other => current.can_transition_to(other.target_state(current)),
        }
    }

    /// 各存储实现共享的字段赋值语义
    pub fn apply(&self, job: &Job) -> Job {
        let mut next = job.clone();
        match self {
            JobMutation::Claim { worker_id, at } => {
                next.state = JobState::Claimed;
                next.owner = Some(worker_id.clone());
                next.claimed_at = Some(*at);
                next.started_at = None;
                next.last_heartbeat_at = Some(*at);
            }
            JobMutation::Start { at } => {
                next.state = JobState::Running;
                next.started_at = Some(*at);
                next.last_heartbeat_at = Some(*at);
            }
            JobMutation::Heartbeat { at } => {
                next.last_heartbeat_at = Some(*at);
            }
            JobMutation::Finish {
                state,
                exit_info,
                at,
            } => {
                next.state = *state;
                next.exit_info = Some(exit_info.clone());
                next.finished_at = Some(*at);
            }
            JobMutation::Requeue => {
                next.state = JobState::Queued;
                next.owner = None;
                next.claimed_at = None;
                next.started_at = None;
                next.last_heartbeat_at = None;
                next.attempt_count = job.attempt_count.saturating_add(1);
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{JobMetadata, NewJob};

    fn queued_job() -> Job {
        NewJob::new("python train.py", JobMetadata::default()).into_job(1)
    }

    #[test]
    fn test_claim_sets_owner_and_lease() {
        let at = Utc::now();
        let job = JobMutation::Claim {
            worker_id: "worker-1".to_string(),
            at,
        }
        .apply(&queued_job());

        assert_eq!(job.state, JobState::Claimed);
        assert_eq!(job.owner.as_deref(), Some("worker-1"));
        assert_eq!(job.claimed_at, Some(at));
        assert_eq!(job.last_heartbeat_at, Some(at));
    }

    #[test]
    fn test_requeue_clears_lease_and_counts_attempt() {
        let at = Utc::now();
        let claimed = JobMutation::Claim {
            worker_id: "worker-1".to_string(),
            at,
        }
        .apply(&queued_job());
        let running = JobMutation::Start { at }.apply(&claimed);

        let requeued = JobMutation::Requeue.apply(&running);
        assert_eq!(requeued.state, JobState::Queued);
        assert!(requeued.owner.is_none());
        assert!(requeued.claimed_at.is_none());
        assert!(requeued.started_at.is_none());
        assert!(requeued.last_heartbeat_at.is_none());
        assert_eq!(requeued.attempt_count, 1);
    }

    #[test]
    fn test_finish_keeps_owner() {
        let at = Utc::now();
        let claimed = JobMutation::Claim {
            worker_id: "worker-1".to_string(),
            at,
        }
        .apply(&queued_job());
        let finished = JobMutation::Finish {
            state: JobState::Killed,
            exit_info: ExitInfo::default().with_message("killed"),
            at,
        }
        .apply(&claimed);

        assert_eq!(finished.state, JobState::Killed);
        assert_eq!(finished.owner.as_deref(), Some("worker-1"));
        assert_eq!(finished.finished_at, Some(at));
    }

    #[test]
    fn test_guard_matching() {
        let at = Utc::now();
        let claimed = JobMutation::Claim {
            worker_id: "worker-1".to_string(),
            at,
        }
        .apply(&queued_job());

        assert!(JobGuard::queued().matches(&queued_job()));
        assert!(!JobGuard::queued().matches(&claimed));
        assert!(JobGuard::owned(JobState::Claimed, "worker-1").matches(&claimed));
        assert!(!JobGuard::owned(JobState::Claimed, "worker-2").matches(&claimed));

        let observed = JobGuard::observed(&claimed);
        assert!(observed.matches(&claimed));

        let refreshed = JobMutation::Heartbeat {
            at: at + chrono::Duration::seconds(1),
        }
        .apply(&claimed);
        assert!(!observed.matches(&refreshed));
    }

    #[test]
    fn test_legality() {
        let at = Utc::now();
        assert!(JobMutation::Heartbeat { at }.is_legal_from(JobState::Running));
        assert!(!JobMutation::Heartbeat { at }.is_legal_from(JobState::Queued));
        assert!(JobMutation::Requeue.is_legal_from(JobState::Running));
        assert!(!JobMutation::Requeue.is_legal_from(JobState::Succeeded));
        assert!(!JobMutation::Start { at }.is_legal_from(JobState::Queued));
    }
}
