use async_trait::async_trait;
use gnomehat_domain::{
    entities::{ExitInfo, Job, JobFilter, JobMetadata, JobState, NewJob},
    mutations::{CasOutcome, HeartbeatGuard, JobGuard, JobMutation},
    repositories::JobStore,
};
use gnomehat_errors::{SchedulerError, SchedulerResult};
use sqlx::{types::Json, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

const JOB_COLUMNS: &str = "id, command, metadata, state, owner, attempt_count, submitted_at, \
     claimed_at, started_at, last_heartbeat_at, finished_at, exit_info";

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 幂等建表，启动时调用
    pub async fn ensure_schema(&self) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL,
                owner TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                submitted_at TEXT NOT NULL,
                claimed_at TEXT,
                started_at TEXT,
                last_heartbeat_at TEXT,
                finished_at TEXT,
                exit_info TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_id ON jobs (state, id)")
            .execute(&self.pool)
            .await?;

        debug!("任务表结构检查完成");
        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Job> {
        let metadata: Json<JobMetadata> = row.try_get("metadata")?;
        let exit_info: Option<Json<ExitInfo>> = row.try_get("exit_info")?;
        Ok(Job {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            metadata: metadata.0,
            state: row.try_get("state")?,
            owner: row.try_get("owner")?,
            attempt_count: row.try_get("attempt_count")?,
            submitted_at: row.try_get("submitted_at")?,
            claimed_at: row.try_get("claimed_at")?,
            started_at: row.try_get("started_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            finished_at: row.try_get("finished_at")?,
            exit_info: exit_info.map(|info| info.0),
        })
    }

    fn push_assignments(builder: &mut QueryBuilder<'_, Sqlite>, mutation: &JobMutation) {
        match mutation {
            JobMutation::Claim { worker_id, at } => {
                builder
                    .push("state = ")
                    .push_bind(JobState::Claimed)
                    .push(", owner = ")
                    .push_bind(worker_id.clone())
                    .push(", claimed_at = ")
                    .push_bind(*at)
                    .push(", started_at = NULL, last_heartbeat_at = ")
                    .push_bind(*at);
            }
            JobMutation::Start { at } => {
                builder
                    .push("state = ")
                    .push_bind(JobState::Running)
                    .push(", started_at = ")
                    .push_bind(*at)
                    .push(", last_heartbeat_at = ")
                    .push_bind(*at);
            }
            JobMutation::Heartbeat { at } => {
                builder.push("last_heartbeat_at = ").push_bind(*at);
            }
            JobMutation::Finish {
                state,
                exit_info,
                at,
            } => {
                builder
                    .push("state = ")
                    .push_bind(*state)
                    .push(", exit_info = ")
                    .push_bind(Json(exit_info.clone()))
                    .push(", finished_at = ")
                    .push_bind(*at);
            }
            JobMutation::Requeue => {
                builder
                    .push("state = ")
                    .push_bind(JobState::Queued)
                    .push(
                        ", owner = NULL, claimed_at = NULL, started_at = NULL, \
                         last_heartbeat_at = NULL, attempt_count = attempt_count + 1",
                    );
            }
        }
    }

    async fn exists(&self, id: i64) -> SchedulerResult<bool> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(command = %job.command))]
    async fn create(&self, job: &NewJob) -> SchedulerResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (command, metadata, state, attempt_count, submitted_at)
            VALUES (?, ?, ?, 0, ?)
            RETURNING id
            "#,
        )
        .bind(&job.command)
        .bind(Json(&job.metadata))
        .bind(JobState::Queued)
        .bind(job.submitted_at)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        debug!("创建任务成功: ID {}", id);
        Ok(id)
    }

    async fn get(&self, id: i64) -> SchedulerResult<Job> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_job(&row),
            None => Err(SchedulerError::job_not_found(id)),
        }
    }

    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));

        if let Some(states) = &filter.states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND state IN (");
            let mut separated = builder.separated(", ");
            for state in states {
                separated.push_bind(*state);
            }
            separated.push_unseparated(")");
        }

        if let Some(owner) = &filter.owner {
            builder.push(" AND owner = ").push_bind(owner.clone());
        }

        builder.push(" ORDER BY id ASC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self, expected, mutation), fields(
        job_id = id,
        mutation = mutation.name(),
        expected_state = %expected.state,
        expected_owner = ?expected.owner,
    ))]
    async fn compare_and_swap(
        &self,
        id: i64,
        expected: &JobGuard,
        mutation: &JobMutation,
    ) -> SchedulerResult<CasOutcome> {
        if !mutation.is_legal_from(expected.state) {
            return Err(SchedulerError::invalid_transition(
                id,
                expected.state,
                mutation.target_state(expected.state),
            ));
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET ");
        Self::push_assignments(&mut builder, mutation);
        builder
            .push(" WHERE id = ")
            .push_bind(id)
            .push(" AND state = ")
            .push_bind(expected.state)
            .push(" AND owner IS ")
            .push_bind(expected.owner.clone());
        if let HeartbeatGuard::Exactly(last_heartbeat_at) = expected.last_heartbeat {
            builder
                .push(" AND last_heartbeat_at IS ")
                .push_bind(last_heartbeat_at);
        }
        builder.push(" RETURNING ").push(JOB_COLUMNS);

        let row = builder.build().fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(CasOutcome::Applied(Self::row_to_job(&row)?)),
            None if self.exists(id).await? => {
                debug!("条件更新未命中，任务已被其他组件修改");
                Ok(CasOutcome::Conflict)
            }
            None => Err(SchedulerError::job_not_found(id)),
        }
    }
}
