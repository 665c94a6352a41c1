use agenthost_common::{Instance, InstanceStatus};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{ActionLogEntry, ErrorMessageUpdate, InstanceStore, Transition, TransitionOutcome};

const INSTANCE_COLUMNS: &str = "id, status, provider, plan_id, owner_email, owner_name, \
     server_id, server_ip, tunnel_id, tunnel_url, terminal_url, config, error_message, \
     created_at, provisioned_at, ready_at, terminated_at";

pub struct PgInstanceStore {
    db: Pool<Postgres>,
}

impl PgInstanceStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    async fn log_state_transition(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: &str,
    ) {
        let res = sqlx::query(
            "INSERT INTO instance_state_history (instance_id, from_status, to_status, reason)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(instance_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .execute(&self.db)
        .await;
        if let Err(e) = res {
            tracing::warn!(
                "[store] failed to record history for {} ({} -> {}): {}",
                instance_id,
                from,
                to,
                e
            );
        }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn get(&self, id: Uuid) -> Result<Option<Instance>> {
        let sql = format!("SELECT {} FROM instances WHERE id = $1", INSTANCE_COLUMNS);
        Ok(sqlx::query_as::<_, Instance>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn find_by_server_id(&self, server_id: &str) -> Result<Option<Instance>> {
        let sql = format!(
            "SELECT {} FROM instances
             WHERE server_id = $1 AND status <> 'terminated'
             ORDER BY created_at DESC
             LIMIT 1",
            INSTANCE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Instance>(&sql)
            .bind(server_id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn find_active_for_owner(&self, owner_email: &str) -> Result<Option<Instance>> {
        let sql = format!(
            "SELECT {} FROM instances
             WHERE lower(owner_email) = lower($1)
               AND status IN ('provisioning', 'configuring')
             LIMIT 1",
            INSTANCE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Instance>(&sql)
            .bind(owner_email)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn insert_if_absent(&self, instance: &Instance) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO instances (id, status, provider, plan_id, owner_email, owner_name, config, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(instance.id)
        .bind(instance.status)
        .bind(instance.provider)
        .bind(&instance.plan_id)
        .bind(&instance.owner_email)
        .bind(&instance.owner_name)
        .bind(&instance.config)
        .bind(instance.created_at)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn transition(&self, id: Uuid, t: &Transition) -> Result<TransitionOutcome> {
        let current: Option<InstanceStatus> =
            sqlx::query_scalar("SELECT status FROM instances WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        let Some(from) = current else {
            return Ok(TransitionOutcome::Missing);
        };
        if !from.can_transition_to(t.to) {
            return Ok(TransitionOutcome::Rejected { current: from });
        }

        let meta = t.metadata.clone().unwrap_or_default();
        let (clear_error, set_error) = match &t.error_message {
            ErrorMessageUpdate::Keep => (false, None),
            ErrorMessageUpdate::Clear => (true, None),
            ErrorMessageUpdate::Set(msg) => (false, Some(msg.clone())),
        };

        // Guard on the status we validated against; a concurrent writer makes
        // this a no-op instead of an unchecked edge.
        let res = sqlx::query(
            "UPDATE instances
             SET status = $3,
                 plan_id = COALESCE($4, plan_id),
                 provider = COALESCE($5, $6, provider),
                 server_id = COALESCE($7, server_id),
                 server_ip = COALESCE($8, server_ip),
                 tunnel_id = COALESCE($9, tunnel_id),
                 tunnel_url = COALESCE($10, tunnel_url),
                 terminal_url = COALESCE($11, terminal_url),
                 config = COALESCE($12, config),
                 error_message = CASE WHEN $13 THEN NULL ELSE COALESCE($14, error_message) END,
                 provisioned_at = CASE WHEN $7::text IS NOT NULL THEN COALESCE(provisioned_at, NOW()) ELSE provisioned_at END,
                 ready_at = CASE WHEN $3 = 'ready'::instance_status THEN COALESCE(ready_at, NOW()) ELSE ready_at END,
                 terminated_at = CASE WHEN $3 = 'terminated'::instance_status THEN NOW() ELSE terminated_at END
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from)
        .bind(t.to)
        .bind(&t.plan_id)
        .bind(meta.provider)
        .bind(t.provider)
        .bind(&meta.server_id)
        .bind(&meta.server_ip)
        .bind(&meta.tunnel_id)
        .bind(&meta.tunnel_url)
        .bind(&meta.terminal_url)
        .bind(&t.config)
        .bind(clear_error)
        .bind(set_error)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            let now: Option<InstanceStatus> =
                sqlx::query_scalar("SELECT status FROM instances WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.db)
                    .await?;
            return Ok(match now {
                Some(current) => TransitionOutcome::Rejected { current },
                None => TransitionOutcome::Missing,
            });
        }

        self.log_state_transition(id, from, t.to, &t.reason).await;
        Ok(TransitionOutcome::Applied { from })
    }

    async fn record_error(&self, id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE instances SET error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn log_action(&self, entry: &ActionLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO action_logs
             (id, action_type, component, status, error_message, instance_id, metadata, created_at)
             VALUES ($1, $2, 'orchestrator', $3, $4, $5, $6, NOW())",
        )
        .bind(entry.id)
        .bind(&entry.action_type)
        .bind(&entry.status)
        .bind(&entry.error_message)
        .bind(entry.instance_id)
        .bind(&entry.metadata)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn complete_action(
        &self,
        id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE action_logs
             SET status = $2,
                 duration_ms = $3,
                 error_message = COALESCE($4, error_message),
                 completed_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(duration_ms)
        .bind(error_message)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
