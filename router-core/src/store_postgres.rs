use crate::errors::CatchEventFailureKind;
use crate::store::{ElementInstanceStore, EventScopeStore, KeyGenerator, VariablesStore, WorkflowStore};
use crate::types::{
    BpmnElementType, DeferredPurpose, DeferredRecord, ElementInstance, ElementInstanceState, EventTrigger, Intent, Key,
    Workflow, WorkflowRecord,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::Row;

fn element_type_str(t: BpmnElementType) -> &'static str {
    match t {
        BpmnElementType::Process => "PROCESS",
        BpmnElementType::StartEvent => "START_EVENT",
        BpmnElementType::ServiceTask => "SERVICE_TASK",
        BpmnElementType::ReceiveTask => "RECEIVE_TASK",
        BpmnElementType::BoundaryEvent => "BOUNDARY_EVENT",
        BpmnElementType::IntermediateCatchEvent => "INTERMEDIATE_CATCH_EVENT",
        BpmnElementType::EventBasedGateway => "EVENT_BASED_GATEWAY",
        BpmnElementType::EventSubProcess => "EVENT_SUB_PROCESS",
        BpmnElementType::SequenceFlow => "SEQUENCE_FLOW",
    }
}

fn element_type_from_str(s: &str) -> Result<BpmnElementType> {
    Ok(match s {
        "PROCESS" => BpmnElementType::Process,
        "START_EVENT" => BpmnElementType::StartEvent,
        "SERVICE_TASK" => BpmnElementType::ServiceTask,
        "RECEIVE_TASK" => BpmnElementType::ReceiveTask,
        "BOUNDARY_EVENT" => BpmnElementType::BoundaryEvent,
        "INTERMEDIATE_CATCH_EVENT" => BpmnElementType::IntermediateCatchEvent,
        "EVENT_BASED_GATEWAY" => BpmnElementType::EventBasedGateway,
        "EVENT_SUB_PROCESS" => BpmnElementType::EventSubProcess,
        "SEQUENCE_FLOW" => BpmnElementType::SequenceFlow,
        other => return Err(anyhow!("unknown bpmn element type '{other}'")),
    })
}

fn state_str(s: ElementInstanceState) -> &'static str {
    match s {
        ElementInstanceState::Activating => "ACTIVATING",
        ElementInstanceState::Activated => "ACTIVATED",
        ElementInstanceState::Completing => "COMPLETING",
        ElementInstanceState::Completed => "COMPLETED",
        ElementInstanceState::Terminating => "TERMINATING",
        ElementInstanceState::Terminated => "TERMINATED",
    }
}

fn state_from_str(s: &str) -> Result<ElementInstanceState> {
    Ok(match s {
        "ACTIVATING" => ElementInstanceState::Activating,
        "ACTIVATED" => ElementInstanceState::Activated,
        "COMPLETING" => ElementInstanceState::Completing,
        "COMPLETED" => ElementInstanceState::Completed,
        "TERMINATING" => ElementInstanceState::Terminating,
        "TERMINATED" => ElementInstanceState::Terminated,
        other => return Err(anyhow!("unknown element instance state '{other}'")),
    })
}

fn intent_str(intent: Intent) -> &'static str {
    match intent {
        Intent::ElementActivating => "ELEMENT_ACTIVATING",
        Intent::ElementTerminating => "ELEMENT_TERMINATING",
        Intent::ElementCompleting => "ELEMENT_COMPLETING",
    }
}

fn intent_from_str(s: &str) -> Result<Intent> {
    Ok(match s {
        "ELEMENT_ACTIVATING" => Intent::ElementActivating,
        "ELEMENT_TERMINATING" => Intent::ElementTerminating,
        "ELEMENT_COMPLETING" => Intent::ElementCompleting,
        other => return Err(anyhow!("unknown intent '{other}'")),
    })
}

fn purpose_str(purpose: DeferredPurpose) -> &'static str {
    match purpose {
        DeferredPurpose::ActivatingEvent => "ACTIVATING_EVENT",
        DeferredPurpose::Other => "OTHER",
    }
}

fn purpose_from_str(s: &str) -> Result<DeferredPurpose> {
    Ok(match s {
        "ACTIVATING_EVENT" => DeferredPurpose::ActivatingEvent,
        "OTHER" => DeferredPurpose::Other,
        other => return Err(anyhow!("unknown deferred purpose '{other}'")),
    })
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<ElementInstance> {
    let element_type: String = row.get("element_type");
    let state: String = row.get("state");
    let key: i64 = row.get("key");
    let parent_key: i64 = row.get("parent_key");
    let interrupting_event_key: i64 = row.get("interrupting_event_key");
    let active_token_count: i32 = row.get("active_token_count");

    Ok(ElementInstance {
        key: Key(key as u64),
        parent_key: Key(parent_key as u64),
        element_id: row.get("element_id"),
        element_type: element_type_from_str(&element_type)?,
        state: state_from_str(&state)?,
        active_token_count: active_token_count as u32,
        interrupting_event_key: Key(interrupting_event_key as u64),
    })
}

/// PostgreSQL-backed implementation of the five store traits, mirroring the
/// teacher's `PostgresProcessStore` (`store_postgres.rs`): one struct over a
/// shared `PgPool`, one `impl` block per trait, embedded `sqlx::migrate!`.
pub struct PostgresStores {
    pool: sqlx::PgPool,
}

impl PostgresStores {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run router-core migrations")?;
        Ok(())
    }

    async fn upsert_instance(&self, instance: &ElementInstance) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO element_instances
                   (key, parent_key, element_id, element_type, state, active_token_count, interrupting_event_key)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (key) DO UPDATE SET
                   parent_key = EXCLUDED.parent_key,
                   element_id = EXCLUDED.element_id,
                   element_type = EXCLUDED.element_type,
                   state = EXCLUDED.state,
                   active_token_count = EXCLUDED.active_token_count,
                   interrupting_event_key = EXCLUDED.interrupting_event_key"#,
        )
        .bind(instance.key.0 as i64)
        .bind(instance.parent_key.0 as i64)
        .bind(&instance.element_id)
        .bind(element_type_str(instance.element_type))
        .bind(state_str(instance.state))
        .bind(instance.active_token_count as i32)
        .bind(instance.interrupting_event_key.0 as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PostgresStores {
    async fn get_workflow_by_key(&self, key: Key) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            r#"SELECT workflow_key, bpmn_process_id, version, root_element_id, element_type
               FROM workflows WHERE workflow_key = $1"#,
        )
        .bind(key.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let element_type: String = row.get("element_type");
                let workflow_key: i64 = row.get("workflow_key");
                Ok(Some(Workflow {
                    workflow_key: Key(workflow_key as u64),
                    bpmn_process_id: row.get("bpmn_process_id"),
                    version: row.get("version"),
                    root_element_id: row.get("root_element_id"),
                    element_type: element_type_from_str(&element_type)?,
                }))
            }
        }
    }
}

#[async_trait]
impl EventScopeStore for PostgresStores {
    async fn peek_event_trigger(&self, scope_key: Key) -> Result<Option<EventTrigger>> {
        let row = sqlx::query(
            r#"SELECT scope_key, event_key, target_element_id, variables
               FROM event_triggers WHERE scope_key = $1 ORDER BY event_key ASC LIMIT 1"#,
        )
        .bind(scope_key.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let scope_key: i64 = row.get("scope_key");
            let event_key: i64 = row.get("event_key");
            let variables: Vec<u8> = row.get("variables");
            EventTrigger {
                scope_key: Key(scope_key as u64),
                event_key: Key(event_key as u64),
                target_element_id: row.get("target_element_id"),
                variables: Bytes::from(variables),
            }
        }))
    }

    async fn delete_trigger(&self, scope_key: Key, event_key: Key) -> Result<()> {
        sqlx::query("DELETE FROM event_triggers WHERE scope_key = $1 AND event_key = $2")
            .bind(scope_key.0 as i64)
            .bind(event_key.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_event_trigger(&self, trigger: EventTrigger) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO event_triggers (scope_key, event_key, target_element_id, variables)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (scope_key, event_key) DO UPDATE SET
                   target_element_id = EXCLUDED.target_element_id,
                   variables = EXCLUDED.variables"#,
        )
        .bind(trigger.scope_key.0 as i64)
        .bind(trigger.event_key.0 as i64)
        .bind(&trigger.target_element_id)
        .bind(trigger.variables.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_all_triggers(&self, scope_key: Key) -> Result<()> {
        sqlx::query("DELETE FROM event_triggers WHERE scope_key = $1")
            .bind(scope_key.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ElementInstanceStore for PostgresStores {
    async fn get_instance(&self, key: Key) -> Result<Option<ElementInstance>> {
        let row = sqlx::query(
            r#"SELECT key, parent_key, element_id, element_type, state, active_token_count, interrupting_event_key
               FROM element_instances WHERE key = $1"#,
        )
        .bind(key.0 as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn new_instance(&self, instance: ElementInstance) -> Result<()> {
        self.upsert_instance(&instance).await
    }

    async fn update_instance(&self, instance: ElementInstance) -> Result<()> {
        self.upsert_instance(&instance).await
    }

    async fn store_record(
        &self,
        child_key: Key,
        parent_key: Key,
        record: WorkflowRecord,
        intent: Intent,
        purpose: DeferredPurpose,
    ) -> Result<()> {
        let payload = serde_json::to_value(&record)?;
        sqlx::query(
            r#"INSERT INTO deferred_records (owner_scope_key, child_instance_key, intent, purpose, record)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (owner_scope_key, child_instance_key, intent) DO UPDATE SET
                   purpose = EXCLUDED.purpose, record = EXCLUDED.record"#,
        )
        .bind(parent_key.0 as i64)
        .bind(child_key.0 as i64)
        .bind(intent_str(intent))
        .bind(purpose_str(purpose))
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_deferred_records(&self, scope_key: Key) -> Result<Vec<DeferredRecord>> {
        let rows = sqlx::query(
            r#"SELECT owner_scope_key, child_instance_key, intent, purpose, record
               FROM deferred_records WHERE owner_scope_key = $1"#,
        )
        .bind(scope_key.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let owner_scope_key: i64 = row.get("owner_scope_key");
                let child_instance_key: i64 = row.get("child_instance_key");
                let intent: String = row.get("intent");
                let purpose: String = row.get("purpose");
                let record: serde_json::Value = row.get("record");
                Ok(DeferredRecord {
                    owner_scope_key: Key(owner_scope_key as u64),
                    child_instance_key: Key(child_instance_key as u64),
                    intent: intent_from_str(&intent)?,
                    purpose: purpose_from_str(&purpose)?,
                    record: serde_json::from_value(record)?,
                })
            })
            .collect()
    }

    async fn delete_deferred_record(&self, scope_key: Key, child_key: Key, intent: Intent) -> Result<()> {
        sqlx::query("DELETE FROM deferred_records WHERE owner_scope_key = $1 AND child_instance_key = $2 AND intent = $3")
            .bind(scope_key.0 as i64)
            .bind(child_key.0 as i64)
            .bind(intent_str(intent))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn discard_deferred_records(&self, scope_key: Key) -> Result<()> {
        sqlx::query("DELETE FROM deferred_records WHERE owner_scope_key = $1")
            .bind(scope_key.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn children_of(&self, scope_key: Key) -> Result<Vec<ElementInstance>> {
        let rows = sqlx::query(
            r#"SELECT key, parent_key, element_id, element_type, state, active_token_count, interrupting_event_key
               FROM element_instances WHERE parent_key = $1"#,
        )
        .bind(scope_key.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn record_incident(&self, scope_key: Key, kind: CatchEventFailureKind, message: String) -> Result<()> {
        sqlx::query("INSERT INTO incidents (scope_key, kind, message) VALUES ($1, $2, $3)")
            .bind(scope_key.0 as i64)
            .bind(kind.to_string())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VariablesStore for PostgresStores {
    async fn set_temporary_variables(&self, element_instance_key: Key, variables: Bytes) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO temporary_variables (element_instance_key, variables)
               VALUES ($1, $2)
               ON CONFLICT (element_instance_key) DO UPDATE SET variables = EXCLUDED.variables"#,
        )
        .bind(element_instance_key.0 as i64)
        .bind(variables.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_temporary_variables(&self, element_instance_key: Key) -> Result<Option<Bytes>> {
        let row = sqlx::query("SELECT variables FROM temporary_variables WHERE element_instance_key = $1")
            .bind(element_instance_key.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let variables: Vec<u8> = row.get("variables");
            Bytes::from(variables)
        }))
    }
}

/// Postgres-backed `KeyGenerator` backed by a `BIGINT` sequence — the
/// monotonic guarantee (§6) comes from the database sequence itself, not
/// from in-process coordination, so this is safe to share across processes
/// restarting against the same database.
pub struct SequenceKeyGenerator {
    pool: sqlx::PgPool,
}

impl SequenceKeyGenerator {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

impl KeyGenerator for SequenceKeyGenerator {
    fn next_key(&self) -> Key {
        // The trait is synchronous (§6: the owning partition is
        // single-threaded cooperative); block on the pool briefly rather
        // than widen `KeyGenerator` to async for this one implementation.
        let pool = self.pool.clone();
        let value: i64 = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let row = sqlx::query("SELECT nextval('router_core_key_seq') AS v")
                    .fetch_one(&pool)
                    .await
                    .expect("router_core_key_seq sequence must exist");
                row.get::<i64, _>("v")
            })
        });
        Key(value as u64)
    }
}
