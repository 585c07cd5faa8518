/// Durable engine listener
///
/// `PersistenceListener` turns engine lifecycle callbacks into rows in the
/// coordinator database. It is the only component that writes persistence on
/// behalf of a running workflow; everything written here is what `resume`
/// later rebuilds execution from.

use crate::{
    runtime::mail::{MailContent, MailHeader, SendMail},
    store::{queries, Store, WorkflowRow},
    workflow::types::{Listener, Params, TaskLogger, TaskState},
};
use async_trait::async_trait;
use minijinja::{context, Environment};
use std::sync::Arc;
use uuid::Uuid;

const STALL_TEMPLATE_NAME: &str = "scheduled_workflow_failure_email.txt";
const STALL_TEMPLATE: &str = include_str!("../../templates/scheduled_workflow_failure_email.txt");

/// Listener surface the worker needs on top of the engine contract
#[async_trait]
pub trait WorkflowListener: Listener {
    /// Record a new workflow instance; failure aborts the start
    async fn workflow_started(
        &self,
        workflow_id: Uuid,
        name: &str,
        params: &Params,
        schedule_id: Option<i64>,
    ) -> anyhow::Result<()>;

    /// Record the terminal state of one execution attempt
    async fn workflow_finished(
        &self,
        workflow_id: Uuid,
        outputs: Option<&Params>,
        error: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Listener backed by the coordinator store
pub struct PersistenceListener {
    store: Store,
    mail_header: MailHeader,
    send_mail: Option<SendMail>,
    base_url: String,
}

impl PersistenceListener {
    /// Listener that persists state but never sends mail
    pub fn new(store: Store) -> Self {
        Self {
            store,
            mail_header: MailHeader::default(),
            send_mail: None,
            base_url: String::new(),
        }
    }

    /// Send stall notifications for scheduled workflows with `send_mail`
    pub fn with_mail(mut self, header: MailHeader, send_mail: SendMail) -> Self {
        self.mail_header = header;
        self.send_mail = Some(send_mail);
        self
    }

    /// Base URL used for links in notifications
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn workflow_link(&self, id: Uuid) -> String {
        format!("{}/workflows/{}", self.base_url.trim_end_matches('/'), id)
    }

    fn render_stall_notice(&self, workflow: &WorkflowRow) -> anyhow::Result<MailContent> {
        let mut env = Environment::new();
        env.add_template(STALL_TEMPLATE_NAME, STALL_TEMPLATE)?;
        let body_text = env.get_template(STALL_TEMPLATE_NAME)?.render(context! {
            workflow => workflow,
            link => self.workflow_link(workflow.id),
        })?;
        Ok(MailContent {
            subject: format!("[relflow] Scheduled workflow {:?} failed", workflow.name),
            body_text,
        })
    }
}

#[async_trait]
impl Listener for PersistenceListener {
    async fn task_state_changed(&self, workflow_id: Uuid, task_name: &str, state: &TaskState) -> anyhow::Result<()> {
        tracing::debug!("💾 task_state_changed({}, {:?}, started={}, finished={})",
            workflow_id, task_name, state.started, state.finished);
        let result = state.result.as_ref().map(serde_json::to_string).transpose()?;

        let mut tx = self.store.begin().await?;
        queries::upsert_task(
            &mut *tx,
            workflow_id,
            task_name,
            state.started,
            state.finished,
            result.as_deref(),
            state.error.as_deref(),
            i64::from(state.retry_count),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    fn logger(&self, workflow_id: Uuid, task_name: &str) -> Arc<dyn TaskLogger> {
        Arc::new(StoreLogger {
            store: self.store.clone(),
            workflow_id,
            task_name: task_name.to_string(),
        })
    }

    async fn workflow_stalled(&self, workflow_id: Uuid) -> anyhow::Result<()> {
        let Some(send_mail) = &self.send_mail else {
            return Ok(());
        };
        let workflow = queries::workflow(self.store.pool(), workflow_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow {} not found", workflow_id))?;
        if workflow.schedule_id.is_none() {
            return Ok(());
        }

        let content = self.render_stall_notice(&workflow)?;
        tracing::info!("📧 Sending stall notification for scheduled workflow {} ({})", workflow.name, workflow_id);
        send_mail(&self.mail_header, &content)
    }
}

#[async_trait]
impl WorkflowListener for PersistenceListener {
    async fn workflow_started(
        &self,
        workflow_id: Uuid,
        name: &str,
        params: &Params,
        schedule_id: Option<i64>,
    ) -> anyhow::Result<()> {
        let params = serde_json::to_string(params)?;
        queries::create_workflow(self.store.pool(), workflow_id, name, &params, schedule_id).await?;
        tracing::info!("📝 Workflow {} ({}) recorded", name, workflow_id);
        Ok(())
    }

    async fn workflow_finished(
        &self,
        workflow_id: Uuid,
        outputs: Option<&Params>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let output = match outputs {
            Some(outputs) => serde_json::to_string(outputs)?,
            None => "{}".to_string(),
        };
        let updated = queries::workflow_finished(self.store.pool(), workflow_id, &output, error.unwrap_or_default()).await?;
        if updated == 0 {
            tracing::warn!("⚠️ workflow_finished({}) matched no workflow row", workflow_id);
        }
        tracing::info!("🏁 Workflow {} finished (error: {:?})", workflow_id, error);
        Ok(())
    }
}

/// Appends one `task_logs` row per message
struct StoreLogger {
    store: Store,
    workflow_id: Uuid,
    task_name: String,
}

#[async_trait]
impl TaskLogger for StoreLogger {
    async fn log(&self, body: String) {
        if let Err(e) = queries::create_task_log(self.store.pool(), self.workflow_id, &self.task_name, &body).await {
            tracing::error!("❌ create_task_log({}, {:?}, {:?}) failed: {}", self.workflow_id, self.task_name, body, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn stall_notice_names_workflow_and_links_to_it() {
        let store = Store::in_memory().await.unwrap();
        let listener = PersistenceListener::new(store).with_base_url("https://relflow.example/");
        let id = Uuid::new_v4();
        let row = WorkflowRow {
            id,
            name: "echo".into(),
            params: "{}".into(),
            output: "{}".into(),
            error: String::new(),
            finished: false,
            schedule_id: Some(7),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mail = listener.render_stall_notice(&row).unwrap();
        assert_eq!(mail.subject, "[relflow] Scheduled workflow \"echo\" failed");
        assert!(mail.body_text.contains(&format!("https://relflow.example/workflows/{}", id)));
        assert!(mail.body_text.contains("Schedule ID: 7"));
    }
}
