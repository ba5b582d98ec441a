use crate::db::LocalState;
use crate::errors::{SyncError, SyncResult};
use crate::models::{EntityKind, JsonMap, RecurrencePattern, RecurringTemplate, SyncConfig};
use crate::remote::RemoteStore;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Materializes recurring-task templates into concrete task instances once
/// per local calendar day. Idempotence is two-layered: a persisted last-run
/// date keeps the whole pass from repeating within a day, and each template's
/// `lastProcessedAt` watermark bounds materialization to one instance per
/// elapsed recurrence period.
///
/// Created tasks go through the remote store only; they become visible in
/// the local cache via the change feed like any other remote write, so cache
/// mutation stays single-pathed.
#[derive(Clone)]
pub struct RecurringTaskScheduler {
    remote: Arc<dyn RemoteStore>,
    local: Arc<LocalState>,
    user_id: String,
    config: SyncConfig,
}

impl RecurringTaskScheduler {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<LocalState>,
        user_id: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            remote,
            local,
            user_id: user_id.into(),
            config,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    async fn run_loop(self) {
        loop {
            let today = Local::now().date_naive();
            let already_ran = match self.local.last_run_date(&self.user_id) {
                Ok(marker) => marker == Some(today),
                Err(err) => {
                    tracing::warn!(%err, "could not read scheduler run marker");
                    false
                }
            };
            if !already_ran {
                match self.run_once(Utc::now()).await {
                    Ok(()) => {
                        // The marker advances even when individual templates
                        // failed: those are retried on the next daily run,
                        // not sooner.
                        if let Err(err) = self.local.set_last_run_date(&self.user_id, today) {
                            tracing::warn!(%err, "could not persist scheduler run marker");
                        }
                    }
                    Err(err) => {
                        // The pass never reached the templates; leave the
                        // marker alone so the next check retries today.
                        tracing::warn!(%err, "materialization pass did not run");
                    }
                }
            }
            sleep(self.config.scheduler_check_interval).await;
        }
    }

    /// One materialization pass over all templates. Template failures are
    /// logged and skipped; one broken template never aborts the others. An
    /// error means the template fetch itself failed and the pass processed
    /// nothing — callers must not count it as today's run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SyncResult<()> {
        let fetched = timeout(
            self.config.remote_timeout,
            self.remote.fetch_all(EntityKind::RecurringTemplate, &self.user_id),
        )
        .await;
        let records = match fetched {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                return Err(SyncError::Scheduler(format!(
                    "failed to fetch recurring templates: {err}"
                )));
            }
            Err(_) => {
                return Err(SyncError::Scheduler(
                    "fetching recurring templates timed out".to_string(),
                ));
            }
        };

        for record in records {
            let template: RecurringTemplate =
                match serde_json::from_value(serde_json::Value::Object(record)) {
                    Ok(template) => template,
                    Err(err) => {
                        tracing::warn!(%err, "skipping undecodable recurring template");
                        continue;
                    }
                };
            if let Err(err) = self.materialize(&template, now).await {
                tracing::warn!(
                    template_id = %template.id,
                    %err,
                    "template failed this run; retrying next day"
                );
            }
        }
        Ok(())
    }

    /// Create this period's task instance for `template` if its watermark
    /// says one is owed, then advance the watermark. The two remote calls are
    /// not atomic: if the watermark update fails after the create succeeded,
    /// the next run creates a duplicate for the period. At-least-once, by
    /// contract.
    async fn materialize(
        &self,
        template: &RecurringTemplate,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        if template.end_date.is_some_and(|end| end < now) {
            return Ok(());
        }
        if !due_for_materialization(template, now) {
            return Ok(());
        }

        let draft = task_draft(template, &self.user_id);
        self.bounded(self.remote.create(EntityKind::Task, draft))
            .await?;
        tracing::info!(template_id = %template.id, "materialized recurring task");

        let mut watermark = JsonMap::new();
        watermark.insert("lastProcessedAt".to_string(), json!(now.to_rfc3339()));
        self.bounded(
            self.remote
                .update(EntityKind::RecurringTemplate, &template.id, watermark),
        )
        .await?;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match timeout(self.config.remote_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SyncError::Scheduler(err.to_string())),
            Err(_) => Err(SyncError::Scheduler("remote call timed out".to_string())),
        }
    }
}

/// Does `template` owe a task instance at `now`? An unset watermark always
/// materializes the first occurrence; a watermark ahead of `now` never does
/// (the watermark is monotonic and is not moved backward).
///
/// Calendar-based patterns compare local dates, the same clock the daily run
/// marker uses, so "a new day" means the same thing in both places.
pub fn due_for_materialization(template: &RecurringTemplate, now: DateTime<Utc>) -> bool {
    let Some(last) = template.last_processed_at else {
        return true;
    };
    if last > now {
        return false;
    }
    let now_local = now.with_timezone(&Local);
    let last_local = last.with_timezone(&Local);
    match template.recurrence_pattern {
        RecurrencePattern::Daily => now_local.date_naive() != last_local.date_naive(),
        RecurrencePattern::Weekly => now - last >= ChronoDuration::days(7),
        RecurrencePattern::Monthly => {
            (now_local.year(), now_local.month()) != (last_local.year(), last_local.month())
        }
        RecurrencePattern::Custom { interval_days } => {
            now - last >= ChronoDuration::days(interval_days.max(1))
        }
    }
}

fn task_draft(template: &RecurringTemplate, user_id: &str) -> JsonMap {
    let mut draft = JsonMap::new();
    draft.insert("title".to_string(), json!(template.title));
    draft.insert("userId".to_string(), json!(user_id));
    draft.insert("priorityClass".to_string(), json!("later"));
    draft.insert("status".to_string(), json!("pending"));
    draft.insert("recurringTemplateId".to_string(), json!(template.id));
    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template(pattern: RecurrencePattern, last: Option<DateTime<Utc>>) -> RecurringTemplate {
        RecurringTemplate {
            id: "r1".to_string(),
            user_id: "u1".to_string(),
            title: "Weekly review".to_string(),
            recurrence_pattern: pattern,
            last_processed_at: last,
            end_date: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    #[test]
    fn unset_watermark_is_always_due() {
        for pattern in [
            RecurrencePattern::Daily,
            RecurrencePattern::Weekly,
            RecurrencePattern::Monthly,
            RecurrencePattern::Custom { interval_days: 3 },
        ] {
            assert!(due_for_materialization(&template(pattern, None), at(2026, 8, 28)));
        }
    }

    #[test]
    fn daily_is_due_once_per_calendar_date() {
        let yesterday = template(RecurrencePattern::Daily, Some(at(2026, 8, 27)));
        assert!(due_for_materialization(&yesterday, at(2026, 8, 28)));

        let today = template(RecurrencePattern::Daily, Some(at(2026, 8, 28)));
        assert!(!due_for_materialization(&today, at(2026, 8, 28)));
    }

    #[test]
    fn weekly_needs_seven_elapsed_days() {
        let six_days = template(RecurrencePattern::Weekly, Some(at(2026, 8, 22)));
        assert!(!due_for_materialization(&six_days, at(2026, 8, 28)));

        let seven_days = template(RecurrencePattern::Weekly, Some(at(2026, 8, 21)));
        assert!(due_for_materialization(&seven_days, at(2026, 8, 28)));
    }

    #[test]
    fn monthly_compares_month_and_year() {
        // Mid-month dates stay in the same month under any UTC offset.
        let last_month = template(RecurrencePattern::Monthly, Some(at(2026, 7, 15)));
        assert!(due_for_materialization(&last_month, at(2026, 8, 15)));

        let same_month = template(RecurrencePattern::Monthly, Some(at(2026, 8, 10)));
        assert!(!due_for_materialization(&same_month, at(2026, 8, 20)));

        let year_ago = template(RecurrencePattern::Monthly, Some(at(2025, 8, 28)));
        assert!(due_for_materialization(&year_ago, at(2026, 8, 28)));
    }

    #[test]
    fn custom_interval_counts_elapsed_days() {
        let pattern = RecurrencePattern::Custom { interval_days: 3 };
        let two_days = template(pattern, Some(at(2026, 8, 26)));
        assert!(!due_for_materialization(&two_days, at(2026, 8, 28)));

        let three_days = template(pattern, Some(at(2026, 8, 25)));
        assert!(due_for_materialization(&three_days, at(2026, 8, 28)));
    }

    #[test]
    fn future_watermark_is_never_due() {
        let ahead = template(RecurrencePattern::Daily, Some(at(2026, 8, 29)));
        assert!(!due_for_materialization(&ahead, at(2026, 8, 28)));
    }

    #[test]
    fn task_draft_references_template() {
        let draft = task_draft(&template(RecurrencePattern::Daily, None), "u1");
        assert_eq!(draft["recurringTemplateId"], "r1");
        assert_eq!(draft["title"], "Weekly review");
        assert_eq!(draft["status"], "pending");
    }
}
