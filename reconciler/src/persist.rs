//! The thin persistence adapter around [`crate::reconcile`]: load under a
//! watermark, merge, recompute, delete-and-insert under the instance lock
//! that `Store::replace_runs_from_watermark` is expected to take (§4.D
//! step 5, §5, §9).

use crate::{fast_path_append, is_fast_appendable, reconcile};
use usage_shared::error::UsageError;
use usage_shared::model::{Account, AccountId, InstanceEvent, InstanceId, Run};
use usage_shared::store::Store;

/// Recomputes and persists runs for `instance_id` given a freshly-arrived
/// batch of events, following §4.D's recompute algorithm: events earlier
/// than `account.created_at` are dropped before anything else runs (§8.5),
/// then the fast path is tried before falling back to a full
/// watermark-anchored recompute.
pub async fn reconcile_and_persist(
    store: &dyn Store,
    account: &Account,
    instance_id: InstanceId,
    new_events: Vec<InstanceEvent>,
) -> Result<Vec<Run>, UsageError> {
    let filtered = crate::filter_since_account_created(&new_events, account.event_watermark());
    if filtered.is_empty() {
        return store.load_runs_for_instance(instance_id).await;
    }

    store.append_events(filtered.clone()).await?;

    let existing_runs = store.load_runs_for_instance(instance_id).await?;
    if is_fast_appendable(&existing_runs, &filtered) {
        let runs = fast_path_append(&existing_runs, &filtered);
        store
            .replace_runs_from_watermark(instance_id, account.event_watermark(), runs.clone())
            .await?;
        return Ok(runs);
    }

    let earliest_affected_run_start = existing_runs.iter().map(|r| r.start_time).min();
    let earliest_batch = filtered
        .iter()
        .map(|e| e.occurred_at)
        .min()
        .expect("checked non-empty above");
    let watermark = match earliest_affected_run_start {
        Some(run_start) => earliest_batch.min(run_start),
        None => earliest_batch,
    };
    let since = watermark.max(account.event_watermark());

    let anchor = store.load_anchor_event(instance_id, since).await?;
    // `filtered` is already durable at this point (the `append_events` call
    // above), so `load_events_since` already returns it as part of the
    // instance's history — extending with it again would double-count every
    // batch event.
    let mut history = store.load_events_since(instance_id, since).await?;
    history.extend(anchor);

    let runs = reconcile(instance_id, &history).map_err(UsageError::from)?;
    store
        .replace_runs_from_watermark(instance_id, since, runs.clone())
        .await?;
    Ok(runs)
}

/// One unit of work handed to a reconciler consumer: a batch of freshly
/// normalized events for a single instance, keyed the way §5 assigns event
/// work to the queue (`(account_id, instance_id)`).
#[derive(Clone, Debug, PartialEq)]
pub struct ReconciliationWork {
    pub account_id: AccountId,
    pub instance_id: InstanceId,
    pub events: Vec<InstanceEvent>,
}

/// Looks up the owning account and runs [`reconcile_and_persist`] — the
/// call a queue consumer makes per received message.
pub async fn process_reconciliation_work(
    store: &dyn Store,
    work: ReconciliationWork,
) -> Result<Vec<Run>, UsageError> {
    let account = store.get_account(work.account_id).await?;
    reconcile_and_persist(store, &account, work.instance_id, work.events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use usage_shared::model::{CloudType, EventType};
    use usage_shared::store::MockStore;
    use uuid::Uuid;

    fn t(hour: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::hours(hour)
    }

    fn test_account() -> Account {
        Account {
            id: Uuid::new_v4(),
            cloud_type: CloudType::Aws,
            cloud_account_id: "123456789012".to_string(),
            user: "alice".to_string(),
            arn_or_subscription: "arn:aws:iam::123456789012:role/x".to_string(),
            created_at: t(0),
            enabled_at: Some(t(0)),
        }
    }

    fn ev(instance_id: InstanceId, hour: i64, event_type: EventType, sequence: u64) -> InstanceEvent {
        InstanceEvent {
            instance_id,
            occurred_at: t(hour),
            event_type,
            instance_type: None,
            subnet: None,
            image_ref: None,
            sequence,
        }
    }

    #[tokio::test]
    async fn drops_events_before_account_creation_without_touching_the_store() {
        let account = test_account();
        let instance_id = Uuid::new_v4();
        let mut store = MockStore::new();
        store.expect_append_events().times(0);
        store
            .expect_load_runs_for_instance()
            .times(1)
            .returning(|_| Ok(vec![]));
        let events = vec![ev(instance_id, -5, EventType::PowerOn, 0)];

        let result = reconcile_and_persist(&store, &account, instance_id, events)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn fast_path_appends_open_run_and_persists_from_account_watermark() {
        let account = test_account();
        let instance_id = Uuid::new_v4();
        let mut store = MockStore::new();
        store
            .expect_append_events()
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_load_runs_for_instance()
            .times(1)
            .returning(|_| Ok(vec![]));
        store
            .expect_replace_runs_from_watermark()
            .withf(move |id, watermark, runs| {
                *id == instance_id && *watermark == t(0) && runs.len() == 1
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let events = vec![ev(instance_id, 2, EventType::PowerOn, 0)];
        let result = reconcile_and_persist(&store, &account, instance_id, events)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].is_open());
    }

    /// Regression test for a batch that forces the slow (full-recompute)
    /// path: `load_events_since` is mocked to behave like the real store
    /// would post-`append_events`, i.e. it already includes the
    /// just-appended batch. An `attribute_change` counted twice would split
    /// the run into two pieces at the identical timestamp, producing a run
    /// with `start_time == end_time`.
    #[tokio::test]
    async fn slow_path_does_not_double_count_the_appended_batch() {
        let account = test_account();
        let instance_id = Uuid::new_v4();
        let existing_open_run = Run {
            instance_id,
            start_time: t(1),
            end_time: None,
            image_ref: None,
            instance_type: Some("t2.micro".to_string()),
            memory_mib: None,
            vcpu: None,
        };
        let batch = vec![ev(instance_id, 3, EventType::AttributeChange, 0)];

        let mut store = MockStore::new();
        store.expect_append_events().times(1).returning(|_| Ok(()));
        store
            .expect_load_runs_for_instance()
            .times(1)
            .returning(move |_| Ok(vec![existing_open_run.clone()]));
        store
            .expect_load_anchor_event()
            .returning(move |_, _| Ok(Some(ev(instance_id, 1, EventType::PowerOn, 0))));
        // Simulates the real store: the batch is already durable by the
        // time this is called, so it is already present in this result.
        store.expect_load_events_since().returning(move |_, _| {
            Ok(vec![
                ev(instance_id, 1, EventType::PowerOn, 0),
                ev(instance_id, 3, EventType::AttributeChange, 0),
            ])
        });
        store
            .expect_replace_runs_from_watermark()
            .returning(|_, _, _| Ok(()));

        let runs = reconcile_and_persist(&store, &account, instance_id, batch)
            .await
            .unwrap();
        let mut runs = runs;
        runs.sort_by_key(|r| r.start_time);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].start_time, runs[0].end_time), (t(1), Some(t(3))));
        assert!(runs[1].is_open());
        assert_eq!(runs[1].start_time, t(3));
        for r in &runs {
            if let Some(end) = r.end_time {
                assert!(end > r.start_time, "run {r:?} has end_time <= start_time");
            }
        }
    }

    #[tokio::test]
    async fn process_reconciliation_work_looks_up_the_account_and_reconciles() {
        let account = test_account();
        let account_id = account.id;
        let instance_id = Uuid::new_v4();
        let mut store = MockStore::new();
        store
            .expect_get_account()
            .withf(move |id| *id == account_id)
            .times(1)
            .returning(move |_| Ok(account.clone()));
        store.expect_append_events().times(1).returning(|_| Ok(()));
        store
            .expect_load_runs_for_instance()
            .times(1)
            .returning(|_| Ok(vec![]));
        store
            .expect_replace_runs_from_watermark()
            .returning(|_, _, _| Ok(()));

        let work = ReconciliationWork {
            account_id,
            instance_id,
            events: vec![ev(instance_id, 2, EventType::PowerOn, 0)],
        };
        let runs = process_reconciliation_work(&store, work).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].is_open());
    }
}
