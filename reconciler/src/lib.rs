//! The run reconciler (component D): a pure function turning an instance's
//! ordered event history into a set of disjoint runs, plus a thin adapter
//! that anchors the pure function on a stored watermark (§4.D, §9).
//!
//! The algorithm in [`reconcile`] has no I/O and no async — that's
//! deliberate, so §8's invariants are unit-testable without a runtime
//! (mirrors `agent/src/util/slot_reconciliation.rs`'s `reconcile_slots`,
//! which is likewise a pure slice-in/slice-out function wrapped by an
//! async caller that owns the actual device state).

mod error;
mod persist;

pub use error::ReconcileError;
pub use persist::{process_reconciliation_work, reconcile_and_persist, ReconciliationWork};

use usage_shared::model::{EventType, InstanceEvent, InstanceId, InstanceTypeDefinition, Run};

#[derive(Clone, Debug)]
struct OpenRun {
    start_time: chrono::DateTime<chrono::Utc>,
    image_ref: Option<usage_shared::model::ImageId>,
}

/// Drops every event with `occurred_at < account_created_at` (§3, §8.5): the
/// mechanical precondition the reconciler applies before walking history,
/// not an edge case.
pub fn filter_since_account_created(
    events: &[InstanceEvent],
    account_created_at: chrono::DateTime<chrono::Utc>,
) -> Vec<InstanceEvent> {
    events
        .iter()
        .filter(|e| e.occurred_at >= account_created_at)
        .cloned()
        .collect()
}

/// Recomputes the full set of runs for one instance from its event history.
///
/// `history` need not already be sorted; this function sorts it internally
/// by [`InstanceEvent::order_key`] (occurred_at ascending, `sequence` breaks
/// ties) so that the result depends only on the multiset of events, never
/// on the order the caller happened to supply them in (§8 property 4).
pub fn reconcile(
    instance_id: InstanceId,
    history: &[InstanceEvent],
) -> Result<Vec<Run>, ReconcileError> {
    let mut sorted: Vec<&InstanceEvent> = history.iter().collect();
    sorted.sort_by_key(|e| e.order_key());

    let mut runs: Vec<(OpenRun, Option<chrono::DateTime<chrono::Utc>>)> = Vec::new();
    let mut open: Option<OpenRun> = None;

    for event in &sorted {
        match event.event_type {
            EventType::PowerOn => match open.as_mut() {
                None => {
                    open = Some(OpenRun {
                        start_time: event.occurred_at,
                        image_ref: event.image_ref,
                    });
                }
                Some(state) => {
                    // Duplicate start (rule 3): the earliest start_time in
                    // the contiguous chain already anchors `state`, since
                    // we walk in occurred_at order and only open a run on
                    // the first power_on of a chain. Absorb this one,
                    // still checking image consistency.
                    check_image_consistency(instance_id, state, event)?;
                }
            },
            EventType::PowerOff => {
                if let Some(state) = open.take() {
                    runs.push((state, Some(event.occurred_at)));
                }
                // else: power_off with no preceding unmatched power_on is
                // ignored for run construction (rule 4).
            }
            EventType::AttributeChange => {
                if let Some(state) = open.as_mut() {
                    check_image_consistency(instance_id, state, event)?;
                    let image_ref = state.image_ref;
                    let closing = OpenRun {
                        start_time: state.start_time,
                        image_ref,
                    };
                    runs.push((closing, Some(event.occurred_at)));
                    *state = OpenRun {
                        start_time: event.occurred_at,
                        image_ref,
                    };
                }
                // attribute_change with no open run neither starts nor
                // ends anything (rule 5).
            }
        }
    }
    if let Some(state) = open {
        runs.push((state, None));
    }

    let history_owned: Vec<InstanceEvent> = sorted.into_iter().cloned().collect();
    Ok(runs
        .into_iter()
        .map(|(state, end_time)| {
            let instance_type = resolve_instance_type(&history_owned, state.start_time);
            if instance_type.is_none() {
                log::warn!(
                    "instance {instance_id}: run starting {} has no resolvable instance_type",
                    state.start_time
                );
            }
            Run {
                instance_id,
                start_time: state.start_time,
                end_time,
                image_ref: state.image_ref,
                instance_type,
                memory_mib: None,
                vcpu: None,
            }
        })
        .collect())
}

fn check_image_consistency(
    instance_id: InstanceId,
    state: &mut OpenRun,
    event: &InstanceEvent,
) -> Result<(), ReconcileError> {
    let Some(incoming) = event.image_ref else {
        return Ok(());
    };
    match state.image_ref {
        Some(existing) if existing != incoming => Err(ReconcileError::ImageChangedMidRun {
            instance_id,
            at: event.occurred_at,
        }),
        Some(_) => Ok(()),
        None => {
            state.image_ref = Some(incoming);
            Ok(())
        }
    }
}

/// Attribute inheritance (§4.D): the most recent event at or before
/// `start_time` carrying an `instance_type`; failing that, the next event
/// strictly after `start_time` that carries one; failing that, `None`.
/// Search spans the *entire* history, not just the run's own events —
/// S5 requires a later open run to inherit a type set by an earlier run's
/// starting event.
fn resolve_instance_type(
    history: &[InstanceEvent],
    start_time: chrono::DateTime<chrono::Utc>,
) -> Option<String> {
    history
        .iter()
        .filter(|e| e.occurred_at <= start_time && e.instance_type.is_some())
        .max_by_key(|e| e.order_key())
        .or_else(|| {
            history
                .iter()
                .filter(|e| e.occurred_at > start_time && e.instance_type.is_some())
                .min_by_key(|e| e.order_key())
        })
        .and_then(|e| e.instance_type.clone())
}

/// Whether a new batch can skip a full recompute (§4.D "fast path"):
/// every batch event must be `power_on` and occur strictly after every
/// existing run's start_time.
pub fn is_fast_appendable(existing_runs: &[Run], batch: &[InstanceEvent]) -> bool {
    if batch.is_empty() {
        return false;
    }
    let all_power_on = batch.iter().all(|e| e.event_type == EventType::PowerOn);
    if !all_power_on {
        return false;
    }
    let latest_existing_start = existing_runs.iter().map(|r| r.start_time).max();
    let earliest_batch = batch.iter().map(|e| e.occurred_at).min().unwrap();
    match latest_existing_start {
        Some(latest) => earliest_batch > latest,
        None => true,
    }
}

/// Applies the fast path itself: if an open run already exists, the batch
/// is a pure duplicate-start absorption (a no-op, earliest already
/// recorded); otherwise a single new open run is appended starting at the
/// earliest batch event. Caller must have already checked
/// [`is_fast_appendable`].
pub fn fast_path_append(existing_runs: &[Run], batch: &[InstanceEvent]) -> Vec<Run> {
    let has_open = existing_runs.iter().any(Run::is_open);
    if has_open {
        return existing_runs.to_vec();
    }
    let earliest = batch
        .iter()
        .min_by_key(|e| e.order_key())
        .expect("fast_path_append called with empty batch");
    let mut result = existing_runs.to_vec();
    result.push(Run {
        instance_id: earliest.instance_id,
        start_time: earliest.occurred_at,
        end_time: None,
        image_ref: earliest.image_ref,
        instance_type: earliest.instance_type.clone(),
        memory_mib: None,
        vcpu: None,
    });
    result
}

/// Fills `vcpu`/`memory_mib` from the process-wide instance-type cache,
/// leaving runs whose `instance_type` has no matching definition untouched
/// (they keep contributing to instance counts in the roll-up but not to
/// vcpu/memory sums, per §4.F).
pub fn enrich_with_instance_types(
    runs: Vec<Run>,
    defs: &[InstanceTypeDefinition],
) -> Vec<Run> {
    runs.into_iter()
        .map(|mut run| {
            if let Some(instance_type) = run.instance_type.as_deref() {
                if let Some(def) = defs.iter().find(|d| {
                    d.instance_type == instance_type
                }) {
                    run.vcpu = Some(def.vcpu);
                    run.memory_mib = Some(def.memory_mib);
                }
            }
            run
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use usage_shared::model::ImageId;
    use uuid::Uuid;

    fn t(hour: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::hours(hour)
    }

    fn ev(
        instance_id: InstanceId,
        occurred_at: DateTime<Utc>,
        event_type: EventType,
        sequence: u64,
    ) -> InstanceEvent {
        InstanceEvent {
            instance_id,
            occurred_at,
            event_type,
            instance_type: None,
            subnet: None,
            image_ref: None,
            sequence,
        }
    }

    fn with_type(mut e: InstanceEvent, instance_type: &str) -> InstanceEvent {
        e.instance_type = Some(instance_type.to_string());
        e
    }

    fn with_image(mut e: InstanceEvent, image_ref: ImageId) -> InstanceEvent {
        e.image_ref = Some(image_ref);
        e
    }

    #[test]
    fn s1_paired_events() {
        let id = Uuid::new_v4();
        let history = vec![
            ev(id, t(2), EventType::PowerOn, 0),
            ev(id, t(3), EventType::PowerOff, 1),
        ];
        let runs = reconcile(id, &history).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_time, t(2));
        assert_eq!(runs[0].end_time, Some(t(3)));
    }

    #[test]
    fn s2_duplicate_start() {
        let id = Uuid::new_v4();
        let history = vec![
            ev(id, t(2), EventType::PowerOn, 0),
            ev(id, t(5), EventType::PowerOn, 1),
        ];
        let runs = reconcile(id, &history).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_time, t(2));
        assert!(runs[0].is_open());
    }

    #[test]
    fn s3_out_of_order_arrival() {
        let id = Uuid::new_v4();
        // Ingest order differs from occurred_at order; sequence reflects
        // the (irrelevant, since occurred_at differs for every event here)
        // insertion order.
        let history = vec![
            ev(id, t(2), EventType::PowerOn, 0),
            ev(id, t(7), EventType::PowerOff, 1),
            ev(id, t(5), EventType::PowerOn, 2),
            ev(id, t(3), EventType::PowerOff, 3),
        ];
        let mut runs = reconcile(id, &history).unwrap();
        runs.sort_by_key(|r| r.start_time);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].start_time, runs[0].end_time), (t(2), Some(t(3))));
        assert_eq!((runs[1].start_time, runs[1].end_time), (t(5), Some(t(7))));
    }

    #[test]
    fn s4_two_instances_are_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let history_a = vec![
            ev(a, t(1), EventType::PowerOn, 0),
            ev(a, t(4), EventType::PowerOff, 1),
            ev(a, t(7), EventType::PowerOn, 2),
            ev(a, t(16), EventType::PowerOff, 3),
        ];
        let history_b = vec![
            ev(b, t(2), EventType::PowerOn, 0),
            ev(b, t(8), EventType::PowerOff, 1),
        ];
        assert_eq!(reconcile(a, &history_a).unwrap().len(), 2);
        assert_eq!(reconcile(b, &history_b).unwrap().len(), 1);
    }

    #[test]
    fn s5_type_inheritance() {
        let id = Uuid::new_v4();
        let history = vec![
            with_type(ev(id, t(2), EventType::PowerOn, 0), "t2.micro"),
            ev(id, t(3), EventType::PowerOff, 1),
            ev(id, t(5), EventType::PowerOn, 2),
        ];
        let mut runs = reconcile(id, &history).unwrap();
        runs.sort_by_key(|r| r.start_time);
        assert_eq!(runs[0].instance_type.as_deref(), Some("t2.micro"));
        assert_eq!(runs[1].instance_type.as_deref(), Some("t2.micro"));
        assert!(runs[1].is_open());
    }

    #[test]
    fn s6_image_change_mid_run_rejected() {
        let id = Uuid::new_v4();
        let image_a = Uuid::new_v4();
        let image_b = Uuid::new_v4();
        let history = vec![
            with_image(ev(id, t(1), EventType::PowerOn, 0), image_a),
            with_image(ev(id, t(2), EventType::PowerOn, 1), image_b),
            ev(id, t(3), EventType::PowerOff, 2),
        ];
        let err = reconcile(id, &history).unwrap_err();
        assert!(matches!(err, ReconcileError::ImageChangedMidRun { .. }));
    }

    #[test]
    fn attribute_change_partitions_a_run_without_closing_it() {
        let id = Uuid::new_v4();
        let history = vec![
            with_type(ev(id, t(1), EventType::PowerOn, 0), "t2.micro"),
            with_type(ev(id, t(3), EventType::AttributeChange, 1), "t2.large"),
            ev(id, t(5), EventType::PowerOff, 2),
        ];
        let mut runs = reconcile(id, &history).unwrap();
        runs.sort_by_key(|r| r.start_time);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].start_time, runs[0].end_time), (t(1), Some(t(3))));
        assert_eq!((runs[1].start_time, runs[1].end_time), (t(3), Some(t(5))));
        assert_eq!(runs[0].instance_type.as_deref(), Some("t2.micro"));
        assert_eq!(runs[1].instance_type.as_deref(), Some("t2.large"));
    }

    #[test]
    fn power_off_without_open_run_is_ignored() {
        let id = Uuid::new_v4();
        let history = vec![
            ev(id, t(2), EventType::PowerOff, 0),
            ev(id, t(3), EventType::PowerOn, 1),
            ev(id, t(4), EventType::PowerOff, 2),
        ];
        let runs = reconcile(id, &history).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_time, t(3));
    }

    #[test]
    fn idempotent_reconciliation() {
        let id = Uuid::new_v4();
        let history = vec![
            ev(id, t(2), EventType::PowerOn, 0),
            ev(id, t(7), EventType::PowerOff, 1),
            ev(id, t(5), EventType::PowerOn, 2),
            ev(id, t(3), EventType::PowerOff, 3),
        ];
        let once = reconcile(id, &history).unwrap();
        let twice = reconcile(id, &history).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn order_independence() {
        let id = Uuid::new_v4();
        let forward = vec![
            ev(id, t(2), EventType::PowerOn, 0),
            ev(id, t(3), EventType::PowerOff, 1),
            ev(id, t(5), EventType::PowerOn, 2),
            ev(id, t(7), EventType::PowerOff, 3),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        let mut a = reconcile(id, &forward).unwrap();
        let mut b = reconcile(id, &reversed).unwrap();
        a.sort_by_key(|r| r.start_time);
        b.sort_by_key(|r| r.start_time);
        assert_eq!(a, b);
    }

    #[test]
    fn run_disjointness_holds_across_seed_scenarios() {
        let id = Uuid::new_v4();
        let history = vec![
            ev(id, t(1), EventType::PowerOn, 0),
            ev(id, t(4), EventType::PowerOff, 1),
            ev(id, t(7), EventType::PowerOn, 2),
            ev(id, t(16), EventType::PowerOff, 3),
        ];
        let runs = reconcile(id, &history).unwrap();
        for (i, r1) in runs.iter().enumerate() {
            for r2 in runs.iter().skip(i + 1) {
                assert!(!r1.overlaps(r2), "{r1:?} overlaps {r2:?}");
            }
        }
    }

    #[test]
    fn fast_path_drops_duplicate_start_when_open_run_exists() {
        let id = Uuid::new_v4();
        let existing = vec![Run {
            instance_id: id,
            start_time: t(2),
            end_time: None,
            image_ref: None,
            instance_type: None,
            memory_mib: None,
            vcpu: None,
        }];
        let batch = vec![ev(id, t(5), EventType::PowerOn, 1)];
        assert!(is_fast_appendable(&existing, &batch));
        let result = fast_path_append(&existing, &batch);
        assert_eq!(result, existing);
    }

    #[test]
    fn fast_path_appends_new_open_run_when_none_exists() {
        let id = Uuid::new_v4();
        let existing = vec![Run {
            instance_id: id,
            start_time: t(1),
            end_time: Some(t(2)),
            image_ref: None,
            instance_type: None,
            memory_mib: None,
            vcpu: None,
        }];
        let batch = vec![ev(id, t(5), EventType::PowerOn, 1)];
        assert!(is_fast_appendable(&existing, &batch));
        let result = fast_path_append(&existing, &batch);
        assert_eq!(result.len(), 2);
        assert!(result[1].is_open());
        assert_eq!(result[1].start_time, t(5));
    }

    #[test]
    fn fast_path_not_applicable_when_batch_precedes_existing_run() {
        let id = Uuid::new_v4();
        let existing = vec![Run {
            instance_id: id,
            start_time: t(5),
            end_time: None,
            image_ref: None,
            instance_type: None,
            memory_mib: None,
            vcpu: None,
        }];
        let batch = vec![ev(id, t(1), EventType::PowerOn, 1)];
        assert!(!is_fast_appendable(&existing, &batch));
    }

    #[test]
    fn pre_account_cutoff_drops_earlier_events() {
        let id = Uuid::new_v4();
        let history = vec![
            ev(id, t(-10), EventType::PowerOn, 0),
            ev(id, t(2), EventType::PowerOn, 1),
            ev(id, t(3), EventType::PowerOff, 2),
        ];
        let filtered = filter_since_account_created(&history, t(0));
        assert_eq!(filtered.len(), 2);
        let runs = reconcile(id, &filtered).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_time, t(2));
    }
}
