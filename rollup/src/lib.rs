//! The concurrency roll-up (component F): for a `(user, day)` pair, derive
//! the day's maximum concurrent RHEL/OpenShift vcpu, memory and instance
//! count from that user's runs, and upsert the result as a
//! [`ConcurrentUsage`] row (§4.F).
//!
//! No `original_source` file covers this at the right granularity — the
//! Python original computes concurrency inline in its reporting queries
//! rather than as a standalone pass. The algorithm here is the standard
//! sweep-line technique: evaluate concurrency only at the instants where it
//! can change (each run's start, since closes never increase a running
//! total at the moment they happen) and keep the maximum seen.

use chrono::{DateTime, NaiveDate, Utc};
use usage_shared::model::{ConcurrentUsage, MachineImage, Run};
use usage_shared::store::Store;

/// One run paired with the resource shape a qualifying image contributes,
/// already resolved so the sweep itself never has to reach back into a
/// store.
struct Contribution {
    run: Run,
    rhel: bool,
    openshift: bool,
}

/// Computes the day's maximum concurrent usage from `runs`, each paired
/// with the `MachineImage` it's bound to (or `None` if the instance's
/// image is still unknown — such a run counts toward instance totals but
/// never toward a qualified vcpu/memory sum, since it doesn't qualify as
/// either rhel or openshift).
///
/// `day` is a calendar date in the user's effective timezone, which this
/// implementation treats as UTC (§4.F's declared default, and the only
/// timezone any of this system's inputs are ever expressed in — see
/// DESIGN.md for why no timezone-conversion crate is pulled in for this).
pub fn compute(user: &str, day: NaiveDate, runs: Vec<(Run, Option<MachineImage>)>) -> ConcurrentUsage {
    let day_start = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
    let day_end = day_start + chrono::Duration::days(1);

    let contributions: Vec<Contribution> = runs
        .into_iter()
        .filter(|(run, _)| run.start_time < day_end && run.end_time.map_or(true, |end| end > day_start))
        .map(|(run, image)| Contribution {
            rhel: image.as_ref().is_some_and(MachineImage::rhel),
            openshift: image.as_ref().is_some_and(MachineImage::openshift),
            run,
        })
        .collect();

    // Concurrency only ever increases at a run's start, so the candidate
    // instants are exactly the starts that fall inside the day, clamped to
    // the day's opening instant for runs that started earlier and are
    // still open at day start.
    let mut instants: Vec<DateTime<Utc>> = contributions
        .iter()
        .map(|c| c.run.start_time.max(day_start))
        .collect();
    instants.sort();
    instants.dedup();

    let mut usage = ConcurrentUsage {
        user: user.to_string(),
        date: day,
        ..Default::default()
    };

    for instant in instants {
        let mut rhel_vcpu = 0i64;
        let mut rhel_memory = 0f64;
        let mut rhel_instances = 0i64;
        let mut openshift_vcpu = 0i64;
        let mut openshift_memory = 0f64;
        let mut openshift_instances = 0i64;

        for c in &contributions {
            if !c.run.covers_at(instant, day_end) {
                continue;
            }
            if c.rhel {
                rhel_instances += 1;
                if let Some(vcpu) = c.run.vcpu {
                    rhel_vcpu += vcpu as i64;
                }
                if let Some(mem) = c.run.memory_mib {
                    rhel_memory += mem;
                }
            }
            if c.openshift {
                openshift_instances += 1;
                if let Some(vcpu) = c.run.vcpu {
                    openshift_vcpu += vcpu as i64;
                }
                if let Some(mem) = c.run.memory_mib {
                    openshift_memory += mem;
                }
            }
        }

        usage.rhel_max_vcpu = usage.rhel_max_vcpu.max(rhel_vcpu);
        usage.rhel_max_memory_mib = usage.rhel_max_memory_mib.max(rhel_memory);
        usage.rhel_max_instances = usage.rhel_max_instances.max(rhel_instances);
        usage.openshift_max_vcpu = usage.openshift_max_vcpu.max(openshift_vcpu);
        usage.openshift_max_memory_mib = usage.openshift_max_memory_mib.max(openshift_memory);
        usage.openshift_max_instances = usage.openshift_max_instances.max(openshift_instances);
    }

    usage
}

/// Loads `user`'s runs for `day`, computes the roll-up and upserts it
/// (§4.F). Safe to call repeatedly for the same `(user, day)`: the result
/// is a pure function of the stored runs and always supersedes whatever
/// was there before.
pub async fn roll_up_day(
    store: &dyn Store,
    user: &str,
    day: NaiveDate,
) -> Result<ConcurrentUsage, usage_shared::error::UsageError> {
    let runs = store.load_runs_for_day(user, day).await?;
    let usage = compute(user, day, runs);
    store.save_concurrent_usage(usage.clone()).await?;
    Ok(usage)
}

/// Rolls up every user with activity on `day` (§10.6: a periodic sweep
/// needs somewhere to start from rather than an externally supplied user
/// list).
pub async fn roll_up_all_users(
    store: &dyn Store,
    day: NaiveDate,
) -> Result<u32, usage_shared::error::UsageError> {
    let users = store.load_distinct_users_active_on(day).await?;
    let mut count = 0;
    for user in users {
        roll_up_day(store, &user, day).await?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use usage_shared::model::{CloudType, ImagePlatform, ImageStatus};
    use uuid::Uuid;

    fn rhel_image() -> MachineImage {
        MachineImage {
            id: Uuid::new_v4(),
            cloud_type: CloudType::Aws,
            cloud_image_id: "ami-rhel".to_string(),
            name: None,
            owner_cloud_account_id: None,
            platform: ImagePlatform::None,
            status: ImageStatus::Inspected,
            inspection_json: None,
            rhel_detected_by_tag: true,
            openshift_detected: false,
            rhel_challenged: false,
            openshift_challenged: false,
            is_encrypted: false,
            is_marketplace: false,
            is_cloud_access: false,
            inspection_attempts: 0,
            openshift_tag_applied_at: None,
            discovered_at: chrono::DateTime::UNIX_EPOCH,
        }
    }

    fn openshift_image() -> MachineImage {
        MachineImage {
            openshift_detected: true,
            rhel_detected_by_tag: false,
            cloud_image_id: "ami-ocp".to_string(),
            ..rhel_image()
        }
    }

    fn run(start: &str, end: Option<&str>, vcpu: i32, memory_mib: f64) -> Run {
        Run {
            instance_id: Uuid::new_v4(),
            start_time: start.parse().unwrap(),
            end_time: end.map(|e| e.parse().unwrap()),
            image_ref: None,
            instance_type: Some("m5.large".to_string()),
            memory_mib: Some(memory_mib),
            vcpu: Some(vcpu),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn two_overlapping_rhel_runs_sum_at_their_overlap() {
        let runs = vec![
            (run("2024-03-15T01:00:00Z", Some("2024-03-15T05:00:00Z"), 4, 16384.0), Some(rhel_image())),
            (run("2024-03-15T03:00:00Z", Some("2024-03-15T07:00:00Z"), 2, 8192.0), Some(rhel_image())),
        ];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_vcpu, 6);
        assert_eq!(usage.rhel_max_memory_mib, 24576.0);
        assert_eq!(usage.rhel_max_instances, 2);
        assert_eq!(usage.openshift_max_instances, 0);
    }

    #[test]
    fn non_overlapping_runs_never_sum() {
        let runs = vec![
            (run("2024-03-15T01:00:00Z", Some("2024-03-15T02:00:00Z"), 4, 16384.0), Some(rhel_image())),
            (run("2024-03-15T03:00:00Z", Some("2024-03-15T04:00:00Z"), 8, 32768.0), Some(rhel_image())),
        ];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_vcpu, 8);
        assert_eq!(usage.rhel_max_instances, 1);
    }

    #[test]
    fn rhel_and_openshift_are_tallied_independently() {
        let runs = vec![
            (run("2024-03-15T01:00:00Z", Some("2024-03-15T05:00:00Z"), 4, 16384.0), Some(rhel_image())),
            (run("2024-03-15T01:00:00Z", Some("2024-03-15T05:00:00Z"), 2, 8192.0), Some(openshift_image())),
        ];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_vcpu, 4);
        assert_eq!(usage.openshift_max_vcpu, 2);
    }

    #[test]
    fn open_run_contributes_through_the_end_of_the_day() {
        let runs = vec![(run("2024-03-15T23:00:00Z", None, 4, 16384.0), Some(rhel_image()))];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_instances, 1);
        assert_eq!(usage.rhel_max_vcpu, 4);
    }

    #[test]
    fn run_starting_before_the_day_is_still_counted_from_day_start() {
        let runs = vec![(
            run("2024-03-14T12:00:00Z", Some("2024-03-15T12:00:00Z"), 4, 16384.0),
            Some(rhel_image()),
        )];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_instances, 1);
    }

    #[test]
    fn run_entirely_outside_the_day_is_excluded() {
        let runs = vec![(
            run("2024-03-10T00:00:00Z", Some("2024-03-10T05:00:00Z"), 4, 16384.0),
            Some(rhel_image()),
        )];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_instances, 0);
        assert_eq!(usage.rhel_max_vcpu, 0);
    }

    #[test]
    fn instance_with_unknown_image_counts_toward_neither_rhel_nor_openshift() {
        let runs = vec![(run("2024-03-15T01:00:00Z", Some("2024-03-15T05:00:00Z"), 4, 16384.0), None)];
        let usage = compute("alice", day(), runs);
        assert_eq!(usage.rhel_max_instances, 0);
        assert_eq!(usage.openshift_max_instances, 0);
    }

    #[test]
    fn recomputation_is_idempotent() {
        let runs = vec![(run("2024-03-15T01:00:00Z", Some("2024-03-15T05:00:00Z"), 4, 16384.0), Some(rhel_image()))];
        let first = compute("alice", day(), runs.clone());
        let second = compute("alice", day(), runs);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn roll_up_day_loads_computes_and_saves() {
        let mut store = usage_shared::store::MockStore::new();
        store.expect_load_runs_for_day().returning(|_, _| {
            Ok(vec![(run("2024-03-15T01:00:00Z", Some("2024-03-15T05:00:00Z"), 4, 16384.0), Some(rhel_image()))])
        });
        store
            .expect_save_concurrent_usage()
            .withf(|usage| usage.user == "alice" && usage.rhel_max_vcpu == 4)
            .returning(|_| Ok(()));

        let usage = roll_up_day(&store, "alice", day()).await.unwrap();
        assert_eq!(usage.rhel_max_vcpu, 4);
    }

    #[tokio::test]
    async fn roll_up_all_users_rolls_up_every_active_user() {
        let mut store = usage_shared::store::MockStore::new();
        store
            .expect_load_distinct_users_active_on()
            .returning(|_| Ok(vec!["alice".to_string(), "bob".to_string()]));
        store.expect_load_runs_for_day().returning(|_, _| Ok(vec![]));
        store.expect_save_concurrent_usage().returning(|_| Ok(()));

        let count = roll_up_all_users(&store, day()).await.unwrap();
        assert_eq!(count, 2);
    }
}
