use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Maximum concurrent resource usage observed for a user on a calendar day,
/// split by RHEL and OpenShift qualification (component F's output, §3/§4.F).
/// One row per `(user, date)`; recomputation is idempotent and supersedes
/// prior values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrentUsage {
    pub user: String,
    pub date: NaiveDate,
    pub rhel_max_vcpu: i64,
    pub rhel_max_memory_mib: f64,
    pub rhel_max_instances: i64,
    pub openshift_max_vcpu: i64,
    pub openshift_max_memory_mib: f64,
    pub openshift_max_instances: i64,
}
