//! Retention policy evaluation for finished jobs.

use chrono::{DateTime, Utc};

use jobkeeper_core::{JobId, KeepJobs};

/// Pick the finished jobs to delete after `settled` reaches a terminal state
/// under `policy`.
///
/// `Remove` only ever deletes `settled` itself. `Retain` trims the whole
/// terminal set by age and count. `finished` holds `(id, finished_on)` for
/// every job in that set; its order does not matter and the count knob keeps
/// the newest.
pub fn jobs_to_prune(
    policy: &KeepJobs,
    settled: &JobId,
    mut finished: Vec<(JobId, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> Vec<JobId> {
    match policy {
        KeepJobs::Keep => Vec::new(),
        KeepJobs::Remove => vec![settled.clone()],
        KeepJobs::Retain { age, count } => {
            finished.sort_by(|a, b| b.1.cmp(&a.1));

            let cutoff = age.map(|age| now - chrono::Duration::from_std(age).unwrap_or_default());
            let keep_count = count.unwrap_or(usize::MAX);

            finished
                .into_iter()
                .enumerate()
                .filter(|(idx, (_, finished_on))| {
                    *idx >= keep_count || cutoff.is_some_and(|c| *finished_on < c)
                })
                .map(|(_, (id, _))| id)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn finished_at(now: DateTime<Utc>, ages_secs: &[i64]) -> Vec<(JobId, DateTime<Utc>)> {
        ages_secs
            .iter()
            .enumerate()
            .map(|(i, age)| (JobId::from(i as u64 + 1), now - chrono::Duration::seconds(*age)))
            .collect()
    }

    #[test]
    fn keep_prunes_nothing() {
        let now = Utc::now();
        let jobs = finished_at(now, &[1, 2, 3]);
        assert!(jobs_to_prune(&KeepJobs::Keep, &JobId::from(3u64), jobs, now).is_empty());
    }

    #[test]
    fn remove_only_touches_the_settled_job() {
        let now = Utc::now();
        let jobs = finished_at(now, &[1, 2, 3]);
        let pruned = jobs_to_prune(&KeepJobs::Remove, &JobId::from(2u64), jobs, now);
        assert_eq!(pruned, vec![JobId::from(2u64)]);
    }

    #[test]
    fn age_knob_drops_jobs_older_than_cutoff() {
        let now = Utc::now();
        let jobs = finished_at(now, &[10, 4000, 30]);
        let pruned = jobs_to_prune(&KeepJobs::retain_for(Duration::from_secs(3600)), &JobId::from(1u64), jobs, now);
        assert_eq!(pruned, vec![JobId::from(2u64)]);
    }

    #[test]
    fn count_knob_keeps_newest() {
        let now = Utc::now();
        let jobs = finished_at(now, &[30, 10, 20]);
        let mut pruned = jobs_to_prune(&KeepJobs::retain_last(1), &JobId::from(2u64), jobs, now);
        pruned.sort();
        assert_eq!(pruned, vec![JobId::from(1u64), JobId::from(3u64)]);
    }
}
