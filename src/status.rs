use crate::jobs::GroupResult;
use crate::models::IndexingStatus;

/// Indexing status from the expected and indexed counts and the restored job
/// group, `None` when the handle is absent or no longer resolvable.
pub fn indexing_status(
    total_photos: usize,
    indexed_photos: usize,
    group: Option<&GroupResult>,
) -> IndexingStatus {
    if total_photos == 0 {
        return IndexingStatus::NotIndexed;
    }
    if indexed_photos == total_photos {
        return IndexingStatus::Indexed;
    }
    match group {
        // a child waiting for a retry counts as failed until it succeeds
        Some(group) if group.has_failures() => IndexingStatus::Error,
        // every child finished yet the counts disagree
        Some(group) if group.is_complete() => IndexingStatus::Error,
        Some(_) => IndexingStatus::Indexing,
        None => IndexingStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ChildStatus, JobState};
    use uuid::Uuid;

    fn group(states: Vec<JobState>) -> GroupResult {
        GroupResult {
            id: Uuid::new_v4(),
            expected_count: states.len(),
            children: states
                .into_iter()
                .map(|state| ChildStatus { job_id: Uuid::new_v4(), state })
                .collect(),
        }
    }

    #[test]
    fn empty_directory_is_not_indexed_whatever_the_handle() {
        assert_eq!(indexing_status(0, 0, None), IndexingStatus::NotIndexed);
        let failed = group(vec![JobState::Failure("x".into())]);
        assert_eq!(indexing_status(0, 3, Some(&failed)), IndexingStatus::NotIndexed);
    }

    #[test]
    fn matching_counts_are_indexed_even_after_the_handle_expired() {
        assert_eq!(indexing_status(4, 4, None), IndexingStatus::Indexed);
    }

    #[test]
    fn in_flight_group_is_indexing() {
        let running = group(vec![JobState::Success("ok".into()), JobState::Pending]);
        assert_eq!(indexing_status(2, 1, Some(&running)), IndexingStatus::Indexing);
    }

    #[test]
    fn retrying_child_is_an_error() {
        let retrying = group(vec![
            JobState::Success("ok".into()),
            JobState::Pending,
            JobState::Retry(1),
        ]);
        assert_eq!(indexing_status(3, 1, Some(&retrying)), IndexingStatus::Error);
    }

    #[test]
    fn failed_child_is_an_error() {
        let failed = group(vec![JobState::Failure("boom".into()), JobState::Pending]);
        assert_eq!(indexing_status(2, 0, Some(&failed)), IndexingStatus::Error);
    }

    #[test]
    fn unresolvable_handle_is_an_error() {
        assert_eq!(indexing_status(5, 2, None), IndexingStatus::Error);
    }

    #[test]
    fn finished_group_with_missing_photos_is_an_error() {
        let done = group(vec![JobState::Success("ok".into()), JobState::Success("stale".into())]);
        assert_eq!(indexing_status(2, 1, Some(&done)), IndexingStatus::Error);
    }
}
