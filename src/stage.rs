use tracing::debug;

use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::models::Stage;

/// The slice of the store the transition engine is allowed to touch.
/// Compare-and-set is the single point of serialization per posting.
pub trait StageStore {
    fn current_stage(&self, id: i64) -> Result<Option<Stage>>;
    fn compare_and_set_stage(&self, id: i64, expected: Stage, new: Stage) -> Result<bool>;
}

impl StageStore for Database {
    fn current_stage(&self, id: i64) -> Result<Option<Stage>> {
        Ok(self.get_posting(id)?.map(|p| p.stage))
    }

    fn compare_and_set_stage(&self, id: i64, expected: Stage, new: Stage) -> Result<bool> {
        Database::compare_and_set_stage(self, id, expected, new)
    }
}

/// Forward edges of the pipeline: discovered -> ready -> applied.
pub fn is_promotion(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::Discovered, Stage::Ready) | (Stage::Ready, Stage::Applied)
    )
}

/// Reverse edges. Only reachable with explicit caller intent; nothing in
/// the pipeline demotes automatically.
pub fn is_demotion(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::Ready, Stage::Discovered) | (Stage::Applied, Stage::Ready)
    )
}

fn edge_allowed(from: Stage, to: Stage, demote: bool) -> bool {
    if demote {
        is_demotion(from, to)
    } else {
        is_promotion(from, to)
    }
}

/// Move a posting along one stage edge. `demote` is the explicit intent
/// flag gating the reverse edges.
///
/// Every attempt goes through compare-and-set. On a lost race the current
/// stage is reloaded and the requested edge re-evaluated from the new
/// state before a single retry; losing twice surfaces
/// `ConcurrentModification` instead of retrying forever.
pub fn transition(store: &dyn StageStore, id: i64, to: Stage, demote: bool) -> Result<Stage> {
    let mut from = store
        .current_stage(id)?
        .ok_or(PipelineError::PostingNotFound { id })?;

    for _attempt in 0..2 {
        if !edge_allowed(from, to, demote) {
            return Err(PipelineError::IllegalTransition { from, to });
        }

        if store.compare_and_set_stage(id, from, to)? {
            debug!(posting_id = id, %from, %to, "stage transition committed");
            return Ok(to);
        }

        // lost the race; re-evaluate the requested edge from the new stage
        from = store
            .current_stage(id)?
            .ok_or(PipelineError::PostingNotFound { id })?;
    }

    Err(PipelineError::ConcurrentModification { id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_posting;
    use crate::models::Source;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn db_with_posting(stage: Stage) -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_posting(&test_posting(Source::Manual, "k1", "Job"))
            .unwrap();
        if stage != Stage::Discovered {
            assert!(db.compare_and_set_stage(id, Stage::Discovered, stage).unwrap());
        }
        (db, id)
    }

    #[test]
    fn test_promotions_walk_the_pipeline() {
        let (db, id) = db_with_posting(Stage::Discovered);
        assert_eq!(transition(&db, id, Stage::Ready, false).unwrap(), Stage::Ready);
        assert_eq!(transition(&db, id, Stage::Applied, false).unwrap(), Stage::Applied);
    }

    #[test]
    fn test_skipping_a_stage_is_illegal() {
        let (db, id) = db_with_posting(Stage::Discovered);
        let err = transition(&db, id, Stage::Applied, false).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IllegalTransition { from: Stage::Discovered, to: Stage::Applied }
        ));
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Discovered);
    }

    #[test]
    fn test_applied_to_discovered_is_never_reachable() {
        let (db, id) = db_with_posting(Stage::Applied);
        assert!(transition(&db, id, Stage::Discovered, false).is_err());
        assert!(transition(&db, id, Stage::Discovered, true).is_err());
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Applied);
    }

    #[test]
    fn test_demotion_requires_intent_flag() {
        let (db, id) = db_with_posting(Stage::Ready);
        assert!(transition(&db, id, Stage::Discovered, false).is_err());
        assert_eq!(
            transition(&db, id, Stage::Discovered, true).unwrap(),
            Stage::Discovered
        );
    }

    #[test]
    fn test_demote_flag_does_not_unlock_promotions() {
        let (db, id) = db_with_posting(Stage::Discovered);
        assert!(transition(&db, id, Stage::Ready, true).is_err());
    }

    #[test]
    fn test_same_stage_request_is_illegal() {
        let (db, id) = db_with_posting(Stage::Ready);
        assert!(matches!(
            transition(&db, id, Stage::Ready, false).unwrap_err(),
            PipelineError::IllegalTransition { .. }
        ));
    }

    #[test]
    fn test_missing_posting_is_reported() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            transition(&db, 42, Stage::Ready, false).unwrap_err(),
            PipelineError::PostingNotFound { id: 42 }
        ));
    }

    /// What a rigged CAS call does, simulating a racing writer that
    /// committed between our read and our compare-and-set.
    enum Rig {
        /// CAS fails; by the time we reload, the writer left this stage.
        FailLeaving(Stage),
        Honest,
    }

    struct RiggedStore {
        stage: RefCell<Stage>,
        plan: RefCell<VecDeque<Rig>>,
    }

    impl RiggedStore {
        fn new(stage: Stage, plan: Vec<Rig>) -> Self {
            Self {
                stage: RefCell::new(stage),
                plan: RefCell::new(plan.into()),
            }
        }
    }

    impl StageStore for RiggedStore {
        fn current_stage(&self, _id: i64) -> Result<Option<Stage>> {
            Ok(Some(*self.stage.borrow()))
        }

        fn compare_and_set_stage(&self, _id: i64, expected: Stage, new: Stage) -> Result<bool> {
            match self.plan.borrow_mut().pop_front() {
                Some(Rig::FailLeaving(stage)) => {
                    *self.stage.borrow_mut() = stage;
                    Ok(false)
                }
                Some(Rig::Honest) | None => {
                    let mut stage = self.stage.borrow_mut();
                    if *stage == expected {
                        *stage = new;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
            }
        }
    }

    #[test]
    fn test_lost_race_retries_when_edge_still_legal() {
        // the racing writer moved the stage away and back before our
        // reload, so discovered -> ready is still the legal edge
        let store = RiggedStore::new(
            Stage::Discovered,
            vec![Rig::FailLeaving(Stage::Discovered), Rig::Honest],
        );
        assert_eq!(transition(&store, 1, Stage::Ready, false).unwrap(), Stage::Ready);
        assert_eq!(*store.stage.borrow(), Stage::Ready);
    }

    #[test]
    fn test_lost_race_with_edge_now_illegal_fails_explicitly() {
        // the racing writer advanced the posting past us; our requested
        // edge no longer applies and must not silently retry
        let store = RiggedStore::new(Stage::Discovered, vec![Rig::FailLeaving(Stage::Applied)]);
        let err = transition(&store, 1, Stage::Ready, false).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IllegalTransition { from: Stage::Applied, to: Stage::Ready }
        ));
        assert_eq!(*store.stage.borrow(), Stage::Applied);
    }

    #[test]
    fn test_losing_twice_surfaces_concurrent_modification() {
        let store = RiggedStore::new(
            Stage::Discovered,
            vec![
                Rig::FailLeaving(Stage::Discovered),
                Rig::FailLeaving(Stage::Discovered),
            ],
        );
        assert!(matches!(
            transition(&store, 7, Stage::Ready, false).unwrap_err(),
            PipelineError::ConcurrentModification { id: 7 }
        ));
    }

    #[test]
    fn test_racing_transitions_one_commits_one_fails() {
        // two threads race the same legal edge through real SQLite; the
        // loser reloads 'ready' and reports the edge illegal rather than
        // committing twice or dropping the loss silently
        let dir = std::env::temp_dir().join(format!("pursuit-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("transition-race.db");
        let _ = std::fs::remove_file(&path);

        let db = Database::open_at(&path).unwrap();
        db.init().unwrap();
        let id = db
            .insert_posting(&test_posting(Source::Manual, "race", "Job"))
            .unwrap();

        let path2 = path.clone();
        let handle = std::thread::spawn(move || {
            let db2 = Database::open_at(&path2).unwrap();
            transition(&db2, id, Stage::Ready, false).is_ok()
        });
        let local = transition(&db, id, Stage::Ready, false).is_ok();
        let remote = handle.join().unwrap();

        assert!(local ^ remote, "exactly one transition may commit");
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Ready);

        let _ = std::fs::remove_file(&path);
    }
}
