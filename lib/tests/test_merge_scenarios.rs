// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use assert_matches::assert_matches;
use testutils::TestRepo;
use zeta_lib::history::FfMode;
use zeta_lib::history::HistoryError;
use zeta_lib::history::MergeStatus;
use zeta_lib::index::Stage;
use zeta_lib::op_context::OpContext;
use zeta_lib::refs::Reference;

#[test]
fn test_branch_create_and_fast_forward_merge() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"base\n");
    let c0 = test_repo.commit_all("c0");

    test_repo.repo.create_branch("topic", c0).unwrap();
    test_repo.repo.switch(&ctx, "topic").unwrap();
    test_repo.write_file("a.txt", b"topic change\n");
    let c1 = test_repo.commit_all("c1");

    test_repo.repo.switch(&ctx, "main").unwrap();
    assert_eq!(test_repo.read_file("a.txt"), b"base\n");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let status = history
        .merge(&ctx, c1, "topic", FfMode::Auto, None, &signature)
        .unwrap();
    assert_eq!(status, MergeStatus::FastForward(c1));

    // main now points at c1, the worktree follows, HEAD stays symbolic.
    assert_eq!(
        test_repo
            .repo
            .refdb()
            .resolve("refs/heads/main")
            .unwrap()
            .hash_target(),
        Some(c1)
    );
    assert_eq!(test_repo.read_file("a.txt"), b"topic change\n");
    assert_matches!(
        test_repo.repo.refdb().head().unwrap(),
        Reference::Symbolic { target, .. } if target == "refs/heads/main"
    );
    let log = test_repo.repo.refdb().read_log("refs/heads/main").unwrap();
    let last = log.entries.last().unwrap();
    assert!(last.message.starts_with("merge:"), "got {:?}", last.message);
    assert_eq!(last.new, c1);
}

#[test]
fn test_conflict_then_continue() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"A\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("b", c0).unwrap();
    test_repo.repo.switch(&ctx, "b").unwrap();
    test_repo.write_file("a.txt", b"B\n");
    let b_tip = test_repo.commit_all("theirs");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"C\n");
    test_repo.commit_all("ours");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let result = history.merge(&ctx, b_tip, "b", FfMode::Auto, None, &signature);
    assert_matches!(result, Err(HistoryError::HasConflicts { .. }));

    // MERGE_HEAD records the other side.
    assert_eq!(
        test_repo
            .repo
            .refdb()
            .reference("MERGE_HEAD")
            .unwrap()
            .hash_target(),
        Some(b_tip)
    );

    // The index holds all three stages for the conflicted path.
    let index = test_repo.repo.worktree().index().unwrap();
    let stages: Vec<Stage> = index.stages("a.txt").map(|entry| entry.stage).collect();
    assert_eq!(stages, vec![Stage::Ancestor, Stage::Ours, Stage::Theirs]);

    // The worktree shows the labelled conflict markers.
    assert_eq!(
        test_repo.read_file("a.txt"),
        b"<<<<<<< HEAD\nC\n=======\nB\n>>>>>>> b\n"
    );

    // Starting another operation while the slot is occupied is refused.
    assert_matches!(
        history.merge(&ctx, b_tip, "b", FfMode::Auto, None, &signature),
        Err(HistoryError::ReplayInProgress)
    );
    // Continuing with unresolved stages is refused too.
    assert_matches!(
        history.merge_continue(&ctx, None, &signature),
        Err(HistoryError::UnresolvedConflicts)
    );

    // Resolve, stage, continue.
    test_repo.write_file("a.txt", b"R\n");
    test_repo.repo.worktree().add(&ctx, &[]).unwrap();
    let merge_commit = history
        .merge_continue(&ctx, Some("merge b into main".to_owned()), &signature)
        .unwrap();

    let commit = test_repo.repo.odb().commit(&merge_commit).unwrap();
    assert_eq!(commit.parents.len(), 2);
    assert_eq!(commit.message, "merge b into main");
    assert!(test_repo.repo.refdb().reference("MERGE_HEAD").is_err());
    assert_eq!(test_repo.read_file("a.txt"), b"R\n");
}

#[test]
fn test_merge_abort_restores_state() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"A\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("b", c0).unwrap();
    test_repo.repo.switch(&ctx, "b").unwrap();
    test_repo.write_file("a.txt", b"B\n");
    let b_tip = test_repo.commit_all("theirs");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"C\n");
    let main_tip = test_repo.commit_all("ours");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.merge(&ctx, b_tip, "b", FfMode::Auto, None, &signature),
        Err(HistoryError::HasConflicts { .. })
    );

    history.merge_abort(&ctx, &signature).unwrap();
    assert_eq!(test_repo.read_file("a.txt"), b"C\n");
    assert!(test_repo.repo.refdb().reference("MERGE_HEAD").is_err());
    let (head, _) = test_repo.repo.worktree().head_commit().unwrap().unwrap();
    assert_eq!(head, main_tip);
    assert!(!test_repo.repo.worktree().index().unwrap().has_conflicts());

    // The slot is free again.
    assert_matches!(
        history.merge_abort(&ctx, &signature),
        Err(HistoryError::NoReplayInProgress)
    );
}

#[test]
fn test_merge_already_up_to_date_and_clean_merge() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"a\n");
    test_repo.write_file("b.txt", b"b\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("side", c0).unwrap();
    test_repo.repo.switch(&ctx, "side").unwrap();
    test_repo.write_file("b.txt", b"b changed\n");
    let side_tip = test_repo.commit_all("side change");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"a changed\n");
    test_repo.commit_all("main change");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();

    // Merging something we already contain is a no-op.
    assert_eq!(
        history
            .merge(&ctx, c0, "old", FfMode::Auto, None, &signature)
            .unwrap(),
        MergeStatus::AlreadyUpToDate
    );

    // Diverged but disjoint: a real merge commit, no conflicts.
    let status = history
        .merge(&ctx, side_tip, "side", FfMode::Auto, None, &signature)
        .unwrap();
    let MergeStatus::Created(merge_commit) = status else {
        panic!("expected a merge commit, got {status:?}");
    };
    let commit = test_repo.repo.odb().commit(&merge_commit).unwrap();
    assert_eq!(commit.parents.len(), 2);
    assert_eq!(test_repo.read_file("a.txt"), b"a changed\n");
    assert_eq!(test_repo.read_file("b.txt"), b"b changed\n");
}

#[test]
fn test_merge_ff_only_refuses_divergence() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"a\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("side", c0).unwrap();
    test_repo.repo.switch(&ctx, "side").unwrap();
    test_repo.write_file("side.txt", b"s\n");
    let side_tip = test_repo.commit_all("side");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("main.txt", b"m\n");
    test_repo.commit_all("main");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.merge(&ctx, side_tip, "side", FfMode::Only, None, &signature),
        Err(HistoryError::FastForwardImpossible)
    );
}

#[test]
fn test_merge_unrelated_histories() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"a\n");
    test_repo.commit_all("base");

    // A rootless commit sharing nothing with main, imported wholesale.
    let other = TestRepo::init();
    other.write_file("z.txt", b"z\n");
    let foreign_tip = other.commit_all("foreign");
    for (id, _) in zeta_lib::revwalk::RevWalk::ancestors(
        other.repo.odb(),
        &ctx,
        &[foreign_tip],
        None,
    )
    .unwrap()
    .map(|item| item.unwrap())
    {
        let (kind, body) = other.repo.odb().get_bytes(&id).unwrap();
        test_repo.repo.odb().unpack(kind, &body).unwrap();
        let commit = other.repo.odb().commit(&id).unwrap();
        copy_tree(&other, &test_repo, &commit.tree);
    }

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.merge(&ctx, foreign_tip, "foreign", FfMode::Auto, None, &signature),
        Err(HistoryError::UnrelatedHistories)
    );
}

fn copy_tree(from: &TestRepo, to: &TestRepo, tree_id: &zeta_lib::hash::ObjectId) {
    let (kind, body) = from.repo.odb().get_bytes(tree_id).unwrap();
    to.repo.odb().unpack(kind, &body).unwrap();
    let tree = from.repo.odb().tree(tree_id).unwrap();
    for entry in tree.entries() {
        if entry.mode.is_dir() {
            copy_tree(from, to, &entry.hash);
        } else {
            let (kind, body) = from.repo.odb().get_bytes(&entry.hash).unwrap();
            to.repo.odb().unpack(kind, &body).unwrap();
        }
    }
}
