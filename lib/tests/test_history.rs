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
use zeta_lib::history::HistoryError;
use zeta_lib::history::RebaseStatus;
use zeta_lib::op_context::OpContext;

#[test]
fn test_rebase_clean() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("base.txt", b"base\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("work", c0).unwrap();
    test_repo.repo.switch(&ctx, "work").unwrap();
    test_repo.write_file("feature.txt", b"feature\n");
    test_repo.commit_all("feature");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("base.txt", b"base v2\n");
    let main_tip = test_repo.commit_all("advance main");

    test_repo.repo.switch(&ctx, "work").unwrap();
    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let status = history.rebase(&ctx, main_tip, &signature).unwrap();
    let RebaseStatus::Done(new_tip) = status else {
        panic!("expected a completed rebase, got {status:?}");
    };

    let commit = test_repo.repo.odb().commit(&new_tip).unwrap();
    assert_eq!(commit.parents.as_slice(), &[main_tip]);
    assert_eq!(commit.message, "feature");
    assert_eq!(test_repo.read_file("base.txt"), b"base v2\n");
    assert_eq!(test_repo.read_file("feature.txt"), b"feature\n");
    // The branch moved with the rebase.
    assert_eq!(
        test_repo
            .repo
            .refdb()
            .resolve("refs/heads/work")
            .unwrap()
            .hash_target(),
        Some(new_tip)
    );
}

#[test]
fn test_rebase_conflict_continue() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"base\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("work", c0).unwrap();
    test_repo.repo.switch(&ctx, "work").unwrap();
    test_repo.write_file("a.txt", b"work version\n");
    let work_tip = test_repo.commit_all("work edit");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"main version\n");
    let main_tip = test_repo.commit_all("main edit");

    test_repo.repo.switch(&ctx, "work").unwrap();
    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.rebase(&ctx, main_tip, &signature),
        Err(HistoryError::HasConflicts { .. })
    );
    assert!(test_repo.repo.dot_dir().join("REBASE_MD").exists());
    assert!(test_repo.repo.worktree().index().unwrap().has_conflicts());

    // Resolve and continue.
    test_repo.write_file("a.txt", b"merged version\n");
    test_repo.repo.worktree().add(&ctx, &[]).unwrap();
    let status = history.rebase_continue(&ctx, &signature).unwrap();
    let RebaseStatus::Done(new_tip) = status else {
        panic!("expected a completed rebase, got {status:?}");
    };
    assert!(!test_repo.repo.dot_dir().join("REBASE_MD").exists());

    let commit = test_repo.repo.odb().commit(&new_tip).unwrap();
    assert_eq!(commit.parents.as_slice(), &[main_tip]);
    assert_eq!(commit.message, "work edit");
    assert_eq!(test_repo.read_file("a.txt"), b"merged version\n");
    assert_ne!(new_tip, work_tip);
}

#[test]
fn test_rebase_abort() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"base\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("work", c0).unwrap();
    test_repo.repo.switch(&ctx, "work").unwrap();
    test_repo.write_file("a.txt", b"work\n");
    let work_tip = test_repo.commit_all("work");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"main\n");
    let main_tip = test_repo.commit_all("main");

    test_repo.repo.switch(&ctx, "work").unwrap();
    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.rebase(&ctx, main_tip, &signature),
        Err(HistoryError::HasConflicts { .. })
    );
    history.rebase_abort(&ctx, &signature).unwrap();

    assert!(!test_repo.repo.dot_dir().join("REBASE_MD").exists());
    let (head, _) = test_repo.repo.worktree().head_commit().unwrap().unwrap();
    assert_eq!(head, work_tip);
    assert_eq!(test_repo.read_file("a.txt"), b"work\n");
    assert_matches!(
        history.rebase_abort(&ctx, &signature),
        Err(HistoryError::NoReplayInProgress)
    );
}

#[test]
fn test_cherry_pick() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"a\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("side", c0).unwrap();
    test_repo.repo.switch(&ctx, "side").unwrap();
    test_repo.write_file("fix.txt", b"the fix\n");
    let fix_commit = test_repo.commit_all("fix something");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"a moved on\n");
    test_repo.commit_all("main progress");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let picked = history.cherry_pick(&ctx, fix_commit, &signature).unwrap();

    let commit = test_repo.repo.odb().commit(&picked).unwrap();
    assert_eq!(commit.message, "fix something");
    assert_eq!(commit.parents.len(), 1);
    assert_eq!(test_repo.read_file("fix.txt"), b"the fix\n");
    assert_eq!(test_repo.read_file("a.txt"), b"a moved on\n");
}

#[test]
fn test_revert() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"original\n");
    test_repo.commit_all("base");
    test_repo.write_file("a.txt", b"regression\n");
    let bad_commit = test_repo.commit_all("bad change");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let reverted = history.revert(&ctx, bad_commit, &signature).unwrap();

    let commit = test_repo.repo.odb().commit(&reverted).unwrap();
    assert!(commit.message.starts_with("Revert \"bad change\""));
    assert_eq!(test_repo.read_file("a.txt"), b"original\n");
}

#[test]
fn test_cherry_pick_conflict_continue_and_abort() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"base\n");
    let c0 = test_repo.commit_all("base");

    test_repo.repo.create_branch("side", c0).unwrap();
    test_repo.repo.switch(&ctx, "side").unwrap();
    test_repo.write_file("a.txt", b"side\n");
    let side_commit = test_repo.commit_all("side edit");

    test_repo.repo.switch(&ctx, "main").unwrap();
    test_repo.write_file("a.txt", b"main\n");
    let main_tip = test_repo.commit_all("main edit");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.cherry_pick(&ctx, side_commit, &signature),
        Err(HistoryError::HasConflicts { .. })
    );
    assert!(test_repo.repo.dot_dir().join("REPLAY_MD").exists());

    test_repo.write_file("a.txt", b"resolved\n");
    test_repo.repo.worktree().add(&ctx, &[]).unwrap();
    let picked = history.replay_continue(&ctx, &signature).unwrap();
    assert!(!test_repo.repo.dot_dir().join("REPLAY_MD").exists());
    assert_eq!(
        test_repo.repo.odb().commit(&picked).unwrap().message,
        "side edit"
    );
    assert_eq!(test_repo.read_file("a.txt"), b"resolved\n");

    // Abort flow on a second conflicted pick.
    test_repo.repo.create_branch("side2", c0).unwrap();
    test_repo.repo.switch(&ctx, "side2").unwrap();
    test_repo.write_file("a.txt", b"side2\n");
    let side2_commit = test_repo.commit_all("side2 edit");
    test_repo.repo.switch(&ctx, "main").unwrap();
    let _ = main_tip;
    let (before, _) = test_repo.repo.worktree().head_commit().unwrap().unwrap();

    let history = test_repo.repo.history().unwrap();
    assert_matches!(
        history.cherry_pick(&ctx, side2_commit, &signature),
        Err(HistoryError::HasConflicts { .. })
    );
    history.replay_abort(&ctx, &signature).unwrap();
    let (after, _) = test_repo.repo.worktree().head_commit().unwrap().unwrap();
    assert_eq!(after, before);
}

#[test]
fn test_stash_push_apply_pop() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"committed\n");
    test_repo.commit_all("base");

    test_repo.write_file("a.txt", b"work in progress\n");
    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let stash_commit = history.stash_push(&ctx, false, &signature).unwrap();

    // Worktree is clean again; the stash ref and its log exist.
    assert_eq!(test_repo.read_file("a.txt"), b"committed\n");
    assert!(test_repo.repo.worktree().status(&ctx).unwrap().is_clean());
    assert_eq!(
        test_repo
            .repo
            .refdb()
            .reference("refs/stash")
            .unwrap()
            .hash_target(),
        Some(stash_commit)
    );
    let stash = test_repo.repo.odb().commit(&stash_commit).unwrap();
    assert_eq!(stash.parents.len(), 2);

    // Pop brings the change back and drops the stack entry.
    history.stash_pop(&ctx).unwrap();
    assert_eq!(test_repo.read_file("a.txt"), b"work in progress\n");
    assert!(test_repo.repo.refdb().reference("refs/stash").is_err());
    assert!(
        test_repo
            .repo
            .refdb()
            .read_log("refs/stash")
            .unwrap()
            .entries
            .is_empty()
    );
}

#[test]
fn test_stash_untracked_only_with_flag() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"a\n");
    test_repo.commit_all("base");
    test_repo.write_file("untracked.txt", b"u\n");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    let stash_commit = history.stash_push(&ctx, true, &signature).unwrap();

    // With -u the untracked file is stashed away.
    assert!(!test_repo.file_exists("untracked.txt"));
    let stash = test_repo.repo.odb().commit(&stash_commit).unwrap();
    let tree = test_repo.repo.odb().tree(&stash.tree).unwrap();
    assert!(tree.entry("untracked.txt").is_some());

    history.stash_pop(&ctx).unwrap();
    assert_eq!(test_repo.read_file("untracked.txt"), b"u\n");
}

#[test]
fn test_stash_nothing_to_stash() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("a.txt", b"a\n");
    test_repo.commit_all("base");

    let history = test_repo.repo.history().unwrap();
    let signature = test_repo.next_signature();
    assert_matches!(
        history.stash_push(&ctx, false, &signature),
        Err(HistoryError::NothingToStash)
    );
}
