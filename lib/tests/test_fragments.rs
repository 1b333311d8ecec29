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

use testutils::TestRepo;
use zeta_lib::object::ObjectKind;
use zeta_lib::object::object_id_of;
use zeta_lib::op_context::OpContext;
use zeta_lib::worktree::CheckoutOptions;

const MIB: u64 = 1 << 20;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_large_file_round_trip() {
    // 9 MiB + 1 byte with the default 4 MiB threshold and chunk size.
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    let content = patterned((9 * MIB + 1) as usize);
    test_repo.write_file("big.bin", &content);
    test_repo.commit_all("add big file");

    let entry = test_repo.repo.worktree().index().unwrap().get("big.bin").unwrap().clone();
    assert!(entry.mode.is_fragments());
    assert_eq!(entry.size, 9 * MIB + 1);

    let manifest = test_repo.repo.odb().fragments(&entry.hash).unwrap();
    assert_eq!(
        manifest.entries.iter().map(|chunk| chunk.size).collect::<Vec<_>>(),
        vec![4 * MIB, 4 * MIB, MIB + 1]
    );
    assert_eq!(manifest.size, content.len() as u64);
    // The origin is the blob hash of the unsplit content.
    assert_eq!(manifest.origin, object_id_of(ObjectKind::Blob, &content));

    // Blow the worktree copy away and rebuild it from the chunks.
    test_repo.delete_file("big.bin");
    let head_tree = test_repo.repo.worktree().head_tree().unwrap().unwrap();
    test_repo
        .repo
        .worktree()
        .checkout(&ctx, &head_tree, CheckoutOptions::default())
        .unwrap();
    assert_eq!(test_repo.read_file("big.bin"), content);
}

#[test]
fn test_fragmented_file_status_is_clean_after_commit() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    test_repo.write_file("big.bin", &patterned((5 * MIB) as usize));
    test_repo.commit_all("add");

    // Status must compare the origin hash, not the manifest hash.
    let status = test_repo.repo.worktree().status(&ctx).unwrap();
    assert!(status.is_clean(), "status: {status:?}");
}

#[test]
fn test_small_file_stays_a_blob() {
    let test_repo = TestRepo::init();
    test_repo.write_file("small.txt", b"tiny\n");
    test_repo.commit_all("add");
    let entry = test_repo.repo.worktree().index().unwrap().get("small.txt").unwrap().clone();
    assert!(!entry.mode.is_fragments());
    assert_eq!(
        test_repo.repo.odb().blob_bytes(&entry.hash).unwrap(),
        b"tiny\n"
    );
}

#[test]
fn test_modifying_large_file_is_detected() {
    let test_repo = TestRepo::init();
    let ctx = OpContext::background();
    let mut content = patterned((5 * MIB) as usize);
    test_repo.write_file("big.bin", &content);
    test_repo.commit_all("add");

    content[123] ^= 0xff;
    content.extend_from_slice(b"tail");
    test_repo.write_file("big.bin", &content);
    let status = test_repo.repo.worktree().status(&ctx).unwrap();
    assert_eq!(status.worktree.len(), 1);
    assert_eq!(status.worktree[0].path(), "big.bin");
}
