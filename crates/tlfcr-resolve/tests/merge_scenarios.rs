//! End-to-end merge scenarios against an in-memory folder.
//!
//! Each test diverges a folder into an unmerged local branch and a merged
//! branch written by "another device", runs one resolution attempt, and
//! checks the committed tree and op logs.

use std::collections::BTreeMap;

use tlfcr_core::Revision;
use tlfcr_resolve::memory::{Edit, MemoryFolder, Node};
use tlfcr_resolve::pipeline::run_attempt;
use tlfcr_resolve::{Outcome, RequestContext, WriterRevisionRenamer};

async fn resolve_once(folder: &MemoryFolder) -> Outcome {
    run_attempt(folder, &WriterRevisionRenamer::default(), &RequestContext::new())
        .await
        .expect("resolution attempt should succeed")
}

fn names_with_prefix<'a>(snap: &'a BTreeMap<String, Node>, prefix: &str) -> Vec<&'a String> {
    snap.keys().filter(|k| k.starts_with(prefix)).collect()
}

fn create(path: &str, data: &[u8]) -> Edit {
    Edit::Create(path.into(), data.to_vec())
}

/// Independent creates on both branches both survive.
#[tokio::test]
async fn independent_creates_are_merged() {
    let folder = MemoryFolder::new("alice/simple").await.expect("folder");
    folder
        .unmerged_edit("bob", vec![create("mine", b"local")])
        .await
        .expect("unmerged edit");
    folder
        .merged_edit("alice", vec![create("theirs", b"remote")])
        .await
        .expect("merged edit");

    let outcome = resolve_once(&folder).await;
    assert_eq!(outcome.committed_revision(), Some(Revision(3)));

    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.get("mine"), Some(&Node::File(b"local".to_vec())));
    assert_eq!(snap.get("theirs"), Some(&Node::File(b"remote".to_vec())));
    assert_eq!(snap.len(), 2);
    assert_eq!(folder.unmerged_head(), None);
}

/// With no merged progress since the branch point, the unmerged
/// revisions are committed as they are.
#[tokio::test]
async fn unchanged_merged_branch_fast_forwards() {
    let folder = MemoryFolder::new("alice/ff").await.expect("folder");
    folder
        .unmerged_edit("bob", vec![Edit::Mkdir("docs".into()), create("docs/a.txt", b"a")])
        .await
        .expect("unmerged edit");

    let outcome = resolve_once(&folder).await;
    assert!(matches!(outcome, Outcome::FastForwarded { .. }));
    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.get("docs"), Some(&Node::Dir));
    assert_eq!(snap.get("docs/a.txt"), Some(&Node::File(b"a".to_vec())));
}

/// Two empty files created under the same name are the same file.
#[tokio::test]
async fn empty_duplicate_creates_are_unified() {
    let folder = MemoryFolder::new("alice/dup-empty").await.expect("folder");
    folder
        .unmerged_edit("bob", vec![create("f", b"")])
        .await
        .expect("unmerged edit");
    folder
        .merged_edit("alice", vec![create("f", b"")])
        .await
        .expect("merged edit");

    resolve_once(&folder).await;

    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.len(), 1, "unexpected tree: {snap:?}");
    assert_eq!(snap.get("f"), Some(&Node::File(Vec::new())));
}

/// Two non-empty files created under the same name: the merged one
/// keeps the name and the local one moves to a conflict copy.
#[tokio::test]
async fn duplicate_creates_with_content_keep_both() {
    let folder = MemoryFolder::new("alice/dup").await.expect("folder");
    folder
        .unmerged_edit("bob", vec![create("f", b"mine")])
        .await
        .expect("unmerged edit");
    folder
        .merged_edit("alice", vec![create("f", b"theirs")])
        .await
        .expect("merged edit");

    resolve_once(&folder).await;

    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.get("f"), Some(&Node::File(b"theirs".to_vec())));
    let copies = names_with_prefix(&snap, "f.conflicted copy (");
    assert_eq!(copies.len(), 1, "unexpected tree: {snap:?}");
    assert_eq!(snap.get(copies[0]), Some(&Node::File(b"mine".to_vec())));
}

/// Concurrent writes to one file end in a conflict copy named after the
/// local writer; the merged contents stay in place.
#[tokio::test]
async fn concurrent_writes_produce_conflict_copy() {
    let folder = MemoryFolder::new("alice/writes").await.expect("folder");
    folder
        .merged_edit("alice", vec![create("a.txt", b"base")])
        .await
        .expect("base");
    folder
        .unmerged_edit(
            "bob",
            vec![Edit::Write {
                path: "a.txt".into(),
                offset: 0,
                data: b"BOB!".to_vec(),
            }],
        )
        .await
        .expect("unmerged edit");
    folder
        .merged_edit(
            "alice",
            vec![Edit::Write {
                path: "a.txt".into(),
                offset: 0,
                data: b"ALI!".to_vec(),
            }],
        )
        .await
        .expect("merged edit");

    resolve_once(&folder).await;

    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.get("a.txt"), Some(&Node::File(b"ALI!".to_vec())));
    let copies: Vec<_> = snap
        .keys()
        .filter(|k| k.starts_with("a.conflicted copy (bob, rev ") && k.ends_with(").txt"))
        .collect();
    assert_eq!(copies.len(), 1, "unexpected tree: {snap:?}");
    assert_eq!(snap.get(copies[0]), Some(&Node::File(b"BOB!".to_vec())));
}

/// Moving X under Y locally while Y moved under X remotely would form a
/// cycle. The merged move wins and the local one becomes a symlink.
#[tokio::test]
async fn cross_branch_rename_cycle_becomes_symlink() {
    let folder = MemoryFolder::new("alice/cycle").await.expect("folder");
    folder
        .merged_edit("alice", vec![Edit::Mkdir("X".into()), Edit::Mkdir("Y".into())])
        .await
        .expect("base");
    folder
        .unmerged_edit("bob", vec![Edit::Rename("X".into(), "Y/X".into())])
        .await
        .expect("unmerged edit");
    folder
        .merged_edit("alice", vec![Edit::Rename("Y".into(), "X/Y".into())])
        .await
        .expect("merged edit");

    resolve_once(&folder).await;

    // snapshot_tree refuses a tree with a directory cycle.
    let snap = folder.snapshot().await.expect("resolved tree is acyclic");
    assert_eq!(snap.get("X"), Some(&Node::Dir));
    assert_eq!(snap.get("X/Y"), Some(&Node::Dir));
    assert!(!snap.contains_key("Y"));
    let links: Vec<_> = snap
        .iter()
        .filter(|(_, node)| matches!(node, Node::Symlink(_)))
        .collect();
    assert_eq!(links.len(), 1, "unexpected tree: {snap:?}");
    let (path, _) = links[0];
    assert!(path.starts_with("X/Y/"), "symlink at {path}");
}

/// A local create inside a directory the merged branch removed brings
/// the directory back. The next attempt finds nothing to do.
#[tokio::test]
async fn create_in_deleted_dir_recreates_it() {
    let folder = MemoryFolder::new("alice/recreate").await.expect("folder");
    folder
        .merged_edit("alice", vec![Edit::Mkdir("D".into())])
        .await
        .expect("base");
    folder
        .unmerged_edit("bob", vec![create("D/f", b"data")])
        .await
        .expect("unmerged edit");
    folder
        .merged_edit("alice", vec![Edit::Rm("D".into())])
        .await
        .expect("merged edit");

    let outcome = resolve_once(&folder).await;
    let committed = outcome.committed_revision().expect("committed");

    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.get("D"), Some(&Node::Dir));
    assert_eq!(snap.get("D/f"), Some(&Node::File(b"data".to_vec())));

    let again = resolve_once(&folder).await;
    assert_eq!(again, Outcome::NothingToDo);
    assert_eq!(folder.merged_head(), committed);
}

/// The local notification ops describe the same changes as the
/// committed revision's op log, followed by the merged-side ops the
/// device hasn't seen, and end in the same resolution op.
#[tokio::test]
async fn local_notifications_match_committed_ops() {
    let folder = MemoryFolder::new("alice/notify").await.expect("folder");
    folder
        .merged_edit("alice", vec![Edit::Mkdir("shared".into()), create("shared/a", b"a")])
        .await
        .expect("base");
    folder
        .unmerged_edit(
            "bob",
            vec![
                create("shared/b", b"b"),
                Edit::Rename("shared/a".into(), "a-moved".into()),
                Edit::SetExec("shared/b".into(), true),
            ],
        )
        .await
        .expect("unmerged edit");
    folder
        .merged_edit("alice", vec![create("shared/c", b"c")])
        .await
        .expect("merged edit");

    let outcome = resolve_once(&folder).await;
    let revision = outcome.committed_revision().expect("committed");

    let committed = folder.merged_revisions().pop().expect("head");
    assert_eq!(committed.revision, revision);
    let local = folder.local_ops().pop().expect("local ops recorded");

    let md_ops = &committed.ops;
    assert!(md_ops.len() >= 2, "expected reverted ops plus resolution: {md_ops:?}");
    assert!(local.len() >= md_ops.len());

    let reverted = md_ops.len() - 1;
    for (md, loc) in md_ops[..reverted].iter().zip(&local[..reverted]) {
        assert_eq!(md.kind_name(), loc.kind_name());
        assert_eq!(md.final_path, loc.final_path);
        assert_eq!(md.refs.len(), loc.refs.len());
        assert_eq!(md.unrefs.len(), loc.unrefs.len());
    }
    let (md_last, local_last) = (md_ops.last().expect("op"), local.last().expect("op"));
    assert_eq!(md_last.kind_name(), "resolution");
    assert!(md_last.same_op(local_last));

    let snap = folder.snapshot().await.expect("snapshot");
    assert_eq!(snap.get("a-moved"), Some(&Node::File(b"a".to_vec())));
    assert_eq!(snap.get("shared/b"), Some(&Node::Exec(b"b".to_vec())));
    assert_eq!(snap.get("shared/c"), Some(&Node::File(b"c".to_vec())));
    assert!(!snap.contains_key("shared/a"));
}
