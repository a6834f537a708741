/// Tests for the tree data model and its derived-field builders

use super::*;
use proptest::prelude::*;

#[test]
fn test_new_node_derives_fields_from_path() {
    let node = DirectoryNode::new("/src/views");
    assert_eq!(node.name, "views");
    assert_eq!(node.depth, 2);
    assert_eq!(node.parent_path, Some("/src".to_string()));
    assert!(!node.is_loaded);
    assert!(node.children.is_empty());
}

#[test]
fn test_root_node_has_no_parent() {
    let root = DirectoryNode::new("");
    assert_eq!(root.name, "");
    assert_eq!(root.depth, 0);
    assert_eq!(root.parent_path, None);
    assert!(root.is_root());
}

#[test]
fn test_push_file_builds_consistent_child() {
    let mut node = DirectoryNode::new_loaded("/src");
    node.push_file("main.rs", Some(100), None);

    let child = &node.children[0];
    assert_eq!(child.name(), "main.rs");
    assert_eq!(child.path(), "/src/main.rs");
    assert_eq!(child.depth(), 2);
    assert_eq!(child.parent_path(), "/src");
    assert!(!child.is_dir());
}

#[test]
fn test_push_dir_stub_builds_consistent_child() {
    let mut node = DirectoryNode::new_loaded("");
    node.push_dir_stub("src", true);

    let child = &node.children[0];
    assert_eq!(child.path(), "/src");
    assert_eq!(child.depth(), 1);
    assert_eq!(child.parent_path(), "");
    assert!(child.is_dir());
    match child {
        ChildNode::Dir(d) => assert!(d.is_loaded),
        other => panic!("expected dir child, got {:?}", other),
    }
}

#[test]
fn test_dir_children_and_file_count() {
    let mut node = DirectoryNode::new_loaded("/r");
    node.push_file("a.txt", None, None);
    node.push_dir_stub("sub", false);
    node.push_file("b.txt", None, None);

    assert_eq!(node.file_count(), 2);
    let dirs: Vec<&str> = node.dir_children().map(|d| d.name.as_str()).collect();
    assert_eq!(dirs, vec!["sub"]);
}

#[test]
fn test_prefetch_target_for_path() {
    let target = PrefetchTarget::for_path("/a/b/c");
    assert_eq!(target.name, "c");
    assert_eq!(target.depth, 3);
    assert_eq!(target.parent_path, Some("/a/b".to_string()));

    let root = PrefetchTarget::for_path("");
    assert_eq!(root.depth, 0);
    assert_eq!(root.parent_path, None);
}

#[test]
fn test_deferred_metadata_reads_as_unloaded_stub() {
    let mut node = DirectoryNode::new_loaded("/r/node_modules");
    node.push_file("package.json", None, None);

    let meta = DeferredDirMetadata::from_node(&node);
    assert_eq!(meta.kind, NodeKind::Directory);
    assert_eq!(meta.path, "/r/node_modules");
    assert_eq!(meta.parent_path, Some("/r".to_string()));
    assert!(!meta.is_loaded);
}

proptest! {
    /// Builder-produced children always satisfy the parent/child
    /// invariants, whatever the names.
    #[test]
    fn prop_builder_children_are_consistent(
        parent in "(/[a-z0-9_]{1,12}){0,4}",
        names in prop::collection::hash_set("[a-zA-Z0-9_.-]{1,20}", 0..16),
    ) {
        let mut node = DirectoryNode::new_loaded(&parent);
        for (index, name) in names.iter().enumerate() {
            if index % 2 == 0 {
                node.push_file(name, Some(index as u64), None);
            } else {
                node.push_dir_stub(name, false);
            }
        }

        for child in &node.children {
            prop_assert_eq!(child.parent_path(), node.path.as_str());
            prop_assert_eq!(child.depth(), node.depth + 1);
            let expected_prefix = format!("{}/", node.path);
            prop_assert!(child.path().starts_with(&expected_prefix));
        }
    }
}
