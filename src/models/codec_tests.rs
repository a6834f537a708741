/// Round-trip and schema tests for the cache entry codec

use super::*;
use chrono::TimeZone;
use proptest::prelude::*;

fn sample_mtime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn sample_node() -> DirectoryNode {
    let mut node = DirectoryNode::new_loaded("/src");
    node.push_file("main.rs", Some(2048), Some(sample_mtime(1_700_000_000)));
    node.push_file("lib.rs", None, None);
    node.push_dir_stub("views", false);
    node.push_dir_stub("models", true);
    node
}

#[test]
fn test_round_trip_preserves_structure() {
    let node = sample_node();
    let encoded = encode(&node, 10, 10, 1, None).unwrap();
    let decoded = decode("/src", &encoded.bytes).unwrap();

    assert_eq!(decoded.node, node);
    assert_eq!(decoded.cached_at, 10);
    assert_eq!(decoded.accessed_at, 10);
    assert_eq!(decoded.seq, 1);
    assert_eq!(decoded.mtime, None);
}

#[test]
fn test_round_trip_preserves_child_order() {
    let mut node = DirectoryNode::new_loaded("/r");
    node.push_file("zz.txt", None, None);
    node.push_dir_stub("aa", false);
    node.push_file("mm.txt", Some(1), None);

    let encoded = encode(&node, 1, 1, 0, None).unwrap();
    let decoded = decode("/r", &encoded.bytes).unwrap();

    let names: Vec<_> = decoded.node.child_names();
    assert_eq!(names, vec!["zz.txt", "aa", "mm.txt"]);
}

#[test]
fn test_round_trip_root_entry() {
    let mut root = DirectoryNode::new_loaded("");
    root.push_dir_stub("src", false);
    root.push_file("Cargo.toml", Some(300), None);

    let encoded = encode(&root, 5, 7, 0, Some(sample_mtime(1_700_000_100))).unwrap();
    let decoded = decode("", &encoded.bytes).unwrap();

    assert_eq!(decoded.node.path, "");
    assert_eq!(decoded.node.parent_path, None);
    assert_eq!(decoded.node.children.len(), 2);
    assert_eq!(decoded.mtime, Some(sample_mtime(1_700_000_100)));
}

#[test]
fn test_encode_strips_grandchildren_to_stubs() {
    let mut node = DirectoryNode::new_loaded("/r");
    let mut loaded_child = DirectoryNode::new_loaded("/r/sub");
    loaded_child.push_file("deep.txt", None, None);
    node.push_dir(loaded_child);

    let encoded = encode(&node, 1, 1, 0, None).unwrap();
    let decoded = decode("/r", &encoded.bytes).unwrap();

    match &decoded.node.children[0] {
        ChildNode::Dir(stub) => {
            assert!(stub.children.is_empty());
            assert!(stub.is_loaded);
        }
        other => panic!("expected dir child, got {:?}", other),
    }
}

#[test]
fn test_encode_rejects_mismatched_child_parent() {
    let mut node = DirectoryNode::new_loaded("/r");
    node.children.push(ChildNode::File(FileSummary {
        name: "f.txt".to_string(),
        path: "/other/f.txt".to_string(),
        depth: 2,
        parent_path: "/other".to_string(),
        size: None,
        mtime: None,
    }));

    let err = encode(&node, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, CacheError::InvalidNode(_)));
}

#[test]
fn test_encode_rejects_wrong_depth() {
    let mut node = DirectoryNode::new_loaded("/r");
    node.depth = 9;

    let err = encode(&node, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, CacheError::InvalidNode(_)));
}

#[test]
fn test_encode_rejects_child_with_slash_in_name() {
    let mut node = DirectoryNode::new_loaded("/r");
    node.push_file("ok.txt", None, None);
    if let ChildNode::File(f) = &mut node.children[0] {
        f.name = "bad/name".to_string();
        f.path = "/r/bad/name".to_string();
    }

    let err = encode(&node, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, CacheError::InvalidNode(_)));
}

#[test]
fn test_decode_rejects_garbage() {
    let err = decode("/r", b"not a record").unwrap_err();
    assert!(matches!(err, CacheError::Corrupted { .. }));
}

#[test]
fn test_decode_rejects_wrong_key() {
    let node = sample_node();
    let encoded = encode(&node, 1, 1, 0, None).unwrap();

    let err = decode("/elsewhere", &encoded.bytes).unwrap_err();
    assert!(matches!(err, CacheError::Corrupted { .. }));
}

#[test]
fn test_decode_rejects_future_schema() {
    let node = sample_node();
    let encoded = encode(&node, 1, 1, 0, None).unwrap();

    // schema_version is the first little-endian u32 of the record
    let mut bytes = encoded.bytes.clone();
    bytes[0] = SCHEMA_VERSION as u8 + 1;

    let err = decode("/src", &bytes).unwrap_err();
    assert!(matches!(err, CacheError::Corrupted { .. }));
}

#[test]
fn test_size_estimate_grows_with_children() {
    let empty = DirectoryNode::new_loaded("/r");
    let encoded_empty = encode(&empty, 1, 1, 0, None).unwrap();

    let mut full = DirectoryNode::new_loaded("/r");
    for i in 0..50 {
        full.push_file(&format!("file_{:03}.txt", i), Some(i), None);
    }
    let encoded_full = encode(&full, 1, 1, 0, None).unwrap();

    assert!(encoded_empty.entry.size_estimate_bytes > 0);
    assert!(encoded_full.entry.size_estimate_bytes > encoded_empty.entry.size_estimate_bytes);
}

fn arb_child_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.-]{1,24}"
}

fn arb_node() -> impl Strategy<Value = DirectoryNode> {
    (
        prop::collection::vec((arb_child_name(), any::<bool>(), any::<Option<u64>>()), 0..20),
        any::<bool>(),
    )
        .prop_map(|(children, is_loaded)| {
            let mut node = DirectoryNode::new("/base/dir");
            node.is_loaded = is_loaded;
            let mut used = std::collections::HashSet::new();
            for (name, dir, size) in children {
                if !used.insert(name.clone()) {
                    continue;
                }
                if dir {
                    node.push_dir_stub(&name, size.is_some());
                } else {
                    node.push_file(&name, size, None);
                }
            }
            node
        })
}

proptest! {
    /// decode(encode(n)) is structurally equal to n for every node whose
    /// directory children are stubs.
    #[test]
    fn prop_round_trip(node in arb_node(), cached_at in 0u64..1_000_000, seq in 0u64..1000) {
        let encoded = encode(&node, cached_at, cached_at, seq, node.mtime).unwrap();
        let decoded = decode("/base/dir", &encoded.bytes).unwrap();

        prop_assert_eq!(&decoded.node, &node);
        prop_assert_eq!(decoded.cached_at, cached_at);
        prop_assert_eq!(decoded.accessed_at, cached_at);
        prop_assert_eq!(decoded.seq, seq);
    }

    /// Encoded size estimates are recorded and non-zero.
    #[test]
    fn prop_size_estimate_recorded(node in arb_node()) {
        let encoded = encode(&node, 1, 1, 0, None).unwrap();
        prop_assert!(encoded.entry.size_estimate_bytes > 0);
        let decoded = decode("/base/dir", &encoded.bytes).unwrap();
        prop_assert_eq!(decoded.size_estimate_bytes, encoded.entry.size_estimate_bytes);
    }
}
