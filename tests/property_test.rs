// Property-style coverage for the path confinement logic: no input,
// however mangled, may resolve outside the server root.

use helmsman::core::filesystem::path::{safe_leaf_path, safe_path};
use proptest::prelude::*;

fn component() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("..".to_string()),
        Just(".".to_string()),
        Just("".to_string()),
        "[a-z]{1,8}",
        Just("with space".to_string()),
        Just("..hidden".to_string()),
    ]
}

fn relative_path() -> impl Strategy<Value = String> {
    (prop::collection::vec(component(), 0..8), any::<bool>()).prop_map(|(parts, rooted)| {
        let joined = parts.join("/");
        if rooted { format!("/{joined}") } else { joined }
    })
}

proptest! {
    #[test]
    fn safe_path_never_escapes_root(rel in relative_path()) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("nested/deeper")).unwrap();

        if let Ok(resolved) = safe_path(&root, std::path::Path::new(&rel)) {
            prop_assert!(
                resolved == root || resolved.starts_with(&root),
                "{rel:?} resolved to {resolved:?} outside {root:?}"
            );
        }
    }

    #[test]
    fn safe_leaf_path_never_escapes_root(rel in relative_path()) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        if let Ok(resolved) = safe_leaf_path(&root, std::path::Path::new(&rel)) {
            prop_assert!(
                resolved.starts_with(&root),
                "{rel:?} resolved to {resolved:?} outside {root:?}"
            );
        }
    }
}
