use super::*;
use crate::events::EventBus;
use crate::model::{DocumentType, NewDocument};
use crate::versions::VersionStore;

fn graph() -> (tempfile::TempDir, FolderGraph) {
    let dir = tempfile::tempdir().unwrap();
    let graph = FolderGraph::new(dir.path().join("folders")).unwrap();
    (dir, graph)
}

fn folder(name: &str) -> NewFolder {
    NewFolder {
        name: name.to_string(),
        ..Default::default()
    }
}

#[test]
fn create_folder_requires_name() {
    let (_dir, mut graph) = graph();
    assert!(matches!(
        graph.create_folder(folder("   ")),
        Err(StoreError::Validation(_))
    ));
    let f = graph.create_folder(folder("reports")).unwrap();
    assert_eq!(graph.get(f.id).unwrap().name, "reports");
}

#[test]
fn cycle_edges_rejected() {
    let (_dir, mut graph) = graph();
    let a = graph.create_folder(folder("a")).unwrap().id;
    let b = graph.create_folder(folder("b")).unwrap().id;
    let c = graph.create_folder(folder("c")).unwrap().id;

    graph.add_child_folder(a, b).unwrap();
    graph.add_child_folder(b, c).unwrap();

    assert!(matches!(
        graph.add_child_folder(c, a),
        Err(StoreError::Cycle { .. })
    ));
    assert!(matches!(
        graph.add_child_folder(a, a),
        Err(StoreError::Cycle { .. })
    ));
    // the failed attempts left the graph intact
    assert_eq!(graph.folder_hierarchy(a).unwrap().len(), 3);
}

#[test]
fn membership_is_idempotent() {
    let (_dir, mut graph) = graph();
    let f = graph.create_folder(folder("inbox")).unwrap().id;
    let item = Uuid::new_v4();

    graph.add_item(f, item).unwrap();
    graph.add_item(f, item).unwrap();
    assert_eq!(graph.folder_items(f).unwrap().len(), 1);

    graph.remove_item(f, item).unwrap();
    // second removal of the same pair is a no-op, not an error
    graph.remove_item(f, item).unwrap();
    assert!(graph.folder_items(f).unwrap().is_empty());
}

#[test]
fn membership_on_missing_folder_is_not_found() {
    let (_dir, mut graph) = graph();
    let bogus = Uuid::new_v4();
    assert!(matches!(
        graph.add_item(bogus, Uuid::new_v4()),
        Err(StoreError::NotFound { kind: "folder", .. })
    ));
    assert!(matches!(
        graph.folder_items(bogus),
        Err(StoreError::NotFound { kind: "folder", .. })
    ));
}

#[test]
fn item_may_live_in_many_folders() {
    let (_dir, mut graph) = graph();
    let f1 = graph.create_folder(folder("drafts")).unwrap().id;
    let f2 = graph.create_folder(folder("published")).unwrap().id;
    let item = Uuid::new_v4();

    graph.add_item(f1, item).unwrap();
    graph.add_item(f2, item).unwrap();

    let mut containing = graph.folders_containing(item);
    containing.sort();
    let mut expected = vec![f1, f2];
    expected.sort();
    assert_eq!(containing, expected);
}

#[test]
fn hierarchy_lists_descendants_with_depth() {
    let (_dir, mut graph) = graph();
    let root = graph.create_folder(folder("root")).unwrap().id;
    let child = graph.create_folder(folder("child")).unwrap().id;
    let grand = graph.create_folder(folder("grand")).unwrap().id;
    let other = graph.create_folder(folder("other")).unwrap().id;

    graph.add_child_folder(root, child).unwrap();
    graph.add_child_folder(child, grand).unwrap();

    let entries = graph.folder_hierarchy(root).unwrap();
    let names_depths: Vec<(String, usize)> = entries
        .iter()
        .map(|e| (e.folder.name.clone(), e.depth))
        .collect();
    assert_eq!(
        names_depths,
        vec![
            ("root".to_string(), 0),
            ("child".to_string(), 1),
            ("grand".to_string(), 2)
        ]
    );

    let roots: Vec<Uuid> = graph.root_folders().iter().map(|f| f.id).collect();
    assert!(roots.contains(&root));
    assert!(roots.contains(&other));
    assert!(!roots.contains(&child));
}

#[test]
fn reparenting_moves_the_edge() {
    let (_dir, mut graph) = graph();
    let a = graph.create_folder(folder("a")).unwrap().id;
    let b = graph.create_folder(folder("b")).unwrap().id;
    let c = graph.create_folder(folder("c")).unwrap().id;

    graph.add_child_folder(a, c).unwrap();
    graph.add_child_folder(b, c).unwrap();

    assert!(graph.folder_hierarchy(a).unwrap().len() == 1);
    let under_b: Vec<Uuid> = graph.child_folders(b).unwrap().iter().map(|f| f.id).collect();
    assert_eq!(under_b, vec![c]);
}

#[test]
fn graph_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("folders");
    let (root, child, item) = {
        let mut graph = FolderGraph::new(&path).unwrap();
        let root = graph.create_folder(folder("root")).unwrap().id;
        let child = graph.create_folder(folder("child")).unwrap().id;
        graph.add_child_folder(root, child).unwrap();
        let item = Uuid::new_v4();
        graph.add_item(child, item).unwrap();
        (root, child, item)
    };

    let graph = FolderGraph::new(&path).unwrap();
    assert_eq!(graph.folder_hierarchy(root).unwrap().len(), 2);
    assert!(graph.folder_items(child).unwrap().contains(&item));
}

#[test]
fn delete_folder_detaches_children_and_members() {
    let (_dir, mut graph) = graph();
    let root = graph.create_folder(folder("root")).unwrap().id;
    let child = graph.create_folder(folder("child")).unwrap().id;
    graph.add_child_folder(root, child).unwrap();
    graph.add_item(root, Uuid::new_v4()).unwrap();

    graph.delete_folder(root).unwrap();
    assert!(graph.get(root).is_none());
    // the orphaned child is now a root
    let roots: Vec<Uuid> = graph.root_folders().iter().map(|f| f.id).collect();
    assert_eq!(roots, vec![child]);
}

#[test]
fn membership_survives_reversioning() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = FolderGraph::new(dir.path().join("folders")).unwrap();
    let mut store = VersionStore::new(dir.path().join("data"), EventBus::new()).unwrap();

    let doc = store
        .create_document(NewDocument {
            name: "policy.pdf".to_string(),
            document_type: Some(DocumentType::Specification),
            ..Default::default()
        })
        .unwrap();

    let f1 = graph.create_folder(folder("legal")).unwrap().id;
    let f2 = graph.create_folder(folder("archive")).unwrap().id;
    graph.add_item(f1, doc.chain_id).unwrap();
    graph.add_item(f2, doc.chain_id).unwrap();

    // membership keys on the chain, so version churn cannot disturb it
    let v2 = store.create_major_version(doc.id).unwrap();
    let _v2_1 = store.create_minor_version(v2.id).unwrap();

    assert!(graph.folder_items(f1).unwrap().contains(&doc.chain_id));
    assert!(graph.folder_items(f2).unwrap().contains(&doc.chain_id));
}
