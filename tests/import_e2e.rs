use std::fs;
use std::path::Path;

use annex_db::importer::{staging_path, ByteOrder, CsvImporter, Element, TreeImporter};
use annex_db::{importer_for, Databases, ImportOptions, Importer, Query, Store, StoreConfig, StoreError};
use tempfile::tempdir;

fn options(dim: usize) -> ImportOptions {
    ImportOptions::new(StoreConfig::new(dim).with_threads(1))
}

/// Tree records: (n_descendants, vector)
fn write_tree(path: &Path, records: &[(i32, Vec<f64>)], order: ByteOrder, element: Element) {
    let mut bytes = Vec::new();
    for (n_descendants, vector) in records {
        let header = match order {
            ByteOrder::Little => n_descendants.to_le_bytes(),
            ByteOrder::Big => n_descendants.to_be_bytes(),
        };
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&[0u8; 8]);
        for &c in vector {
            match (element, order) {
                (Element::F64, ByteOrder::Little) => bytes.extend_from_slice(&c.to_le_bytes()),
                (Element::F64, ByteOrder::Big) => bytes.extend_from_slice(&c.to_be_bytes()),
                (Element::F32, ByteOrder::Little) => {
                    bytes.extend_from_slice(&(c as f32).to_le_bytes())
                }
                (Element::F32, ByteOrder::Big) => bytes.extend_from_slice(&(c as f32).to_be_bytes()),
            }
        }
    }
    fs::write(path, bytes).unwrap();
}

#[test]
fn test_csv_rows_are_their_own_nearest_neighbours() {
    let dir = tempdir().unwrap();
    let csv = dir.path().join("vectors.csv");
    let mut rows = String::new();
    for key in 0..30u64 {
        let f = key as f32;
        rows.push_str(&format!("{},{},{},{}\n", 1000 + key, f, (f * 0.7).cos(), f * 0.25));
        if key % 10 == 0 {
            rows.push('\n');
        }
    }
    fs::write(&csv, rows).unwrap();

    let target = dir.path().join("csvdb");
    let report = importer_for(&csv, options(3)).import(&csv, &target).unwrap();
    assert_eq!(report.imported, 30);
    assert_eq!(report.apply.applied, 30);

    let store: Store = Store::open_with_threads(&target, 1).unwrap();
    assert_eq!(store.stats().active_keys, 30);
    for key in 1000..1030u64 {
        let hits = store.search(Query::Key(key), 1, 0.1).unwrap();
        assert_eq!(hits[0].key, key);
    }
}

#[test]
fn test_csv_bad_row_fails_with_line_number() {
    let dir = tempdir().unwrap();
    let csv = dir.path().join("bad.csv");
    fs::write(&csv, "1,0.0,0.0\n\n2,0.5\n").unwrap();

    let err = CsvImporter::new(options(2))
        .import(&csv, &dir.path().join("db"))
        .unwrap_err();
    assert!(matches!(err, StoreError::Parse { line: 3, .. }));
}

#[test]
fn test_tree_import_uses_positional_keys_and_skips_inner_nodes() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("forest.tree");
    write_tree(
        &tree,
        &[
            (1, vec![0.0, 0.0]),
            (1, vec![1.0, 0.0]),
            (1, vec![0.0, 1.0]),
            (3, vec![9.0, 9.0]),
            (2, vec![9.0, 9.0]),
        ],
        ByteOrder::Little,
        Element::F64,
    );

    let target = dir.path().join("tree");
    let report = TreeImporter::new(options(2)).import(&tree, &target).unwrap();
    assert_eq!(report.imported, 3);
    assert_eq!(report.skipped_nodes, 2);

    let store: Store = Store::open_with_threads(&target, 1).unwrap();
    let hits = store.search(Query::Vector(&[0.9, 0.1]), 1, 0.1).unwrap();
    assert_eq!(hits[0].key, 1);
    assert!(matches!(
        store.search(Query::Key(3), 1, 0.0),
        Err(StoreError::UnknownKey(3))
    ));
}

#[test]
fn test_tree_import_big_endian_f32_with_mapping() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("forest.bin");
    write_tree(
        &tree,
        &[(1, vec![0.5, 0.25, 1.0]), (1, vec![-1.0, 2.0, 0.0])],
        ByteOrder::Big,
        Element::F32,
    );
    let map = dir.path().join("ids.csv");
    fs::write(&map, "0,500\n1,501\n").unwrap();

    let mut opts = options(3);
    opts.byte_order = ByteOrder::Big;
    opts.element = Element::F32;
    opts.mapping = Some(map);
    let target = dir.path().join("mapped");
    importer_for(&tree, opts).import(&tree, &target).unwrap();

    let store: Store = Store::open_with_threads(&target, 1).unwrap();
    let hits = store.search(Query::Vector(&[-1.0, 2.0, 0.0]), 2, 0.0).unwrap();
    assert_eq!(hits[0].key, 501);
    assert!(hits[0].distance.abs() < 1e-6);
    assert_eq!(hits[1].key, 500);
}

#[test]
fn test_failed_import_leaves_no_database_behind() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("forest.tree");
    write_tree(
        &tree,
        &[
            (1, vec![0.0, 0.0]),
            (1, vec![1.0, 0.0]),
            (1, vec![2.0, 0.0]),
            (1, vec![3.0, 0.0]),
        ],
        ByteOrder::Little,
        Element::F64,
    );
    let map = dir.path().join("ids.csv");
    fs::write(&map, "0,10\n1,11\n3,13\n").unwrap();

    let data_dir = dir.path().join("data");
    fs::create_dir(&data_dir).unwrap();
    let target = data_dir.join("partial");
    let mut opts = options(2);
    opts.mapping = Some(map.clone());
    let err = TreeImporter::new(opts.clone()).import(&tree, &target).unwrap_err();
    assert!(matches!(err, StoreError::MappingNotFound { index: 2 }));

    assert!(!target.exists());
    assert!(!staging_path(&target).exists());
    let databases = Databases::scan(&data_dir, 1).unwrap();
    assert!(databases.is_empty());

    // Fixing the mapping lets the same import run again
    fs::write(&map, "0,10\n1,11\n2,12\n3,13\n").unwrap();
    let report = TreeImporter::new(opts).import(&tree, &target).unwrap();
    assert_eq!(report.imported, 4);
    let databases = Databases::scan(&data_dir, 1).unwrap();
    assert_eq!(databases.names(), vec!["partial"]);
    let store = databases.get("partial").unwrap();
    assert_eq!(store.search(Query::Key(12), 1, 0.0).unwrap()[0].key, 12);
}

#[test]
fn test_csv_failure_cleans_up_staging() {
    let dir = tempdir().unwrap();
    let csv = dir.path().join("bad.csv");
    fs::write(&csv, "1,0.0,0.0\n2,inf,0.0\n").unwrap();
    let target = dir.path().join("db");

    let err = CsvImporter::new(options(2)).import(&csv, &target).unwrap_err();
    assert!(matches!(err, StoreError::Parse { line: 2, .. }));
    assert!(!target.exists());
    assert!(!staging_path(&target).exists());
}

#[test]
fn test_import_refuses_existing_store() {
    let dir = tempdir().unwrap();
    let csv = dir.path().join("v.csv");
    fs::write(&csv, "1,1.0\n").unwrap();
    let target = dir.path().join("db");
    importer_for(&csv, options(1)).import(&csv, &target).unwrap();

    assert!(matches!(
        importer_for(&csv, options(1)).import(&csv, &target),
        Err(StoreError::AlreadyExists(_))
    ));
}
