use std::fs;

use tempfile::tempdir;

use mannager::data::{read_tree, Column, Table};
use mannager::ml::{ModelManager, Objective, Registry, SgdModel};
use mannager::reshape::{
    load_instruction, reshape_to_table, reshape_to_tree, save_instruction, Instruction, ReshapeOptions,
    RowRange, SNAPSHOT_TREE_NAME,
};
use mannager::{InstructionError, ReshapeError};

fn events(rows: usize) -> Table {
    let px: Vec<f64> = (0..rows).map(|i| (i % 7) as f64 - 3.0).collect();
    let py: Vec<f64> = (0..rows).map(|i| (i % 5) as f64 * 0.5).collect();
    let pz: Vec<f64> = (0..rows).map(|i| (i % 3) as f64 + 1.0).collect();
    let jets: Vec<Vec<f64>> = (0..rows).map(|i| (0..i % 4).map(|j| 10.0 * (j + 1) as f64).collect()).collect();
    Table::new()
        .with_column("px", Column::Scalar(px))
        .and_then(|t| t.with_column("py", Column::Scalar(py)))
        .and_then(|t| t.with_column("pz", Column::Scalar(pz)))
        .and_then(|t| t.with_column("jet_pt", Column::Vector(jets)))
        .unwrap()
}

fn momentum_instruction() -> Instruction {
    Instruction::from_pairs([
        ("px2", "px*px"),
        ("py2", "py*py"),
        ("pz2", "pz*pz"),
        ("energy", "sqrt(px2+py2+pz2)"),
    ])
    .unwrap()
}

#[test]
fn later_definitions_see_earlier_ones() {
    let tree = events(20);
    let instruction = Instruction::from_pairs([("px2", "px*px"), ("energy", "sqrt(px2+py*py+pz*pz)")]).unwrap();

    let table = reshape_to_table(&tree, &instruction, &ReshapeOptions::default()).unwrap();

    assert_eq!(table.column_names(), vec!["px2", "energy"]);
    let px = tree.scalar_column("px").unwrap();
    let py = tree.scalar_column("py").unwrap();
    let pz = tree.scalar_column("pz").unwrap();
    for (row, energy) in table.scalar_column("energy").unwrap().iter().enumerate() {
        let expected = (px[row] * px[row] + py[row] * py[row] + pz[row] * pz[row]).sqrt();
        assert!((energy - expected).abs() < 1e-12);
    }
}

#[test]
fn range_matches_slice_of_full_result() {
    let tree = events(100);
    let instruction = momentum_instruction();

    let full = reshape_to_table(&tree, &instruction, &ReshapeOptions::default()).unwrap();
    let ranged = reshape_to_table(
        &tree,
        &instruction,
        &ReshapeOptions {
            range: Some(RowRange::new(0, 10)),
            ..ReshapeOptions::default()
        },
    )
    .unwrap();

    assert_eq!(ranged.nrows(), 10);
    assert_eq!(ranged, full.slice(0, 10, 1).unwrap());
}

#[test]
fn intermediate_snapshot_holds_instruction_columns() {
    let tree = events(30);
    let instruction = Instruction::from_pairs([("pt", "hypot(px, py)"), ("jets", "jet_pt * 0.001")]).unwrap();
    let dir = tempdir().unwrap();
    let snapshot = dir.path().join("snapshot.json");

    let table = reshape_to_table(
        &tree,
        &instruction,
        &ReshapeOptions {
            range: Some(RowRange::new(5, 25).with_stride(5)),
            intermediate_save_path: Some(snapshot.clone()),
            vectorize: true,
        },
    )
    .unwrap();

    let stored = read_tree(&snapshot, SNAPSHOT_TREE_NAME).unwrap();
    assert_eq!(stored.column_names(), vec!["pt", "jets"]);
    assert_eq!(stored, table);
    assert_eq!(table.nrows(), 4);
    assert!(table.column("jets").unwrap().is_vector());
}

#[test]
fn reshape_to_tree_writes_named_tree() {
    let tree = events(12);
    let dir = tempdir().unwrap();
    let output = dir.path().join("kinematics.json");

    reshape_to_tree(&tree, &momentum_instruction(), &output, "kinematics").unwrap();

    let written = read_tree(&output, "kinematics").unwrap();
    assert_eq!(written.column_names(), vec!["px2", "py2", "pz2", "energy"]);
    assert_eq!(written.nrows(), 12);
}

#[test]
fn engine_errors_propagate() {
    let tree = events(5);
    let dir = tempdir().unwrap();
    let missing = Instruction::from_pairs([("e", "sqrt(qx)")]).unwrap();
    assert!(matches!(
        reshape_to_table(&tree, &missing, &ReshapeOptions::default()),
        Err(ReshapeError::Expression { .. })
    ));

    let bad_syntax = Instruction::from_pairs([("e", "px * (py")]).unwrap();
    assert!(matches!(
        reshape_to_tree(&tree, &bad_syntax, dir.path().join("t.json"), "t"),
        Err(ReshapeError::Expression { .. })
    ));
}

#[test]
fn malformed_instruction_file_is_an_error_not_an_empty_instruction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("instruction.csv");
    fs::write(&path, "px2,px*px\nenergy\n").unwrap();

    let loaded = load_instruction(&path);
    assert!(matches!(loaded, Err(InstructionError::Malformed { line: 2, .. })));
}

#[test]
fn instruction_file_drives_reshape_and_training() {
    let dir = tempdir().unwrap();
    let instruction_path = dir.path().join("features.csv");
    let instruction = Instruction::from_pairs([
        ("pt", "hypot(px, py)"),
        ("n_jets", "Length(jet_pt)"),
        ("label", "pt > 2 ? 1 : 0"),
    ])
    .unwrap();
    save_instruction(&instruction_path, &instruction).unwrap();

    let table = reshape_to_table(
        &events(200),
        &load_instruction(&instruction_path).unwrap(),
        &ReshapeOptions::default(),
    )
    .unwrap();

    let mut manager = ModelManager::with_model(Box::new(SgdModel::new(Objective::Logistic, 0.5).with_seed(9)));
    let outcome = manager.train(&table, 40, 16, Some(0.25)).unwrap();
    assert_eq!(outcome.val_data.as_ref().unwrap().nrows(), 50);
    assert_eq!(outcome.history.epochs.len(), 40);

    let scores = manager.test(&table, 64).unwrap();
    assert_eq!(scores.len(), 2);
    assert!(scores[1] > 0.75);

    let manager_path = dir.path().join("manager.json");
    manager.save(&manager_path).unwrap();
    let restored = ModelManager::load(&manager_path, &Registry::default()).unwrap();
    let restored_scores = restored.test(&table, 64).unwrap();
    assert!((restored_scores[1] - scores[1]).abs() < 1e-12);
    assert!(dir.path().join("manager.json.model").exists());
}
