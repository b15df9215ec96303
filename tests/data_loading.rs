use flate2::Compression;
use flate2::write::GzEncoder;
use parcor::data::{DataError, load_table};
use std::fs;
use std::io::Write;
use tempfile::tempdir;

fn id_columns() -> Vec<String> {
    vec!["sample_id".to_string(), "ID".to_string()]
}

#[test]
fn tsv_with_missing_markers_and_a_text_column() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("expression.tsv");
    fs::write(
        &path,
        "sample_id\tCMTM6\tSTUB1\ttissue\n\
         S1\t1.5\tNA\tlung\n\
         S2\t\t2.0\tlung\n\
         S3\t3.25\t-1\tskin\n",
    )
    .unwrap();

    let table = load_table(&path, &id_columns(), None).unwrap();
    assert_eq!(table.sample_ids(), ["S1", "S2", "S3"]);
    assert_eq!(table.column_names(), ["CMTM6", "STUB1"]);
    assert!(!table.has_column("tissue"));

    let cmtm6 = table.column("CMTM6").unwrap();
    assert_eq!(cmtm6[0], 1.5);
    assert!(cmtm6[1].is_nan());
    let stub1 = table.column("STUB1").unwrap();
    assert!(stub1[0].is_nan());
    assert_eq!(stub1[2], -1.0);
}

#[test]
fn csv_uses_the_fallback_id_column_and_requested_columns_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("timer.csv");
    fs::write(
        &path,
        "ID,B_cell,Macrophage,Neutrophil\nA,0.1,0.2,0.3\nB,0.4,0.5,0.6\n",
    )
    .unwrap();

    let wanted = vec!["Macrophage".to_string()];
    let table = load_table(&path, &id_columns(), Some(&wanted)).unwrap();
    assert_eq!(table.column_names(), ["Macrophage"]);
    assert_eq!(table.column("Macrophage").unwrap()[1], 0.5);
    assert_eq!(table.row_of("B"), Some(1));
}

#[test]
fn gzip_input_is_decompressed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("expression.tsv.gz");
    let mut encoder = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
    encoder
        .write_all(b"sample_id\tG\nS1\t1.0\nS2\t2.0\n")
        .unwrap();
    encoder.finish().unwrap();

    let table = load_table(&path, &id_columns(), None).unwrap();
    assert_eq!(table.n_samples(), 2);
    assert_eq!(table.column("G").unwrap()[1], 2.0);
}

#[test]
fn duplicate_ids_and_missing_id_column_are_data_errors() {
    let dir = tempdir().unwrap();

    let duplicated = dir.path().join("dup.tsv");
    fs::write(&duplicated, "sample_id\tG\nS1\t1\nS1\t2\n").unwrap();
    assert!(matches!(
        load_table(&duplicated, &id_columns(), None),
        Err(DataError::DuplicateSampleId(ref id)) if id == "S1"
    ));

    let anonymous = dir.path().join("anon.tsv");
    fs::write(&anonymous, "barcode\tG\nS1\t1\n").unwrap();
    assert!(matches!(
        load_table(&anonymous, &id_columns(), None),
        Err(DataError::MissingSampleIdColumn { .. })
    ));
}
