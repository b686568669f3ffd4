use std::io::Write;
use std::path::Path;

use arms_approver::{read_records, ApproverError, ColumnSpec};

fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn reads_csv_in_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "accounts.csv",
        "Region,OU ID,Account Name\nEU,OU-9,Zeta Corp\nUS,,Missing OU\nUS, OU-1 ,\"Alpha, Inc\"\n",
    );

    let records = read_records(&path, &ColumnSpec::default()).unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].index, 1);
    assert_eq!(records[0].row, 2);
    assert_eq!(records[0].ou_id, "OU-9");
    assert_eq!(records[1].index, 2);
    assert_eq!(records[1].row, 4);
    assert_eq!(records[1].ou_id, "OU-1");
    assert_eq!(records[1].account_name, "Alpha, Inc");
}

#[test]
fn custom_column_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "accounts.CSV", "ou,name\nX1,One\n");
    let columns = ColumnSpec {
        ou_id_column: "ou".into(),
        account_name_column: "name".into(),
        ..Default::default()
    };

    let records = read_records(&path, &columns).unwrap();
    assert_eq!(records[0].ou_id, "X1");
    assert_eq!(records[0].account_name, "One");
}

#[test]
fn missing_file_and_bad_extension_are_rejected() {
    let dir = tempfile::tempdir().unwrap();

    match read_records(&dir.path().join("nope.xlsx"), &ColumnSpec::default()) {
        Err(ApproverError::FileNotFound(p)) => assert!(p.ends_with("nope.xlsx")),
        other => panic!("expected FileNotFound, got {other:?}"),
    }

    let txt = write_file(dir.path(), "accounts.txt", "OU ID,Account Name\n");
    match read_records(&txt, &ColumnSpec::default()) {
        Err(ApproverError::InputFormat(msg)) => assert!(msg.contains("txt")),
        other => panic!("expected InputFormat, got {other:?}"),
    }
}

#[test]
fn corrupt_workbook_is_input_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "accounts.xlsx", "this is not a zip archive");

    assert!(matches!(
        read_records(&path, &ColumnSpec::default()),
        Err(ApproverError::InputFormat(_))
    ));
}

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[test]
fn reads_first_sheet_of_workbook() {
    // Table starts at B3; the OU ID in B4 is stored as a number.
    let records = read_records(&fixture("accounts.xlsx"), &ColumnSpec::default()).unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].index, 1);
    assert_eq!(records[0].row, 4);
    assert_eq!(records[0].ou_id, "12345");
    assert_eq!(records[0].account_name, "Alpha Corp");
    assert_eq!(records[1].index, 2);
    assert_eq!(records[1].row, 6);
    assert_eq!(records[1].ou_id, "OU-7");
    assert_eq!(records[1].account_name, "Beta");
}

#[test]
fn reads_named_sheet_of_workbook() {
    let columns = ColumnSpec {
        sheet: Some("Legacy".into()),
        ..Default::default()
    };
    let records = read_records(&fixture("accounts.xlsx"), &columns).unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].row, 2);
    assert_eq!(records[0].ou_id, "987");
    assert_eq!(records[0].account_name, "Legacy Co");

    let missing = ColumnSpec {
        sheet: Some("Archive".into()),
        ..Default::default()
    };
    assert!(matches!(
        read_records(&fixture("accounts.xlsx"), &missing),
        Err(ApproverError::InputFormat(_))
    ));
}
