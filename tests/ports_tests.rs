use std::io::Write;

use scan_orchestrator::error::ScanError;
use scan_orchestrator::ports::{load_ports_from_path, normalize_ports, parse_ports_str};

#[test]
fn parse_single_and_ranges_and_comments() {
    let input = r#"
        # common ports
        22
        80  # http
        443 # https
        8000-8002
        8001  # duplicate
        # blank line follows

    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_names_the_line() {
    let err = parse_ports_str("22\n0\n").unwrap_err();
    match err {
        ScanError::Configuration(msg) => assert!(msg.contains("line 2"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn request_ports_must_be_in_range() {
    assert_eq!(normalize_ports(&[22, 65535, 22]).unwrap(), vec![22, 65535]);
    assert!(normalize_ports(&[65536]).is_err());
}

#[test]
fn ports_file_is_loaded() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# web\n80,443\n8080-8081").unwrap();
    let ports = load_ports_from_path(file.path()).unwrap();
    assert_eq!(ports, vec![80, 443, 8080, 8081]);

    let missing = file.path().with_extension("missing");
    let err = load_ports_from_path(&missing).unwrap_err();
    assert!(err.to_string().contains("failed to read ports file"));
}
