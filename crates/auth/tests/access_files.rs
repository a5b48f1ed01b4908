use restproc_auth::Verifier;

fn temp_file(name: &str, contents: &str) -> String {
    let path = std::env::temp_dir().join(format!("restproc-auth-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn keys_from_multiple_files_are_merged() {
    let first = temp_file("first.csv", "key-one,alpha\n");
    let second = temp_file("second.csv", "key-two,beta\n");

    let verifier = Verifier::from_files(&[first.clone(), second.clone()]).unwrap();
    assert_eq!(verifier.access_key("alpha"), Some("key-one"));
    assert_eq!(verifier.access_key("beta"), Some("key-two"));

    std::fs::remove_file(first).ok();
    std::fs::remove_file(second).ok();
}

#[test]
fn missing_file_fails_load() {
    let err = Verifier::from_files(&["/nonexistent/keys.csv".to_string()]).unwrap_err();
    assert_eq!(err.code, "ERR_ACCESS_FILE_READ");
}

#[test]
fn malformed_file_fails_load() {
    let path = temp_file("bad.csv", "only-one-column\n");
    let err = Verifier::from_files(&[path.clone()]).unwrap_err();
    assert_eq!(err.code, "ERR_ACCESS_FILE_PARSE");
    std::fs::remove_file(path).ok();
}
