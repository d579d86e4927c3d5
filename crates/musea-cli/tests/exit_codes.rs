use std::process::{Command, Output};

fn musea_dedup(vars: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_musea-dedup"));
    for name in [
        "SUPABASE_URL",
        "SUPABASE_SERVICE_KEY",
        "SUPABASE_SERVICE_ROLE_KEY",
        "MUSEA_TABLE",
        "MUSEA_KEY_FIELD",
        "MUSEA_HTTP_TIMEOUT_SECS",
    ] {
        cmd.env_remove(name);
    }
    cmd.env("RUST_LOG", "off");
    for (name, value) in vars {
        cmd.env(name, value);
    }
    cmd.output().expect("running musea-dedup")
}

#[test]
fn missing_url_exits_with_configuration_error() {
    let output = musea_dedup(&[("SUPABASE_SERVICE_KEY", "secret")]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration error:"), "stderr: {stderr}");
    assert!(stderr.contains("SUPABASE_URL"), "stderr: {stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn unreachable_store_exits_non_zero_without_configuration_error() {
    let output = musea_dedup(&[
        ("SUPABASE_URL", "http://127.0.0.1:1"),
        ("SUPABASE_SERVICE_KEY", "secret"),
        ("MUSEA_HTTP_TIMEOUT_SECS", "5"),
    ]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("configuration error:"), "stderr: {stderr}");
    assert!(stderr.contains("fetching rows from musea"), "stderr: {stderr}");
}
