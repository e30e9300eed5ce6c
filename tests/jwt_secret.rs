use std::process::Command;

#[test]
fn fails_without_jwt_secret() {
    let exe = env!("CARGO_BIN_EXE_generation-backend");
    let output = Command::new(exe)
        .env_remove("JWT_SECRET")
        .current_dir(env!("CARGO_TARGET_TMPDIR"))
        .output()
        .expect("failed to run generation-backend binary");
    assert!(!output.status.success());
}
