use std::process::Command;

// stamps `--version` with the commit the binary was built from
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let describe = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    println!(
        "cargo:rustc-env=GIT_COMMIT={}",
        describe.as_deref().unwrap_or("unknown")
    );
}
