fn main() {
    let mut target_board: Option<String> = None;

    for (name, _) in std::env::vars() {
        let prefix = "CARGO_FEATURE_TARGET_BOARD_";
        if let Some(suffix) = name.strip_prefix(prefix) {
            if let Some(previous) = &target_board {
                panic!(
                    "multiple target board features defined (at least {} and {})",
                    show_feature(previous),
                    show_feature(suffix)
                );
            }

            target_board = Some(suffix.to_string());
        }
    }

    let Some(board) = target_board else {
        panic!("missing target-board-* feature");
    };

    // The firmware binary needs our memory map; host builds (tests, xtask)
    // don't link against it.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.starts_with("riscv64") {
        let out = std::path::PathBuf::from(std::env::var("OUT_DIR").unwrap());
        let script = format!("link-{}.x", board.to_ascii_lowercase());
        std::fs::copy(&script, out.join("memory.x"))
            .unwrap_or_else(|e| panic!("can't copy {script}: {e}"));
        println!("cargo:rustc-link-search={}", out.display());
        println!("cargo:rustc-link-arg-bins=-Tmemory.x");
        println!("cargo:rerun-if-changed={script}");
    }
}

fn show_feature(envvar: &str) -> String {
    let mut name = "target-board-".to_string();
    name.push_str(&envvar.to_ascii_lowercase().replace('_', "-"));
    name
}
