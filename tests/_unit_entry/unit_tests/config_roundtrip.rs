// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Write;

use relay_core::cfg::config::Config;

#[test]
fn load_from_file_parses_and_normalizes() {
    let mut cfg = Config::default();
    cfg.buffer.default_slot_size = 0;
    let yaml = serde_yaml::to_string(&cfg).expect("serialize default config");

    let mut file = tempfile_like_file(&yaml);
    let loaded = Config::load_from_file(file.path()).expect("load_from_file");
    assert!(loaded.buffer.default_slot_size > 0);
    file.close();
}

#[test]
fn rejects_zero_sniffer_budget() {
    let mut cfg = Config::default();
    cfg.sniffer.max_buffered_bytes = 0;
    let err = cfg.validate_and_normalize().expect_err("zero budget must be rejected");
    assert!(err.to_string().contains("max_buffered_bytes"));
}

/// Minimal scratch-file helper: this crate has no dependency on
/// `tempfile` (§10.4 — no filesystem state in this domain otherwise), so
/// a test-only temp path under the OS temp dir is rolled by hand instead
/// of pulling the crate in just for this one assertion.
struct ScratchFile {
    path: std::path::PathBuf,
}

impl ScratchFile {
    fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn close(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn tempfile_like_file(contents: &str) -> ScratchFile {
    let mut path = std::env::temp_dir();
    path.push(format!("relay-core-config-test-{}.yaml", std::process::id()));
    let mut f = std::fs::File::create(&path).expect("create scratch config file");
    f.write_all(contents.as_bytes()).expect("write scratch config file");
    ScratchFile { path }
}
