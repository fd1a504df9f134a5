//! Binary-level tests: exit codes and the info summary.

use std::fs;
use std::io::BufWriter;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tiff::encoder::{colortype::Gray16, TiffEncoder};

const H: usize = 16;
const W: usize = 16;

fn write_tiff(path: &Path, data: &[u16]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = BufWriter::new(file);
    let mut encoder = TiffEncoder::new(&mut writer).unwrap();
    encoder
        .write_image::<Gray16>(W as u32, H as u32, data)
        .unwrap();
}

/// One position, two frames, two channels of flat data.
fn build_acquisition(root: &Path) {
    let dir = root.join("Pos0");
    fs::create_dir_all(&dir).unwrap();
    let plane = vec![100u16; H * W];
    for t in 0..2 {
        for c in 0..2 {
            let name = format!(
                "img_channel{:03}_position{:03}_time{:09}_z{:03}.tif",
                c, 0, t, 0
            );
            write_tiff(&dir.join(name), &plane);
        }
    }
}

#[test]
fn info_prints_dimensions() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("acq");
    build_acquisition(&input);

    Command::cargo_bin("pyama")
        .unwrap()
        .args(["info", "--input", input.to_str().unwrap()])
        .assert()
        .success()
        .stderr(predicate::str::contains("P=1 T=2 C=2 (16x16)"));
}

#[test]
fn unknown_feature_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("acq");
    build_acquisition(&input);
    let output = tmp.path().join("out");

    Command::cargo_bin("pyama")
        .unwrap()
        .args([
            "process",
            "--input",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--pc",
            "0",
            "--fl",
            "1",
            "--pc-features",
            "perimeter",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("perimeter"));
}

#[test]
fn missing_input_is_an_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("pyama")
        .unwrap()
        .args([
            "process",
            "--input",
            tmp.path().join("nope.nd2").to_str().unwrap(),
            "--output",
            tmp.path().join("out").to_str().unwrap(),
            "--pc",
            "0",
        ])
        .assert()
        .code(3);
}

#[test]
fn bad_fov_selection_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("acq");
    build_acquisition(&input);

    Command::cargo_bin("pyama")
        .unwrap()
        .args([
            "process",
            "--input",
            input.to_str().unwrap(),
            "--output",
            tmp.path().join("out").to_str().unwrap(),
            "--pc",
            "0",
            "--fov",
            "0:5:0",
        ])
        .assert()
        .code(2);
}
