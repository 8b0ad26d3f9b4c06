#![allow(dead_code)]

use std::{fs, path::PathBuf};

use anyhow::{anyhow, Result};
use assert_cmd::Command;
use parse::{
    builder::{ClassBuilder, MethodBody},
    classfile::ClassInfo,
    flags::MethodAccessFlags,
};
use tracing::Level;

const TMP_DIR: &str = env!("CARGO_TARGET_TMPDIR");
const SOURCE_DIR: &str = env!("CARGO_MANIFEST_DIR");

pub fn init_logging() {
    // Several tests in one binary race to install it, the first one wins
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn split(index: u16) -> [u8; 2] {
    index.to_be_bytes()
}

/// A class with one static method, `run`.
pub fn single_method(
    name: &str,
    descriptor: &str,
    body: MethodBody,
) -> Vec<u8> {
    let mut builder = ClassBuilder::new(name, Some("java/lang/Object"));
    builder.method(MethodAccessFlags::STATIC, "run", descriptor, Some(body));
    builder.build()
}

pub fn code_of(class: &ClassInfo, name: &str, descriptor: &str) -> Result<Vec<u8>> {
    let index = class
        .method_index(name, descriptor)
        .ok_or_else(|| anyhow!("no method {}{}", name, descriptor))?;

    Ok(class.code(index)?.to_vec())
}

/// Writes class bytes into the target's scratch directory.
pub fn write_class(file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = PathBuf::from(TMP_DIR).join(format!("{}.class", file_name));
    fs::write(&path, bytes)?;
    Ok(path)
}

pub fn tmp_path(file_name: &str) -> PathBuf {
    PathBuf::from(TMP_DIR).join(file_name)
}

pub fn cli() -> Command {
    let mut command = Command::new(env!("CARGO"));
    command
        .arg("run")
        .arg("--quiet")
        .arg("--manifest-path")
        .arg(format!("{SOURCE_DIR}/../Cargo.toml"))
        .arg("--bin")
        .arg("cli")
        .arg("--");

    command
}
