use anyhow::Result;
use instrument::{cpool::repository::METHOD_ENTRY, opcode::*};
use parse::{builder::MethodBody, classfile::ClassInfo};
use util::{cli, single_method, tmp_path, write_class};

mod util;

fn sample(file_name: &str) -> Result<(ClassInfo, std::path::PathBuf)> {
    let bytes = single_method(
        "demo/Cli",
        "()V",
        MethodBody::new(1, 0, vec![ICONST_0, POP, RETURN]),
    );
    let path = write_class(file_name, &bytes)?;
    Ok((ClassInfo::parse(&bytes)?, path))
}

#[test]
fn it_inspects_a_class() -> Result<()> {
    let (_, path) = sample("CliInspect")?;

    let assert = cli().arg("inspect").arg(&path).assert().success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).to_string();

    assert!(out.contains("class demo/Cli"), "{}", out);
    assert!(out.contains("run()V: 3 bytes"), "{}", out);

    Ok(())
}

#[test]
fn it_instruments_a_class() -> Result<()> {
    let (original, path) = sample("CliInstrument")?;
    let output = tmp_path("CliInstrument.out.class");

    let assert = cli()
        .arg("instrument")
        .arg(&path)
        .arg("--kind")
        .arg("entry-exit")
        .arg("--method")
        .arg("run()V")
        .arg("--points")
        .arg("1")
        .arg("-o")
        .arg(&output)
        .assert()
        .success();

    let out = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(out.contains("demo/Cli run()V id 0"), "{}", out);

    let class = ClassInfo::parse(&std::fs::read(&output)?)?;
    assert_eq!(class.pool_count(), original.pool_count() + 12);

    let [hi, lo] = (original.pool_count() + METHOD_ENTRY).to_be_bytes();
    assert_eq!(&class.code(0)?[..6], &[SIPUSH, 0, 0, INVOKESTATIC, hi, lo]);

    Ok(())
}

#[test]
fn it_rejects_unknown_methods() -> Result<()> {
    let (_, path) = sample("CliMissing")?;

    cli()
        .arg("instrument")
        .arg(&path)
        .arg("--kind")
        .arg("root")
        .arg("--method")
        .arg("missing")
        .arg("-o")
        .arg(tmp_path("CliMissing.out.class"))
        .assert()
        .failure();

    Ok(())
}

#[test]
fn it_needs_bounds_for_regions() -> Result<()> {
    let (_, path) = sample("CliRegion")?;

    cli()
        .arg("instrument")
        .arg(&path)
        .arg("--kind")
        .arg("region")
        .arg("-o")
        .arg(tmp_path("CliRegion.out.class"))
        .assert()
        .failure();

    let output = tmp_path("CliRegionBounded.out.class");
    cli()
        .arg("instrument")
        .arg(&path)
        .arg("--kind")
        .arg("region")
        .arg("--region")
        .arg("0:2")
        .arg("-o")
        .arg(&output)
        .assert()
        .success();

    let class = ClassInfo::parse(&std::fs::read(&output)?)?;
    assert_eq!(class.code(0)?.len(), 3 + 4 + 4);

    Ok(())
}
