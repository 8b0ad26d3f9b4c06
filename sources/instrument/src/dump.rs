use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Writes class bytes under `dir`, one directory per package segment.
pub fn dump_class(dir: &Path, class_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let path = dir.join(format!("{}.class", class_name));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;

    use super::dump_class;

    #[test]
    fn it_writes_into_package_directories() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("instrument-dump-{}", std::process::id()));
        let path = dump_class(&dir, "demo/pkg/Thing", &[0xca, 0xfe])?;

        assert_eq!(path, dir.join("demo").join("pkg").join("Thing.class"));
        assert_eq!(fs::read(&path)?, vec![0xca, 0xfe]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
