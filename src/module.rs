// File: src/module.rs
//
// Module file resolution for `use` imports: paths resolve against the
// importing script's directory, with the `.vsp` extension tried when
// the literal path does not exist.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SOURCE_EXTENSION: &str = "vsp";

#[derive(Debug, Clone)]
pub struct ModuleResolver {
    base_dir: PathBuf,
}

impl ModuleResolver {
    pub fn new(base_dir: PathBuf) -> Self {
        ModuleResolver { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The existing file a module path refers to, if any.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let direct = self.base_dir.join(path);
        if direct.is_file() {
            return Some(direct);
        }
        if direct.extension().is_none() {
            let with_extension = direct.with_extension(SOURCE_EXTENSION);
            if with_extension.is_file() {
                return Some(with_extension);
            }
        }
        None
    }

    /// Resolve and read a module, returning the final path together
    /// with the source text.
    pub fn read(&self, path: &str) -> io::Result<(PathBuf, String)> {
        let resolved = self
            .resolve(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("module '{}'", path)))?;
        let source = fs::read_to_string(&resolved)?;
        Ok((resolved, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolves_literal_paths_and_default_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("util.vsp"), "x : 1;").expect("write");

        let resolver = ModuleResolver::new(dir.path().to_path_buf());
        assert!(resolver.resolve("util.vsp").is_some());
        assert!(resolver.resolve("util").is_some());
        assert!(resolver.resolve("missing").is_none());
    }

    #[test]
    fn read_returns_path_and_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("m.vsp"), "y : 2;").expect("write");

        let resolver = ModuleResolver::new(dir.path().to_path_buf());
        let (path, source) = resolver.read("m").expect("read");
        assert!(path.ends_with("m.vsp"));
        assert_eq!(source, "y : 2;");
    }
}
