//! Test registration and descriptor discovery.
//!
//! The [`Registry`] is an explicit, ordered collection of [`TestCase`]s.
//! [`discover`] populates it by walking the test root once, in sorted order,
//! and parsing every `TESTS.toml` it finds. The directory holding a
//! descriptor names the test group.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use super::case::{TestCase, TestDescriptor};

/// Descriptor file name looked up in every directory under the root.
pub const DESCRIPTOR_FILE: &str = "TESTS.toml";

/// Contents of one descriptor file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorFile {
    #[serde(default)]
    pub test: Vec<TestDescriptor>,
}

/// Registered test cases in registration order.
///
/// A test case is identified by its descriptor directory and name, so
/// directories in different parts of the tree may share a group name.
#[derive(Debug, Default)]
pub struct Registry {
    tests: Vec<TestCase>,
    seen: HashSet<(PathBuf, String)>,
    instances: HashMap<(String, String), usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one test case found in `dir`.
    ///
    /// Returns `false` when the same test from the same directory is already
    /// registered, in which case the registry is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] when the descriptor is invalid.
    pub fn register(
        &mut self,
        group: &str,
        dir: &Path,
        descriptor: TestDescriptor,
    ) -> Result<bool, RegistrationError> {
        let mut test = TestCase::from_descriptor(group, dir, descriptor)?;
        let key = (
            std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()),
            test.name().to_string(),
        );
        if self.seen.contains(&key) {
            debug!(test = %test.qualified_name(), dir = %dir.display(), "already registered");
            return Ok(false);
        }
        self.seen.insert(key);

        let instance = self
            .instances
            .entry((test.group().to_string(), test.name().to_string()))
            .or_insert(0);
        test.set_instance(*instance);
        *instance += 1;

        self.tests.push(test);
        Ok(true)
    }

    /// Registered test cases in discovery order.
    #[must_use]
    pub fn test_cases(&self) -> &[TestCase] {
        &self.tests
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Parse a descriptor file.
///
/// # Errors
///
/// Returns [`RegistrationError`] if the file cannot be read or parsed.
pub fn load_descriptors(path: &Path) -> Result<Vec<TestDescriptor>, RegistrationError> {
    let text = fs::read_to_string(path).map_err(|source| RegistrationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: DescriptorFile = toml::from_str(&text).map_err(|source| RegistrationError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.test)
}

/// Walk `root` and register every test case described under it.
///
/// Returns the number of newly registered test cases; running discovery
/// twice registers nothing the second time.
///
/// # Errors
///
/// Returns [`RegistrationError`] on the first unreadable directory,
/// malformed descriptor, or invalid test case.
pub fn discover(root: &Path, registry: &mut Registry) -> Result<usize, RegistrationError> {
    let mut files = Vec::new();
    collect_descriptors(root, &mut files)?;

    let mut added = 0;
    for path in files {
        let dir = path.parent().unwrap_or(root);
        let group = group_name(dir);
        for descriptor in load_descriptors(&path)? {
            if registry.register(&group, dir, descriptor)? {
                added += 1;
            }
        }
    }
    info!(root = %root.display(), added, total = registry.len(), "discovered tests");
    Ok(added)
}

fn group_name(dir: &Path) -> String {
    std::path::absolute(dir)
        .ok()
        .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

fn collect_descriptors(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RegistrationError> {
    let io_err = |source: io::Error| RegistrationError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let descriptor = dir.join(DESCRIPTOR_FILE);
    if descriptor.is_file() {
        out.push(descriptor);
    }

    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let file_type = entry.file_type().map_err(io_err)?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if file_type.is_dir() && !hidden {
            subdirs.push(entry.path());
        }
    }
    subdirs.sort();
    for subdir in subdirs {
        collect_descriptors(&subdir, out)?;
    }
    Ok(())
}

/// Registration error. Always fatal, raised during discovery.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A test name that is not `TEST<n>`.
    #[error("{group}: invalid test name '{name}', expected TEST<number>")]
    InvalidName { group: String, name: String },

    /// A build or filesystem restriction naming an unknown variant.
    #[error("{test}: unknown {kind} variant '{name}'")]
    UnknownVariant {
        test: String,
        kind: &'static str,
        name: String,
    },

    /// A test requiring more than one instrumentation tool.
    #[error("{test}: only one tool can be required, got: {tools}")]
    ConflictingTools { test: String, tools: String },

    /// A directory or descriptor that could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A descriptor that is not valid TOML or has unknown keys.
    #[error("invalid descriptor {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, group: &str, body: &str) -> PathBuf {
        let group_dir = dir.join(group);
        fs::create_dir_all(&group_dir).unwrap();
        fs::write(group_dir.join(DESCRIPTOR_FILE), body).unwrap();
        group_dir
    }

    #[test]
    fn reregistration_is_a_noop() {
        let mut registry = Registry::new();
        let dir = Path::new("/src/test/obj_basic");
        assert!(
            registry
                .register("obj_basic", dir, TestDescriptor::new("TEST0", "obj_basic"))
                .unwrap()
        );
        assert!(
            !registry
                .register("obj_basic", dir, TestDescriptor::new("TEST0", "other"))
                .unwrap()
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.test_cases()[0].binary(), "obj_basic");
    }

    #[test]
    fn same_group_name_in_another_directory_is_distinct() {
        let mut registry = Registry::new();
        let first = Path::new("/src/test/a/obj_basic");
        let second = Path::new("/src/test/b/obj_basic");
        for dir in [first, second] {
            assert!(
                registry
                    .register("obj_basic", dir, TestDescriptor::new("TEST0", "obj_basic"))
                    .unwrap()
            );
        }
        assert!(
            !registry
                .register("obj_basic", first, TestDescriptor::new("TEST0", "obj_basic"))
                .unwrap()
        );

        let tests = registry.test_cases();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].workdir_stem(), "obj_basic_0");
        assert_eq!(tests[1].workdir_stem(), "obj_basic-1_0");
    }

    #[test]
    fn discovery_keeps_groups_sharing_a_name() {
        let root = tempfile::tempdir().unwrap();
        let body = "[[test]]\nname = \"TEST0\"\nbinary = \"obj_basic\"\n";
        write(&root.path().join("a"), "obj_basic", body);
        write(&root.path().join("b"), "obj_basic", body);

        let mut registry = Registry::new();
        assert_eq!(discover(root.path(), &mut registry).unwrap(), 2);
        let dirs: Vec<_> = registry.test_cases().iter().map(TestCase::dir).collect();
        assert_eq!(
            dirs,
            vec![
                root.path().join("a").join("obj_basic"),
                root.path().join("b").join("obj_basic"),
            ]
        );
        assert_eq!(discover(root.path(), &mut registry).unwrap(), 0);
    }

    #[test]
    fn same_name_in_another_group_is_distinct() {
        let mut registry = Registry::new();
        registry
            .register("a", Path::new("/a"), TestDescriptor::new("TEST0", "a"))
            .unwrap();
        registry
            .register("b", Path::new("/b"), TestDescriptor::new("TEST0", "b"))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn discovery_is_sorted_and_idempotent() {
        let root = tempfile::tempdir().unwrap();
        write(
            root.path(),
            "pmem2_map",
            "[[test]]\nname = \"TEST0\"\nbinary = \"pmem2_map\"\n",
        );
        write(
            root.path(),
            "obj_basic",
            "[[test]]\nname = \"TEST1\"\nbinary = \"obj_basic\"\n\n\
             [[test]]\nname = \"TEST0\"\nbinary = \"obj_basic\"\n",
        );
        write(
            root.path(),
            ".hidden",
            "[[test]]\nname = \"TEST0\"\nbinary = \"x\"\n",
        );

        let mut registry = Registry::new();
        assert_eq!(discover(root.path(), &mut registry).unwrap(), 3);
        let names: Vec<_> = registry
            .test_cases()
            .iter()
            .map(TestCase::qualified_name)
            .collect();
        assert_eq!(
            names,
            vec!["obj_basic/TEST1", "obj_basic/TEST0", "pmem2_map/TEST0"]
        );

        assert_eq!(discover(root.path(), &mut registry).unwrap(), 0);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn malformed_descriptor_fails_discovery() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "obj_basic", "[[test]]\nname = \"TEST0\"\n");
        let err = discover(root.path(), &mut Registry::new()).unwrap_err();
        assert!(matches!(err, RegistrationError::Parse { .. }));
    }

    #[test]
    fn invalid_name_fails_discovery() {
        let root = tempfile::tempdir().unwrap();
        write(
            root.path(),
            "obj_basic",
            "[[test]]\nname = \"FOO\"\nbinary = \"obj_basic\"\n",
        );
        let err = discover(root.path(), &mut Registry::new()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidName { .. }));
    }
}
