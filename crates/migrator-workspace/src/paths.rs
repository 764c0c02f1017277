use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use migrator_core::{MigrationError, MigrationId, MigrationResult};

const AUTHORS_FILE_NAME: &str = "authors.txt";
const NO_AUTHOR_ENTRY: &str = "(no author) = no author <no-author@localhost>";

/// Filesystem layout of one migration workspace:
/// `<temp_root>/<migration_id>/<project_path>` holds the bridged repository,
/// `<temp_root>/<migration_id>/authors.txt` the optional authors mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    root: PathBuf,
    repo_dir: PathBuf,
    authors_file: PathBuf,
}

impl WorkspacePaths {
    pub fn new(
        temp_root: &Path,
        migration_id: &MigrationId,
        project_path: &str,
    ) -> MigrationResult<Self> {
        validate_project_path(project_path)?;
        let root = temp_root.join(migration_id.as_str());
        Ok(Self {
            repo_dir: root.join(project_path),
            authors_file: root.join(AUTHORS_FILE_NAME),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute destination for the bridge clone; never a relative path
    /// resolved against an ambiguous working directory.
    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn authors_file(&self) -> &Path {
        &self.authors_file
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// The bridge keeps its remote-tracking metadata under `.git/svn`; its
    /// presence is what makes a workspace resumable.
    pub fn bridge_metadata_dir(&self) -> PathBuf {
        self.repo_dir.join(".git").join("svn")
    }
}

fn validate_project_path(project_path: &str) -> MigrationResult<()> {
    let path = Path::new(project_path);
    if project_path.is_empty() || path.is_absolute() {
        return Err(MigrationError::Configuration(format!(
            "project path '{project_path}' must be a non-empty relative path"
        )));
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(MigrationError::Configuration(format!(
                "project path '{project_path}' must not contain '.' or '..' segments"
            )));
        }
    }
    Ok(())
}

pub fn create_workspace(paths: &WorkspacePaths) -> MigrationResult<()> {
    fs::create_dir_all(paths.root()).map_err(|error| {
        MigrationError::Io(format!(
            "failed to create workspace '{}': {error}",
            paths.root().display()
        ))
    })
}

pub fn delete_workspace(paths: &WorkspacePaths) -> MigrationResult<()> {
    if !paths.exists() {
        return Ok(());
    }
    fs::remove_dir_all(paths.root()).map_err(|error| {
        MigrationError::Io(format!(
            "failed to delete workspace '{}': {error}",
            paths.root().display()
        ))
    })
}

/// Writes the authors translation file when a mapping is supplied. The
/// synthetic "(no author)" identity is always appended because revisions
/// committed without a username would otherwise abort the bridge.
pub fn write_authors_file(
    paths: &WorkspacePaths,
    mapping: &BTreeMap<String, String>,
) -> MigrationResult<Option<PathBuf>> {
    if mapping.is_empty() {
        return Ok(None);
    }

    let mut contents = String::new();
    for (svn_user, git_identity) in mapping {
        contents.push_str(svn_user);
        contents.push_str(" = ");
        contents.push_str(git_identity);
        contents.push('\n');
    }
    contents.push_str(NO_AUTHOR_ENTRY);
    contents.push('\n');

    fs::write(paths.authors_file(), contents).map_err(|error| {
        MigrationError::Io(format!(
            "failed to write authors file '{}': {error}",
            paths.authors_file().display()
        ))
    })?;
    Ok(Some(paths.authors_file().to_path_buf()))
}
