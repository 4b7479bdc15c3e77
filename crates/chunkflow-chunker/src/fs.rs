use crate::{InputCorpus, InputResolver, InputUnit, UnreadUnit};
use async_trait::async_trait;
use chunkflow_core::{ContentId, DecompositionError, InputRef};
use ignore::{overrides::OverrideBuilder, WalkBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/target/**",
    "**/.git/**",
    "**/node_modules/**",
    "**/dist/**",
    "**/build/**",
    "**/coverage/**",
    "**/__pycache__/**",
    "**/.chunkflow/**",
];

/// Reads a directory tree (or a single file) from disk, honouring `.gitignore` and a set of
/// default excludes. Files that cannot be read or are not valid UTF-8 are kept in the
/// corpus as [`UnreadUnit`]s.
#[derive(Debug, Clone, Default)]
pub struct FsInputResolver {
    exclude_patterns: Vec<String>,
}

impl FsInputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_excludes<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    fn collect(&self, root: &Path, project: &str) -> Result<Collected, DecompositionError> {
        let mut collected = Collected::default();
        if root.is_file() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            collected.read(root, name, project);
            return Ok(collected);
        }
        if !root.is_dir() {
            return Err(DecompositionError::InputUnresolvable(format!(
                "{} does not exist",
                root.display()
            )));
        }

        info!("Collecting input units from: {:?}", root);
        let mut ovr = OverrideBuilder::new(root);
        for pattern in DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(self.exclude_patterns.iter().map(String::as_str))
        {
            let pattern = format!("!{}", pattern.trim_start_matches('!'));
            if let Err(e) = ovr.add(&pattern) {
                warn!("Ignoring bad exclude pattern {}: {}", pattern, e);
            }
        }
        let overrides = ovr
            .build()
            .map_err(|e| DecompositionError::InputUnresolvable(e.to_string()))?;

        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .git_exclude(true)
            .ignore(true)
            .overrides(overrides)
            .build();

        for dent in walker {
            let dent = match dent {
                Ok(d) => d,
                Err(e) => {
                    match error_path(&e) {
                        Some(path) => collected.unread.push(UnreadUnit {
                            unit: ContentId::for_unit(project, &relative_path(root, path)),
                            bytes: 0,
                            reason: format!("walk failed: {}", e),
                        }),
                        None => warn!("Walker error: {}", e),
                    }
                    continue;
                }
            };
            let path = dent.path();
            if !path.is_file() {
                continue;
            }
            collected.read(path, relative_path(root, path), project);
        }
        debug!(
            "Collected {} units ({} unread) from {:?}",
            collected.units.len(),
            collected.unread.len(),
            root
        );
        Ok(collected)
    }
}

#[derive(Default)]
struct Collected {
    units: Vec<InputUnit>,
    unread: Vec<UnreadUnit>,
}

impl Collected {
    fn read(&mut self, path: &Path, relative: String, project: &str) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read {:?}: {}", path, e);
                let bytes = std::fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0);
                self.unread.push(UnreadUnit {
                    unit: ContentId::for_unit(project, &relative),
                    bytes,
                    reason: format!("unreadable: {}", e),
                });
                return;
            }
        };
        match String::from_utf8(bytes) {
            Ok(content) => self.units.push(InputUnit::new(relative, content)),
            Err(e) => {
                debug!("Not reading non UTF-8 file {:?}", path);
                self.unread.push(UnreadUnit {
                    unit: ContentId::for_unit(project, &relative),
                    bytes: e.as_bytes().len(),
                    reason: "not valid UTF-8".to_string(),
                });
            }
        }
    }
}

/// Path an [`ignore::Error`] refers to, looking through depth and line wrappers.
fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl InputResolver for FsInputResolver {
    async fn resolve(&self, input: &InputRef) -> Result<InputCorpus, DecompositionError> {
        let root: PathBuf = match input {
            InputRef::Path(path) => path.clone(),
            other => {
                return Err(DecompositionError::InputUnresolvable(format!(
                    "{} is not a filesystem path",
                    other
                )))
            }
        };
        let project = input.project_name();
        let resolver = self.clone();
        let scope = project.clone();
        let collected = tokio::task::spawn_blocking(move || resolver.collect(&root, &scope))
            .await
            .map_err(|e| DecompositionError::InputUnresolvable(e.to_string()))??;
        Ok(InputCorpus::new(project, collected.units).with_unread(collected.unread))
    }
}
