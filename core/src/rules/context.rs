// Core models for rule execution
// The RuleContext carries the "active" artifact from action to action so
// path and extension changes propagate down the pipeline

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A concrete file flowing through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Extension including the dot (".mov"); derived from the path
    pub ext: Option<String>,
    pub mime: Option<String>,
    /// Free-form metadata (duration, codec, ...)
    pub meta: BTreeMap<String, Value>,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e));
        Self {
            path,
            ext,
            mime: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Context threaded through one rule execution
#[derive(Debug, Clone)]
pub struct RuleContext {
    /// The artifact that triggered the rule; never changes
    pub original: Artifact,
    /// What the next action operates on
    pub active: Artifact,
    /// Previous actives, oldest first
    pub history: Vec<Artifact>,
    /// Template variables (asset_id, event fields, action outputs)
    pub vars: BTreeMap<String, Value>,
}

impl RuleContext {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            original: artifact.clone(),
            active: artifact,
            history: Vec::new(),
            vars: BTreeMap::new(),
        }
    }

    /// Replace the active artifact, keeping the old one in history.
    /// A same-path update (metadata refresh) does not grow the history.
    pub fn update_active(&mut self, new_artifact: Artifact) {
        if self.active.path != new_artifact.path {
            self.history.push(self.active.clone());
        }
        self.active = new_artifact;
    }

    pub fn asset_id(&self) -> Option<&str> {
        self.vars.get("asset_id").and_then(|v| v.as_str())
    }
}

/// What an action produced
#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    /// New file the following actions should operate on, when one exists
    pub primary_output_path: Option<PathBuf>,
    /// Secondary outputs that do not shift the active artifact
    pub outputs: BTreeMap<String, PathBuf>,
    /// Variables merged into ctx.vars after the action
    pub updated_vars: BTreeMap<String, Value>,
}

impl ActionResult {
    pub fn with_primary(path: impl AsRef<Path>) -> Self {
        Self {
            primary_output_path: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_derives_extension() {
        let artifact = Artifact::new("/tmp/video.mov");
        assert_eq!(artifact.ext.as_deref(), Some(".mov"));
        assert_eq!(artifact.file_name(), "video.mov");

        let no_ext = Artifact::new("/tmp/noext");
        assert_eq!(no_ext.ext, None);
    }

    #[test]
    fn test_update_active_builds_history() {
        let original = Artifact::new("/tmp/original.mkv");
        let mut ctx = RuleContext::new(original.clone());

        let remuxed = Artifact::new("/tmp/original.mov");
        ctx.update_active(remuxed.clone());
        assert_eq!(ctx.active, remuxed);
        assert_eq!(ctx.history, vec![original.clone()]);

        let moved = Artifact::new("/archive/original.mov");
        ctx.update_active(moved.clone());
        assert_eq!(ctx.active, moved);
        assert_eq!(ctx.history, vec![original, remuxed.clone()]);

        // Same path again: no history growth
        ctx.update_active(Artifact::new("/archive/original.mov"));
        assert_eq!(ctx.history.len(), 2);
        let _ = remuxed;
    }
}
